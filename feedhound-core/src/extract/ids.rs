use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use super::record::RecordKind;

const POST_QUERY_KEYS: &[&str] = &["story_fbid", "fbid", "id", "v", "photo_id", "multi_permalinks"];
const COMMENT_QUERY_KEYS: &[&str] = &["reply_comment_id", "comment_id"];

fn path_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"/(?:posts|permalink|videos|photos|story|watch|reel)/([A-Za-z0-9._-]+)")
            .expect("valid regex")
    })
}

fn numeric_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"/(\d{10,})(?:/|$)").expect("valid regex"))
}

fn parse_link(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("https://relative.invalid/")
            .ok()?
            .join(raw)
            .ok(),
        Err(_) => None,
    }
}

fn query_value(url: &Url, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        url.query_pairs()
            .find(|(name, value)| name == key && !value.trim().is_empty())
            .map(|(_, value)| value.trim().to_string())
    })
}

/// Site-native identifier carried by a permalink, if any.
///
/// Post ids come from well-known path segments, then any long numeric path
/// segment, then id-bearing query parameters. Comment ids only come from
/// comment query parameters, since a comment link also names its post.
pub fn derive_source_id(permalink: &str, kind: RecordKind) -> Option<String> {
    let url = parse_link(permalink)?;
    if kind == RecordKind::Comment {
        return query_value(&url, COMMENT_QUERY_KEYS);
    }
    let path = url.path();
    if let Some(captures) = path_id_regex().captures(path) {
        return Some(captures[1].to_string());
    }
    if let Some(captures) = numeric_id_regex().captures(path) {
        return Some(captures[1].to_string());
    }
    query_value(&url, POST_QUERY_KEYS)
}

/// Deterministic id for a record without a usable permalink, stable across
/// scroll windows for the same author and text.
pub fn fallback_source_id(author: Option<&str>, text: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(author.unwrap_or_default()).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize(text.unwrap_or_default()).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("gen_{}", &digest[..32])
}

/// Lowercased, whitespace-collapsed prefix of `text`, `chars` characters long.
pub fn content_key(text: &str, chars: usize) -> String {
    normalize(text).chars().take(chars).collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
