use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::browser::{BrowserResult, ElementRef, PageDriver};

use super::SelectorError;

fn text_filter_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^(?P<css>.*?):(?:has-text|contains)\(\s*["'](?P<text>.*)["']\s*\)\s*$"#)
            .expect("valid regex")
    })
}

/// A CSS selector, optionally narrowed by a trailing `:has-text("...")` or
/// `:contains("...")` filter. Browsers do not understand either pseudo-class,
/// so the text part is applied after the query, case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    raw: String,
    css: String,
    text: Option<String>,
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SelectorError::Malformed {
                raw: raw.to_string(),
                reason: "empty expression".into(),
            });
        }
        match text_filter_pattern().captures(trimmed) {
            Some(captures) => {
                let text = captures["text"].trim();
                if text.is_empty() {
                    return Err(SelectorError::Malformed {
                        raw: raw.to_string(),
                        reason: "empty text filter".into(),
                    });
                }
                let css = captures["css"].trim();
                Ok(Self {
                    raw: trimmed.to_string(),
                    css: if css.is_empty() { "*".into() } else { css.into() },
                    text: Some(text.to_lowercase()),
                })
            }
            None => Ok(Self {
                raw: trimmed.to_string(),
                css: trimmed.to_string(),
                text: None,
            }),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn css(&self) -> &str {
        &self.css
    }

    pub fn text_filter(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn matches_text(&self, text: &str) -> bool {
        match &self.text {
            Some(needle) => text.to_lowercase().contains(needle),
            None => true,
        }
    }

    /// Elements under `scope` matching this locator, in document order.
    pub async fn find_all(
        &self,
        driver: &mut dyn PageDriver,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Vec<ElementRef>> {
        let found = driver.query_all(scope, &self.css).await?;
        if self.text.is_none() {
            return Ok(found);
        }
        let mut kept = Vec::with_capacity(found.len());
        for element in found {
            match driver.read_text(element).await {
                Ok(text) if self.matches_text(&text) => kept.push(element),
                Ok(_) => {}
                Err(err) if err.is_detached() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(kept)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
