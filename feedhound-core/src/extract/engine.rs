use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::ids::{content_key, derive_source_id, fallback_source_id};
use super::record::{RawRecord, RecordField, RecordKind};
use super::timestamp::normalize_timestamp;
use crate::browser::{BrowserError, BrowserResult, ElementRef};
use crate::config::ExtractionSection;
use crate::engine::{PageView, ScrollState};
use crate::selectors::targets;

const TRUNCATION_MARKERS: &[&str] = &["see more", "show more"];

/// Where a field's value lives on its element.
#[derive(Debug, Clone, Copy)]
enum Source {
    Text,
    Attr(&'static [&'static str]),
    AttrOrText(&'static [&'static str]),
}

/// Snapshot of the containers materialized when the pass began. Yields
/// records lazily, in container order, each comment right after its post.
#[derive(Debug, Default)]
pub struct ExtractionPass {
    containers: VecDeque<ElementRef>,
    pending: VecDeque<RawRecord>,
    total: usize,
}

impl ExtractionPass {
    pub fn containers(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Turns post containers into [`RawRecord`]s. Fields resolve independently;
/// a field that cannot be read is left empty and noted on the record.
#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractionSection,
}

impl Extractor {
    pub fn new(config: ExtractionSection) -> Self {
        Self { config }
    }

    pub async fn begin(&self, view: &mut PageView<'_>) -> BrowserResult<ExtractionPass> {
        let containers = view.resolve_all(targets::POST_CONTAINER, None).await?;
        trace!(containers = containers.len(), "extraction pass started");
        Ok(ExtractionPass {
            total: containers.len(),
            containers: containers.into(),
            pending: VecDeque::new(),
        })
    }

    /// Next record not yet seen in this run, or `None` once the snapshot is
    /// used up. Only a closed page is an error.
    pub async fn next_record(
        &self,
        view: &mut PageView<'_>,
        pass: &mut ExtractionPass,
        state: &mut ScrollState,
    ) -> BrowserResult<Option<RawRecord>> {
        loop {
            if let Some(record) = pass.pending.pop_front() {
                return Ok(Some(record));
            }
            let Some(container) = pass.containers.pop_front() else {
                return Ok(None);
            };
            match self.read_post(view, container, state).await {
                Ok(Some(post)) => {
                    if self.config.include_comments {
                        let comments = self
                            .read_comments(view, container, &post.source_id, state)
                            .await?;
                        pass.pending.extend(comments);
                    }
                    return Ok(Some(post));
                }
                Ok(None) => {}
                Err(BrowserError::Closed) => return Err(BrowserError::Closed),
                Err(err) => debug!(container = %container, error = %err, "skipping unreadable container"),
            }
        }
    }

    async fn read_post(
        &self,
        view: &mut PageView<'_>,
        container: ElementRef,
        state: &mut ScrollState,
    ) -> BrowserResult<Option<RawRecord>> {
        let captured_at = Utc::now();
        let mut missing = Vec::new();

        let permalink = self
            .field(view, &mut missing, RecordField::Permalink, targets::PERMALINK, container, Source::Attr(&["href"]))
            .await?;
        let site_id = permalink
            .as_deref()
            .and_then(|link| derive_source_id(link, RecordKind::Post));
        if let Some(id) = &site_id {
            if state.is_known(id, None) {
                view.metrics.record_duplicate();
                return Ok(None);
            }
        }

        self.expand(view, container).await?;
        let text = self
            .field(view, &mut missing, RecordField::Text, targets::POST_TEXT, container, Source::Text)
            .await?
            .map(strip_truncation_marker)
            .filter(|text| !text.is_empty());
        let author = self
            .field(view, &mut missing, RecordField::AuthorName, targets::AUTHOR_NAME, container, Source::Text)
            .await?;
        let avatar = self
            .field(
                view,
                &mut missing,
                RecordField::AuthorAvatar,
                targets::AUTHOR_AVATAR,
                container,
                Source::Attr(&["src", "xlink:href", "href"]),
            )
            .await?;
        let timestamp_raw = self
            .field(
                view,
                &mut missing,
                RecordField::Timestamp,
                targets::TIMESTAMP,
                container,
                Source::AttrOrText(&["title", "aria-label"]),
            )
            .await?;

        if text.is_none() && author.is_none() && permalink.is_none() && timestamp_raw.is_none() {
            view.metrics.record_empty_container();
            return Ok(None);
        }
        let key = text
            .as_deref()
            .map(|text| content_key(text, self.config.content_key_chars))
            .filter(|key| !key.is_empty());
        let (source_id, derived) = match site_id {
            Some(id) => (id, false),
            None => (fallback_source_id(author.as_deref(), text.as_deref()), true),
        };
        if state.is_known(&source_id, key.as_deref()) {
            view.metrics.record_duplicate();
            return Ok(None);
        }
        state.remember(&source_id, key.as_deref());
        self.note_degradation(view, &source_id, &missing);

        Ok(Some(RawRecord {
            kind: RecordKind::Post,
            source_id,
            source_id_derived: derived,
            timestamp: self.normalize(timestamp_raw.as_deref(), captured_at),
            raw_text: text,
            author_name: author,
            author_avatar_ref: avatar,
            timestamp_raw,
            permalink_ref: permalink,
            parent_id: None,
            captured_at,
            missing_fields: missing,
        }))
    }

    async fn read_comments(
        &self,
        view: &mut PageView<'_>,
        container: ElementRef,
        parent_id: &str,
        state: &mut ScrollState,
    ) -> BrowserResult<Vec<RawRecord>> {
        match view.resolve(targets::VIEW_MORE_COMMENTS, Some(container)).await {
            Ok(Some(toggle)) => match view.driver.click(toggle).await {
                Ok(()) | Err(BrowserError::Detached(_)) => {}
                Err(BrowserError::Closed) => return Err(BrowserError::Closed),
                Err(err) => debug!(error = %err, "failed to expand comments"),
            },
            Ok(None) => {}
            Err(BrowserError::Closed) => return Err(BrowserError::Closed),
            Err(err) => debug!(error = %err, "comment toggle lookup failed"),
        }
        let comments = match view.resolve_all(targets::COMMENT_CONTAINER, Some(container)).await {
            Ok(found) => found,
            Err(BrowserError::Closed) => return Err(BrowserError::Closed),
            Err(err) => {
                debug!(error = %err, "comment lookup failed");
                return Ok(Vec::new());
            }
        };

        let mut records = Vec::new();
        for comment in comments.into_iter().take(self.config.max_comments_per_post) {
            let captured_at = Utc::now();
            let mut missing = Vec::new();
            let text = self
                .field(view, &mut missing, RecordField::Text, targets::COMMENT_TEXT, comment, Source::Text)
                .await?;
            let author = self
                .field(view, &mut missing, RecordField::AuthorName, targets::AUTHOR_NAME, comment, Source::Text)
                .await?;
            let avatar = self
                .field(
                    view,
                    &mut missing,
                    RecordField::AuthorAvatar,
                    targets::AUTHOR_AVATAR,
                    comment,
                    Source::Attr(&["src", "xlink:href", "href"]),
                )
                .await?;
            let timestamp_raw = self
                .field(
                    view,
                    &mut missing,
                    RecordField::Timestamp,
                    targets::TIMESTAMP,
                    comment,
                    Source::AttrOrText(&["title", "aria-label"]),
                )
                .await?;
            let permalink = self
                .field(
                    view,
                    &mut missing,
                    RecordField::Permalink,
                    targets::COMMENT_PERMALINK,
                    comment,
                    Source::Attr(&["href"]),
                )
                .await?;
            if text.is_none() && author.is_none() && permalink.is_none() {
                view.metrics.record_empty_container();
                continue;
            }
            let (source_id, derived) = match permalink
                .as_deref()
                .and_then(|link| derive_source_id(link, RecordKind::Comment))
            {
                Some(id) => (id, false),
                None => {
                    let scoped = format!("{parent_id} {}", text.as_deref().unwrap_or_default());
                    (fallback_source_id(author.as_deref(), Some(&scoped)), true)
                }
            };
            if state.is_known(&source_id, None) {
                view.metrics.record_duplicate();
                continue;
            }
            state.remember(&source_id, None);
            self.note_degradation(view, &source_id, &missing);
            records.push(RawRecord {
                kind: RecordKind::Comment,
                source_id,
                source_id_derived: derived,
                timestamp: self.normalize(timestamp_raw.as_deref(), captured_at),
                raw_text: text,
                author_name: author,
                author_avatar_ref: avatar,
                timestamp_raw,
                permalink_ref: permalink,
                parent_id: Some(parent_id.to_string()),
                captured_at,
                missing_fields: missing,
            });
        }
        Ok(records)
    }

    /// One attempt to reveal truncated text.
    async fn expand(&self, view: &mut PageView<'_>, container: ElementRef) -> BrowserResult<()> {
        let toggle = match view.resolve(targets::SEE_MORE, Some(container)).await {
            Ok(Some(toggle)) => toggle,
            Ok(None) => return Ok(()),
            Err(BrowserError::Closed) => return Err(BrowserError::Closed),
            Err(err) => {
                trace!(error = %err, "see-more lookup failed");
                return Ok(());
            }
        };
        match view.driver.click(toggle).await {
            Ok(()) => Ok(()),
            Err(BrowserError::Closed) => Err(BrowserError::Closed),
            Err(err) => {
                debug!(container = %container, error = %err, "failed to expand truncated text");
                Ok(())
            }
        }
    }

    /// Reads one field, recording it in `missing` when it cannot be read.
    async fn field(
        &self,
        view: &mut PageView<'_>,
        missing: &mut Vec<RecordField>,
        field: RecordField,
        target: &str,
        scope: ElementRef,
        source: Source,
    ) -> BrowserResult<Option<String>> {
        match read_value(view, target, scope, source).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                missing.push(field);
                Ok(None)
            }
            Err(BrowserError::Closed) => Err(BrowserError::Closed),
            Err(err) => {
                trace!(%target, error = %err, "field resolution failed");
                missing.push(field);
                Ok(None)
            }
        }
    }

    fn note_degradation(&self, view: &mut PageView<'_>, source_id: &str, missing: &[RecordField]) {
        if missing.is_empty() {
            return;
        }
        for _ in missing {
            view.metrics.record_field_degradation();
        }
        debug!(%source_id, missing = ?missing, "emitting partial record");
    }

    fn normalize(&self, raw: Option<&str>, captured_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.config.normalize_timestamps {
            return None;
        }
        raw.and_then(|raw| normalize_timestamp(raw, captured_at))
    }
}

async fn read_value(
    view: &mut PageView<'_>,
    target: &str,
    scope: ElementRef,
    source: Source,
) -> BrowserResult<Option<String>> {
    let Some(element) = view.resolve(target, Some(scope)).await? else {
        return Ok(None);
    };
    let (attrs, text_fallback) = match source {
        Source::Text => (&[][..], true),
        Source::Attr(attrs) => (attrs, false),
        Source::AttrOrText(attrs) => (attrs, true),
    };
    for attr in attrs {
        if let Some(value) = view.driver.read_attribute(element, attr).await? {
            let value = value.trim();
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }
    }
    if !text_fallback {
        return Ok(None);
    }
    let text = view.driver.read_text(element).await?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

fn strip_truncation_marker(text: String) -> String {
    let trimmed = text.trim_end();
    let lowered = trimmed.to_lowercase();
    for marker in TRUNCATION_MARKERS {
        if lowered.ends_with(marker) {
            let cut = trimmed.len() - marker.len();
            if trimmed.is_char_boundary(cut) {
                return trimmed[..cut]
                    .trim_end_matches(|c: char| c.is_whitespace() || c == '…' || c == '.')
                    .to_string();
            }
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::EngineMetrics;
    use crate::selectors::{SelectorRegistry, SelectorSpec};
    use crate::testing::{FakeComment, FakeFeed, FeedScript};
    use tokio_util::sync::CancellationToken;

    async fn drain(
        extractor: &Extractor,
        view: &mut PageView<'_>,
        state: &mut ScrollState,
    ) -> Vec<RawRecord> {
        let mut pass = extractor.begin(view).await.unwrap();
        let mut records = Vec::new();
        while let Some(record) = extractor.next_record(view, &mut pass, state).await.unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn truncation_markers_are_stripped() {
        assert_eq!(strip_truncation_marker("Long story… See more".into()), "Long story");
        assert_eq!(strip_truncation_marker("Nothing to see".into()), "Nothing to see");
    }

    #[tokio::test]
    async fn posts_come_out_in_view_order_with_fields() {
        let feed = FakeFeed::new(FeedScript::with_posts(3));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        let extractor = Extractor::new(ExtractionSection::default());
        let mut state = ScrollState::new();

        let records = drain(&extractor, &mut view, &mut state).await;
        let script = feed.script();
        assert_eq!(records.len(), 3);
        for (record, post) in records.iter().zip(&script.posts) {
            assert_eq!(record.kind, RecordKind::Post);
            assert_eq!(record.author_name.as_deref(), post.author.as_deref());
            assert_eq!(record.raw_text.as_deref(), Some(post.text.as_str()));
            assert_eq!(record.permalink_ref, post.permalink);
            assert!(!record.source_id_derived);
            assert!(record.timestamp.is_some());
            assert!(!record.is_partial(), "{:?}", record.missing_fields);
        }

        assert!(drain(&extractor, &mut view, &mut state).await.is_empty());
        assert_eq!(view.metrics.duplicates_skipped, 3);
    }

    #[tokio::test]
    async fn truncated_text_is_expanded_once() {
        let mut script = FeedScript::with_posts(1);
        script.posts[0].truncated = true;
        let feed = FakeFeed::new(script);
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        let extractor = Extractor::new(ExtractionSection::default());

        let records = drain(&extractor, &mut view, &mut ScrollState::new()).await;
        assert_eq!(records[0].raw_text.as_deref(), Some(feed.script().posts[0].text.as_str()));
        assert_eq!(feed.clicks(), ["feed/post0/see-more"]);
    }

    #[tokio::test]
    async fn unresolvable_field_degrades_to_empty() {
        let feed = FakeFeed::new(FeedScript::with_posts(2));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        registry.insert(SelectorSpec::new(targets::AUTHOR_NAME, ["span.gone", "b.also-gone"]).unwrap());
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        let extractor = Extractor::new(ExtractionSection::default());

        let records = drain(&extractor, &mut view, &mut ScrollState::new()).await;
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.author_name, None);
            assert_eq!(record.missing_fields, [RecordField::AuthorName]);
            assert!(record.raw_text.is_some());
        }
        assert_eq!(view.metrics.field_degradations, 2);
    }

    #[tokio::test]
    async fn missing_permalink_falls_back_to_content_id() {
        let mut script = FeedScript::with_posts(2);
        script.posts[1].permalink = None;
        let feed = FakeFeed::new(script);
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        let extractor = Extractor::new(ExtractionSection::default());

        let records = drain(&extractor, &mut view, &mut ScrollState::new()).await;
        assert!(!records[0].source_id_derived);
        assert!(records[1].source_id_derived);
        assert!(records[1].source_id.starts_with("gen_"));
        assert!(records[1].missing_fields.contains(&RecordField::Permalink));
    }

    #[tokio::test]
    async fn comments_follow_their_post() {
        let mut script = FeedScript::with_posts(2);
        script.posts[0].comments = vec![
            FakeComment::new("c1", "Bea", "First!"),
            FakeComment::new("c2", "Cal", "Agreed, nice post"),
            FakeComment::new("c3", "Dee", "Late to the party"),
        ];
        let feed = FakeFeed::new(script);
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        let extractor = Extractor::new(ExtractionSection {
            include_comments: true,
            max_comments_per_post: 2,
            ..ExtractionSection::default()
        });

        let records = drain(&extractor, &mut view, &mut ScrollState::new()).await;
        let kinds: Vec<_> = records.iter().map(|record| record.kind).collect();
        assert_eq!(
            kinds,
            [RecordKind::Post, RecordKind::Comment, RecordKind::Comment, RecordKind::Post]
        );
        let parent = records[0].source_id.clone();
        assert_eq!(records[1].parent_id.as_deref(), Some(parent.as_str()));
        assert_eq!(records[1].source_id, "c1");
        assert_eq!(records[2].source_id, "c2");
        assert_eq!(records[2].author_name.as_deref(), Some("Cal"));
        assert_eq!(records[2].raw_text.as_deref(), Some("Agreed, nice post"));
    }
}
