use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::overlay::OverlayHandler;
use super::stabilize::{ContentProbe, Readiness, StabilizationWaiter};
use super::view::PageView;
use crate::browser::{BrowserResult, ScrollPacer};
use crate::config::{ScrollSection, StabilizationSection};
use crate::extract::content_key;
use crate::selectors::targets;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollOutcome {
    Grew,
    Stalled,
}

/// Per-run scroll bookkeeping plus the set of records already emitted.
#[derive(Debug, Default)]
pub struct ScrollState {
    pub offset: f64,
    pub consecutive_stalls: u32,
    last_fingerprint: Option<String>,
    seen_ids: HashSet<String>,
    seen_keys: HashSet<String>,
}

impl ScrollState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record with this id or content key was already emitted.
    pub fn is_known(&self, source_id: &str, content_key: Option<&str>) -> bool {
        self.seen_ids.contains(source_id)
            || content_key.is_some_and(|key| self.seen_keys.contains(key))
    }

    pub fn remember(&mut self, source_id: &str, content_key: Option<&str>) {
        self.seen_ids.insert(source_id.to_string());
        if let Some(key) = content_key {
            self.seen_keys.insert(key.to_string());
        }
    }

    pub fn emitted(&self) -> usize {
        self.seen_ids.len()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.last_fingerprint.as_deref()
    }
}

pub struct ScrollController {
    pacer: ScrollPacer,
    stall_limit: u32,
    settle_timeout: Duration,
    probe: ContentProbe,
    key_chars: usize,
}

impl ScrollController {
    pub fn new(
        pacer: ScrollPacer,
        scroll: &ScrollSection,
        stabilization: &StabilizationSection,
        key_chars: usize,
    ) -> Self {
        Self {
            pacer,
            stall_limit: scroll.stall_limit.max(1),
            settle_timeout: stabilization.after_scroll_timeout(),
            probe: ContentProbe::new(stabilization.min_text_length),
            key_chars,
        }
    }

    pub fn stall_limit(&self) -> u32 {
        self.stall_limit
    }

    pub fn is_exhausted(&self, state: &ScrollState) -> bool {
        state.consecutive_stalls >= self.stall_limit
    }

    /// Records the fingerprint of the view before the first scroll.
    pub async fn baseline(&self, view: &mut PageView<'_>, state: &mut ScrollState) -> BrowserResult<()> {
        state.last_fingerprint = Some(content_fingerprint(view, self.key_chars).await?);
        Ok(())
    }

    /// Scrolls one randomized increment, lets the page settle and compares
    /// the content fingerprint with the previous one.
    pub async fn advance(
        &mut self,
        view: &mut PageView<'_>,
        overlays: &OverlayHandler,
        waiter: &StabilizationWaiter,
        state: &mut ScrollState,
    ) -> BrowserResult<ScrollOutcome> {
        let delta = self.pacer.next_increment();
        view.driver.scroll_by(delta).await?;
        state.offset += delta;

        let pause = self.pacer.next_pause();
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = view.cancel.cancelled() => {}
        }

        overlays.sweep(view).await;
        if waiter
            .wait_until_ready(view, None, &self.probe, self.settle_timeout)
            .await?
            == Readiness::TimedOut
        {
            view.metrics.record_stabilization_timeout();
        }

        let fingerprint = content_fingerprint(view, self.key_chars).await?;
        let outcome = if state.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            state.consecutive_stalls += 1;
            ScrollOutcome::Stalled
        } else {
            state.consecutive_stalls = 0;
            ScrollOutcome::Grew
        };
        state.last_fingerprint = Some(fingerprint);
        view.metrics.record_scroll(outcome == ScrollOutcome::Stalled);
        debug!(
            delta,
            offset = state.offset,
            outcome = ?outcome,
            stalls = state.consecutive_stalls,
            "scrolled"
        );
        Ok(outcome)
    }
}

/// Digest over the distinct content keys of every materialized container.
/// Independent of container order and of repeated containers. Releases
/// element handles first.
pub async fn content_fingerprint(view: &mut PageView<'_>, key_chars: usize) -> BrowserResult<String> {
    view.release_elements().await?;
    let mut keys = BTreeSet::new();
    for container in view.resolve_all(targets::POST_CONTAINER, None).await? {
        match view.driver.read_text(container).await {
            Ok(text) => {
                let key = content_key(&text, key_chars);
                if !key.is_empty() {
                    keys.insert(key);
                }
            }
            Err(err) if err.is_detached() => {}
            Err(err) => return Err(err),
        }
    }
    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::EngineMetrics;
    use crate::config::OverlaySection;
    use crate::selectors::SelectorRegistry;
    use crate::testing::{FakeFeed, FeedScript};
    use tokio_util::sync::CancellationToken;

    fn controller() -> ScrollController {
        let scroll = ScrollSection {
            increment_px: [700, 950],
            pause_ms: [10, 20],
            stall_limit: 2,
        };
        let stabilization = StabilizationSection {
            min_text_length: 40,
            poll_interval_ms: 50,
            timeout_ms: 1_000,
            after_scroll_timeout_ms: 300,
        };
        ScrollController::new(ScrollPacer::seeded(&scroll, 1), &scroll, &stabilization, 200)
    }

    #[test]
    fn dedup_matches_on_id_or_content() {
        let mut state = ScrollState::new();
        state.remember("100", Some("hello world"));
        assert!(state.is_known("100", None));
        assert!(state.is_known("gen_x", Some("hello world")));
        assert!(!state.is_known("200", Some("other")));
        assert_eq!(state.emitted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_feed_grows_then_short_feed_stalls() {
        let overlays = OverlayHandler::from_config(&OverlaySection::default());
        let waiter = StabilizationWaiter::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let feed = FakeFeed::new(FeedScript::with_posts(30));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let mut controller = controller();
        let mut state = ScrollState::new();
        {
            let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
            controller.baseline(&mut view, &mut state).await.unwrap();
            for _ in 0..3 {
                let outcome = controller
                    .advance(&mut view, &overlays, &waiter, &mut state)
                    .await
                    .unwrap();
                assert_eq!(outcome, ScrollOutcome::Grew);
            }
        }
        assert!(state.offset >= 2_100.0);
        assert_eq!(metrics.scrolls, 3);
        assert_eq!(metrics.stalls, 0);

        let feed = FakeFeed::new(FeedScript::with_posts(3));
        let mut driver = feed.authenticated_page().await;
        let mut metrics = EngineMetrics::default();
        let mut state = ScrollState::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        controller.baseline(&mut view, &mut state).await.unwrap();
        for expected in 1..=2 {
            let outcome = controller
                .advance(&mut view, &overlays, &waiter, &mut state)
                .await
                .unwrap();
            assert_eq!(outcome, ScrollOutcome::Stalled);
            assert_eq!(state.consecutive_stalls, expected);
        }
        assert!(controller.is_exhausted(&state));
    }
}
