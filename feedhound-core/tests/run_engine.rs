use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use feedhound_core::engine::{RecordSink, SinkError, VecSink};
use feedhound_core::extract::RecordField;
use feedhound_core::session::SessionState;
use feedhound_core::testing::{
    FakeComment, FakeEvent, FakeFeed, FakeOverlay, FeedScript, OverlayKind, ScriptedPrompt,
};
use feedhound_core::{
    EngineConfig, ErrorKind, LoginDecision, LoginReason, RawRecord, RecordKind, RunOrchestrator,
    RunOutcome, RunRequest, RunState, RunSummary, SessionOrigin, SessionStore,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: TempDir,
    config: EngineConfig,
    feed: FakeFeed,
    prompt: Arc<ScriptedPrompt>,
}

impl Harness {
    fn new(script: FeedScript, decision: LoginDecision) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = FakeFeed::engine_config(dir.path());
        Self {
            _dir: dir,
            config,
            feed: FakeFeed::new(script),
            prompt: Arc::new(ScriptedPrompt::new(decision)),
        }
    }

    fn with_session(script: FeedScript) -> Self {
        let harness = Self::new(script, LoginDecision::Abort);
        harness.store().save(&harness.feed.valid_session()).unwrap();
        harness
    }

    fn store(&self) -> SessionStore {
        SessionStore::new(self.config.session_state_path())
    }

    fn orchestrator(&self) -> RunOrchestrator {
        RunOrchestrator::new(
            Arc::new(self.config.clone()),
            Arc::new(self.feed.clone()),
            self.prompt.clone(),
        )
        .unwrap()
        .with_seed(7)
    }

    async fn run(&self, quota: usize) -> (RunSummary, VecSink) {
        let mut sink = VecSink::new();
        let summary = self.orchestrator().run(request(quota), &mut sink).await;
        (summary, sink)
    }
}

fn request(quota: usize) -> RunRequest {
    RunRequest {
        target_url: "https://feed.test/groups/fake".into(),
        quota,
        headless: true,
    }
}

fn texts(records: &[RawRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| record.raw_text.clone().unwrap_or_default())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn quota_ends_the_run_with_records_in_feed_order() {
    let harness = Harness::with_session(FeedScript::with_posts(25));
    let (summary, sink) = harness.run(10).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.records, 10);
    assert_eq!(summary.posts, 10);
    assert_eq!(summary.session, Some(SessionOrigin::Restored));
    assert_eq!(sink.records.len(), 10);
    let expected: Vec<String> = (0..10).map(|i| (10_000 + i).to_string()).collect();
    let ids: Vec<String> = sink.records.iter().map(|r| r.source_id.clone()).collect();
    assert_eq!(ids, expected);
    assert!(sink.records.iter().all(|r| !r.is_partial()));
    assert!(sink.records.iter().all(|r| r.timestamp.is_some()));
    assert_eq!(sink.summary.as_ref().map(|s| s.run_id), Some(summary.run_id));
    assert_eq!(summary.states.first(), Some(&RunState::Idle));
    assert_eq!(summary.states.last(), Some(&RunState::Terminated));
    assert_eq!(harness.prompt.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeating_feed_is_exhausted_after_the_stall_limit() {
    let mut script = FeedScript::with_posts(12);
    let unique = script.posts.clone();
    for _ in 0..3 {
        script.posts.extend(unique.clone());
    }
    let harness = Harness::with_session(script);
    let (summary, sink) = harness.run(50).await;

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(sink.records.len(), 12);
    assert_eq!(summary.metrics.stalls, 3);
    let ids: HashSet<_> = sink.records.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(ids.len(), 12);
    assert!(summary.metrics.duplicates_skipped > 0);
    assert!(!summary.outcome.is_error());
}

#[tokio::test(start_paused = true)]
async fn missing_session_falls_back_to_operator_login() {
    let harness = Harness::new(FeedScript::with_posts(8), LoginDecision::Proceed);
    let (summary, sink) = harness.run(3).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.session, Some(SessionOrigin::FreshLogin));
    assert_eq!(sink.records.len(), 3);
    assert_eq!(harness.prompt.calls(), 1);
    assert_eq!(harness.prompt.reasons(), vec![LoginReason::NoSession]);
    assert!(summary.states.contains(&RunState::Navigating));
    let stored = harness.store().load().unwrap().unwrap();
    assert_eq!(stored.payload, json!({ "token": "token-1" }));
}

#[tokio::test(start_paused = true)]
async fn rejected_session_prompts_exactly_once() {
    let harness = Harness::new(FeedScript::with_posts(8), LoginDecision::Proceed);
    harness
        .store()
        .save(&SessionState::new("fake", json!({ "token": "stale" })))
        .unwrap();
    let (summary, _) = harness.run(2).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(harness.prompt.calls(), 1);
    assert_eq!(harness.prompt.reasons(), vec![LoginReason::ProbeFailed]);
    assert_eq!(summary.metrics.login_prompts, 1);
}

#[tokio::test(start_paused = true)]
async fn declined_login_is_a_session_error() {
    let harness = Harness::new(FeedScript::with_posts(8), LoginDecision::Abort);
    let (summary, sink) = harness.run(2).await;

    assert!(matches!(
        summary.outcome,
        RunOutcome::Error {
            kind: ErrorKind::Session,
            ..
        }
    ));
    assert!(sink.records.is_empty());
    assert!(sink.summary.is_some());
    assert!(!summary.states.contains(&RunState::Navigating));
    assert_eq!(summary.states.last(), Some(&RunState::Terminated));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_field_degrades_instead_of_dropping_records() {
    let mut harness = Harness::with_session(FeedScript::with_posts(6));
    harness
        .config
        .selectors
        .insert("author_name".into(), vec!["span.no-such-author".into()]);
    let (summary, sink) = harness.run(4).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(sink.records.len(), 4);
    for record in &sink.records {
        assert_eq!(record.author_name, None);
        assert_eq!(record.missing_fields, vec![RecordField::AuthorName]);
        assert!(record.raw_text.is_some());
    }
    assert!(summary.metrics.field_degradations >= 4);
}

#[tokio::test(start_paused = true)]
async fn unknown_markup_triggers_container_discovery() {
    let mut script = FeedScript::with_posts(10);
    script.legacy_markup = true;
    script.suggested_locators = vec!["div.userContentWrapper".into()];
    let harness = Harness::with_session(script);
    let (summary, sink) = harness.run(3).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(sink.records.len(), 3);
    assert_eq!(summary.metrics.selectors_learned, 1);
    let learned = std::fs::read_to_string(harness.config.learned_selectors_path()).unwrap();
    assert!(learned.contains("div.userContentWrapper"));
}

#[tokio::test(start_paused = true)]
async fn overlays_are_cleared_during_the_run() {
    let mut script = FeedScript::with_posts(20);
    let mut late = FakeOverlay::new(OverlayKind::Notification);
    late.after_scrolls = 1;
    script.overlays = vec![FakeOverlay::new(OverlayKind::Consent), late];
    let harness = Harness::with_session(script);
    let (summary, sink) = harness.run(12).await;

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(sink.records.len(), 12);
    assert_eq!(summary.metrics.overlays_dismissed, 2);
    let clicks = harness.feed.clicks();
    assert!(clicks.contains(&"overlay0/dismiss".to_string()));
    assert!(clicks.contains(&"overlay1/dismiss".to_string()));
}

#[tokio::test(start_paused = true)]
async fn comments_follow_their_post() {
    let mut script = FeedScript::with_posts(4);
    script.posts[0].comments = vec![
        FakeComment::new("501", "Ana Lima", "First reply to the meetup post."),
        FakeComment::new("502", "Bo Chen", "Second reply to the meetup post."),
    ];
    let mut harness = Harness::with_session(script);
    harness.config.extraction.include_comments = true;
    let (summary, sink) = harness.run(0).await;

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(summary.posts, 4);
    assert_eq!(summary.comments, 2);
    let kinds: Vec<RecordKind> = sink.records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds[..3],
        [RecordKind::Post, RecordKind::Comment, RecordKind::Comment]
    );
    assert_eq!(sink.records[1].source_id, "501");
    assert_eq!(sink.records[2].parent_id.as_deref(), Some("10000"));
    assert_eq!(
        texts(&sink.records[1..3]),
        [
            "First reply to the meetup post.",
            "Second reply to the meetup post."
        ]
    );
}

/// Cancels the run as soon as the first batch arrives.
struct CancellingSink {
    inner: VecSink,
    cancel: CancellationToken,
}

#[async_trait]
impl RecordSink for CancellingSink {
    async fn accept(&mut self, batch: Vec<RawRecord>) -> Result<(), SinkError> {
        self.cancel.cancel();
        self.inner.accept(batch).await
    }

    async fn finish(&mut self, summary: &RunSummary) -> Result<(), SinkError> {
        self.inner.finish(summary).await
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_drains_and_reports_cancelled() {
    let harness = Harness::new(FeedScript::with_posts(40), LoginDecision::Abort);
    let mut stale = harness.feed.valid_session();
    stale.captured_at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    harness.store().save(&stale).unwrap();
    let cancel = CancellationToken::new();
    let mut orchestrator = harness.orchestrator().with_cancellation(cancel.clone());
    let mut sink = CancellingSink {
        inner: VecSink::new(),
        cancel,
    };
    let summary = orchestrator.run(request(0), &mut sink).await;

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert!(summary.records < 40);
    assert_eq!(sink.inner.records.len(), summary.records);
    assert!(sink.inner.summary.is_some());

    let stored = harness.store().load().unwrap().unwrap();
    assert!(stored.captured_at > stale.captured_at);
    assert_eq!(stored.payload, json!({ "token": "token-1" }));
    let events = harness.feed.events();
    let exported = events.iter().position(|event| *event == FakeEvent::Exported);
    let closed = events.iter().position(|event| *event == FakeEvent::Closed);
    assert!(exported.is_some());
    assert!(exported < closed, "session saved before the browser closed");
}

struct RejectingSink;

#[async_trait]
impl RecordSink for RejectingSink {
    async fn accept(&mut self, _batch: Vec<RawRecord>) -> Result<(), SinkError> {
        Err(SinkError::Rejected("downstream full".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn sink_failure_ends_the_run() {
    let harness = Harness::with_session(FeedScript::with_posts(20));
    let summary = harness.orchestrator().run(request(0), &mut RejectingSink).await;

    match summary.outcome {
        RunOutcome::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::Sink);
            assert!(message.contains("downstream full"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn element_handles_are_released_between_scrolls() {
    let harness = Harness::with_session(FeedScript::with_posts(30));
    let (summary, sink) = harness.run(0).await;

    assert_eq!(summary.outcome, RunOutcome::Exhausted);
    assert_eq!(sink.records.len(), 30);
    let released: Vec<usize> = harness
        .feed
        .events()
        .into_iter()
        .filter_map(|event| match event {
            FakeEvent::Released(count) => Some(count),
            _ => None,
        })
        .collect();
    assert!(released.len() as u64 > summary.metrics.scrolls);
    // Never more live handles than one rendered page's worth of nodes.
    let peak = released.iter().copied().max().unwrap_or(0);
    assert!(peak < 400, "peak live handles {peak}");
}

/// Accepts the first batch and cancels the run, then refuses everything.
struct CancelThenRefuse {
    accepted: usize,
    cancel: CancellationToken,
}

#[async_trait]
impl RecordSink for CancelThenRefuse {
    async fn accept(&mut self, batch: Vec<RawRecord>) -> Result<(), SinkError> {
        if self.cancel.is_cancelled() {
            return Err(SinkError::Rejected("closed".into()));
        }
        self.accepted += batch.len();
        self.cancel.cancel();
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn failed_drain_after_cancellation_keeps_the_cancelled_outcome() {
    let harness = Harness::with_session(FeedScript::with_posts(20));
    let cancel = CancellationToken::new();
    let mut orchestrator = harness.orchestrator().with_cancellation(cancel.clone());
    let mut sink = CancelThenRefuse { accepted: 0, cancel };
    let summary = orchestrator.run(request(0), &mut sink).await;

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(sink.accepted, harness.config.extraction.flush_batch);
}
