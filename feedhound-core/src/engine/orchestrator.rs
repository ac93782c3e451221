use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ErrorKind, RunError};
use super::navigate::Navigator;
use super::overlay::OverlayHandler;
use super::scroll::{ScrollController, ScrollState};
use super::sink::{RecordSink, SinkError};
use super::stabilize::{ContentProbe, Readiness, StabilizationWaiter};
use super::view::PageView;
use crate::browser::{
    DriverFactory, EngineMetrics, LaunchMode, PageDriver, RetryPolicy, ScrollPacer,
};
use crate::config::EngineConfig;
use crate::extract::{Extractor, RawRecord, RecordKind};
use crate::selectors::{targets, SelectorError, SelectorRegistry};
use crate::session::{LoginPrompt, SessionManager, SessionOrigin, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub target_url: String,
    /// Records to collect before stopping; `0` means until the feed runs dry.
    pub quota: usize,
    pub headless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    AcquiringSession,
    Navigating,
    Stabilizing,
    Extracting,
    Scrolling,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The quota was met.
    Success,
    /// The feed stopped yielding new content. Not an error.
    Exhausted,
    Error { kind: ErrorKind, message: String },
    Cancelled,
}

impl RunOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, RunOutcome::Error { .. })
    }

    fn from_result(result: Result<Termination, RunError>) -> Self {
        match result {
            Ok(Termination::QuotaMet) => RunOutcome::Success,
            Ok(Termination::Exhausted) => RunOutcome::Exhausted,
            Err(err) => match err.kind() {
                Some(kind) => RunOutcome::Error {
                    kind,
                    message: err.to_string(),
                },
                None => RunOutcome::Cancelled,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target_url: String,
    pub outcome: RunOutcome,
    pub records: usize,
    pub posts: usize,
    pub comments: usize,
    pub session: Option<SessionOrigin>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub metrics: EngineMetrics,
    pub states: Vec<RunState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    QuotaMet,
    Exhausted,
}

/// Per-run mutable bookkeeping.
#[derive(Debug, Default)]
struct Progress {
    states: Vec<RunState>,
    buffer: Vec<RawRecord>,
    records: usize,
    posts: usize,
    comments: usize,
}

impl Progress {
    fn enter(&mut self, state: RunState) {
        if self.states.last() != Some(&state) {
            debug!(state = ?state, "run state");
            self.states.push(state);
        }
    }

    fn push(&mut self, record: RawRecord, metrics: &mut EngineMetrics) {
        self.records += 1;
        match record.kind {
            RecordKind::Post => self.posts += 1,
            RecordKind::Comment => self.comments += 1,
        }
        metrics.record_emitted();
        self.buffer.push(record);
    }

    async fn flush(&mut self, sink: &mut dyn RecordSink) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = mem::take(&mut self.buffer);
        debug!(records = batch.len(), "flushing records");
        sink.accept(batch).await
    }
}

/// Sequences one extraction run: session, navigation, then the
/// extract/scroll loop until the quota is met or the feed runs dry.
pub struct RunOrchestrator {
    config: Arc<EngineConfig>,
    factory: Arc<dyn DriverFactory>,
    prompt: Arc<dyn LoginPrompt>,
    registry: SelectorRegistry,
    cancel: CancellationToken,
    seed: Option<u64>,
}

impl RunOrchestrator {
    /// Builds the selector registry from the catalogue, the `[selectors]`
    /// overrides and whatever was learned in earlier runs.
    pub fn new(
        config: Arc<EngineConfig>,
        factory: Arc<dyn DriverFactory>,
        prompt: Arc<dyn LoginPrompt>,
    ) -> Result<Self, SelectorError> {
        let mut registry = SelectorRegistry::from_config(&config)?;
        let learned_path = config.learned_selectors_path();
        match registry.load_learned(&learned_path) {
            Ok(0) => {}
            Ok(merged) => {
                info!(targets = merged, path = %learned_path.display(), "applied learned selectors")
            }
            Err(err) => warn!(error = %err, "ignoring learned selectors"),
        }
        Ok(Self {
            config,
            factory,
            prompt,
            registry,
            cancel: CancellationToken::new(),
            seed: None,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the selector table, e.g. to share one across runs.
    pub fn with_registry(mut self, registry: SelectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Deterministic scroll pacing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &SelectorRegistry {
        &self.registry
    }

    /// Always returns a summary; failures are reported through its outcome.
    pub async fn run(&mut self, request: RunRequest, sink: &mut dyn RecordSink) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let config = Arc::clone(&self.config);
        let mut metrics = EngineMetrics::default();
        let mut progress = Progress::default();
        progress.enter(RunState::Idle);
        info!(
            %run_id,
            url = %request.target_url,
            quota = request.quota,
            headless = request.headless,
            "run started"
        );

        progress.enter(RunState::AcquiringSession);
        let manager = SessionManager::new(
            Arc::clone(&self.factory),
            SessionStore::new(config.session_state_path()),
            Arc::clone(&self.prompt),
            config.session.clone(),
            RetryPolicy::new(config.retry.clone()),
        );
        let mode = LaunchMode::from_headless(request.headless);
        let (result, origin) = match manager
            .acquire(mode, &mut self.registry, &mut metrics, &self.cancel)
            .await
        {
            Ok(session) => {
                let origin = session.origin;
                let mut driver = session.driver;
                let result = self
                    .drive(&config, &request, driver.as_mut(), &mut metrics, &mut progress, sink)
                    .await;
                progress.enter(RunState::Draining);
                let buffered = progress.buffer.len();
                let result = match (result, progress.flush(sink).await) {
                    (Ok(_), Err(err)) => Err(RunError::Sink(err)),
                    (Err(run_err), Err(err)) => {
                        warn!(
                            records = buffered,
                            error = %err,
                            run_error = %run_err,
                            "buffered records lost while draining"
                        );
                        Err(run_err)
                    }
                    (result, Ok(())) => result,
                };
                if let Err(err) = manager.persist(driver.as_mut()).await {
                    warn!(error = %err, "failed to persist session state");
                }
                release(driver.as_mut()).await;
                (result, Some(origin))
            }
            Err(err) => {
                warn!(error = %err, "session acquisition failed");
                progress.enter(RunState::Draining);
                (Err(RunError::Session(err)), None)
            }
        };

        match self.registry.save_learned(&config.learned_selectors_path()) {
            Ok(saved) => debug!(targets = saved, "saved learned selectors"),
            Err(err) => warn!(error = %err, "failed to save learned selectors"),
        }

        let mut summary = RunSummary {
            run_id,
            target_url: request.target_url.clone(),
            outcome: RunOutcome::from_result(result),
            records: progress.records,
            posts: progress.posts,
            comments: progress.comments,
            session: origin,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            metrics,
            states: Vec::new(),
        };
        progress.enter(RunState::Terminated);
        summary.states = mem::take(&mut progress.states);
        if let Err(err) = sink.finish(&summary).await {
            warn!(error = %err, "record sink failed to finish");
            if !summary.outcome.is_error() {
                summary.outcome = RunOutcome::Error {
                    kind: ErrorKind::Sink,
                    message: RunError::Sink(err).to_string(),
                };
            }
        }
        info!(
            %run_id,
            outcome = ?summary.outcome,
            records = summary.records,
            scrolls = summary.metrics.scrolls,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        summary
    }

    async fn drive(
        &mut self,
        config: &EngineConfig,
        request: &RunRequest,
        driver: &mut dyn PageDriver,
        metrics: &mut EngineMetrics,
        progress: &mut Progress,
        sink: &mut dyn RecordSink,
    ) -> Result<Termination, RunError> {
        let mut view = PageView::new(driver, &mut self.registry, metrics, &self.cancel);
        let waiter = StabilizationWaiter::from_config(&config.stabilization);
        let overlays = OverlayHandler::from_config(&config.overlay);

        progress.enter(RunState::Navigating);
        let navigator = Navigator::new(
            &config.navigation,
            &config.stabilization,
            RetryPolicy::new(config.retry.clone()),
        );
        navigator
            .open_feed(&mut view, &waiter, &request.target_url)
            .await?;

        checkpoint(&view)?;
        progress.enter(RunState::Stabilizing);
        overlays.sweep(&mut view).await;
        let probe = ContentProbe::new(config.stabilization.min_text_length);
        match waiter
            .wait_until_ready(&mut view, None, &probe, config.stabilization.timeout())
            .await?
        {
            Readiness::TimedOut | Readiness::Refuted => {
                view.metrics.record_stabilization_timeout();
                warn!("feed did not stabilize, reading what is there");
            }
            Readiness::Cancelled => return Err(RunError::Cancelled),
            Readiness::Ready => {}
        }

        let pacer = match self.seed {
            Some(seed) => ScrollPacer::seeded(&config.scroll, seed),
            None => ScrollPacer::new(&config.scroll),
        };
        let mut scroller = ScrollController::new(
            pacer,
            &config.scroll,
            &config.stabilization,
            config.extraction.content_key_chars,
        );
        let extractor = Extractor::new(config.extraction.clone());
        let mut state = ScrollState::new();
        scroller.baseline(&mut view, &mut state).await?;

        let mut empty_passes = 0;
        loop {
            checkpoint(&view)?;
            // Handles from the previous pass and scroll are all stale by now.
            view.release_elements().await?;
            progress.enter(RunState::Extracting);
            overlays.sweep(&mut view).await;
            let mut pass = extractor.begin(&mut view).await?;
            if pass.is_empty() {
                empty_passes += 1;
                if empty_passes >= config.extraction.discovery_after_empty {
                    discover_containers(&mut view).await;
                    empty_passes = 0;
                }
            } else {
                empty_passes = 0;
            }
            while let Some(record) = extractor.next_record(&mut view, &mut pass, &mut state).await? {
                progress.push(record, &mut *view.metrics);
                if progress.buffer.len() >= config.extraction.flush_batch {
                    progress.flush(sink).await?;
                }
                if request.quota > 0 && progress.records >= request.quota {
                    info!(records = progress.records, "record quota reached");
                    return Ok(Termination::QuotaMet);
                }
            }
            debug!(
                containers = pass.containers(),
                records = progress.records,
                "extraction pass finished"
            );

            checkpoint(&view)?;
            progress.enter(RunState::Scrolling);
            scroller
                .advance(&mut view, &overlays, &waiter, &mut state)
                .await?;
            if scroller.is_exhausted(&state) {
                info!(
                    stalls = state.consecutive_stalls,
                    records = progress.records,
                    "feed exhausted"
                );
                return Ok(Termination::Exhausted);
            }
        }
    }
}

fn checkpoint(view: &PageView<'_>) -> Result<(), RunError> {
    if view.is_cancelled() {
        Err(RunError::Cancelled)
    } else {
        Ok(())
    }
}

/// Asks the backend for container locators when none of the known ones match.
async fn discover_containers(view: &mut PageView<'_>) {
    let suggestions = match view.driver.suggest_locators().await {
        Ok(suggestions) => suggestions,
        Err(err) => {
            debug!(error = %err, "container discovery failed");
            return;
        }
    };
    let mut learned = 0;
    for suggestion in suggestions {
        match view.registry.add_alternative(targets::POST_CONTAINER, &suggestion) {
            Ok(true) => learned += 1,
            Ok(false) => {}
            Err(err) => debug!(locator = %suggestion, error = %err, "rejected suggested locator"),
        }
    }
    if learned > 0 {
        view.metrics.record_learned(learned);
    }
    info!(learned, "container discovery finished");
}

async fn release(driver: &mut dyn PageDriver) {
    if let Err(err) = driver.close().await {
        warn!(error = %err, "failed to close browser page");
    }
}
