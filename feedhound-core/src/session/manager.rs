use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::SessionState;
use super::store::SessionStore;
use super::{SessionError, SessionResult};
use crate::browser::{
    Backoff, BrowserError, DriverFactory, EngineMetrics, LaunchMode, PageDriver, RetryPolicy,
};
use crate::config::SessionSection;
use crate::engine::{LandmarkProbe, PageView, Readiness, StabilizationWaiter};
use crate::selectors::SelectorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginReason {
    NoSession,
    ProbeFailed,
    /// The operator asked for a fresh login.
    Requested,
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub login_url: String,
    pub timeout: Duration,
    pub reason: LoginReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginDecision {
    Proceed,
    Abort,
}

/// Callback invoked when a human has to log in. The engine opens a visible
/// browser right after a `Proceed` and waits for the login to land.
#[async_trait]
pub trait LoginPrompt: Send + Sync {
    async fn login_required(&self, request: &LoginRequest) -> LoginDecision;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Restored,
    FreshLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeVerdict {
    Valid,
    LoginRequired,
}

/// A page whose authentication context was confirmed by the landmark probe.
pub struct ValidatedSession {
    pub driver: Box<dyn PageDriver>,
    pub origin: SessionOrigin,
    /// Mode the page actually runs in; a fresh login keeps its visible window.
    pub mode: LaunchMode,
}

impl std::fmt::Debug for ValidatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedSession")
            .field("origin", &self.origin)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub struct SessionManager {
    factory: Arc<dyn DriverFactory>,
    store: SessionStore,
    prompt: Arc<dyn LoginPrompt>,
    config: SessionSection,
    retry: RetryPolicy,
    waiter: StabilizationWaiter,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        store: SessionStore,
        prompt: Arc<dyn LoginPrompt>,
        config: SessionSection,
        retry: RetryPolicy,
    ) -> Self {
        let waiter = StabilizationWaiter::new(config.poll_interval());
        Self {
            factory,
            store,
            prompt,
            config,
            retry,
            waiter,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Restores and probes the persisted session, falling back to a manual
    /// login exactly once when it is missing or no longer valid.
    pub async fn acquire(
        &self,
        mode: LaunchMode,
        registry: &mut SelectorRegistry,
        metrics: &mut EngineMetrics,
        cancel: &CancellationToken,
    ) -> SessionResult<ValidatedSession> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let reason = match self.restore(mode, metrics).await? {
            Some(mut driver) => {
                let verdict = {
                    let mut view = PageView::new(driver.as_mut(), registry, metrics, cancel);
                    self.probe(&mut view).await
                };
                match verdict {
                    Ok(ProbeVerdict::Valid) => {
                        info!(mode = ?mode, "restored session is valid");
                        return Ok(ValidatedSession {
                            driver,
                            origin: SessionOrigin::Restored,
                            mode,
                        });
                    }
                    Ok(ProbeVerdict::LoginRequired) => {
                        warn!("persisted session failed the validity probe");
                        close_quietly(driver.as_mut()).await;
                        LoginReason::ProbeFailed
                    }
                    Err(err) => {
                        close_quietly(driver.as_mut()).await;
                        return Err(err);
                    }
                }
            }
            None => LoginReason::NoSession,
        };
        self.manual_login(reason, registry, metrics, cancel).await
    }

    /// Probes the persisted session without ever prompting for a login.
    pub async fn check(
        &self,
        mode: LaunchMode,
        registry: &mut SelectorRegistry,
        metrics: &mut EngineMetrics,
        cancel: &CancellationToken,
    ) -> SessionResult<ProbeVerdict> {
        let Some(mut driver) = self.restore(mode, metrics).await? else {
            return Ok(ProbeVerdict::LoginRequired);
        };
        let verdict = {
            let mut view = PageView::new(driver.as_mut(), registry, metrics, cancel);
            self.probe(&mut view).await
        };
        close_quietly(driver.as_mut()).await;
        verdict
    }

    /// Opens a page carrying the persisted session, if there is a usable one.
    async fn restore(
        &self,
        mode: LaunchMode,
        metrics: &mut EngineMetrics,
    ) -> SessionResult<Option<Box<dyn PageDriver>>> {
        let Some(state) = self.store.load()? else {
            return Ok(None);
        };
        if state.backend != self.factory.backend() {
            warn!(
                stored = %state.backend,
                active = %self.factory.backend(),
                "persisted session belongs to another backend"
            );
            return Ok(None);
        }
        match self.factory.open(mode, Some(&state.payload)).await {
            Ok(driver) => {
                metrics.record_page_open();
                debug!(captured_at = %state.captured_at, "restored session state");
                Ok(Some(driver))
            }
            Err(BrowserError::State(reason)) => {
                warn!(%reason, "persisted session could not be restored");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Navigates to the home surface and waits for the authenticated
    /// landmark. A visible login form short-circuits to `LoginRequired`.
    pub async fn probe(&self, view: &mut PageView<'_>) -> SessionResult<ProbeVerdict> {
        let mut failures = 0;
        loop {
            match view.driver.navigate(&self.config.home_url).await {
                Ok(()) => break,
                Err(err) => {
                    failures += 1;
                    warn!(url = %self.config.home_url, attempt = failures, error = %err, "probe navigation failed");
                    match self.retry.backoff(failures, view.cancel).await {
                        Backoff::Proceed => {}
                        Backoff::Exhausted => return Ok(ProbeVerdict::LoginRequired),
                        Backoff::Cancelled => return Err(SessionError::Cancelled),
                    }
                }
            }
        }
        let readiness = self
            .waiter
            .wait_until_ready(
                view,
                None,
                &LandmarkProbe::validity(),
                self.config.probe_timeout(),
            )
            .await?;
        match readiness {
            Readiness::Ready => Ok(ProbeVerdict::Valid),
            Readiness::TimedOut | Readiness::Refuted => Ok(ProbeVerdict::LoginRequired),
            Readiness::Cancelled => Err(SessionError::Cancelled),
        }
    }

    /// Hands over to the operator in a visible browser and persists the
    /// resulting session once the authenticated landmark shows up.
    pub async fn manual_login(
        &self,
        reason: LoginReason,
        registry: &mut SelectorRegistry,
        metrics: &mut EngineMetrics,
        cancel: &CancellationToken,
    ) -> SessionResult<ValidatedSession> {
        metrics.record_login_prompt();
        let request = LoginRequest {
            login_url: self.config.login_url.clone(),
            timeout: self.config.login_timeout(),
            reason,
        };
        info!(reason = ?reason, url = %request.login_url, "manual login required");
        if self.prompt.login_required(&request).await == LoginDecision::Abort {
            return Err(SessionError::LoginDeclined);
        }
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let mut driver = self.factory.open(LaunchMode::Headed, None).await?;
        metrics.record_page_open();
        let landed = {
            let mut view = PageView::new(driver.as_mut(), registry, metrics, cancel);
            self.await_login(&mut view, request.timeout).await
        };
        if let Err(err) = landed {
            close_quietly(driver.as_mut()).await;
            return Err(err);
        }
        if let Err(err) = self.persist(driver.as_mut()).await {
            close_quietly(driver.as_mut()).await;
            return Err(err);
        }
        info!("manual login completed");
        Ok(ValidatedSession {
            driver,
            origin: SessionOrigin::FreshLogin,
            mode: LaunchMode::Headed,
        })
    }

    async fn await_login(&self, view: &mut PageView<'_>, timeout: Duration) -> SessionResult<()> {
        view.driver.navigate(&self.config.login_url).await?;
        let readiness = self
            .waiter
            .wait_until_ready(view, None, &LandmarkProbe::login(), timeout)
            .await?;
        match readiness {
            Readiness::Ready => Ok(()),
            Readiness::TimedOut | Readiness::Refuted => {
                Err(SessionError::LoginAbandoned { waited: timeout })
            }
            Readiness::Cancelled => Err(SessionError::Cancelled),
        }
    }

    /// Serializes the page's authentication context into the store.
    pub async fn persist(&self, driver: &mut dyn PageDriver) -> SessionResult<()> {
        let payload = driver.export_state().await?;
        let state = SessionState::new(self.factory.backend(), payload);
        self.store.save(&state)
    }
}

async fn close_quietly(driver: &mut dyn PageDriver) {
    if let Err(err) = driver.close().await {
        debug!(error = %err, "failed to close page");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEvent, FakeFeed, FeedScript, ScriptedPrompt};
    use tempfile::tempdir;

    fn manager(feed: &FakeFeed, store: SessionStore, prompt: Arc<ScriptedPrompt>) -> SessionManager {
        let config = FakeFeed::engine_config(std::path::Path::new("."));
        SessionManager::new(
            Arc::new(feed.clone()),
            store,
            prompt,
            config.session.clone(),
            RetryPolicy::new(config.retry.clone()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn valid_session_is_restored_without_prompt() {
        let dir = tempdir().unwrap();
        let feed = FakeFeed::new(FeedScript::with_posts(1));
        let store = SessionStore::new(dir.path().join("session.json"));
        store.save(&feed.valid_session()).unwrap();
        let prompt = Arc::new(ScriptedPrompt::new(LoginDecision::Proceed));
        let manager = manager(&feed, store, prompt.clone());

        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let session = manager
            .acquire(LaunchMode::Headless, &mut registry, &mut metrics, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.origin, SessionOrigin::Restored);
        assert_eq!(session.mode, LaunchMode::Headless);
        assert_eq!(prompt.calls(), 0);
        assert_eq!(metrics.login_prompts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_login_is_an_error() {
        let dir = tempdir().unwrap();
        let feed = FakeFeed::new(FeedScript::with_posts(1));
        let prompt = Arc::new(ScriptedPrompt::new(LoginDecision::Abort));
        let manager = manager(&feed, SessionStore::new(dir.path().join("s.json")), prompt.clone());

        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let err = manager
            .acquire(LaunchMode::Headless, &mut registry, &mut metrics, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LoginDeclined));
        assert_eq!(prompt.calls(), 1);
        assert!(!feed.events().iter().any(|event| matches!(event, FakeEvent::Opened { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_login_times_out() {
        let dir = tempdir().unwrap();
        let mut script = FeedScript::with_posts(1);
        script.login_after = None;
        let feed = FakeFeed::new(script);
        let prompt = Arc::new(ScriptedPrompt::new(LoginDecision::Proceed));
        let store = SessionStore::new(dir.path().join("s.json"));
        let manager = manager(&feed, store.clone(), prompt);

        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let err = manager
            .acquire(LaunchMode::Headless, &mut registry, &mut metrics, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LoginAbandoned { .. }));
        assert!(store.load().unwrap().is_none());
        assert_eq!(feed.events().last(), Some(&FakeEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn check_reports_without_prompting() {
        let dir = tempdir().unwrap();
        let feed = FakeFeed::new(FeedScript::with_posts(1));
        let store = SessionStore::new(dir.path().join("s.json"));
        let prompt = Arc::new(ScriptedPrompt::new(LoginDecision::Proceed));
        let manager = manager(&feed, store.clone(), prompt.clone());
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();

        let verdict = manager
            .check(LaunchMode::Headless, &mut registry, &mut metrics, &cancel)
            .await
            .unwrap();
        assert_eq!(verdict, ProbeVerdict::LoginRequired);

        store.save(&feed.valid_session()).unwrap();
        let verdict = manager
            .check(LaunchMode::Headless, &mut registry, &mut metrics, &cancel)
            .await
            .unwrap();
        assert_eq!(verdict, ProbeVerdict::Valid);
        assert_eq!(prompt.calls(), 0);
    }
}
