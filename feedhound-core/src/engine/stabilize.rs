use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::poll::{Poller, Tick};
use super::view::PageView;
use crate::browser::{BrowserError, BrowserResult, ElementRef};
use crate::config::StabilizationSection;
use crate::selectors::targets;

/// Result of a single readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Ready,
    Pending,
    /// The page can never become ready (e.g. a login wall instead of content).
    Refuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Refuted,
    Cancelled,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(
        &self,
        view: &mut PageView<'_>,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Check>;

    fn describe(&self) -> &'static str;
}

/// Ready once no skeleton placeholder remains and at least one post container
/// carries more than `min_text_length` characters of text.
#[derive(Debug, Clone, Copy)]
pub struct ContentProbe {
    pub min_text_length: usize,
}

impl ContentProbe {
    pub fn new(min_text_length: usize) -> Self {
        Self { min_text_length }
    }
}

#[async_trait]
impl ReadinessProbe for ContentProbe {
    async fn check(
        &self,
        view: &mut PageView<'_>,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Check> {
        if !view.resolve_all(targets::SKELETON, scope).await?.is_empty() {
            return Ok(Check::Pending);
        }
        for container in view.resolve_all(targets::POST_CONTAINER, scope).await? {
            match view.driver.read_text(container).await {
                Ok(text) if text.trim().chars().count() > self.min_text_length => {
                    return Ok(Check::Ready)
                }
                Ok(_) => {}
                Err(err) if err.is_detached() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Check::Pending)
    }

    fn describe(&self) -> &'static str {
        "feed content"
    }
}

/// Ready once an authenticated-only landmark is present.
#[derive(Debug, Clone, Copy)]
pub struct LandmarkProbe {
    refute_on_login_form: bool,
}

impl LandmarkProbe {
    /// Probe for a restored session: a visible login form settles the
    /// question immediately.
    pub fn validity() -> Self {
        Self {
            refute_on_login_form: true,
        }
    }

    /// Probe for an operator-driven login, where the login form is expected.
    pub fn login() -> Self {
        Self {
            refute_on_login_form: false,
        }
    }
}

#[async_trait]
impl ReadinessProbe for LandmarkProbe {
    async fn check(
        &self,
        view: &mut PageView<'_>,
        scope: Option<ElementRef>,
    ) -> BrowserResult<Check> {
        if view.resolve(targets::AUTH_LANDMARK, scope).await?.is_some() {
            return Ok(Check::Ready);
        }
        if self.refute_on_login_form {
            if let Some(form) = view.resolve(targets::LOGIN_FORM, scope).await? {
                if view.driver.is_visible(form).await.unwrap_or(false) {
                    return Ok(Check::Refuted);
                }
            }
        }
        Ok(Check::Pending)
    }

    fn describe(&self) -> &'static str {
        "authenticated landmark"
    }
}

/// Polls a [`ReadinessProbe`] at a fixed interval until it holds, is refuted,
/// the timeout elapses or the run is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct StabilizationWaiter {
    interval: Duration,
}

impl StabilizationWaiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &StabilizationSection) -> Self {
        Self::new(config.poll_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Only a closed page is an error; every other backend failure during a
    /// check counts as "not ready yet". Unscoped waits release element
    /// handles before every check.
    pub async fn wait_until_ready(
        &self,
        view: &mut PageView<'_>,
        scope: Option<ElementRef>,
        probe: &dyn ReadinessProbe,
        timeout: Duration,
    ) -> BrowserResult<Readiness> {
        let poller = Poller::new(self.interval, timeout, view.cancel.clone());
        let mut checks = 0u32;
        loop {
            checks += 1;
            if scope.is_none() {
                view.release_elements().await?;
            }
            match probe.check(view, scope).await {
                Ok(Check::Ready) => {
                    trace!(probe = probe.describe(), checks, "view ready");
                    return Ok(Readiness::Ready);
                }
                Ok(Check::Refuted) => {
                    debug!(probe = probe.describe(), checks, "readiness refuted");
                    return Ok(Readiness::Refuted);
                }
                Ok(Check::Pending) => {}
                Err(BrowserError::Closed) => return Err(BrowserError::Closed),
                Err(err) => {
                    trace!(probe = probe.describe(), error = %err, "readiness check failed");
                }
            }
            match poller.tick().await {
                Tick::Again => {}
                Tick::Expired => {
                    debug!(
                        probe = probe.describe(),
                        checks,
                        timeout_ms = timeout.as_millis() as u64,
                        "timed out waiting for readiness"
                    );
                    return Ok(Readiness::TimedOut);
                }
                Tick::Cancelled => return Ok(Readiness::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::EngineMetrics;
    use crate::selectors::SelectorRegistry;
    use crate::testing::{FakeFeed, FeedScript};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn waits_for_skeleton_to_clear() {
        let mut script = FeedScript::with_posts(3);
        script.skeleton_for = Duration::from_millis(600);
        let feed = FakeFeed::new(script);
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);

        let started = Instant::now();
        let readiness = StabilizationWaiter::new(Duration::from_millis(100))
            .wait_until_ready(&mut view, None, &ContentProbe::new(40), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Ready);
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_an_empty_view() {
        let feed = FakeFeed::new(FeedScript::with_posts(0));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);

        let started = Instant::now();
        let readiness = StabilizationWaiter::new(Duration::from_millis(100))
            .wait_until_ready(&mut view, None, &ContentProbe::new(40), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn login_form_refutes_validity_probe() {
        let feed = FakeFeed::new(FeedScript::with_posts(2));
        let mut driver = feed.anonymous_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);
        let waiter = StabilizationWaiter::new(Duration::from_millis(100));

        let started = Instant::now();
        let readiness = waiter
            .wait_until_ready(&mut view, None, &LandmarkProbe::validity(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Refuted);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let readiness = waiter
            .wait_until_ready(&mut view, None, &LandmarkProbe::login(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_wait() {
        let feed = FakeFeed::new(FeedScript::with_posts(0));
        let mut driver = feed.authenticated_page().await;
        let mut registry = SelectorRegistry::with_defaults().unwrap();
        let mut metrics = EngineMetrics::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut view = PageView::new(driver.as_mut(), &mut registry, &mut metrics, &cancel);

        let readiness = StabilizationWaiter::new(Duration::from_millis(100))
            .wait_until_ready(&mut view, None, &ContentProbe::new(40), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Cancelled);
    }
}
