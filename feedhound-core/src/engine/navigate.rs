use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use super::error::NavigationError;
use super::stabilize::{ContentProbe, Readiness, StabilizationWaiter};
use super::view::PageView;
use crate::browser::{Backoff, BrowserError, BrowserResult, RetryPolicy};
use crate::config::{NavigationSection, StabilizationSection};
use crate::selectors::targets;

/// Lands on a feed's primary view.
#[derive(Debug, Clone)]
pub struct Navigator {
    suffix: String,
    sub_views: Vec<String>,
    content_check: Duration,
    probe: ContentProbe,
    retry: RetryPolicy,
}

impl Navigator {
    pub fn new(
        navigation: &NavigationSection,
        stabilization: &StabilizationSection,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            suffix: navigation.primary_view_suffix.trim_matches('/').to_string(),
            sub_views: navigation.sub_views.clone(),
            content_check: navigation.content_check(),
            probe: ContentProbe::new(stabilization.min_text_length),
            retry,
        }
    }

    /// The primary-view URL for a bare feed URL, or `None` when `url`
    /// already names a specific view.
    pub fn primary_view_url(&self, url: &Url) -> Option<Url> {
        if self.suffix.is_empty() {
            return None;
        }
        let named = url.path_segments().is_some_and(|mut segments| {
            segments.any(|segment| segment == self.suffix || self.sub_views.iter().any(|view| view == segment))
        });
        if named {
            return None;
        }
        let mut anchored = url.clone();
        anchored.path_segments_mut().ok()?.pop_if_empty().push(&self.suffix);
        Some(anchored)
    }

    /// Navigates to `target` and makes sure its primary view is the active
    /// one, retrying within the retry budget.
    pub async fn open_feed(
        &self,
        view: &mut PageView<'_>,
        waiter: &StabilizationWaiter,
        target: &str,
    ) -> Result<Url, NavigationError> {
        let url = Url::parse(target).map_err(|err| NavigationError::InvalidUrl {
            url: target.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NavigationError::InvalidUrl {
                url: target.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        let anchored = self.primary_view_url(&url);

        let mut failures = 0;
        loop {
            if view.is_cancelled() {
                return Err(NavigationError::Cancelled);
            }
            let attempt = self.attempt(view, waiter, &url, anchored.as_ref()).await;
            if view.is_cancelled() {
                return Err(NavigationError::Cancelled);
            }
            match attempt {
                Ok(landed) => {
                    info!(url = %landed, attempts = failures + 1, "feed opened");
                    return Ok(landed);
                }
                Err(err) => {
                    failures += 1;
                    warn!(url = %url, attempt = failures, error = %err, "feed navigation failed");
                    match self.retry.backoff(failures, view.cancel).await {
                        Backoff::Proceed => {}
                        Backoff::Exhausted => {
                            return Err(NavigationError::Exhausted {
                                attempts: failures,
                                last: err,
                            })
                        }
                        Backoff::Cancelled => return Err(NavigationError::Cancelled),
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        view: &mut PageView<'_>,
        waiter: &StabilizationWaiter,
        url: &Url,
        anchored: Option<&Url>,
    ) -> BrowserResult<Url> {
        let mut landed = url.clone();
        if let Some(anchored) = anchored {
            view.driver.navigate(url.as_str()).await?;
            let readiness = waiter
                .wait_until_ready(view, None, &self.probe, self.content_check)
                .await?;
            if readiness != Readiness::Ready {
                debug!(url = %url, suffix = %self.suffix, "bare feed url shows no content");
                view.driver.navigate(anchored.as_str()).await?;
                landed = anchored.clone();
            }
        } else {
            view.driver.navigate(url.as_str()).await?;
        }
        view.metrics.record_page_open();
        self.anchor_tab(view).await?;
        Ok(landed)
    }

    /// Selects the primary-view tab when the page offers one. A page without
    /// the tab is taken as already anchored.
    async fn anchor_tab(&self, view: &mut PageView<'_>) -> BrowserResult<()> {
        let Some(tab) = view.resolve(targets::PRIMARY_VIEW_TAB, None).await? else {
            return Ok(());
        };
        if is_selected(view, tab).await? {
            return Ok(());
        }
        debug!("primary view tab not selected, clicking it");
        view.driver.click(tab).await?;
        let Some(tab) = view.resolve(targets::PRIMARY_VIEW_TAB, None).await? else {
            return Ok(());
        };
        if is_selected(view, tab).await? {
            Ok(())
        } else {
            Err(BrowserError::Timeout("primary view tab selection".into()))
        }
    }
}

async fn is_selected(view: &mut PageView<'_>, tab: crate::browser::ElementRef) -> BrowserResult<bool> {
    Ok(view
        .driver
        .read_attribute(tab, "aria-selected")
        .await?
        .is_some_and(|value| value == "true"))
}
