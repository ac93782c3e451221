use serde::Serialize;
use tracing::{debug, info, warn};

use super::view::PageView;
use crate::browser::{BrowserError, ElementRef};
use crate::config::{OverlayRuleConfig, OverlaySection};

/// Detection and dismissal targets for one kind of interruption, both named
/// in the selector registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayRule {
    pub name: String,
    pub detect: String,
    pub dismiss: String,
    pub priority: u32,
}

impl From<&OverlayRuleConfig> for OverlayRule {
    fn from(config: &OverlayRuleConfig) -> Self {
        Self {
            name: config.name.clone(),
            detect: config.detect.clone(),
            dismiss: config.dismiss.clone(),
            priority: config.priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissalKind {
    Dismissed,
    /// The overlay detached before the click landed.
    Raced,
    Escaped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayAction {
    pub rule: String,
    pub kind: DismissalKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub actions: Vec<OverlayAction>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OverlayHandler {
    rules: Vec<OverlayRule>,
    escape_fallback: bool,
}

impl OverlayHandler {
    pub fn new(mut rules: Vec<OverlayRule>, escape_fallback: bool) -> Self {
        rules.sort_by_key(|rule| rule.priority);
        Self {
            rules,
            escape_fallback,
        }
    }

    pub fn from_config(config: &OverlaySection) -> Self {
        Self::new(
            config.rules.iter().map(OverlayRule::from).collect(),
            config.escape_fallback,
        )
    }

    pub fn rules(&self) -> &[OverlayRule] {
        &self.rules
    }

    /// Runs every rule once, in priority order, dismissing each visible match.
    /// Sweeping a clean view reports no actions. Nothing here fails the run:
    /// lookup errors are logged and the sweep moves on.
    pub async fn sweep(&self, view: &mut PageView<'_>) -> SweepReport {
        let mut report = SweepReport::default();
        if view.is_cancelled() {
            return report;
        }
        for rule in &self.rules {
            let detected = match view.resolve_all(&rule.detect, None).await {
                Ok(found) => found,
                Err(err) => {
                    debug!(rule = %rule.name, error = %err, "overlay detection failed");
                    continue;
                }
            };
            for overlay in detected {
                match view.driver.is_visible(overlay).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) if err.is_detached() => continue,
                    Err(err) => {
                        debug!(rule = %rule.name, error = %err, "overlay visibility check failed");
                        continue;
                    }
                }
                if let Some(kind) = self.dismiss(view, rule, overlay).await {
                    match kind {
                        DismissalKind::Escaped => view.metrics.record_escape_fallback(),
                        DismissalKind::Dismissed => view.metrics.record_dismissal(false),
                        DismissalKind::Raced => view.metrics.record_dismissal(true),
                    }
                    info!(rule = %rule.name, kind = ?kind, "dismissed overlay");
                    report.actions.push(OverlayAction {
                        rule: rule.name.clone(),
                        kind,
                    });
                }
            }
        }
        report
    }

    async fn dismiss(
        &self,
        view: &mut PageView<'_>,
        rule: &OverlayRule,
        overlay: ElementRef,
    ) -> Option<DismissalKind> {
        let control = match view.resolve(&rule.dismiss, Some(overlay)).await {
            Ok(Some(control)) => Some(control),
            Ok(None) => self.page_wide_control(view, rule).await.ok()?,
            Err(BrowserError::Closed) => return None,
            Err(err) if err.is_detached() => return Some(DismissalKind::Raced),
            Err(err) => {
                debug!(rule = %rule.name, error = %err, "dismiss control lookup failed");
                None
            }
        };
        if let Some(control) = control {
            match view.driver.click(control).await {
                Ok(()) => return Some(DismissalKind::Dismissed),
                Err(err) if err.is_detached() => return Some(DismissalKind::Raced),
                Err(err) => {
                    debug!(rule = %rule.name, error = %err, "dismiss click failed");
                }
            }
        }
        if !self.escape_fallback {
            warn!(rule = %rule.name, "overlay has no usable dismiss control");
            return None;
        }
        match view.driver.press_escape().await {
            Ok(()) => Some(DismissalKind::Escaped),
            Err(err) => {
                warn!(rule = %rule.name, error = %err, "escape fallback failed");
                None
            }
        }
    }

    /// Controls rendered outside the overlay node, e.g. in a portal. Only a
    /// visible match counts. `Err` means the page is gone.
    async fn page_wide_control(
        &self,
        view: &mut PageView<'_>,
        rule: &OverlayRule,
    ) -> Result<Option<ElementRef>, BrowserError> {
        let control = match view.resolve(&rule.dismiss, None).await {
            Ok(Some(control)) => control,
            Ok(None) => return Ok(None),
            Err(BrowserError::Closed) => return Err(BrowserError::Closed),
            Err(err) => {
                debug!(rule = %rule.name, error = %err, "page-wide dismiss control lookup failed");
                return Ok(None);
            }
        };
        match view.driver.is_visible(control).await {
            Ok(true) => Ok(Some(control)),
            Ok(false) => Ok(None),
            Err(BrowserError::Closed) => Err(BrowserError::Closed),
            Err(err) => {
                debug!(rule = %rule.name, error = %err, "page-wide dismiss control went away");
                Ok(None)
            }
        }
    }
}
