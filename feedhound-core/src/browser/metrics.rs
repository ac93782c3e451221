use serde::{Deserialize, Serialize};

/// Counters accumulated over one run and reported in its summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub pages_opened: u64,
    pub login_prompts: u64,
    pub overlays_dismissed: u64,
    pub dismissal_races: u64,
    pub escape_fallbacks: u64,
    pub stabilization_timeouts: u64,
    pub scrolls: u64,
    pub stalls: u64,
    pub selector_promotions: u64,
    pub selectors_learned: u64,
    pub field_degradations: u64,
    pub duplicates_skipped: u64,
    pub empty_containers: u64,
    pub records_emitted: u64,
}

impl EngineMetrics {
    pub fn record_page_open(&mut self) {
        self.pages_opened = self.pages_opened.saturating_add(1);
    }

    pub fn record_login_prompt(&mut self) {
        self.login_prompts = self.login_prompts.saturating_add(1);
    }

    pub fn record_dismissal(&mut self, raced: bool) {
        self.overlays_dismissed = self.overlays_dismissed.saturating_add(1);
        if raced {
            self.dismissal_races = self.dismissal_races.saturating_add(1);
        }
    }

    pub fn record_escape_fallback(&mut self) {
        self.escape_fallbacks = self.escape_fallbacks.saturating_add(1);
    }

    pub fn record_stabilization_timeout(&mut self) {
        self.stabilization_timeouts = self.stabilization_timeouts.saturating_add(1);
    }

    pub fn record_scroll(&mut self, stalled: bool) {
        self.scrolls = self.scrolls.saturating_add(1);
        if stalled {
            self.stalls = self.stalls.saturating_add(1);
        }
    }

    pub fn record_promotion(&mut self) {
        self.selector_promotions = self.selector_promotions.saturating_add(1);
    }

    pub fn record_learned(&mut self, count: u64) {
        self.selectors_learned = self.selectors_learned.saturating_add(count);
    }

    pub fn record_field_degradation(&mut self) {
        self.field_degradations = self.field_degradations.saturating_add(1);
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_skipped = self.duplicates_skipped.saturating_add(1);
    }

    pub fn record_empty_container(&mut self) {
        self.empty_containers = self.empty_containers.saturating_add(1);
    }

    pub fn record_emitted(&mut self) {
        self.records_emitted = self.records_emitted.saturating_add(1);
    }

    /// Share of scrolls that revealed nothing new, in percent.
    pub fn stall_rate(&self) -> f64 {
        if self.scrolls == 0 {
            0.0
        } else {
            (self.stalls as f64 / self.scrolls as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_rate_counts_only_stalled_scrolls() {
        let mut metrics = EngineMetrics::default();
        assert_eq!(metrics.stall_rate(), 0.0);
        metrics.record_scroll(false);
        metrics.record_scroll(true);
        metrics.record_scroll(false);
        metrics.record_scroll(true);
        assert_eq!(metrics.scrolls, 4);
        assert_eq!(metrics.stalls, 2);
        assert_eq!(metrics.stall_rate(), 50.0);
    }

    #[test]
    fn races_are_also_dismissals() {
        let mut metrics = EngineMetrics::default();
        metrics.record_dismissal(false);
        metrics.record_dismissal(true);
        assert_eq!(metrics.overlays_dismissed, 2);
        assert_eq!(metrics.dismissal_races, 1);
    }
}
