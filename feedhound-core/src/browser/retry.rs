use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetrySection;

/// Bounded retries with a fixed backoff schedule plus random jitter. The last
/// schedule entry repeats once the schedule runs out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    jitter_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The delay elapsed; try again.
    Proceed,
    /// The attempt budget is spent.
    Exhausted,
    Cancelled,
}

impl RetryPolicy {
    pub fn new(config: RetrySection) -> Self {
        let mut schedule = config
            .schedule_ms
            .into_iter()
            .map(Duration::from_millis)
            .collect::<Vec<_>>();
        if schedule.is_empty() {
            schedule.push(Duration::from_secs(1));
        }
        Self {
            max_attempts: config.max_attempts.max(1),
            schedule,
            jitter_ms: config.jitter_ms,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let index = (attempt - 1).min(self.schedule.len() - 1);
        self.schedule[index]
    }

    /// Called after `failures` consecutive failed attempts. Sleeps out the
    /// scheduled delay unless the budget is spent or `cancel` fires first.
    pub async fn backoff(&self, failures: usize, cancel: &CancellationToken) -> Backoff {
        if failures >= self.max_attempts {
            return Backoff::Exhausted;
        }
        if cancel.is_cancelled() {
            return Backoff::Cancelled;
        }
        let mut delay = self.delay_for_attempt(failures);
        if self.jitter_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
            delay += Duration::from_millis(jitter);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Backoff::Proceed,
            _ = cancel.cancelled() => Backoff::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(RetrySection {
            max_attempts,
            schedule_ms: vec![100, 200],
            jitter_ms: 0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn follows_schedule_until_budget_is_spent() {
        let policy = policy(3);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert_eq!(policy.backoff(1, &cancel).await, Backoff::Proceed);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, &cancel).await, Backoff::Proceed);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(policy.backoff(3, &cancel).await, Backoff::Exhausted);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(policy(5).backoff(1, &cancel).await, Backoff::Cancelled);
    }

    #[test]
    fn schedule_repeats_last_entry() {
        let policy = policy(10);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(200));
    }

    #[test]
    fn zero_attempts_still_allows_one() {
        assert_eq!(policy(0).max_attempts(), 1);
    }
}
