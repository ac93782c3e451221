use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The interval elapsed inside the deadline; check again.
    Again,
    Expired,
    Cancelled,
}

/// Fixed-interval, deadline-bounded, cancellable pacing for
/// poll-until-true loops. The final sleep is clipped to the deadline so the
/// last check happens right at it.
#[derive(Debug)]
pub struct Poller {
    interval: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub async fn tick(&self) -> Tick {
        if self.cancel.is_cancelled() {
            return Tick::Cancelled;
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Tick::Expired;
        }
        tokio::select! {
            _ = sleep(self.interval.min(remaining)) => Tick::Again,
            _ = self.cancel.cancelled() => Tick::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_deadline() {
        let poller = Poller::new(
            Duration::from_millis(40),
            Duration::from_millis(100),
            CancellationToken::new(),
        );
        let started = Instant::now();
        let mut ticks = 0;
        while poller.tick().await == Tick::Again {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(poller.tick().await, Tick::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_sleep() {
        let cancel = CancellationToken::new();
        let poller = Poller::new(Duration::from_secs(10), Duration::from_secs(60), cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        assert_eq!(poller.tick().await, Tick::Cancelled);
    }
}
