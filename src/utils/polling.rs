use std::time::{Duration, Instant};

/// Floor for the poll interval so a zero setting cannot spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deadline-bounded poll loop shared by every bounded wait in the crate.
///
/// The deadline is fixed at construction; `tick` sleeps one interval (never
/// past the deadline) and reports whether another attempt is allowed.
#[derive(Debug, Clone)]
pub struct Poller {
    started: Instant,
    /// `None` when the timeout is too large to represent.
    deadline: Option<Instant>,
    poll_interval: Duration,
    attempts: u32,
}

impl Poller {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started.checked_add(timeout),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            attempts: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline
            .map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Counts an attempt without sleeping.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Sleeps until the next attempt; `false` once the deadline has passed.
    pub async fn tick(&mut self) -> bool {
        if self.expired() {
            return false;
        }
        let pause = self.poll_interval.min(self.remaining());
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_timeout_never_ticks() {
        let mut poller = Poller::new(Duration::ZERO, Duration::from_millis(10));
        assert!(poller.expired());
        assert!(!poller.tick().await);
    }

    #[tokio::test]
    async fn ticks_until_deadline() {
        let mut poller = Poller::new(Duration::from_millis(60), Duration::from_millis(20));
        let mut ticks = 0;
        while poller.tick().await {
            poller.record_attempt();
            ticks += 1;
            assert!(ticks < 100);
        }
        assert!(ticks >= 2);
        assert_eq!(poller.attempts(), ticks);
        assert!(poller.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn unrepresentable_timeout_never_expires() {
        let mut poller = Poller::new(Duration::MAX, Duration::from_millis(1));
        assert!(!poller.expired());
        assert_eq!(poller.remaining(), Duration::MAX);
        assert!(poller.tick().await);
    }

    #[tokio::test]
    async fn zero_interval_still_sleeps() {
        let mut poller = Poller::new(Duration::from_millis(50), Duration::ZERO);
        let mut ticks = 0;
        while poller.tick().await {
            ticks += 1;
        }
        assert!(ticks <= 10, "spun {ticks} times");
    }
}
