use std::time::Duration;

/// Bounded, escalating retry intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    pub fn from_millis(intervals_ms: &[u64]) -> Self {
        Self::new(intervals_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// Interval to wait before retry number `attempt` (zero based).
    ///
    /// The boolean is `false` once the policy is exhausted and the last
    /// interval is being repeated.
    pub fn interval(&self, attempt: usize) -> (Duration, bool) {
        match self.intervals.get(attempt) {
            Some(interval) => (*interval, true),
            None => (self.max_interval(), false),
        }
    }

    pub fn max_interval(&self) -> Duration {
        self.intervals.last().copied().unwrap_or_default()
    }
}

/// Attempt counter over a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let (interval, _) = self.policy.interval(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        interval
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
