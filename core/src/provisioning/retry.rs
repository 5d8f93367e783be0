use std::time::Duration;

/// Capped exponential backoff with a fixed attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Model downloads: 8s, 16s, 32s, 64s, 90s.
    pub const DOWNLOAD: RetryPolicy = RetryPolicy {
        base: Duration::from_secs(8),
        cap: Duration::from_secs(90),
        max_attempts: 5,
    };

    /// Runtime bootstrap: 10s, 20s, 40s, 80s.
    pub const BOOTSTRAP: RetryPolicy = RetryPolicy {
        base: Duration::from_secs(10),
        cap: Duration::from_secs(120),
        max_attempts: 4,
    };

    /// Delay before retry number `attempt + 1` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether another retry fits in the budget after `attempts` so far.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
