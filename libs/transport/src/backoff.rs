//! Capped linear backoff shared by the transport adapter and the worker
//! supervisors.

use std::time::Duration;

/// Delay grows by `step` per attempt and never exceeds `cap`. Callers reset
/// their attempt counter after a success.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub step: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(250),
            cap: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self { step, cap }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        std::cmp::min(self.step * attempt.min(64), self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_linearly_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(8), Duration::from_secs(2));
        assert_eq!(policy.delay(1000), Duration::from_secs(2));
    }
}
