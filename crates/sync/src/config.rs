use std::time::Duration;

/// Runtime knobs for the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Capacity of the listing and event channels between sessions and the coordinator.
    pub queue_cap: usize,
    /// Pause between failed list/watch attempts. Zero retries immediately
    /// (after yielding to the scheduler).
    pub retry_delay: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self { Self { queue_cap: 1024, retry_delay: Duration::ZERO } }
}

impl MirrorConfig {
    /// Defaults overridden by `KMIRROR_QUEUE_CAP` and `KMIRROR_RETRY_DELAY_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queue_cap = std::env::var("KMIRROR_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.queue_cap);
        let retry_delay = std::env::var("KMIRROR_RETRY_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay);
        Self { queue_cap, retry_delay }
    }
}
