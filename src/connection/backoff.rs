use std::time::Duration;

use rand::Rng;

/// Reconnect schedule after an unexpected drop. Disabled unless configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Upper bound of the delay before reconnect attempt `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Whether a connection that stayed up for `uptime` earns a fresh
    /// attempt count.
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.max_delay
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`, or `None` once the policy
    /// gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt >= self.max_attempts {
            return None;
        }

        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let floor = ceiling / 2;
        let millis = if ceiling > floor {
            rand::rng().random_range(floor..=ceiling)
        } else {
            ceiling
        };
        Some(Duration::from_millis(millis))
    }
}
