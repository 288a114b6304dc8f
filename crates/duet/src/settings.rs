//! Runtime settings of one client

use duet_config::Config;
use std::time::Duration;

use crate::relay::RelayTimeouts;

/// Timing knobs of the matcher, relay and lifecycle controller
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Pause between queue scans when no partner is available
    pub scan_interval: Duration,
    /// Age after which a reservation may be taken over
    pub reservation_lease: Duration,
    pub contention_backoff_min: Duration,
    pub contention_backoff_max: Duration,
    pub answer_timeout: Duration,
    pub negotiation_timeout: Duration,
    /// Delay before re-queueing after a skip or a peer leaving
    pub skip_delay: Duration,
    /// First delay after a failure, doubled per consecutive failure
    pub failure_backoff: Duration,
    pub max_failure_backoff: Duration,
    /// How long a partner who left before connecting is excluded from matching
    pub early_leave_cooldown: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientSettings {
    fn from(config: &Config) -> Self {
        let ms = Duration::from_millis;
        Self {
            scan_interval: ms(config.matching.scan_interval_ms),
            reservation_lease: ms(config.matching.reservation_lease_ms),
            contention_backoff_min: ms(config.matching.contention_backoff_min_ms),
            contention_backoff_max: ms(config
                .matching
                .contention_backoff_max_ms
                .max(config.matching.contention_backoff_min_ms)),
            answer_timeout: ms(config.session.answer_timeout_ms),
            negotiation_timeout: ms(config.session.negotiation_timeout_ms),
            skip_delay: ms(config.lifecycle.skip_delay_ms),
            failure_backoff: ms(config.lifecycle.failure_backoff_ms),
            max_failure_backoff: ms(config
                .lifecycle
                .max_failure_backoff_ms
                .max(config.lifecycle.failure_backoff_ms)),
            early_leave_cooldown: ms(config.lifecycle.early_leave_cooldown_ms),
        }
    }
}

impl ClientSettings {
    /// Short timings for tests and simulations
    pub fn fast() -> Self {
        let ms = Duration::from_millis;
        Self {
            scan_interval: ms(20),
            reservation_lease: ms(1000),
            contention_backoff_min: ms(5),
            contention_backoff_max: ms(25),
            answer_timeout: ms(1000),
            negotiation_timeout: ms(2000),
            skip_delay: ms(50),
            failure_backoff: ms(100),
            max_failure_backoff: ms(800),
            early_leave_cooldown: ms(2000),
        }
    }

    pub fn relay_timeouts(&self) -> RelayTimeouts {
        RelayTimeouts {
            answer: self.answer_timeout,
            negotiation: self.negotiation_timeout,
        }
    }

    /// Backoff after `failures` consecutive failures (1 = first failure)
    pub fn failure_backoff_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.failure_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_failure_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_config() {
        let settings = ClientSettings::default();
        assert_eq!(settings.scan_interval, Duration::from_millis(250));
        assert_eq!(settings.reservation_lease, Duration::from_secs(5));
        assert_eq!(settings.answer_timeout, Duration::from_secs(10));
        assert_eq!(settings.relay_timeouts().negotiation, Duration::from_secs(20));
        assert_eq!(settings.early_leave_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_failure_backoff_doubles_and_caps() {
        let settings = ClientSettings::default();
        assert_eq!(settings.failure_backoff_for(1), Duration::from_secs(3));
        assert_eq!(settings.failure_backoff_for(2), Duration::from_secs(6));
        assert_eq!(settings.failure_backoff_for(3), Duration::from_secs(12));
        assert_eq!(settings.failure_backoff_for(5), Duration::from_secs(30));
        assert_eq!(settings.failure_backoff_for(100), Duration::from_secs(30));
    }

    #[test]
    fn test_inverted_ranges_are_clamped() {
        let mut config = Config::default();
        config.matching.contention_backoff_min_ms = 300;
        config.matching.contention_backoff_max_ms = 100;
        let settings = ClientSettings::from(&config);
        assert_eq!(settings.contention_backoff_max, Duration::from_millis(300));
    }
}
