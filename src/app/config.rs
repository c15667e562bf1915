use std::time::Duration;

use super::bridge::BridgeTimeouts;
use super::mitigation::{BackoffPolicy, MitigationPolicy};
use super::navigation::NavigationTimings;
use super::state::DEFAULT_BATCH_SIZE;
use super::watchdog::StallPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeConfig {
    pub batch_size: usize,
    pub navigation: NavigationTimings,
    pub bridge: BridgeTimeouts,
    pub backoff: BackoffPolicy,
    pub mitigation: MitigationPolicy,
    pub stall: StallPolicy,
    pub page_retry_delay: Duration,
    pub item_delay: Duration,
    pub batch_jitter: Duration,
    pub domain: Option<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            navigation: NavigationTimings::default(),
            bridge: BridgeTimeouts::default(),
            backoff: BackoffPolicy::default(),
            mitigation: MitigationPolicy::default(),
            stall: StallPolicy::default(),
            page_retry_delay: Duration::from_secs(5),
            item_delay: Duration::from_secs(1),
            batch_jitter: Duration::from_secs(5),
            domain: None,
        }
    }
}

impl ScrapeConfig {
    pub fn batch_pause(&self, delay: Duration) -> Duration {
        let jitter_ms = self.batch_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..jitter_ms)
        };
        delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_site_pacing() {
        let config = ScrapeConfig::default();
        assert_eq!(config.batch_size, 60);
        assert_eq!(config.navigation.load_timeout, Duration::from_secs(30));
        assert_eq!(config.bridge.send_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.stall.threshold, Duration::from_secs(600));
    }

    #[test]
    fn batch_pause_adds_bounded_jitter() {
        let config = ScrapeConfig::default();
        for _ in 0..20 {
            let pause = config.batch_pause(Duration::from_secs(2));
            assert!(pause >= Duration::from_secs(2) && pause < Duration::from_secs(7));
        }
    }
}
