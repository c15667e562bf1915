use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::BrowsingContext;

pub const KNOWN_SESSION_COOKIES: [&str; 19] = [
    "_gcl_au",
    "_gid",
    "_ga",
    "AMCVS_",
    "AMCV_",
    "s_cc",
    "s_sq",
    "mbox",
    "RT",
    "_fbp",
    "reauid",
    "reauids",
    "visid_incap",
    "incap_ses",
    "nlbi_",
    "utag_main",
    "__gads",
    "IDE",
    "_gat",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            jitter: Duration::from_secs(10),
            cap: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// `2^retry_count * base + uniform(0, jitter)`, capped.
pub fn compute_backoff(retry_count: u32, policy: &BackoffPolicy) -> Duration {
    let base_ms = policy.base.as_millis() as u64;
    let exponential = base_ms.saturating_mul(1u64.checked_shl(retry_count).unwrap_or(u64::MAX));
    let jitter_ms = policy.jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        fastrand::u64(0..jitter_ms)
    };
    Duration::from_millis(exponential.saturating_add(jitter)).min(policy.cap)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MitigationPolicy {
    pub per_batch: bool,
    pub per_retry: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for MitigationPolicy {
    fn default() -> Self {
        Self {
            per_batch: true,
            per_retry: true,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl MitigationPolicy {
    fn random_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(fastrand::u64(min..=max))
    }
}

#[derive(Debug, Clone)]
pub struct Mitigator {
    policy: MitigationPolicy,
    domain: String,
}

impl Mitigator {
    pub fn new(policy: MitigationPolicy, domain: impl Into<String>) -> Self {
        Self {
            policy,
            domain: domain.into(),
        }
    }

    pub fn policy(&self) -> &MitigationPolicy {
        &self.policy
    }

    pub async fn mitigate<C>(&self, ctx: &C, stop: &CancellationToken) -> bool
    where
        C: BrowsingContext + ?Sized,
    {
        let mut ok = true;

        for name in KNOWN_SESSION_COOKIES {
            if let Err(err) = ctx.delete_cookie(name).await {
                debug!(cookie = name, error = %err, "failed to clear known cookie");
                ok = false;
            }
        }

        match ctx.cookies().await {
            Ok(cookies) => {
                let mut cleared = 0usize;
                for cookie in cookies
                    .iter()
                    .filter(|c| c.domain.is_empty() || c.domain.contains(&self.domain))
                {
                    match ctx.delete_cookie(&cookie.name).await {
                        Ok(()) => cleared += 1,
                        Err(err) => {
                            debug!(cookie = %cookie.name, error = %err, "failed to clear cookie");
                            ok = false;
                        }
                    }
                }
                debug!(cleared, domain = %self.domain, "cleared domain cookies");
            }
            Err(err) => {
                warn!(error = %err, "cookie enumeration failed");
                ok = false;
            }
        }

        let delay = self.policy.random_delay();
        info!(delay_ms = delay.as_millis() as u64, ok, "rate-limit mitigation applied");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.cancelled() => {}
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::ScriptedContext;
    use tokio::time::Instant;

    #[test]
    fn backoff_grows_strictly_and_is_capped() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let first = compute_backoff(0, &policy);
            let second = compute_backoff(1, &policy);
            let third = compute_backoff(2, &policy);
            assert!(first >= Duration::from_secs(30) && first < Duration::from_secs(40));
            assert!(first < second && second < third);
            assert!(compute_backoff(5, &policy) <= Duration::from_secs(300));
        }
        assert_eq!(compute_backoff(64, &policy), Duration::from_secs(300));
    }

    #[test]
    fn retries_stop_at_the_limit() {
        let policy = BackoffPolicy::default();
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test(start_paused = true)]
    async fn clears_known_and_domain_cookies_then_waits() {
        let ctx = ScriptedContext::new();
        ctx.set_cookies(&[
            ("session", "www.realestate.com.au"),
            ("tracker", ".ads.example.net"),
        ]);
        let mitigator = Mitigator::new(MitigationPolicy::default(), "realestate.com.au");
        let started = Instant::now();

        assert!(mitigator.mitigate(&ctx, &CancellationToken::new()).await);

        let deleted = ctx.deleted_cookies();
        assert!(deleted.contains(&"_ga".to_string()));
        assert!(deleted.contains(&"session".to_string()));
        assert!(!deleted.contains(&"tracker".to_string()));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_tolerated_and_delay_still_applies() {
        let ctx = ScriptedContext::new();
        ctx.fail_cookie_calls();
        let mitigator = Mitigator::new(MitigationPolicy::default(), "realestate.com.au");
        let started = Instant::now();

        assert!(!mitigator.mitigate(&ctx, &CancellationToken::new()).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
