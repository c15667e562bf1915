use std::time::Duration;

use tracing::{debug, trace};

use super::context::{BrowsingContext, NavigationTicket};
use super::error::{Result, ScrapeError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationTimings {
    pub load_timeout: Duration,
    pub poll_interval: Duration,
    pub listing_settle: Duration,
    pub detail_settle: Duration,
}

impl Default for NavigationTimings {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            listing_settle: Duration::from_secs(2),
            detail_settle: Duration::from_secs(3),
        }
    }
}

/// Registration of the one load watcher a navigation may have. Dropping it
/// deregisters, whichever way the navigation ended.
struct LoadObserver<'a> {
    active: &'a mut usize,
}

impl<'a> LoadObserver<'a> {
    fn register(active: &'a mut usize) -> Self {
        *active += 1;
        Self { active }
    }
}

impl Drop for LoadObserver<'_> {
    fn drop(&mut self) {
        *self.active -= 1;
    }
}

#[derive(Debug)]
pub struct NavigationDriver {
    timings: NavigationTimings,
    active_observers: usize,
}

impl NavigationDriver {
    pub fn new(timings: NavigationTimings) -> Self {
        Self {
            timings,
            active_observers: 0,
        }
    }

    pub fn active_observers(&self) -> usize {
        self.active_observers
    }

    pub async fn navigate<C>(&mut self, ctx: &C, url: &str, settle: Duration) -> Result<()>
    where
        C: BrowsingContext + ?Sized,
    {
        let load_timeout = self.timings.load_timeout;
        let poll_interval = self.timings.poll_interval;
        {
            let _observer = LoadObserver::register(&mut self.active_observers);
            let ticket = ctx.begin_navigation(url).await?;
            tokio::time::timeout(load_timeout, wait_for_load(ctx, &ticket, poll_interval))
                .await
                .map_err(|_| ScrapeError::NavigationTimeout {
                    timeout_ms: load_timeout.as_millis() as u64,
                })?;
        }
        debug!(url, settle_ms = settle.as_millis() as u64, "page loaded");
        tokio::time::sleep(settle).await;
        Ok(())
    }
}

async fn wait_for_load<C>(ctx: &C, ticket: &NavigationTicket, poll_interval: Duration)
where
    C: BrowsingContext + ?Sized,
{
    loop {
        match ctx.load_complete(ticket).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => trace!(url = %ticket.url, error = %err, "load check failed"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}
