use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::state::JobState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallPolicy {
    pub interval: Duration,
    pub threshold: Duration,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            threshold: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    RecollectPage { page: u32 },
    ForceAdvanceBatch { batch_index: usize },
}

#[derive(Debug)]
pub struct Watchdog {
    threshold: chrono::Duration,
    last_fired: Option<(StallAction, DateTime<Utc>)>,
}

impl Watchdog {
    pub fn new(policy: StallPolicy) -> Self {
        Self {
            threshold: chrono::Duration::from_std(policy.threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            last_fired: None,
        }
    }

    pub fn inspect(&mut self, state: &JobState, now: DateTime<Utc>) -> Option<StallAction> {
        if !state.is_processing {
            return None;
        }

        let (action, since) = if !state.url_collection_complete {
            (
                StallAction::RecollectPage {
                    page: state.current_page,
                },
                state.last_url_collection_time?,
            )
        } else if state.batch_window().is_empty() {
            return None;
        } else {
            (
                StallAction::ForceAdvanceBatch {
                    batch_index: state.current_batch_index,
                },
                state.last_progress_time?,
            )
        };

        if now - since <= self.threshold {
            return None;
        }
        if let Some((fired, at)) = self.last_fired {
            if fired == action && now - at <= self.threshold {
                return None;
            }
        }
        self.last_fired = Some((action, now));
        Some(action)
    }
}

pub async fn run_watchdog(
    policy: StallPolicy,
    mut snapshots: watch::Receiver<JobState>,
    actions: UnboundedSender<StallAction>,
) {
    let mut watchdog = Watchdog::new(policy);
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if snapshots.has_changed().is_err() {
            debug!("state publisher gone, watchdog exiting");
            return;
        }
        let action = {
            let state = snapshots.borrow_and_update();
            watchdog.inspect(&state, Utc::now())
        };
        if let Some(action) = action {
            warn!(?action, "no progress within stall threshold");
            if actions.send(action).is_err() {
                return;
            }
        }
    }
}
