//! User activity tracking

use super::manager::SessionManager;
use crate::runtime::EnvironmentEvent;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Throttles input signals into occasional `last_activity` refreshes
pub struct ActivityTracker {
    throttle: Duration,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ActivityTracker {
    pub fn new(throttle: std::time::Duration) -> Self {
        Self {
            throttle: Duration::from_std(throttle).unwrap_or_else(|_| Duration::seconds(60)),
            last: Mutex::new(None),
        }
    }

    /// Record an input at `now`; true when it should refresh the session
    pub fn observe(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(previous) if now - previous < self.throttle => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Feed a tab's input signals to `manager` until the stream closes
    pub fn spawn(
        self,
        manager: Arc<SessionManager>,
        mut events: broadcast::Receiver<EnvironmentEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EnvironmentEvent::Input(kind)) => {
                        if self.observe(manager.now()) {
                            debug!(?kind, "User activity");
                            if let Err(e) = manager.touch_activity() {
                                warn!(error = %e, "Failed to record activity");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_throttles() {
        let tracker = ActivityTracker::new(std::time::Duration::from_secs(60));
        let start = Utc::now();

        assert!(tracker.observe(start));
        assert!(!tracker.observe(start + Duration::seconds(30)));
        assert!(!tracker.observe(start + Duration::seconds(59)));
        assert!(tracker.observe(start + Duration::seconds(60)));
        assert!(!tracker.observe(start + Duration::seconds(61)));
    }
}
