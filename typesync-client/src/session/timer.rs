//! Expiry warning and expiry timers

use super::types::SessionEvent;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use typesync_core::SharedClock;

/// How often the clock is re-read while a session is live
const EXPIRY_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Watches one session's expiry.
///
/// Sends [`SessionEvent::ExpiryWarning`] a fixed lead time before expiry and
/// [`SessionEvent::Expired`] once it passes. Besides sleeping until those
/// instants, the clock is re-read every minute so wall-clock jumps (a
/// suspended device) are noticed too.
pub struct ExpiryScheduler {
    lead: Duration,
    clock: SharedClock,
    events: broadcast::Sender<SessionEvent>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryScheduler {
    pub fn new(lead: Duration, clock: SharedClock, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            lead,
            clock,
            events,
            pending: Mutex::new(None),
        }
    }

    /// Replace any pending watch with one for `expires_at`.
    ///
    /// No warning is sent when its time has already passed at `now`.
    pub fn schedule(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.cancel();

        let warn_at = expires_at - self.lead;
        let mut warned = warn_at <= now;
        if warned {
            debug!(%expires_at, "Expiry warning time already passed");
        }
        let until = |at: DateTime<Utc>| (at - now).to_std().unwrap_or_default();
        let (warning_delay, expiry_delay) = (until(warn_at), until(expires_at));

        let clock = self.clock.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let warning = tokio::time::sleep(warning_delay);
            let expiry = tokio::time::sleep(expiry_delay);
            tokio::pin!(warning);
            tokio::pin!(expiry);
            let mut checks = tokio::time::interval_at(
                tokio::time::Instant::now() + EXPIRY_CHECK_INTERVAL,
                EXPIRY_CHECK_INTERVAL,
            );
            checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut expiry => break,
                    _ = &mut warning, if !warned => {
                        warned = true;
                        debug!(%expires_at, "Session expiry warning");
                        let _ = events.send(SessionEvent::ExpiryWarning { expires_at });
                    }
                    _ = checks.tick() => {
                        let now = clock.now();
                        if now >= expires_at {
                            break;
                        }
                        if !warned && now >= warn_at {
                            warned = true;
                            let _ = events.send(SessionEvent::ExpiryWarning { expires_at });
                        }
                    }
                }
            }

            debug!(%expires_at, "Session expired");
            let _ = events.send(SessionEvent::Expired { expires_at });
        });
        *self.pending.lock() = Some(handle);
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use typesync_core::{Clock, ManualClock};

    fn scheduler(clock: &ManualClock) -> (ExpiryScheduler, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(4);
        (
            ExpiryScheduler::new(Duration::minutes(30), Arc::new(clock.clone()), tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_fires_before_expiry() {
        let clock = ManualClock::default();
        let (scheduler, mut rx) = scheduler(&clock);
        let now = clock.now();
        let expires_at = now + Duration::hours(1);

        scheduler.schedule(expires_at, now);
        assert!(scheduler.is_scheduled());

        tokio::time::sleep(std::time::Duration::from_secs(29 * 60)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(std::time::Duration::from_secs(2 * 60)).await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::ExpiryWarning { expires_at });

        tokio::time::sleep(std::time::Duration::from_secs(30 * 60)).await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Expired { expires_at });
        assert!(!scheduler.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_warning_is_skipped() {
        let clock = ManualClock::default();
        let (scheduler, mut rx) = scheduler(&clock);
        let now = clock.now();
        let expires_at = now + Duration::minutes(10);

        scheduler.schedule(expires_at, now);
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Expired { expires_at });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_jump_past_expiry_is_noticed() {
        let clock = ManualClock::default();
        let (scheduler, mut rx) = scheduler(&clock);
        let now = clock.now();
        let expires_at = now + Duration::days(7);

        scheduler.schedule(expires_at, now);
        clock.advance(Duration::days(8));
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Expired { expires_at });
        assert!(!scheduler.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_watch() {
        let clock = ManualClock::default();
        let (scheduler, mut rx) = scheduler(&clock);
        let now = clock.now();

        scheduler.schedule(now + Duration::hours(1), now);
        scheduler.cancel();

        tokio::time::sleep(std::time::Duration::from_secs(7200)).await;
        assert!(rx.try_recv().is_err());
    }
}
