//! Periodic entitlement reconciliation
//!
//! Independent of the bus triggers: on a fixed interval and whenever the tab
//! regains focus, refetch the canonical record and correct the cache if it
//! drifted. Failures are logged and never surfaced.

use super::bus::EntitlementBus;
use super::signal::BusEvent;
use crate::runtime::EnvironmentEvent;
use crate::ClientResult;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use typesync_core::TaskGroup;

pub struct EntitlementReconciler {
    bus: EntitlementBus,
    period: Duration,
    tasks: TaskGroup,
}

impl EntitlementReconciler {
    pub fn new(bus: EntitlementBus, period: Duration) -> Self {
        Self {
            bus,
            period,
            tasks: TaskGroup::new(),
        }
    }

    /// Compare the cache with the remote once; returns the correction if any
    pub async fn reconcile_once(&self) -> ClientResult<Option<BusEvent>> {
        reconcile(&self.bus).await
    }

    /// Run on the interval and on focus regain until stopped
    pub fn start(&self, mut environment: broadcast::Receiver<EnvironmentEvent>) {
        let bus = self.bus.clone();
        let period = self.period;

        self.tasks.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let reason = tokio::select! {
                    _ = ticker.tick() => "interval",
                    event = environment.recv() => match event {
                        Ok(event) if event.is_focus_regain() => "focus",
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if let Err(e) = reconcile(&bus).await {
                    warn!(reason, error = %e, "Entitlement reconciliation failed");
                }
            }
        });
    }

    pub fn stop(&self) {
        self.tasks.abort_all();
    }

    pub fn is_running(&self) -> bool {
        self.tasks.active() > 0
    }
}

async fn reconcile(bus: &EntitlementBus) -> ClientResult<Option<BusEvent>> {
    let Some(user_id) = bus.active_user() else {
        return Ok(None);
    };

    let Some(remote) = bus.fetch_canonical(&user_id).await? else {
        debug!(user_id = %user_id, "No remote entitlement to reconcile against");
        return Ok(None);
    };

    Ok(bus.apply_remote(&user_id, remote, true))
}
