//! Periodic maintenance: pending-sync reconciliation, stale and connectivity
//! detection, pairing and pending-registration expiry.

use crate::alerts::AlertEngine;
use crate::config::{SweepConfig, MIN_SWEEP_INTERVAL};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::pairing::PairingManager;
use crate::registration::RegistrationGate;
use crate::twin::TwinEngine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StaleReport {
    pub stale: usize,
    pub connection_alerts: usize,
}

pub struct Sweeper {
    twins: Arc<TwinEngine>,
    alerts: Arc<AlertEngine>,
    pairing: Arc<PairingManager>,
    registration: Arc<RegistrationGate>,
}

impl Sweeper {
    pub fn new(
        twins: Arc<TwinEngine>,
        alerts: Arc<AlertEngine>,
        pairing: Arc<PairingManager>,
        registration: Arc<RegistrationGate>,
    ) -> Self {
        Self {
            twins,
            alerts,
            pairing,
            registration,
        }
    }

    pub async fn sync_sweep(&self) -> usize {
        match self.twins.process_pending_syncs().await {
            Ok(n) => n,
            Err(e) => {
                error!("Pending sync sweep failed: {}", e);
                DB_FAILURES_TOTAL.inc();
                0
            }
        }
    }

    pub async fn stale_sweep(&self, now: DateTime<Utc>) -> StaleReport {
        let mut report = StaleReport::default();

        match self.twins.detect_stale(now).await {
            Ok(flagged) => report.stale = flagged.len(),
            Err(e) => {
                error!("Stale sweep failed: {}", e);
                DB_FAILURES_TOTAL.inc();
            }
        }

        let overdue = match self.twins.overdue(self.alerts.connectivity_cutoff(now)).await {
            Ok(twins) => twins,
            Err(e) => {
                error!("Connectivity sweep failed: {}", e);
                DB_FAILURES_TOTAL.inc();
                return report;
            }
        };
        for twin in &overdue {
            match self.alerts.check_connectivity(twin, now).await {
                Ok(true) => report.connection_alerts += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(device_id = %twin.device_id, "Failed to raise connectivity alert: {}", e);
                    DB_FAILURES_TOTAL.inc();
                }
            }
        }

        report
    }

    pub fn pairing_sweep(&self, now: DateTime<Utc>) -> usize {
        self.pairing.expire_sweep(now)
    }

    pub fn registration_sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        self.registration.expire_pending(now, ttl)
    }
}

/// `interval` panics on a zero period.
fn ticker(every: Duration) -> Interval {
    let mut ticker = interval(if every.is_zero() { MIN_SWEEP_INTERVAL } else { every });
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Runs every sweep on its own ticker until `shutdown` flips to `true`.
pub async fn run_sweeps(
    sweeper: Arc<Sweeper>,
    config: SweepConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Starting sweeps: sync every {:?}, stale every {:?}, pairing every {:?}, registrations every {:?}",
        config.sync_every, config.stale_every, config.pairing_every, config.registration_every
    );

    let mut sync_ticker = ticker(config.sync_every);
    let mut stale_ticker = ticker(config.stale_every);
    let mut pairing_ticker = ticker(config.pairing_every);
    let mut registration_ticker = ticker(config.registration_every);

    loop {
        tokio::select! {
            _ = sync_ticker.tick() => {
                let sent = sweeper.sync_sweep().await;
                if sent > 0 {
                    debug!("Sync sweep republished {} deltas", sent);
                }
            }

            _ = stale_ticker.tick() => {
                let report = sweeper.stale_sweep(Utc::now()).await;
                if report != StaleReport::default() {
                    info!(
                        stale = report.stale,
                        connection_alerts = report.connection_alerts,
                        "Stale sweep finished"
                    );
                }
            }

            _ = pairing_ticker.tick() => {
                let expired = sweeper.pairing_sweep(Utc::now());
                if expired > 0 {
                    debug!("Expired {} pairing sessions", expired);
                }
            }

            _ = registration_ticker.tick() => {
                let expired = sweeper.registration_sweep(Utc::now(), config.registration_ttl);
                if expired > 0 {
                    info!("Expired {} pending registrations", expired);
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Sweeps stopped");
}
