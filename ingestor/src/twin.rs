//! Reported/desired twin per device and the sync-status state machine.
//!
//! `in_sync` means nothing is outstanding, `pending` means a desired change
//! has been sent and not yet observed, `stale` means the device stopped
//! reporting. Every write goes through [`TwinRepository::modify`] so
//! concurrent samples for one device never lose updates.

use crate::broadcast::{LiveBroadcaster, LiveEventName};
use crate::changes::{ChangeEvent, ChangeSender, TwinChange};
use crate::commands::{Command, CommandDispatcher};
use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, STALE_TWINS_TOTAL};
use crate::model::{
    values_equal, DesiredState, DeviceTwin, ReportedState, SyncStatus, TwinKey,
};
use crate::repository::TwinRepository;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Desired fields that still differ from what the device reports.
///
/// Scalars contribute when set and unequal to the reported value; objects and
/// arrays are composite setpoints and always contribute. `None` means the
/// device already matches.
pub fn get_delta(desired: &DesiredState, reported: &ReportedState) -> Option<Map<String, Value>> {
    let delta: Map<String, Value> = desired
        .fields()
        .iter()
        .filter(|(field, want)| match want {
            Value::Null => false,
            Value::Object(_) | Value::Array(_) => true,
            _ => reported
                .get(field)
                .map_or(true, |have| !values_equal(want, have)),
        })
        .map(|(field, want)| (field.clone(), want.clone()))
        .collect();

    (!delta.is_empty()).then_some(delta)
}

/// Status after new reported values land.
fn reconciled_status(twin: &DeviceTwin) -> SyncStatus {
    let outstanding = get_delta(&twin.desired, &twin.reported).is_some();
    match (twin.metadata.sync_status, outstanding) {
        (SyncStatus::Pending | SyncStatus::Stale, false) => SyncStatus::InSync,
        (SyncStatus::Stale, true) => SyncStatus::Pending,
        (status, _) => status,
    }
}

pub struct TwinEngine {
    twins: Arc<dyn TwinRepository>,
    changes: ChangeSender,
    commands: CommandDispatcher,
    live: LiveBroadcaster,
    stale_after: chrono::Duration,
}

impl TwinEngine {
    pub fn new(
        twins: Arc<dyn TwinRepository>,
        changes: ChangeSender,
        commands: CommandDispatcher,
        live: LiveBroadcaster,
        stale_after: Duration,
    ) -> Self {
        Self {
            twins,
            changes,
            commands,
            live,
            stale_after: chrono::Duration::seconds(stale_after.as_secs() as i64),
        }
    }

    fn emit(&self, twin: &DeviceTwin, change: TwinChange, at: DateTime<Utc>) {
        if !matches!(change, TwinChange::ReportedUpdated { .. }) {
            self.live.send(LiveEventName::TwinUpdated, twin);
        }
        self.changes.publish(ChangeEvent::new(twin, change, at));
    }

    fn emit_status(&self, before: &DeviceTwin, after: &DeviceTwin, at: DateTime<Utc>) {
        let (from, to) = (before.metadata.sync_status, after.metadata.sync_status);
        if from != to {
            self.emit(after, TwinChange::SyncStatusChanged { from, to }, at);
        }
    }

    pub async fn get_twin(&self, device_id: &str) -> Result<Option<DeviceTwin>> {
        self.twins.get(device_id).await
    }

    /// Merges a reported delta, creating the twin on first contact. Never
    /// publishes commands.
    pub async fn process_telemetry(
        &self,
        key: &TwinKey,
        delta: &ReportedState,
    ) -> Result<DeviceTwin> {
        let now = Utc::now();
        let (before, after) = self
            .twins
            .modify(&key.device_id, &|current| {
                let mut twin = current.unwrap_or_else(|| DeviceTwin::new(key, now));
                twin.reported.merge(delta);
                twin.metadata.last_reported_at = Some(now);
                twin.metadata.is_connected = true;
                twin.metadata.sync_status = reconciled_status(&twin);
                twin.touch(now);
                Some(twin)
            })
            .await?;
        let after = after.ok_or_else(|| {
            Error::Storage(format!("twin {} was not written", key.device_id))
        })?;

        match before {
            None => {
                debug!(device_id = %key.device_id, kind = %key.kind, "Twin created");
                self.emit(&after, TwinChange::Created, now);
            }
            Some(before) => {
                let fields = before.reported.clone().merge(delta);
                if !fields.is_empty() {
                    self.emit(&after, TwinChange::ReportedUpdated { fields }, now);
                }
                if !before.metadata.is_connected {
                    self.emit(&after, TwinChange::ConnectionChanged { connected: true }, now);
                }
                self.emit_status(&before, &after, now);
            }
        }

        Ok(after)
    }

    /// Operator path. Stores the desired fields (`null` clears one), marks the
    /// twin pending and sends the outstanding delta right away.
    pub async fn set_desired_state(
        &self,
        device_id: &str,
        desired: &Map<String, Value>,
    ) -> Result<DeviceTwin> {
        if desired.is_empty() {
            return Err(Error::Validation("desired state cannot be empty".into()));
        }
        if desired.keys().any(|k| k.trim().is_empty()) {
            return Err(Error::Validation("desired field names cannot be empty".into()));
        }

        let now = Utc::now();
        let (before, after) = self
            .twins
            .modify(device_id, &|current| {
                let mut twin = current?;
                twin.desired.apply(desired);
                twin.metadata.sync_status = SyncStatus::Pending;
                twin.touch(now);
                Some(twin)
            })
            .await?;
        let (Some(before), Some(after)) = (before, after) else {
            return Err(Error::NotFound(format!("twin {}", device_id)));
        };

        let fields = before.desired.clone().apply(desired);
        info!(device_id, ?fields, "Desired state updated");
        self.emit(&after, TwinChange::DesiredUpdated { fields }, now);
        self.emit_status(&before, &after, now);

        if let Some(delta) = get_delta(&after.desired, &after.reported) {
            self.commands
                .dispatch(&Command::SetState {
                    target: after.key(),
                    delta,
                })
                .await;
        }

        Ok(after)
    }

    /// Re-sends the delta of every pending twin; twins whose delta has
    /// vanished settle to `in_sync`. Returns the number of commands sent.
    pub async fn process_pending_syncs(&self) -> Result<usize> {
        let pending = self.twins.list_by_status(SyncStatus::Pending).await?;
        let mut republished = 0;

        for twin in pending {
            match get_delta(&twin.desired, &twin.reported) {
                Some(delta) => {
                    let sent = self
                        .commands
                        .dispatch(&Command::SetState {
                            target: twin.key(),
                            delta,
                        })
                        .await;
                    if sent {
                        republished += 1;
                    }
                }
                None => {
                    if let Err(e) = self.settle(&twin.device_id).await {
                        error!(device_id = %twin.device_id, "Failed to settle pending twin: {}", e);
                        DB_FAILURES_TOTAL.inc();
                    }
                }
            }
        }

        if republished > 0 {
            debug!("Republished {} pending deltas", republished);
        }
        Ok(republished)
    }

    /// Pending to in-sync, re-checked under the write so a concurrent
    /// desired change is never masked.
    async fn settle(&self, device_id: &str) -> Result<()> {
        let now = Utc::now();
        let (before, after) = self
            .twins
            .modify(device_id, &|current| {
                let mut twin = current?;
                if twin.metadata.sync_status != SyncStatus::Pending
                    || get_delta(&twin.desired, &twin.reported).is_some()
                {
                    return None;
                }
                twin.metadata.sync_status = SyncStatus::InSync;
                twin.touch(now);
                Some(twin)
            })
            .await?;
        if let (Some(before), Some(after)) = (before, after) {
            self.emit_status(&before, &after, now);
        }
        Ok(())
    }

    /// Trusts the device acknowledgment and marks the twin in sync. Returns
    /// `false` for unknown twins.
    pub async fn mark_sync_success(&self, device_id: &str) -> Result<bool> {
        let now = Utc::now();
        let (before, after) = self
            .twins
            .modify(device_id, &|current| {
                let mut twin = current?;
                if twin.metadata.sync_status == SyncStatus::InSync {
                    return None;
                }
                twin.metadata.sync_status = SyncStatus::InSync;
                twin.touch(now);
                Some(twin)
            })
            .await?;

        if let (Some(before), Some(after)) = (&before, &after) {
            self.emit_status(before, after, now);
        }
        Ok(before.is_some())
    }

    /// Flags twins that have not reported for `stale_after` as stale and
    /// disconnected. Returns the twins flagged by this pass.
    pub async fn detect_stale(&self, now: DateTime<Utc>) -> Result<Vec<DeviceTwin>> {
        let cutoff = now - self.stale_after;
        let candidates = self.twins.list_reported_before(cutoff).await?;
        let mut flagged = Vec::new();

        for candidate in candidates {
            let result = self
                .twins
                .modify(&candidate.device_id, &|current| {
                    let mut twin = current?;
                    let fresh = twin
                        .metadata
                        .last_reported_at
                        .map_or(true, |at| at >= cutoff);
                    let flagged_already = twin.metadata.sync_status == SyncStatus::Stale
                        && !twin.metadata.is_connected;
                    if fresh || flagged_already {
                        return None;
                    }
                    twin.metadata.sync_status = SyncStatus::Stale;
                    twin.metadata.is_connected = false;
                    twin.touch(now);
                    Some(twin)
                })
                .await;

            match result {
                Ok((Some(before), Some(after))) => {
                    STALE_TWINS_TOTAL.inc();
                    info!(device_id = %after.device_id, "Twin flagged stale");
                    self.emit_status(&before, &after, now);
                    if before.metadata.is_connected {
                        self.emit(&after, TwinChange::ConnectionChanged { connected: false }, now);
                    }
                    flagged.push(after);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(device_id = %candidate.device_id, "Failed to flag stale twin: {}", e);
                    DB_FAILURES_TOTAL.inc();
                }
            }
        }

        Ok(flagged)
    }

    /// Twins whose last report is older than `cutoff`.
    pub async fn overdue(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeviceTwin>> {
        self.twins.list_reported_before(cutoff).await
    }

    /// Creates an empty in-sync twin when none exists.
    pub async fn ensure_twin(&self, key: &TwinKey) -> Result<DeviceTwin> {
        let now = Utc::now();
        let (before, after) = self
            .twins
            .modify(&key.device_id, &|current| match current {
                Some(_) => None,
                None => {
                    let mut twin = DeviceTwin::new(key, now);
                    twin.touch(now);
                    Some(twin)
                }
            })
            .await?;

        match (before, after) {
            (_, Some(created)) => {
                self.emit(&created, TwinChange::Created, now);
                Ok(created)
            }
            (Some(existing), None) => Ok(existing),
            (None, None) => Err(Error::Storage(format!("twin {} was not written", key.device_id))),
        }
    }

    /// Records a connection flag from a status message, creating the twin
    /// when the device has never reported.
    pub async fn set_connection(&self, key: &TwinKey, connected: bool) -> Result<DeviceTwin> {
        let now = Utc::now();
        let (before, after) = self
            .twins
            .modify(&key.device_id, &|current| {
                let existed = current.is_some();
                let mut twin = current.unwrap_or_else(|| DeviceTwin::new(key, now));
                if existed && twin.metadata.is_connected == connected {
                    return None;
                }
                twin.metadata.is_connected = connected;
                twin.touch(now);
                Some(twin)
            })
            .await?;

        match (before, after) {
            (None, Some(created)) => {
                self.emit(&created, TwinChange::Created, now);
                Ok(created)
            }
            (Some(_), Some(updated)) => {
                self.emit(&updated, TwinChange::ConnectionChanged { connected }, now);
                Ok(updated)
            }
            (Some(unchanged), None) => Ok(unchanged),
            (None, None) => Err(Error::Storage(format!("twin {} was not written", key.device_id))),
        }
    }

    pub async fn delete_twin(&self, device_id: &str) -> Result<bool> {
        let Some(twin) = self.twins.get(device_id).await? else {
            return Ok(false);
        };
        let deleted = self.twins.delete(device_id).await?;
        if deleted {
            self.changes.publish(ChangeEvent::deleted(&twin, Utc::now()));
        }
        Ok(deleted)
    }
}
