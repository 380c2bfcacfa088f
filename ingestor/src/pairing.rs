//! Leaf pairing sessions, one per `(farm, coordinator)`.
//!
//! `none -> active -> {completed, cancelled, expired}`. Sessions live only in
//! memory; expiry is driven by [`PairingManager::expire_sweep`] rather than a
//! timer per session.

use crate::broadcast::{LiveBroadcaster, LiveEventName};
use crate::commands::{Command, CommandDispatcher};
use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{DeviceStatus, LeafDevice, TwinKey};
use crate::payload::{CompletionStatus, PairingComplete, PairingRequest, PairingWindowStatus};
use crate::repository::DeviceRepository;
use crate::twin::TwinEngine;
use crate::validate::validate_id;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Cancelled,
    Expired,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub device_id: String,
    pub mac: String,
    pub status: RequestStatus,
    pub fw_version: Option<String>,
    pub rssi: Option<i32>,
    pub capabilities: Option<Value>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingSession {
    pub session_id: Uuid,
    pub farm_id: String,
    pub coord_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub requests: Vec<PendingRequest>,
}

impl PairingSession {
    fn new(farm_id: &str, coord_id: &str, now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            farm_id: farm_id.to_string(),
            coord_id: coord_id.to_string(),
            status: SessionStatus::Active,
            started_at: now,
            expires_at: now + window,
            requests: Vec::new(),
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.expires_at
    }
}

type SessionKey = (String, String);

fn session_key(farm_id: &str, coord_id: &str) -> SessionKey {
    (farm_id.to_string(), coord_id.to_string())
}

pub struct PairingManager {
    sessions: DashMap<SessionKey, PairingSession>,
    devices: Arc<dyn DeviceRepository>,
    twins: Arc<TwinEngine>,
    commands: CommandDispatcher,
    live: LiveBroadcaster,
}

impl PairingManager {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        twins: Arc<TwinEngine>,
        commands: CommandDispatcher,
        live: LiveBroadcaster,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            devices,
            twins,
            commands,
            live,
        }
    }

    pub fn session(&self, farm_id: &str, coord_id: &str) -> Option<PairingSession> {
        self.sessions
            .get(&session_key(farm_id, coord_id))
            .map(|s| s.value().clone())
    }

    pub fn pending_requests(&self, farm_id: &str, coord_id: &str) -> Vec<PendingRequest> {
        self.session(farm_id, coord_id)
            .map(|s| {
                s.requests
                    .into_iter()
                    .filter(|r| r.status == RequestStatus::Pending)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Opens a discovery window. While one is open and unexpired the same
    /// session comes back unchanged and nothing is re-sent.
    pub async fn start_session(
        &self,
        farm_id: &str,
        coord_id: &str,
        duration: Duration,
    ) -> Result<PairingSession> {
        validate_id("Farm ID", farm_id)?;
        validate_id("Coordinator ID", coord_id)?;
        if duration.is_zero() {
            return Err(Error::Validation("pairing duration must be positive".into()));
        }
        let window = chrono::Duration::from_std(duration)
            .map_err(|_| Error::Validation("pairing duration too long".into()))?;

        let now = Utc::now();
        let fresh = PairingSession::new(farm_id, coord_id, now, window);
        let (session, created) = {
            let mut slot = self
                .sessions
                .entry(session_key(farm_id, coord_id))
                .or_insert_with(|| fresh.clone());
            if slot.session_id == fresh.session_id {
                (fresh, true)
            } else if slot.is_open(now) {
                (slot.value().clone(), false)
            } else {
                *slot = fresh.clone();
                (fresh, true)
            }
        };

        if !created {
            debug!(farm_id, coord_id, "Pairing session already active");
            return Ok(session);
        }

        info!(
            farm_id,
            coord_id,
            session_id = %session.session_id,
            "Pairing session started for {}s",
            duration.as_secs()
        );
        self.commands
            .dispatch(&Command::StartPairing {
                farm_id: farm_id.to_string(),
                coord_id: coord_id.to_string(),
                duration_ms: duration.as_millis() as u64,
            })
            .await;
        self.live.send(LiveEventName::PairingSession, &session);
        Ok(session)
    }

    /// Cancels the active session. `None` when there is none.
    pub async fn stop_session(&self, farm_id: &str, coord_id: &str) -> Option<PairingSession> {
        let stopped = {
            let mut s = self.sessions.get_mut(&session_key(farm_id, coord_id))?;
            if s.status != SessionStatus::Active {
                return None;
            }
            s.status = SessionStatus::Cancelled;
            s.value().clone()
        };

        info!(farm_id, coord_id, "Pairing session cancelled");
        self.commands
            .dispatch(&Command::StopPairing {
                farm_id: farm_id.to_string(),
                coord_id: coord_id.to_string(),
            })
            .await;
        self.live.send(LiveEventName::PairingSession, &stopped);
        Some(stopped)
    }

    /// Records a discovery request. Returns `true` only for the first
    /// sighting of a device in the session; repeats refresh signal and
    /// firmware quietly.
    pub fn handle_request(&self, farm_id: &str, coord_id: &str, request: PairingRequest) -> bool {
        let now = Utc::now();
        let added = {
            let Some(mut session) = self.sessions.get_mut(&session_key(farm_id, coord_id)) else {
                debug!(farm_id, coord_id, tower_id = %request.tower_id, "Pairing request without a session");
                return false;
            };
            if !session.is_open(now) {
                debug!(farm_id, coord_id, tower_id = %request.tower_id, "Pairing request outside the window");
                return false;
            }

            match session
                .requests
                .iter_mut()
                .find(|r| r.device_id == request.tower_id)
            {
                Some(existing) => {
                    existing.rssi = request.rssi.or(existing.rssi);
                    existing.fw_version = request.fw_version.or(existing.fw_version.take());
                    existing.capabilities = request.capabilities.or(existing.capabilities.take());
                    existing.last_seen_at = now;
                    None
                }
                None => {
                    let pending = PendingRequest {
                        device_id: request.tower_id,
                        mac: request.mac_address.unwrap_or_default(),
                        status: RequestStatus::Pending,
                        fw_version: request.fw_version,
                        rssi: request.rssi,
                        capabilities: request.capabilities,
                        first_seen_at: now,
                        last_seen_at: now,
                    };
                    session.requests.push(pending.clone());
                    Some(pending)
                }
            }
        };

        match added {
            Some(request) => {
                info!(farm_id, coord_id, tower_id = %request.device_id, "New pairing request");
                self.live.send(
                    LiveEventName::PairingRequest,
                    &json!({ "farm_id": farm_id, "coord_id": coord_id, "request": request }),
                );
                true
            }
            None => false,
        }
    }

    /// Flips a pending request in an open session. `None` when there is no
    /// such request.
    fn decide(
        &self,
        key: &SessionKey,
        device_id: &str,
        to: RequestStatus,
        now: DateTime<Utc>,
    ) -> Option<PendingRequest> {
        let mut session = self.sessions.get_mut(key)?;
        if !session.is_open(now) {
            return None;
        }
        let request = session
            .requests
            .iter_mut()
            .find(|r| r.device_id == device_id && r.status == RequestStatus::Pending)?;
        request.status = to;
        Some(request.clone())
    }

    /// Approves a pending request and persists the device as `pairing`. A
    /// storage failure puts the request back to pending.
    pub async fn approve(
        &self,
        farm_id: &str,
        coord_id: &str,
        device_id: &str,
    ) -> Result<Option<LeafDevice>> {
        let key = session_key(farm_id, coord_id);
        let now = Utc::now();
        let Some(request) = self.decide(&key, device_id, RequestStatus::Approved, now) else {
            warn!(farm_id, coord_id, device_id, "No pending pairing request to approve");
            return Ok(None);
        };

        let device = LeafDevice {
            device_id: request.device_id.clone(),
            farm_id: farm_id.to_string(),
            coord_id: coord_id.to_string(),
            mac: request.mac.clone(),
            status: DeviceStatus::Pairing,
            fw_version: request.fw_version.clone(),
            capabilities: request.capabilities.clone(),
            created_at: now,
            paired_at: None,
        };

        if let Err(e) = self.devices.upsert(&device).await {
            if let Some(mut session) = self.sessions.get_mut(&key) {
                if let Some(r) = session
                    .requests
                    .iter_mut()
                    .find(|r| r.device_id == device_id && r.status == RequestStatus::Approved)
                {
                    r.status = RequestStatus::Pending;
                }
            }
            error!(device_id, "Failed to persist approved device: {}", e);
            DB_FAILURES_TOTAL.inc();
            return Err(e);
        }

        info!(farm_id, coord_id, device_id, "Pairing approved");
        self.commands
            .dispatch(&Command::ApprovePairing {
                farm_id: farm_id.to_string(),
                coord_id: coord_id.to_string(),
                tower_id: request.device_id.clone(),
                mac: request.mac.clone(),
            })
            .await;
        self.live.send(LiveEventName::PairingApproved, &device);
        Ok(Some(device))
    }

    /// Rejects a pending request. Nothing is persisted.
    pub async fn reject(
        &self,
        farm_id: &str,
        coord_id: &str,
        device_id: &str,
    ) -> Option<PendingRequest> {
        let key = session_key(farm_id, coord_id);
        let Some(request) = self.decide(&key, device_id, RequestStatus::Rejected, Utc::now())
        else {
            warn!(farm_id, coord_id, device_id, "No pending pairing request to reject");
            return None;
        };

        info!(farm_id, coord_id, device_id, "Pairing rejected");
        self.commands
            .dispatch(&Command::RejectPairing {
                farm_id: farm_id.to_string(),
                coord_id: coord_id.to_string(),
                tower_id: request.device_id.clone(),
                mac: request.mac.clone(),
            })
            .await;
        self.live.send(
            LiveEventName::PairingRejected,
            &json!({ "farm_id": farm_id, "coord_id": coord_id, "request": request }),
        );
        Some(request)
    }

    /// Expires every active session past its deadline, pending requests or
    /// not. Returns how many expired.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.status == SessionStatus::Active && now >= session.expires_at {
                session.status = SessionStatus::Expired;
                expired.push(session.value().clone());
            }
        }

        for session in &expired {
            info!(
                farm_id = %session.farm_id,
                coord_id = %session.coord_id,
                "Pairing session expired"
            );
            self.live.send(LiveEventName::PairingSession, session);
        }
        expired.len()
    }

    /// The coordinator closed its window on its own. Returns `true` when an
    /// active session was completed.
    pub fn handle_window_status(
        &self,
        farm_id: &str,
        coord_id: &str,
        status: &PairingWindowStatus,
    ) -> bool {
        if status.pairing_active {
            return false;
        }
        let completed = {
            let Some(mut session) = self.sessions.get_mut(&session_key(farm_id, coord_id)) else {
                return false;
            };
            if session.status != SessionStatus::Active {
                return false;
            }
            session.status = SessionStatus::Completed;
            session.value().clone()
        };

        info!(farm_id, coord_id, "Coordinator closed pairing window");
        self.live.send(LiveEventName::PairingSession, &completed);
        true
    }

    /// Device-side confirmation. Success makes the device operational and
    /// records what it reported as confirmed now; failure only notifies and
    /// leaves the approval record alone. A success is refused when the
    /// request was rejected in the session, or when the device is neither
    /// stored nor requested.
    pub async fn handle_completion(
        &self,
        farm_id: &str,
        coord_id: &str,
        completion: PairingComplete,
    ) -> Result<Option<LeafDevice>> {
        validate_id("Tower ID", &completion.tower_id)?;

        if completion.status == CompletionStatus::Failed {
            warn!(
                farm_id,
                coord_id,
                tower_id = %completion.tower_id,
                reason = completion.reason.as_deref().unwrap_or("unknown"),
                "Pairing failed on device"
            );
            self.pairing_failed(
                farm_id,
                coord_id,
                &completion.tower_id,
                completion.reason.as_deref(),
            );
            return Ok(None);
        }

        let request = self.session(farm_id, coord_id).and_then(|s| {
            s.requests
                .into_iter()
                .find(|r| r.device_id == completion.tower_id)
        });
        if matches!(&request, Some(r) if r.status == RequestStatus::Rejected) {
            warn!(
                farm_id,
                coord_id,
                tower_id = %completion.tower_id,
                "Pairing completion for a rejected device, ignoring"
            );
            self.pairing_failed(farm_id, coord_id, &completion.tower_id, Some("rejected"));
            return Ok(None);
        }

        let now = Utc::now();
        let mut device = match self.devices.get(&completion.tower_id).await? {
            Some(device) => device,
            None => {
                let Some(request) = request else {
                    warn!(
                        farm_id,
                        coord_id,
                        tower_id = %completion.tower_id,
                        "Pairing completion for an unknown device, ignoring"
                    );
                    self.pairing_failed(
                        farm_id,
                        coord_id,
                        &completion.tower_id,
                        Some("not_requested"),
                    );
                    return Ok(None);
                };
                LeafDevice {
                    device_id: completion.tower_id.clone(),
                    farm_id: farm_id.to_string(),
                    coord_id: coord_id.to_string(),
                    mac: request.mac,
                    status: DeviceStatus::Pairing,
                    fw_version: None,
                    capabilities: None,
                    created_at: now,
                    paired_at: None,
                }
            }
        };

        device.farm_id = farm_id.to_string();
        device.coord_id = coord_id.to_string();
        device.status = DeviceStatus::Operational;
        device.fw_version = completion.fw_version.or(device.fw_version);
        device.capabilities = completion.capabilities.or(device.capabilities);
        device.paired_at = Some(now);
        self.devices.upsert(&device).await?;

        let key = TwinKey::leaf(farm_id, coord_id, &device.device_id);
        if let Err(e) = self.twins.ensure_twin(&key).await {
            error!(device_id = %device.device_id, "Failed to create leaf twin: {}", e);
            DB_FAILURES_TOTAL.inc();
        }

        info!(farm_id, coord_id, device_id = %device.device_id, "Device paired");
        self.live.send(LiveEventName::PairingCompleted, &device);
        Ok(Some(device))
    }

    fn pairing_failed(&self, farm_id: &str, coord_id: &str, tower_id: &str, reason: Option<&str>) {
        self.live.send(
            LiveEventName::PairingFailed,
            &json!({
                "farm_id": farm_id,
                "coord_id": coord_id,
                "tower_id": tower_id,
                "reason": reason,
            }),
        );
    }

    /// Tells the coordinator to wipe the device, then deletes it and its twin
    /// whatever the publish outcome. Returns whether the device existed.
    pub async fn forget(&self, farm_id: &str, coord_id: &str, device_id: &str) -> Result<bool> {
        validate_id("Tower ID", device_id)?;

        self.commands
            .dispatch(&Command::ForgetDevice {
                farm_id: farm_id.to_string(),
                coord_id: coord_id.to_string(),
                tower_id: device_id.to_string(),
            })
            .await;

        let existed = self.devices.delete(device_id).await?;
        if let Err(e) = self.twins.delete_twin(device_id).await {
            error!(device_id, "Failed to delete twin: {}", e);
            DB_FAILURES_TOTAL.inc();
        }

        info!(farm_id, coord_id, device_id, existed, "Device forgotten");
        self.live.send(
            LiveEventName::DeviceForgotten,
            &json!({ "farm_id": farm_id, "coord_id": coord_id, "device_id": device_id }),
        );
        Ok(existed)
    }
}
