//! Coordinator registration gate.
//!
//! `unknown -> {pending, rejected} -> registered`. Only the registered set is
//! durable; pending and rejected coordinators are review state that a restart
//! forgets.

use crate::broadcast::{LiveBroadcaster, LiveEventName};
use crate::commands::{Command, CommandDispatcher};
use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, GATED_MESSAGES_TOTAL};
use crate::model::{Coordinator, TwinKey};
use crate::payload::Announce;
use crate::repository::CoordinatorRepository;
use crate::twin::TwinEngine;
use crate::validate::validate_id;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};

/// What the router should do with a message from a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allow,
    /// Unregistered; recorded for review, not processed.
    Held,
    /// Rejected by an operator.
    Dropped,
    /// Registered, but the topic names a farm other than its assigned one.
    WrongFarm,
}

#[derive(Debug, Clone)]
pub enum Sighting {
    /// Any farm-scoped message. Carries the farm segment of the topic.
    Message { farm_hint: String },
    Announce(Announce),
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingRegistration {
    pub coord_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub message_count: u64,
    pub mac: Option<String>,
    pub fw_version: Option<String>,
    pub chip_model: Option<String>,
    pub wifi_rssi: Option<i32>,
    pub ip: Option<String>,
    pub free_heap: Option<u64>,
    pub farm_hint: Option<String>,
}

impl PendingRegistration {
    fn new(coord_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            coord_id: coord_id.to_string(),
            first_seen_at: now,
            last_seen_at: now,
            message_count: 0,
            mac: None,
            fw_version: None,
            chip_model: None,
            wifi_rssi: None,
            ip: None,
            free_heap: None,
            farm_hint: None,
        }
    }

    fn observe(&mut self, sighting: &Sighting, now: DateTime<Utc>) {
        self.message_count += 1;
        self.last_seen_at = now;
        match sighting {
            Sighting::Message { farm_hint } => self.farm_hint = Some(farm_hint.clone()),
            Sighting::Announce(a) => {
                self.mac = a.mac.clone().or(self.mac.take());
                self.fw_version = a.fw_version.clone().or(self.fw_version.take());
                self.chip_model = a.chip_model.clone().or(self.chip_model.take());
                self.wifi_rssi = a.wifi_rssi.or(self.wifi_rssi);
                self.ip = a.ip.clone().or(self.ip.take());
                self.free_heap = a.free_heap.or(self.free_heap);
            }
        }
    }
}

/// Operator approval of a coordinator.
#[derive(Debug, Clone, Default)]
pub struct ApproveCoordinator {
    pub coord_id: String,
    pub farm_id: String,
    pub name: String,
    pub fw_version: Option<String>,
    pub ip: Option<String>,
}

pub struct RegistrationGate {
    coordinators: Arc<dyn CoordinatorRepository>,
    twins: Arc<TwinEngine>,
    commands: CommandDispatcher,
    live: LiveBroadcaster,
    /// Registered coordinator to its assigned farm.
    registered: DashMap<String, String>,
    pending: DashMap<String, PendingRegistration>,
    rejected: DashSet<String>,
}

impl RegistrationGate {
    pub fn new(
        coordinators: Arc<dyn CoordinatorRepository>,
        twins: Arc<TwinEngine>,
        commands: CommandDispatcher,
        live: LiveBroadcaster,
    ) -> Self {
        Self {
            coordinators,
            twins,
            commands,
            live,
            registered: DashMap::new(),
            pending: DashMap::new(),
            rejected: DashSet::new(),
        }
    }

    /// Rebuilds the registered set from storage. Returns its size.
    pub async fn refresh_cache(&self) -> Result<usize> {
        let coordinators = self.coordinators.list().await?;
        self.registered.clear();
        for c in &coordinators {
            self.registered.insert(c.coord_id.clone(), c.farm_id.clone());
        }
        info!("Loaded {} registered coordinators", coordinators.len());
        Ok(coordinators.len())
    }

    pub fn is_registered(&self, coord_id: &str) -> bool {
        self.registered.contains_key(coord_id)
    }

    pub fn assigned_farm(&self, coord_id: &str) -> Option<String> {
        self.registered.get(coord_id).map(|f| f.value().clone())
    }

    pub fn is_rejected(&self, coord_id: &str) -> bool {
        self.rejected.contains(coord_id)
    }

    pub fn list_pending(&self) -> Vec<PendingRegistration> {
        self.pending.iter().map(|p| p.value().clone()).collect()
    }

    /// Gates one message. The first sighting of an unknown coordinator and
    /// every announce notify operators; other sightings are only counted.
    pub fn intercept(&self, coord_id: &str, sighting: Sighting) -> Gate {
        if let Some(farm) = self.registered.get(coord_id) {
            return match &sighting {
                Sighting::Message { farm_hint } if farm_hint != farm.value() => {
                    warn!(
                        coord_id,
                        topic_farm = %farm_hint,
                        assigned_farm = %farm.value(),
                        "Dropping message addressed to the wrong farm"
                    );
                    GATED_MESSAGES_TOTAL.with_label_values(&["wrong_farm"]).inc();
                    Gate::WrongFarm
                }
                _ => Gate::Allow,
            };
        }
        if self.rejected.contains(coord_id) {
            trace!(coord_id, "Dropping message from rejected coordinator");
            GATED_MESSAGES_TOTAL.with_label_values(&["dropped"]).inc();
            return Gate::Dropped;
        }

        let now = Utc::now();
        let notify = match self.pending.entry(coord_id.to_string()) {
            Entry::Vacant(entry) => {
                let mut pending = PendingRegistration::new(coord_id, now);
                pending.observe(&sighting, now);
                Some(entry.insert(pending).value().clone())
            }
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.observe(&sighting, now);
                matches!(sighting, Sighting::Announce(_)).then(|| pending.clone())
            }
        };

        if let Some(snapshot) = notify {
            info!(
                coord_id,
                messages = snapshot.message_count,
                "Coordinator awaiting registration"
            );
            self.live.send(LiveEventName::CoordinatorPending, &snapshot);
        }

        GATED_MESSAGES_TOTAL.with_label_values(&["held"]).inc();
        Gate::Held
    }

    /// Announce path. A registered coordinator that announces again (after a
    /// reboot, say) is re-sent its farm assignment.
    pub async fn announce(&self, coord_id: &str, announce: Announce) -> Gate {
        let gate = self.intercept(coord_id, Sighting::Announce(announce));
        if gate != Gate::Allow {
            return gate;
        }

        match self.coordinators.get(coord_id).await {
            Ok(Some(c)) => {
                self.commands
                    .dispatch(&Command::Registered {
                        coord_id: c.coord_id,
                        farm_id: c.farm_id,
                        name: c.name,
                    })
                    .await;
            }
            Ok(None) => warn!(coord_id, "Registered coordinator missing from storage"),
            Err(e) => {
                error!(coord_id, "Failed to load coordinator: {}", e);
                DB_FAILURES_TOTAL.inc();
            }
        }
        gate
    }

    /// Registers a coordinator and tells it which farm it belongs to.
    /// Registering twice is a conflict and changes nothing.
    pub async fn approve(&self, req: ApproveCoordinator) -> Result<Coordinator> {
        validate_id("Coordinator ID", &req.coord_id)?;
        validate_id("Farm ID", &req.farm_id)?;
        if req.name.trim().is_empty() {
            return Err(Error::Validation("Coordinator name cannot be empty".into()));
        }
        if self.registered.contains_key(&req.coord_id) {
            return Err(Error::Conflict(format!(
                "coordinator {} is already registered",
                req.coord_id
            )));
        }

        let seen = self.pending.get(&req.coord_id).map(|p| p.clone());
        let coordinator = Coordinator {
            fw_version: req
                .fw_version
                .or_else(|| seen.as_ref().and_then(|p| p.fw_version.clone())),
            ip: req.ip.or_else(|| seen.as_ref().and_then(|p| p.ip.clone())),
            coord_id: req.coord_id,
            farm_id: req.farm_id,
            name: req.name,
            registered_at: Utc::now(),
        };

        if !self.coordinators.insert_if_absent(&coordinator).await? {
            if let Some(stored) = self.coordinators.get(&coordinator.coord_id).await? {
                self.registered.insert(stored.coord_id, stored.farm_id);
            }
            return Err(Error::Conflict(format!(
                "coordinator {} is already registered",
                coordinator.coord_id
            )));
        }

        self.registered
            .insert(coordinator.coord_id.clone(), coordinator.farm_id.clone());
        self.pending.remove(&coordinator.coord_id);
        self.rejected.remove(&coordinator.coord_id);
        info!(
            coord_id = %coordinator.coord_id,
            farm_id = %coordinator.farm_id,
            "Coordinator registered"
        );

        let key = TwinKey::gateway(&coordinator.farm_id, &coordinator.coord_id);
        if let Err(e) = self.twins.ensure_twin(&key).await {
            error!(coord_id = %coordinator.coord_id, "Failed to create gateway twin: {}", e);
            DB_FAILURES_TOTAL.inc();
        }

        self.commands
            .dispatch(&Command::Registered {
                coord_id: coordinator.coord_id.clone(),
                farm_id: coordinator.farm_id.clone(),
                name: coordinator.name.clone(),
            })
            .await;
        self.live
            .send(LiveEventName::CoordinatorRegistered, &coordinator);

        Ok(coordinator)
    }

    /// Forgets pending coordinators not heard from since `now - ttl`. One
    /// that shows up again is treated as a first sighting.
    pub fn expire_pending(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = now - ttl;
        let mut expired = 0;
        self.pending.retain(|coord_id, p| {
            let keep = p.last_seen_at >= cutoff;
            if !keep {
                info!(coord_id = %coord_id, messages = p.message_count, "Pending registration expired");
                expired += 1;
            }
            keep
        });
        expired
    }

    /// Moves a pending coordinator to the deny set.
    pub fn reject(&self, coord_id: &str) -> bool {
        if self.registered.contains_key(coord_id) {
            warn!(coord_id, "Cannot reject a registered coordinator");
            return false;
        }
        match self.pending.remove(coord_id) {
            Some(_) => {
                self.rejected.insert(coord_id.to_string());
                info!(coord_id, "Coordinator rejected");
                true
            }
            None => {
                warn!(coord_id, "No pending registration to reject");
                false
            }
        }
    }
}
