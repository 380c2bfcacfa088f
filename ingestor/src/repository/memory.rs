//! In-process driver. Atomicity comes from `DashMap`'s per-shard entry locks;
//! nothing here survives a restart. Samples and resolved alerts are kept as
//! ring buffers bounded by [`MemoryRetention`].

use super::{
    AlertRepository, CoordinatorRepository, DeviceRepository, FarmRepository, SampleRepository,
    TwinMutation, TwinRepository,
};
use crate::config::MemoryRetention;
use crate::errors::{Error, Result};
use crate::model::{
    Alert, AlertStatus, Coordinator, DeviceTwin, FarmSummary, LeafDevice, SyncStatus,
    TelemetrySample,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct MemoryStore {
    twins: DashMap<String, DeviceTwin>,
    samples: Mutex<VecDeque<TelemetrySample>>,
    devices: DashMap<String, LeafDevice>,
    coordinators: DashMap<String, Coordinator>,
    active_alerts: DashMap<String, Alert>,
    resolved_alerts: Mutex<VecDeque<Alert>>,
    farms: DashMap<String, FarmSummary>,
    retention: MemoryRetention,
    fail_samples: AtomicBool,
    fail_devices: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_retention(MemoryRetention::default())
    }
}

/// Appends, evicting from the front once `cap` is reached.
fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(item);
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: MemoryRetention) -> Self {
        Self {
            twins: DashMap::new(),
            samples: Mutex::new(VecDeque::new()),
            devices: DashMap::new(),
            coordinators: DashMap::new(),
            active_alerts: DashMap::new(),
            resolved_alerts: Mutex::new(VecDeque::new()),
            farms: DashMap::new(),
            retention,
            fail_samples: AtomicBool::new(false),
            fail_devices: AtomicBool::new(false),
        }
    }

    /// Makes sample inserts fail until switched back.
    pub fn set_fail_samples(&self, fail: bool) {
        self.fail_samples.store(fail, Ordering::SeqCst);
    }

    /// Makes leaf device writes fail until switched back.
    pub fn set_fail_devices(&self, fail: bool) {
        self.fail_devices.store(fail, Ordering::SeqCst);
    }

    /// Retained samples, oldest first.
    pub async fn samples(&self) -> Vec<TelemetrySample> {
        self.samples.lock().await.iter().cloned().collect()
    }

    pub async fn resolved_alerts(&self) -> Vec<Alert> {
        self.resolved_alerts.lock().await.iter().cloned().collect()
    }
}

fn unavailable(what: &str) -> Error {
    Error::Storage(format!("{} store unavailable", what))
}

#[async_trait]
impl TwinRepository for MemoryStore {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceTwin>> {
        Ok(self.twins.get(device_id).map(|t| t.clone()))
    }

    async fn upsert(&self, twin: &DeviceTwin) -> Result<()> {
        self.twins.insert(twin.device_id.clone(), twin.clone());
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        Ok(self.twins.remove(device_id).is_some())
    }

    async fn modify(
        &self,
        device_id: &str,
        mutate: TwinMutation<'_>,
    ) -> Result<(Option<DeviceTwin>, Option<DeviceTwin>)> {
        match self.twins.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().clone();
                match mutate(Some(before.clone())) {
                    Some(after) => {
                        entry.insert(after.clone());
                        Ok((Some(before), Some(after)))
                    }
                    None => Ok((Some(before), None)),
                }
            }
            Entry::Vacant(entry) => match mutate(None) {
                Some(after) => {
                    entry.insert(after.clone());
                    Ok((None, Some(after)))
                }
                None => Ok((None, None)),
            },
        }
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<DeviceTwin>> {
        Ok(self
            .twins
            .iter()
            .filter(|t| t.metadata.sync_status == status)
            .map(|t| t.value().clone())
            .collect())
    }

    async fn list_reported_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeviceTwin>> {
        Ok(self
            .twins
            .iter()
            .filter(|t| t.metadata.last_reported_at.is_some_and(|at| at < cutoff))
            .map(|t| t.value().clone())
            .collect())
    }
}

#[async_trait]
impl SampleRepository for MemoryStore {
    async fn insert_samples(&self, batch: &[TelemetrySample]) -> Result<()> {
        if self.fail_samples.load(Ordering::SeqCst) {
            return Err(unavailable("sample"));
        }
        let mut samples = self.samples.lock().await;
        for sample in batch {
            push_bounded(&mut *samples, sample.clone(), self.retention.max_samples);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceRepository for MemoryStore {
    async fn get(&self, device_id: &str) -> Result<Option<LeafDevice>> {
        Ok(self.devices.get(device_id).map(|d| d.clone()))
    }

    async fn upsert(&self, device: &LeafDevice) -> Result<()> {
        if self.fail_devices.load(Ordering::SeqCst) {
            return Err(unavailable("device"));
        }
        self.devices.insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        if self.fail_devices.load(Ordering::SeqCst) {
            return Err(unavailable("device"));
        }
        Ok(self.devices.remove(device_id).is_some())
    }
}

#[async_trait]
impl CoordinatorRepository for MemoryStore {
    async fn get(&self, coord_id: &str) -> Result<Option<Coordinator>> {
        Ok(self.coordinators.get(coord_id).map(|c| c.clone()))
    }

    async fn insert_if_absent(&self, coordinator: &Coordinator) -> Result<bool> {
        match self.coordinators.entry(coordinator.coord_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(coordinator.clone());
                Ok(true)
            }
        }
    }

    async fn delete(&self, coord_id: &str) -> Result<bool> {
        Ok(self.coordinators.remove(coord_id).is_some())
    }

    async fn list(&self) -> Result<Vec<Coordinator>> {
        Ok(self.coordinators.iter().map(|c| c.value().clone()).collect())
    }
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn create_if_absent(&self, alert: &Alert) -> Result<bool> {
        match self.active_alerts.entry(alert.alert_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(alert.clone());
                Ok(true)
            }
        }
    }

    async fn resolve_active(&self, alert_key: &str, at: DateTime<Utc>) -> Result<Option<Alert>> {
        let Some((_, mut alert)) = self.active_alerts.remove(alert_key) else {
            return Ok(None);
        };
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(at);
        push_bounded(
            &mut *self.resolved_alerts.lock().await,
            alert.clone(),
            self.retention.max_resolved_alerts,
        );
        Ok(Some(alert))
    }

    async fn get_active(&self, alert_key: &str) -> Result<Option<Alert>> {
        Ok(self.active_alerts.get(alert_key).map(|a| a.clone()))
    }

    async fn list_active(&self, farm_id: &str) -> Result<Vec<Alert>> {
        Ok(self
            .active_alerts
            .iter()
            .filter(|a| a.farm_id == farm_id)
            .map(|a| a.value().clone())
            .collect())
    }
}

#[async_trait]
impl FarmRepository for MemoryStore {
    async fn get(&self, farm_id: &str) -> Result<Option<FarmSummary>> {
        Ok(self.farms.get(farm_id).map(|f| f.clone()))
    }

    async fn adjust_active_alerts(&self, farm_id: &str, delta: i64) -> Result<FarmSummary> {
        let now = Utc::now();
        let mut summary = self
            .farms
            .entry(farm_id.to_string())
            .or_insert_with(|| FarmSummary {
                farm_id: farm_id.to_string(),
                active_alerts: 0,
                updated_at: now,
            });
        summary.active_alerts = (summary.active_alerts + delta).max(0);
        summary.updated_at = now;
        Ok(summary.clone())
    }
}
