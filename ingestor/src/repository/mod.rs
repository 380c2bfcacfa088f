//! Durable storage contracts, one trait per entity.
//!
//! Per-device mutations that must be atomic are expressed here as
//! conditional operations (`modify`, `create_if_absent`, `resolve_active`,
//! `insert_if_absent`, `adjust_active_alerts`) so each driver can implement
//! them with its own atomic primitive.

pub mod memory;
pub mod postgres;

use crate::errors::Result;
use crate::model::{
    Alert, AlertCategory, Coordinator, DeviceTwin, FarmSummary, LeafDevice, SyncStatus,
    TelemetrySample,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Read-modify-write step for a twin. Receives the current twin (if any) and
/// returns the twin to write, or `None` to leave storage untouched.
pub type TwinMutation<'a> = &'a (dyn Fn(Option<DeviceTwin>) -> Option<DeviceTwin> + Send + Sync);

#[async_trait]
pub trait TwinRepository: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceTwin>>;

    async fn upsert(&self, twin: &DeviceTwin) -> Result<()>;

    async fn delete(&self, device_id: &str) -> Result<bool>;

    /// Atomically applies `mutate` to the stored twin. Returns
    /// `(before, after)`; `after` is `None` when nothing was written.
    async fn modify(
        &self,
        device_id: &str,
        mutate: TwinMutation<'_>,
    ) -> Result<(Option<DeviceTwin>, Option<DeviceTwin>)>;

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<DeviceTwin>>;

    /// Twins whose last report is older than `cutoff`.
    async fn list_reported_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeviceTwin>>;
}

#[async_trait]
pub trait SampleRepository: Send + Sync {
    async fn insert_samples(&self, batch: &[TelemetrySample]) -> Result<()>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<LeafDevice>>;

    async fn upsert(&self, device: &LeafDevice) -> Result<()>;

    async fn delete(&self, device_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait CoordinatorRepository: Send + Sync {
    async fn get(&self, coord_id: &str) -> Result<Option<Coordinator>>;

    /// Returns `false` without writing when the coordinator already exists.
    async fn insert_if_absent(&self, coordinator: &Coordinator) -> Result<bool>;

    async fn delete(&self, coord_id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Coordinator>>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Inserts `alert` unless an active alert with the same key exists.
    /// Returns `true` when inserted.
    async fn create_if_absent(&self, alert: &Alert) -> Result<bool>;

    /// Resolves the active alert for `alert_key`, if any.
    async fn resolve_active(&self, alert_key: &str, at: DateTime<Utc>) -> Result<Option<Alert>>;

    async fn get_active(&self, alert_key: &str) -> Result<Option<Alert>>;

    async fn list_active(&self, farm_id: &str) -> Result<Vec<Alert>>;

    async fn count_active(&self, farm_id: &str, category: AlertCategory) -> Result<usize> {
        Ok(self
            .list_active(farm_id)
            .await?
            .iter()
            .filter(|a| a.category == category)
            .count())
    }
}

#[async_trait]
pub trait FarmRepository: Send + Sync {
    async fn get(&self, farm_id: &str) -> Result<Option<FarmSummary>>;

    /// Atomically adds `delta` to the active-alert counter, never going below
    /// zero. Creates the summary row when missing.
    async fn adjust_active_alerts(&self, farm_id: &str, delta: i64) -> Result<FarmSummary>;
}

/// All repositories behind one handle.
#[derive(Clone)]
pub struct Repositories {
    pub twins: Arc<dyn TwinRepository>,
    pub samples: Arc<dyn SampleRepository>,
    pub devices: Arc<dyn DeviceRepository>,
    pub coordinators: Arc<dyn CoordinatorRepository>,
    pub alerts: Arc<dyn AlertRepository>,
    pub farms: Arc<dyn FarmRepository>,
}

impl Repositories {
    /// Every repository served by the same driver.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TwinRepository
            + SampleRepository
            + DeviceRepository
            + CoordinatorRepository
            + AlertRepository
            + FarmRepository
            + 'static,
    {
        Self {
            twins: store.clone(),
            samples: store.clone(),
            devices: store.clone(),
            coordinators: store.clone(),
            alerts: store.clone(),
            farms: store,
        }
    }
}
