use super::{
    AlertRepository, CoordinatorRepository, DeviceRepository, FarmRepository, SampleRepository,
    TwinMutation, TwinRepository,
};
use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    Alert, Coordinator, DesiredState, DeviceTwin, FarmSummary, LeafDevice, ReportedState,
    SyncStatus, TelemetrySample, TwinMetadata,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MODIFY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and runs pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

fn parse_column<T>(column: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| Error::Storage(format!("{} '{}': {}", column, raw, e)))
}

pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

// ---- twins ----

const TWIN_COLUMNS: &str = "device_id, kind, farm_id, coord_id, reported, desired, created_at, \
     updated_at, last_reported_at, is_connected, sync_status, version";

#[derive(FromRow)]
struct TwinRow {
    device_id: String,
    kind: String,
    farm_id: String,
    coord_id: String,
    reported: Json<ReportedState>,
    desired: Json<DesiredState>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_reported_at: Option<DateTime<Utc>>,
    is_connected: bool,
    sync_status: String,
    version: i64,
}

impl TryFrom<TwinRow> for DeviceTwin {
    type Error = Error;

    fn try_from(row: TwinRow) -> Result<Self> {
        Ok(DeviceTwin {
            kind: parse_column("twins.kind", &row.kind)?,
            device_id: row.device_id,
            farm_id: row.farm_id,
            coord_id: row.coord_id,
            reported: row.reported.0,
            desired: row.desired.0,
            metadata: TwinMetadata {
                created_at: row.created_at,
                updated_at: row.updated_at,
                last_reported_at: row.last_reported_at,
                is_connected: row.is_connected,
                sync_status: parse_column("twins.sync_status", &row.sync_status)?,
                version: row.version,
            },
        })
    }
}

fn into_twins(rows: Vec<TwinRow>) -> Result<Vec<DeviceTwin>> {
    rows.into_iter().map(DeviceTwin::try_from).collect()
}

/// Writes a twin. With `create_only` the insert yields to a concurrent
/// creator and reports zero rows.
async fn write_twin(conn: &mut PgConnection, twin: &DeviceTwin, create_only: bool) -> Result<u64> {
    let conflict = if create_only {
        "ON CONFLICT (device_id) DO NOTHING"
    } else {
        "ON CONFLICT (device_id) DO UPDATE SET
            kind = EXCLUDED.kind,
            farm_id = EXCLUDED.farm_id,
            coord_id = EXCLUDED.coord_id,
            reported = EXCLUDED.reported,
            desired = EXCLUDED.desired,
            updated_at = EXCLUDED.updated_at,
            last_reported_at = EXCLUDED.last_reported_at,
            is_connected = EXCLUDED.is_connected,
            sync_status = EXCLUDED.sync_status,
            version = EXCLUDED.version"
    };
    let query = format!(
        "INSERT INTO twins ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) {}",
        TWIN_COLUMNS, conflict
    );

    let result = sqlx::query(&query)
        .bind(&twin.device_id)
        .bind(twin.kind.to_string())
        .bind(&twin.farm_id)
        .bind(&twin.coord_id)
        .bind(Json(&twin.reported))
        .bind(Json(&twin.desired))
        .bind(twin.metadata.created_at)
        .bind(twin.metadata.updated_at)
        .bind(twin.metadata.last_reported_at)
        .bind(twin.metadata.is_connected)
        .bind(twin.metadata.sync_status.to_string())
        .bind(twin.metadata.version)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

#[async_trait]
impl TwinRepository for PgStore {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceTwin>> {
        let query = format!("SELECT {} FROM twins WHERE device_id = $1", TWIN_COLUMNS);
        sqlx::query_as::<_, TwinRow>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?
            .map(DeviceTwin::try_from)
            .transpose()
    }

    async fn upsert(&self, twin: &DeviceTwin) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_twin(&mut *conn, twin, false).await?;
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM twins WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn modify(
        &self,
        device_id: &str,
        mutate: TwinMutation<'_>,
    ) -> Result<(Option<DeviceTwin>, Option<DeviceTwin>)> {
        let query = format!(
            "SELECT {} FROM twins WHERE device_id = $1 FOR UPDATE",
            TWIN_COLUMNS
        );

        for attempt in 1..=MODIFY_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            let before = sqlx::query_as::<_, TwinRow>(&query)
                .bind(device_id)
                .fetch_optional(&mut *tx)
                .await?
                .map(DeviceTwin::try_from)
                .transpose()?;

            let Some(after) = mutate(before.clone()) else {
                tx.rollback().await?;
                return Ok((before, None));
            };

            let written = write_twin(&mut *tx, &after, before.is_none()).await?;
            if written == 0 {
                // Lost a create race; the row exists now, so lock it and retry.
                tx.rollback().await?;
                debug!(device_id, attempt, "Twin created concurrently, retrying modify");
                continue;
            }

            tx.commit().await?;
            return Ok((before, Some(after)));
        }

        Err(Error::Conflict(format!(
            "twin {} kept changing during modify",
            device_id
        )))
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<DeviceTwin>> {
        let query = format!("SELECT {} FROM twins WHERE sync_status = $1", TWIN_COLUMNS);
        let rows = sqlx::query_as::<_, TwinRow>(&query)
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        into_twins(rows)
    }

    async fn list_reported_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeviceTwin>> {
        let query = format!(
            "SELECT {} FROM twins WHERE last_reported_at < $1",
            TWIN_COLUMNS
        );
        let rows = sqlx::query_as::<_, TwinRow>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        into_twins(rows)
    }
}

// ---- samples ----

#[async_trait]
impl SampleRepository for PgStore {
    async fn insert_samples(&self, batch: &[TelemetrySample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match insert_samples_inner(&self.pool, batch).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err))
                    if attempts < max_attempts && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Sample insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Sample insert failed permanently after {} attempts: {}",
                        attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }
}

async fn insert_samples_inner(pool: &PgPool, batch: &[TelemetrySample]) -> Result<()> {
    let device_ids: Vec<&str> = batch.iter().map(|s| s.device_id.as_str()).collect();
    let farm_ids: Vec<&str> = batch.iter().map(|s| s.farm_id.as_str()).collect();
    let coord_ids: Vec<&str> = batch.iter().map(|s| s.coord_id.as_str()).collect();
    let kinds: Vec<String> = batch.iter().map(|s| s.kind.to_string()).collect();
    let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|s| s.timestamp).collect();
    let payloads: Vec<Value> = batch.iter().map(|s| s.payload.clone()).collect();

    let query = r#"
        INSERT INTO telemetry_samples (device_id, farm_id, coord_id, kind, ts, payload)
        SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::timestamptz[], $6::jsonb[])
        ON CONFLICT (device_id, kind, ts) DO NOTHING
        "#;

    sqlx::query(query)
        .bind(&device_ids)
        .bind(&farm_ids)
        .bind(&coord_ids)
        .bind(&kinds)
        .bind(&timestamps)
        .bind(&payloads)
        .execute(pool)
        .await?;

    Ok(())
}

// ---- leaf devices ----

const DEVICE_COLUMNS: &str =
    "device_id, farm_id, coord_id, mac, status, fw_version, capabilities, created_at, paired_at";

#[derive(FromRow)]
struct DeviceRow {
    device_id: String,
    farm_id: String,
    coord_id: String,
    mac: String,
    status: String,
    fw_version: Option<String>,
    capabilities: Option<Value>,
    created_at: DateTime<Utc>,
    paired_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for LeafDevice {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(LeafDevice {
            status: parse_column("devices.status", &row.status)?,
            device_id: row.device_id,
            farm_id: row.farm_id,
            coord_id: row.coord_id,
            mac: row.mac,
            fw_version: row.fw_version,
            capabilities: row.capabilities,
            created_at: row.created_at,
            paired_at: row.paired_at,
        })
    }
}

#[async_trait]
impl DeviceRepository for PgStore {
    async fn get(&self, device_id: &str) -> Result<Option<LeafDevice>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?
            .map(LeafDevice::try_from)
            .transpose()
    }

    async fn upsert(&self, device: &LeafDevice) -> Result<()> {
        let query = format!(
            "INSERT INTO devices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (device_id) DO UPDATE SET
                farm_id = EXCLUDED.farm_id,
                coord_id = EXCLUDED.coord_id,
                mac = EXCLUDED.mac,
                status = EXCLUDED.status,
                fw_version = EXCLUDED.fw_version,
                capabilities = EXCLUDED.capabilities,
                paired_at = EXCLUDED.paired_at",
            DEVICE_COLUMNS
        );
        sqlx::query(&query)
            .bind(&device.device_id)
            .bind(&device.farm_id)
            .bind(&device.coord_id)
            .bind(&device.mac)
            .bind(device.status.to_string())
            .bind(&device.fw_version)
            .bind(device.capabilities.clone())
            .bind(device.created_at)
            .bind(device.paired_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---- coordinators ----

#[async_trait]
impl CoordinatorRepository for PgStore {
    async fn get(&self, coord_id: &str) -> Result<Option<Coordinator>> {
        let row = sqlx::query_as::<_, Coordinator>(
            "SELECT coord_id, farm_id, name, fw_version, ip, registered_at
             FROM coordinators WHERE coord_id = $1",
        )
        .bind(coord_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_if_absent(&self, coordinator: &Coordinator) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO coordinators (coord_id, farm_id, name, fw_version, ip, registered_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (coord_id) DO NOTHING",
        )
        .bind(&coordinator.coord_id)
        .bind(&coordinator.farm_id)
        .bind(&coordinator.name)
        .bind(&coordinator.fw_version)
        .bind(&coordinator.ip)
        .bind(coordinator.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, coord_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM coordinators WHERE coord_id = $1")
            .bind(coord_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Coordinator>> {
        let rows = sqlx::query_as::<_, Coordinator>(
            "SELECT coord_id, farm_id, name, fw_version, ip, registered_at FROM coordinators",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// ---- alerts ----

const ALERT_COLUMNS: &str = "id, alert_key, farm_id, device_id, category, severity, status, \
     message, value, threshold, created_at, resolved_at";

#[derive(FromRow)]
struct AlertRow {
    id: Uuid,
    alert_key: String,
    farm_id: String,
    device_id: String,
    category: String,
    severity: String,
    status: String,
    message: String,
    value: Option<f64>,
    threshold: Option<f64>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            category: parse_column("alerts.category", &row.category)?,
            severity: parse_column("alerts.severity", &row.severity)?,
            status: parse_column("alerts.status", &row.status)?,
            id: row.id,
            alert_key: row.alert_key,
            farm_id: row.farm_id,
            device_id: row.device_id,
            message: row.message,
            value: row.value,
            threshold: row.threshold,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[async_trait]
impl AlertRepository for PgStore {
    async fn create_if_absent(&self, alert: &Alert) -> Result<bool> {
        let query = format!(
            "INSERT INTO alerts ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (alert_key) WHERE status = 'active' DO NOTHING",
            ALERT_COLUMNS
        );
        let result = sqlx::query(&query)
            .bind(alert.id)
            .bind(&alert.alert_key)
            .bind(&alert.farm_id)
            .bind(&alert.device_id)
            .bind(alert.category.to_string())
            .bind(alert.severity.to_string())
            .bind(alert.status.to_string())
            .bind(&alert.message)
            .bind(alert.value)
            .bind(alert.threshold)
            .bind(alert.created_at)
            .bind(alert.resolved_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn resolve_active(&self, alert_key: &str, at: DateTime<Utc>) -> Result<Option<Alert>> {
        let query = format!(
            "UPDATE alerts SET status = 'resolved', resolved_at = $2
             WHERE alert_key = $1 AND status = 'active'
             RETURNING {}",
            ALERT_COLUMNS
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(alert_key)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?
            .map(Alert::try_from)
            .transpose()
    }

    async fn get_active(&self, alert_key: &str) -> Result<Option<Alert>> {
        let query = format!(
            "SELECT {} FROM alerts WHERE alert_key = $1 AND status = 'active'",
            ALERT_COLUMNS
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(alert_key)
            .fetch_optional(&self.pool)
            .await?
            .map(Alert::try_from)
            .transpose()
    }

    async fn list_active(&self, farm_id: &str) -> Result<Vec<Alert>> {
        let query = format!(
            "SELECT {} FROM alerts WHERE farm_id = $1 AND status = 'active'
             ORDER BY created_at DESC",
            ALERT_COLUMNS
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(farm_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Alert::try_from)
            .collect()
    }
}

// ---- farms ----

#[async_trait]
impl FarmRepository for PgStore {
    async fn get(&self, farm_id: &str) -> Result<Option<FarmSummary>> {
        let row = sqlx::query_as::<_, FarmSummary>(
            "SELECT farm_id, active_alerts, updated_at FROM farms WHERE farm_id = $1",
        )
        .bind(farm_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn adjust_active_alerts(&self, farm_id: &str, delta: i64) -> Result<FarmSummary> {
        let row = sqlx::query_as::<_, FarmSummary>(
            "INSERT INTO farms (farm_id, active_alerts, updated_at)
             VALUES ($1, GREATEST($2::bigint, 0), $3)
             ON CONFLICT (farm_id) DO UPDATE SET
                active_alerts = GREATEST(farms.active_alerts + $2::bigint, 0),
                updated_at = $3
             RETURNING farm_id, active_alerts, updated_at",
        )
        .bind(farm_id)
        .bind(delta)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}
