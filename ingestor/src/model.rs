use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    /// Coordinator with its reservoir.
    Gateway,
    /// Tower paired to a coordinator.
    Leaf,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    Pending,
    Stale,
}

/// Compares two JSON values, treating numbers numerically so `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Last observed device values, flat `field -> value`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportedState(Map<String, Value>);

impl ReportedState {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn f64(&self, field: &str) -> Option<f64> {
        self.0.get(field).and_then(Value::as_f64)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Inserts `value` when present; absent inputs leave the field untouched.
    pub fn put<T: Into<Value>>(&mut self, field: &str, value: Option<T>) {
        if let Some(v) = value {
            self.insert(field, v);
        }
    }

    /// Merges `delta` and returns the names of fields whose value changed.
    /// Null values in the delta are ignored.
    pub fn merge(&mut self, delta: &ReportedState) -> Vec<String> {
        let mut changed = Vec::new();
        for (field, value) in &delta.0 {
            if value.is_null() {
                continue;
            }
            let same = self
                .0
                .get(field)
                .is_some_and(|current| values_equal(current, value));
            if !same {
                self.0.insert(field.clone(), value.clone());
                changed.push(field.clone());
            }
        }
        changed
    }
}

impl FromIterator<(String, Value)> for ReportedState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Operator-set targets, flat `field -> value`. Objects and arrays are
/// composite setpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesiredState(Map<String, Value>);

impl DesiredState {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn f64(&self, field: &str) -> Option<f64> {
        self.0.get(field).and_then(Value::as_f64)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies an operator patch; a `null` clears the field. Returns the
    /// names of fields that were written or cleared.
    pub fn apply(&mut self, patch: &Map<String, Value>) -> Vec<String> {
        let mut touched = Vec::with_capacity(patch.len());
        for (field, value) in patch {
            if value.is_null() {
                if self.0.remove(field).is_some() {
                    touched.push(field.clone());
                }
            } else {
                self.0.insert(field.clone(), value.clone());
                touched.push(field.clone());
            }
        }
        touched
    }
}

impl FromIterator<(String, Value)> for DesiredState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Identity and parents of a twin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinKey {
    pub device_id: String,
    pub kind: DeviceKind,
    pub farm_id: String,
    pub coord_id: String,
}

impl TwinKey {
    pub fn gateway(farm_id: &str, coord_id: &str) -> Self {
        Self {
            device_id: coord_id.to_string(),
            kind: DeviceKind::Gateway,
            farm_id: farm_id.to_string(),
            coord_id: coord_id.to_string(),
        }
    }

    pub fn leaf(farm_id: &str, coord_id: &str, device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind: DeviceKind::Leaf,
            farm_id: farm_id.to_string(),
            coord_id: coord_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_reported_at: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub sync_status: SyncStatus,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTwin {
    pub device_id: String,
    pub kind: DeviceKind,
    pub farm_id: String,
    pub coord_id: String,
    pub reported: ReportedState,
    pub desired: DesiredState,
    pub metadata: TwinMetadata,
}

impl DeviceTwin {
    /// A twin that has never reported; trivially in sync with itself.
    pub fn new(key: &TwinKey, now: DateTime<Utc>) -> Self {
        Self {
            device_id: key.device_id.clone(),
            kind: key.kind,
            farm_id: key.farm_id.clone(),
            coord_id: key.coord_id.clone(),
            reported: ReportedState::new(),
            desired: DesiredState::new(),
            metadata: TwinMetadata {
                created_at: now,
                updated_at: now,
                last_reported_at: None,
                is_connected: false,
                sync_status: SyncStatus::InSync,
                version: 0,
            },
        }
    }

    pub fn key(&self) -> TwinKey {
        TwinKey {
            device_id: self.device_id.clone(),
            kind: self.kind,
            farm_id: self.farm_id.clone(),
            coord_id: self.coord_id.clone(),
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.updated_at = now;
        self.metadata.version += 1;
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SampleKind {
    GatewayAmbient,
    Reservoir,
    LeafEnvironment,
    ConnectionStatus,
}

/// Immutable time-series record of one inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub device_id: String,
    pub farm_id: String,
    pub coord_id: String,
    pub kind: SampleKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    /// Approved by the operator, waiting for the device to confirm.
    Pairing,
    Operational,
}

/// A persisted leaf device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafDevice {
    pub device_id: String,
    pub farm_id: String,
    pub coord_id: String,
    pub mac: String,
    pub status: DeviceStatus,
    pub fw_version: Option<String>,
    pub capabilities: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub paired_at: Option<DateTime<Utc>>,
}

/// A registered coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Coordinator {
    pub coord_id: String,
    pub farm_id: String,
    pub name: String,
    pub fw_version: Option<String>,
    pub ip: Option<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertCategory {
    ConnectionLost,
    TemperatureHigh,
    TemperatureLow,
    WaterLevel,
    PhOutOfRange,
    EcDeviation,
    BatteryLow,
    DeviceOffline,
    DeviceError,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
}

pub fn alert_key(farm_id: &str, device_id: &str, category: AlertCategory) -> String {
    format!("{}:{}:{}", farm_id, device_id, category)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_key: String,
    pub farm_id: String,
    pub device_id: String,
    pub category: AlertCategory,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FarmSummary {
    pub farm_id: String,
    pub active_alerts: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reported(v: Value) -> ReportedState {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!(2)));
        assert!(!values_equal(&json!(true), &json!(1)));
    }

    #[test]
    fn test_merge_reports_only_changed_fields() {
        let mut state = reported(json!({"pump_on": false, "air_temp_c": 22.0}));
        let changed = state.merge(&reported(json!({
            "pump_on": false,
            "air_temp_c": 23.5,
            "humidity_pct": null,
            "light_on": true
        })));
        assert_eq!(changed, vec!["air_temp_c".to_string(), "light_on".to_string()]);
        assert_eq!(state.get("pump_on"), Some(&json!(false)));
        assert!(state.get("humidity_pct").is_none());
    }

    #[test]
    fn test_desired_null_clears_field() {
        let mut desired = DesiredState::new();
        desired.apply(json!({"pump_on": true, "light_brightness": 200}).as_object().unwrap());
        let touched = desired.apply(json!({"light_brightness": null}).as_object().unwrap());
        assert_eq!(touched, vec!["light_brightness".to_string()]);
        assert!(desired.get("light_brightness").is_none());
        assert_eq!(desired.get("pump_on"), Some(&json!(true)));
    }

    #[test]
    fn test_alert_key_format() {
        assert_eq!(
            alert_key("farm-1", "tower-7", AlertCategory::TemperatureHigh),
            "farm-1:tower-7:temperature_high"
        );
    }

    #[test]
    fn test_enums_round_trip_as_text() {
        assert_eq!(SyncStatus::InSync.to_string(), "in_sync");
        assert_eq!("pending".parse::<SyncStatus>().unwrap(), SyncStatus::Pending);
        assert_eq!(DeviceKind::Leaf.to_string(), "leaf");
        assert_eq!(
            "ph_out_of_range".parse::<AlertCategory>().unwrap(),
            AlertCategory::PhOutOfRange
        );
    }
}
