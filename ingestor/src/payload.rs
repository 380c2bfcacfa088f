//! Inbound wire payloads.
//!
//! Every field a device may omit is optional; kind and status fields are
//! closed enums so an unexpected value fails decoding instead of being
//! silently ignored.

use crate::model::ReportedState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusMode {
    Operational,
    Idle,
    Pairing,
    Ota,
    Maintenance,
    Error,
    Offline,
}

/// `farm/{farm}/coord/{coord}/telemetry`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAmbient {
    pub temp_c: Option<f64>,
    pub light_lux: Option<f64>,
    pub wifi_rssi: Option<i32>,
    pub wifi_connected: Option<bool>,
}

impl GatewayAmbient {
    pub fn to_reported(&self) -> ReportedState {
        let mut state = ReportedState::new();
        state.put("temp_c", self.temp_c);
        state.put("light_lux", self.light_lux);
        state.put("wifi_rssi", self.wifi_rssi);
        state.put("wifi_connected", self.wifi_connected);
        state
    }
}

/// `farm/{farm}/coord/{coord}/reservoir/telemetry`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservoirTelemetry {
    pub fw_version: Option<String>,
    pub towers_online: Option<u32>,
    pub wifi_rssi: Option<i32>,
    pub status_mode: Option<StatusMode>,
    pub uptime_s: Option<u64>,
    pub temp_c: Option<f64>,
    pub ph: Option<f64>,
    pub ec_ms_cm: Option<f64>,
    pub tds_ppm: Option<f64>,
    pub water_temp_c: Option<f64>,
    pub water_level_pct: Option<f64>,
    pub water_level_cm: Option<f64>,
    pub low_water_alert: Option<bool>,
    pub main_pump_on: Option<bool>,
    pub dosing_pump_ph_on: Option<bool>,
    pub dosing_pump_nutrient_on: Option<bool>,
}

impl ReservoirTelemetry {
    pub fn to_reported(&self) -> ReportedState {
        let mut state = ReportedState::new();
        state.put("fw_version", self.fw_version.clone());
        state.put("towers_online", self.towers_online);
        state.put("wifi_rssi", self.wifi_rssi);
        state.put("status_mode", self.status_mode.map(|m| m.to_string()));
        state.put("uptime_s", self.uptime_s);
        state.put("temp_c", self.temp_c);
        state.put("ph", self.ph);
        state.put("ec_ms_cm", self.ec_ms_cm);
        state.put("tds_ppm", self.tds_ppm);
        state.put("water_temp_c", self.water_temp_c);
        state.put("water_level_pct", self.water_level_pct);
        state.put("water_level_cm", self.water_level_cm);
        state.put("low_water_alert", self.low_water_alert);
        state.put("main_pump_on", self.main_pump_on);
        state.put("dosing_pump_ph_on", self.dosing_pump_ph_on);
        state.put("dosing_pump_nutrient_on", self.dosing_pump_nutrient_on);
        state
    }
}

/// `farm/{farm}/coord/{coord}/tower/{tower}/telemetry`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeafTelemetry {
    pub air_temp_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub light_lux: Option<f64>,
    pub pump_on: Option<bool>,
    pub light_on: Option<bool>,
    pub light_brightness: Option<u16>,
    pub status_mode: Option<StatusMode>,
    pub vbat_mv: Option<u32>,
    #[serde(alias = "fw")]
    pub fw_version: Option<String>,
    pub uptime_s: Option<u64>,
    pub signal_quality: Option<i32>,
}

impl LeafTelemetry {
    pub fn to_reported(&self) -> ReportedState {
        let mut state = ReportedState::new();
        state.put("air_temp_c", self.air_temp_c);
        state.put("humidity_pct", self.humidity_pct);
        state.put("light_lux", self.light_lux);
        state.put("pump_on", self.pump_on);
        state.put("light_on", self.light_on);
        state.put("light_brightness", self.light_brightness);
        state.put("status_mode", self.status_mode.map(|m| m.to_string()));
        state.put("vbat_mv", self.vbat_mv);
        state.put("fw_version", self.fw_version.clone());
        state.put("uptime_s", self.uptime_s);
        state.put("signal_quality", self.signal_quality);
        state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    MqttConnected,
    WifiConnected,
    Reconnected,
    Disconnected,
    MqttDisconnected,
    WifiDisconnected,
    Lwt,
}

impl ConnectionEvent {
    pub fn is_online(self) -> bool {
        match self {
            ConnectionEvent::Connected
            | ConnectionEvent::MqttConnected
            | ConnectionEvent::WifiConnected
            | ConnectionEvent::Reconnected => true,
            ConnectionEvent::Disconnected
            | ConnectionEvent::MqttDisconnected
            | ConnectionEvent::WifiDisconnected
            | ConnectionEvent::Lwt => false,
        }
    }
}

/// `farm/{farm}/coord/{coord}/status/connection`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub event: ConnectionEvent,
    pub ts: Option<i64>,
    pub wifi_connected: Option<bool>,
    pub wifi_rssi: Option<i32>,
    pub mqtt_connected: Option<bool>,
    pub uptime_ms: Option<u64>,
    pub free_heap: Option<u64>,
    pub reason: Option<String>,
}

/// `farm/{farm}/coord/{coord}/pairing/request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    #[serde(alias = "device_id")]
    pub tower_id: String,
    #[serde(alias = "mac")]
    pub mac_address: Option<String>,
    pub fw_version: Option<String>,
    pub capabilities: Option<Value>,
    pub rssi: Option<i32>,
}

/// `farm/{farm}/coord/{coord}/pairing/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingWindowStatus {
    pub pairing_active: bool,
    pub time_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[serde(alias = "success")]
    Paired,
    #[serde(alias = "timeout", alias = "rejected")]
    Failed,
}

/// `farm/{farm}/coord/{coord}/pairing/complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingComplete {
    #[serde(alias = "device_id")]
    pub tower_id: String,
    pub status: CompletionStatus,
    pub fw_version: Option<String>,
    pub capabilities: Option<Value>,
    pub reason: Option<String>,
}

/// `coordinator/{coord}/announce`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Announce {
    pub mac: Option<String>,
    pub fw_version: Option<String>,
    pub chip_model: Option<String>,
    pub free_heap: Option<u64>,
    pub wifi_rssi: Option<i32>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

/// `.../cmd/ack`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub status: AckStatus,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_payload_maps_to_reported() {
        let payload: LeafTelemetry = serde_json::from_value(json!({
            "air_temp_c": 36.0,
            "humidity_pct": 55.0,
            "status_mode": "operational",
            "fw": "1.2.0"
        }))
        .unwrap();
        let reported = payload.to_reported();
        assert_eq!(reported.f64("air_temp_c"), Some(36.0));
        assert_eq!(reported.get("status_mode"), Some(&json!("operational")));
        assert_eq!(reported.get("fw_version"), Some(&json!("1.2.0")));
        assert!(reported.get("pump_on").is_none());
    }

    #[test]
    fn test_unknown_status_mode_is_rejected() {
        let res = serde_json::from_value::<LeafTelemetry>(json!({"status_mode": "dancing"}));
        assert!(res.is_err());
    }

    #[test]
    fn test_connection_events() {
        let s: ConnectionStatus =
            serde_json::from_value(json!({"event": "mqtt_connected", "wifi_rssi": -45})).unwrap();
        assert!(s.event.is_online());
        let s: ConnectionStatus = serde_json::from_value(json!({"event": "lwt"})).unwrap();
        assert!(!s.event.is_online());
        assert!(serde_json::from_value::<ConnectionStatus>(json!({"event": "rebooting"})).is_err());
    }

    #[test]
    fn test_pairing_completion_aliases() {
        let c: PairingComplete =
            serde_json::from_value(json!({"tower_id": "t1", "status": "success"})).unwrap();
        assert_eq!(c.status, CompletionStatus::Paired);
        let c: PairingComplete =
            serde_json::from_value(json!({"device_id": "t1", "status": "timeout"})).unwrap();
        assert_eq!(c.status, CompletionStatus::Failed);
    }
}
