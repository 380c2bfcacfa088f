//! Inbound message dispatch.
//!
//! `Router::handle` never fails: each message is isolated, and every problem
//! is logged and counted before the message is dropped.

use crate::alerts::{AlertEngine, Observation};
use crate::batching::SampleWriter;
use crate::broadcast::{LiveBroadcaster, LiveEventName};
use crate::errors::{Error, Result};
use crate::metrics::{
    DB_FAILURES_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL, UNROUTED_MESSAGES_TOTAL,
    VALID_MESSAGES_TOTAL,
};
use crate::model::{AlertCategory, DeviceTwin, ReportedState, SampleKind, TelemetrySample, TwinKey};
use crate::pairing::PairingManager;
use crate::payload::{
    AckStatus, Announce, CommandAck, ConnectionStatus, GatewayAmbient, LeafTelemetry,
    PairingComplete, PairingRequest, PairingWindowStatus, ReservoirTelemetry,
};
use crate::registration::{Gate, RegistrationGate, Sighting};
use crate::topic::InboundTopic;
use crate::twin::TwinEngine;
use crate::validate::{validate_gateway, validate_leaf, validate_pairing_request, validate_reservoir};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Decoded telemetry, tagged by source.
enum Reading {
    Gateway(GatewayAmbient),
    Reservoir(ReservoirTelemetry),
    Leaf(LeafTelemetry),
}

impl Reading {
    fn kind(&self) -> SampleKind {
        match self {
            Reading::Gateway(_) => SampleKind::GatewayAmbient,
            Reading::Reservoir(_) => SampleKind::Reservoir,
            Reading::Leaf(_) => SampleKind::LeafEnvironment,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Reading::Gateway(t) => validate_gateway(t),
            Reading::Reservoir(t) => validate_reservoir(t),
            Reading::Leaf(t) => validate_leaf(t),
        }
    }

    fn to_reported(&self) -> ReportedState {
        match self {
            Reading::Gateway(t) => t.to_reported(),
            Reading::Reservoir(t) => t.to_reported(),
            Reading::Leaf(t) => t.to_reported(),
        }
    }
}

fn malformed(topic: &str, reason: impl std::fmt::Display) {
    warn!(topic, "Dropping malformed message: {}", reason);
    INVALID_MESSAGES_TOTAL.inc();
}

/// Parses JSON, then the typed payload. Returns the raw value alongside so
/// samples keep exactly what the device sent.
fn decode<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Option<(Value, T)> {
    let raw: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            malformed(topic, e);
            return None;
        }
    };
    match serde_json::from_value::<T>(raw.clone()) {
        Ok(typed) => Some((raw, typed)),
        Err(e) => {
            malformed(topic, e);
            None
        }
    }
}

pub struct Router {
    registration: Arc<RegistrationGate>,
    twins: Arc<TwinEngine>,
    pairing: Arc<PairingManager>,
    alerts: Arc<AlertEngine>,
    samples: SampleWriter,
    live: LiveBroadcaster,
}

impl Router {
    pub fn new(
        registration: Arc<RegistrationGate>,
        twins: Arc<TwinEngine>,
        pairing: Arc<PairingManager>,
        alerts: Arc<AlertEngine>,
        samples: SampleWriter,
        live: LiveBroadcaster,
    ) -> Self {
        Self {
            registration,
            twins,
            pairing,
            alerts,
            samples,
            live,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        MESSAGES_TOTAL.inc();
        trace!(topic, bytes = payload.len(), "Received message");

        let parsed = match InboundTopic::parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(topic, "Dropping message: {}", e);
                UNROUTED_MESSAGES_TOTAL.inc();
                return;
            }
        };

        match parsed {
            InboundTopic::CommandEcho => {
                trace!(topic, "Ignoring echoed command");
            }
            InboundTopic::Announce { coord_id } => {
                self.handle_announce(topic, &coord_id, payload).await;
            }
            scoped => {
                let Some((farm_id, coord_id)) = scoped.farm_scope() else {
                    UNROUTED_MESSAGES_TOTAL.inc();
                    return;
                };
                let sighting = Sighting::Message {
                    farm_hint: farm_id.to_string(),
                };
                let gate = self.registration.intercept(coord_id, sighting);
                if gate != Gate::Allow {
                    debug!(topic, coord_id, ?gate, "Message not admitted");
                    return;
                }
                self.dispatch(topic, &scoped, payload).await;
            }
        }
    }

    async fn dispatch(&self, topic: &str, parsed: &InboundTopic, payload: &[u8]) {
        match parsed {
            InboundTopic::GatewayTelemetry { farm_id, coord_id } => {
                if let Some((raw, t)) = decode(topic, payload) {
                    let key = TwinKey::gateway(farm_id, coord_id);
                    self.handle_telemetry(topic, key, raw, Reading::Gateway(t)).await;
                }
            }
            InboundTopic::ReservoirTelemetry { farm_id, coord_id } => {
                if let Some((raw, t)) = decode(topic, payload) {
                    let key = TwinKey::gateway(farm_id, coord_id);
                    self.handle_telemetry(topic, key, raw, Reading::Reservoir(t)).await;
                }
            }
            InboundTopic::LeafTelemetry {
                farm_id,
                coord_id,
                device_id,
            } => {
                if let Some((raw, t)) = decode(topic, payload) {
                    let key = TwinKey::leaf(farm_id, coord_id, device_id);
                    self.handle_telemetry(topic, key, raw, Reading::Leaf(t)).await;
                }
            }
            InboundTopic::ConnectionStatus { farm_id, coord_id } => {
                if let Some((raw, status)) = decode::<ConnectionStatus>(topic, payload) {
                    VALID_MESSAGES_TOTAL.inc();
                    self.handle_connection(farm_id, coord_id, raw, status).await;
                }
            }
            InboundTopic::PairingRequest { farm_id, coord_id } => {
                if let Some((_, request)) = decode::<PairingRequest>(topic, payload) {
                    if let Err(e) = validate_pairing_request(&request) {
                        malformed(topic, e);
                        return;
                    }
                    VALID_MESSAGES_TOTAL.inc();
                    self.pairing.handle_request(farm_id, coord_id, request);
                }
            }
            InboundTopic::PairingStatus { farm_id, coord_id } => {
                if let Some((_, status)) = decode::<PairingWindowStatus>(topic, payload) {
                    VALID_MESSAGES_TOTAL.inc();
                    self.pairing.handle_window_status(farm_id, coord_id, &status);
                }
            }
            InboundTopic::PairingComplete { farm_id, coord_id } => {
                if let Some((_, completion)) = decode::<PairingComplete>(topic, payload) {
                    match self.pairing.handle_completion(farm_id, coord_id, completion).await {
                        Ok(_) => VALID_MESSAGES_TOTAL.inc(),
                        Err(e) if e.is_rejection() => malformed(topic, e),
                        Err(e) => {
                            error!(%farm_id, %coord_id, "Failed to record pairing completion: {}", e);
                            DB_FAILURES_TOTAL.inc();
                        }
                    }
                }
            }
            InboundTopic::GatewayAck { coord_id, .. } => {
                self.handle_ack(topic, coord_id, payload).await;
            }
            InboundTopic::LeafAck { device_id, .. } => {
                self.handle_ack(topic, device_id, payload).await;
            }
            InboundTopic::Announce { .. } | InboundTopic::CommandEcho => {}
        }
    }

    fn queue_sample(&self, key: &TwinKey, kind: SampleKind, payload: Value) {
        let sample = TelemetrySample {
            device_id: key.device_id.clone(),
            farm_id: key.farm_id.clone(),
            coord_id: key.coord_id.clone(),
            kind,
            timestamp: Utc::now(),
            payload,
        };
        match self.samples.queue(sample) {
            Ok(()) | Err(Error::ChannelFull) => {}
            Err(e) => error!(device_id = %key.device_id, "Failed to queue sample: {}", e),
        }
    }

    async fn handle_telemetry(&self, topic: &str, key: TwinKey, raw: Value, reading: Reading) {
        if let Err(e) = reading.validate() {
            malformed(topic, e);
            return;
        }
        VALID_MESSAGES_TOTAL.inc();

        self.queue_sample(&key, reading.kind(), raw.clone());

        let reported = reading.to_reported();
        let twin: Option<DeviceTwin> = match self.twins.process_telemetry(&key, &reported).await {
            Ok(twin) => Some(twin),
            Err(e) => {
                error!(device_id = %key.device_id, "Failed to update twin: {}", e);
                DB_FAILURES_TOTAL.inc();
                None
            }
        };

        let observation = match &reading {
            Reading::Gateway(t) => Observation::Gateway(t),
            Reading::Reservoir(t) => Observation::Reservoir {
                telemetry: t,
                ec_target: twin.as_ref().and_then(|tw| tw.desired.f64("ec_target_ms_cm")),
            },
            Reading::Leaf(t) => Observation::Leaf(t),
        };
        self.alerts
            .process(&key.farm_id, &key.device_id, observation)
            .await;

        self.live.send(
            LiveEventName::Telemetry,
            &json!({
                "farm_id": key.farm_id,
                "coord_id": key.coord_id,
                "device_id": key.device_id,
                "kind": reading.kind(),
                "data": raw,
            }),
        );
    }

    async fn handle_connection(
        &self,
        farm_id: &str,
        coord_id: &str,
        raw: Value,
        status: ConnectionStatus,
    ) {
        let key = TwinKey::gateway(farm_id, coord_id);
        let connected = status.event.is_online();

        self.queue_sample(&key, SampleKind::ConnectionStatus, raw);

        if let Err(e) = self.twins.set_connection(&key, connected).await {
            error!(coord_id, "Failed to update connection state: {}", e);
            DB_FAILURES_TOTAL.inc();
        }

        if connected {
            if let Err(e) = self
                .alerts
                .resolve(farm_id, coord_id, AlertCategory::ConnectionLost)
                .await
            {
                error!(coord_id, "Failed to resolve connectivity alert: {}", e);
                DB_FAILURES_TOTAL.inc();
            }
        }

        debug!(farm_id, coord_id, event = %status.event, "Coordinator connection status");
        self.live.send(
            LiveEventName::ConnectionStatus,
            &json!({
                "farm_id": farm_id,
                "coord_id": coord_id,
                "event": status.event,
                "connected": connected,
                "wifi_rssi": status.wifi_rssi,
                "reason": status.reason,
            }),
        );
    }

    async fn handle_ack(&self, topic: &str, device_id: &str, payload: &[u8]) {
        let Some((_, ack)) = decode::<CommandAck>(topic, payload) else {
            return;
        };
        VALID_MESSAGES_TOTAL.inc();

        match ack.status {
            AckStatus::Ok => match self.twins.mark_sync_success(device_id).await {
                Ok(true) => debug!(device_id, "Device acknowledged desired state"),
                Ok(false) => trace!(device_id, "Ack with nothing pending"),
                Err(e) => {
                    error!(device_id, "Failed to record ack: {}", e);
                    DB_FAILURES_TOTAL.inc();
                }
            },
            AckStatus::Error => warn!(
                device_id,
                message = ack.message.as_deref().unwrap_or(""),
                "Device rejected command"
            ),
        }
    }

    async fn handle_announce(&self, topic: &str, coord_id: &str, payload: &[u8]) {
        let announce = if payload.is_empty() {
            Announce::default()
        } else {
            match decode::<Announce>(topic, payload) {
                Some((_, announce)) => announce,
                None => return,
            }
        };
        VALID_MESSAGES_TOTAL.inc();

        let gate = self.registration.announce(coord_id, announce).await;
        debug!(coord_id, ?gate, "Coordinator announced");
    }
}
