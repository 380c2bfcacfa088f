//! Named-event fan-out for live dashboards. Bounded; a slow subscriber loses
//! its oldest events and nobody else notices.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use strum::Display;
use tokio::sync::broadcast;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LiveEventName {
    Telemetry,
    ConnectionStatus,
    TwinUpdated,
    AlertCreated,
    AlertResolved,
    FarmSummary,
    PairingSession,
    PairingRequest,
    PairingApproved,
    PairingRejected,
    PairingCompleted,
    PairingFailed,
    DeviceForgotten,
    CoordinatorPending,
    CoordinatorRegistered,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveEvent {
    pub name: LiveEventName,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LiveBroadcaster {
    tx: broadcast::Sender<LiveEvent>,
}

impl LiveBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    /// Best effort; having no subscribers is normal.
    pub fn send<T: Serialize>(&self, name: LiveEventName, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to encode {} live event: {}", name, e);
                return;
            }
        };
        let event = LiveEvent {
            name,
            payload,
            at: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            trace!("No live subscribers for {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_without_subscribers() {
        let live = LiveBroadcaster::new(4);
        live.send(LiveEventName::Telemetry, &json!({"device_id": "t1"}));
    }

    #[test]
    fn test_subscriber_receives_named_events() {
        let live = LiveBroadcaster::new(4);
        let mut rx = live.subscribe();
        live.send(LiveEventName::AlertCreated, &json!({"category": "battery_low"}));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, LiveEventName::AlertCreated);
        assert_eq!(event.name.to_string(), "alert_created");
        assert_eq!(event.payload["category"], "battery_low");
    }
}
