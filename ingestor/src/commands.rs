use crate::errors::Result;
use crate::metrics::{COMMANDS_TOTAL, COMMAND_FAILURES_TOTAL};
use crate::model::{DeviceKind, TwinKey};
use crate::topic;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outbound device commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Push the outstanding desired delta to a device.
    SetState {
        target: TwinKey,
        delta: Map<String, Value>,
    },
    StartPairing {
        farm_id: String,
        coord_id: String,
        duration_ms: u64,
    },
    StopPairing {
        farm_id: String,
        coord_id: String,
    },
    ApprovePairing {
        farm_id: String,
        coord_id: String,
        tower_id: String,
        mac: String,
    },
    RejectPairing {
        farm_id: String,
        coord_id: String,
        tower_id: String,
        mac: String,
    },
    /// Tells the coordinator to wipe the leaf's credentials.
    ForgetDevice {
        farm_id: String,
        coord_id: String,
        tower_id: String,
    },
    /// Tells a newly approved coordinator which farm it belongs to.
    Registered {
        coord_id: String,
        farm_id: String,
        name: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetState { .. } => "set_state",
            Command::StartPairing { .. } => "start_pairing",
            Command::StopPairing { .. } => "stop_pairing",
            Command::ApprovePairing { .. } => "approve_pairing",
            Command::RejectPairing { .. } => "reject_pairing",
            Command::ForgetDevice { .. } => "forget_device",
            Command::Registered { .. } => "registered",
        }
    }

    pub fn topic(&self) -> String {
        match self {
            Command::SetState { target, .. } => match target.kind {
                DeviceKind::Gateway => topic::gateway_cmd(&target.farm_id, &target.coord_id),
                DeviceKind::Leaf => {
                    topic::leaf_cmd(&target.farm_id, &target.coord_id, &target.device_id)
                }
            },
            Command::StartPairing {
                farm_id, coord_id, ..
            }
            | Command::StopPairing { farm_id, coord_id }
            | Command::ApprovePairing {
                farm_id, coord_id, ..
            }
            | Command::RejectPairing {
                farm_id, coord_id, ..
            }
            | Command::ForgetDevice {
                farm_id, coord_id, ..
            } => topic::gateway_cmd(farm_id, coord_id),
            Command::Registered { coord_id, .. } => topic::registered(coord_id),
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Command::SetState { delta, .. } => Value::Object(delta.clone()),
            Command::StartPairing { duration_ms, .. } => json!({
                "command": "start_pairing",
                "duration_ms": duration_ms,
            }),
            Command::StopPairing { .. } => json!({ "command": "stop_pairing" }),
            Command::ApprovePairing { tower_id, mac, .. } => json!({
                "command": "approve_pairing",
                "tower_id": tower_id,
                "mac": mac,
            }),
            Command::RejectPairing { tower_id, mac, .. } => json!({
                "command": "reject_pairing",
                "tower_id": tower_id,
                "mac": mac,
            }),
            Command::ForgetDevice { tower_id, .. } => json!({
                "command": "forget_device",
                "tower_id": tower_id,
            }),
            Command::Registered {
                coord_id,
                farm_id,
                name,
            } => json!({
                "coord_id": coord_id,
                "farm_id": farm_id,
                "name": name,
            }),
        }
    }
}

/// Transport seam for outbound commands.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Fire-and-forget front for a [`CommandPublisher`]. Failures are logged and
/// counted; the pending-sync sweep re-sends anything that still matters.
#[derive(Clone)]
pub struct CommandDispatcher {
    publisher: Arc<dyn CommandPublisher>,
}

impl CommandDispatcher {
    pub fn new(publisher: Arc<dyn CommandPublisher>) -> Self {
        Self { publisher }
    }

    /// Returns whether the transport accepted the command.
    pub async fn dispatch(&self, command: &Command) -> bool {
        let topic = command.topic();
        let payload = match serde_json::to_vec(&command.payload()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {} command: {}", command.name(), e);
                COMMAND_FAILURES_TOTAL.inc();
                return false;
            }
        };

        match self.publisher.publish(&topic, payload).await {
            Ok(()) => {
                COMMANDS_TOTAL.inc();
                debug!("Published {} command to {}", command.name(), topic);
                true
            }
            Err(e) => {
                COMMAND_FAILURES_TOTAL.inc();
                warn!("Failed to publish {} command to {}: {}", command.name(), topic, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::errors::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Captures published commands instead of sending them.
    #[derive(Default)]
    pub struct RecordingPublisher {
        sent: Mutex<Vec<(String, Value)>>,
        fail: AtomicBool,
    }

    impl RecordingPublisher {
        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<(String, Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ChannelSend);
            }
            let body = serde_json::from_slice(&payload)?;
            self.sent.lock().unwrap().push((topic.to_string(), body));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingPublisher;
    use super::*;

    #[test]
    fn test_set_state_topics() {
        let mut delta = Map::new();
        delta.insert("pump_on".into(), json!(true));

        let leaf = Command::SetState {
            target: TwinKey::leaf("f1", "c1", "t1"),
            delta: delta.clone(),
        };
        assert_eq!(leaf.topic(), "farm/f1/coord/c1/tower/t1/cmd");
        assert_eq!(leaf.payload(), json!({"pump_on": true}));

        let gateway = Command::SetState {
            target: TwinKey::gateway("f1", "c1"),
            delta,
        };
        assert_eq!(gateway.topic(), "farm/f1/coord/c1/cmd");
    }

    #[test]
    fn test_pairing_command_bodies() {
        let start = Command::StartPairing {
            farm_id: "f1".into(),
            coord_id: "c1".into(),
            duration_ms: 60_000,
        };
        assert_eq!(start.topic(), "farm/f1/coord/c1/cmd");
        assert_eq!(
            start.payload(),
            json!({"command": "start_pairing", "duration_ms": 60000})
        );

        let registered = Command::Registered {
            coord_id: "c9".into(),
            farm_id: "f2".into(),
            name: "Greenhouse".into(),
        };
        assert_eq!(registered.topic(), "coordinator/c9/registered");
        assert_eq!(registered.payload()["farm_id"], "f2");
    }

    #[test]
    fn test_dispatch_swallows_failures() {
        tokio_test::block_on(async {
            let publisher = Arc::new(RecordingPublisher::default());
            let dispatcher = CommandDispatcher::new(publisher.clone());
            let cmd = Command::StopPairing {
                farm_id: "f1".into(),
                coord_id: "c1".into(),
            };

            assert!(dispatcher.dispatch(&cmd).await);
            publisher.set_fail(true);
            assert!(!dispatcher.dispatch(&cmd).await);
            assert_eq!(publisher.sent().len(), 1);
        });
    }
}
