//! Positional topic parsing and outbound topic builders.
//!
//! Farm-scoped topics look like `farm/{farm}/coord/{coord}/...`; leaf devices
//! add `tower/{tower}` after the coordinator. Coordinators that have not been
//! assigned a farm yet announce themselves on `coordinator/{coord}/announce`.

use thiserror::Error;

/// A recognised inbound topic with its positional identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    GatewayTelemetry { farm_id: String, coord_id: String },
    ReservoirTelemetry { farm_id: String, coord_id: String },
    LeafTelemetry { farm_id: String, coord_id: String, device_id: String },
    ConnectionStatus { farm_id: String, coord_id: String },
    PairingRequest { farm_id: String, coord_id: String },
    PairingStatus { farm_id: String, coord_id: String },
    PairingComplete { farm_id: String, coord_id: String },
    GatewayAck { farm_id: String, coord_id: String },
    LeafAck { farm_id: String, coord_id: String, device_id: String },
    Announce { coord_id: String },
    /// Our own outbound commands, echoed back by the `farm/#` subscription.
    CommandEcho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("not enough topic segments")]
    TooShort,
    #[error("unrecognized topic shape")]
    Unrecognized,
}

impl InboundTopic {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let segs: Vec<&str> = topic.split('/').collect();
        if segs.iter().any(|s| s.is_empty()) {
            return Err(TopicError::Unrecognized);
        }

        let parsed = match segs.as_slice() {
            ["farm", f, "coord", c, "telemetry"] => InboundTopic::GatewayTelemetry {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
            },
            ["farm", f, "coord", c, "reservoir", "telemetry"] => {
                InboundTopic::ReservoirTelemetry {
                    farm_id: f.to_string(),
                    coord_id: c.to_string(),
                }
            }
            ["farm", f, "coord", c, "tower", t, "telemetry"] => InboundTopic::LeafTelemetry {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
                device_id: t.to_string(),
            },
            ["farm", f, "coord", c, "status", "connection"] => InboundTopic::ConnectionStatus {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
            },
            ["farm", f, "coord", c, "pairing", "request"] => InboundTopic::PairingRequest {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
            },
            ["farm", f, "coord", c, "pairing", "status"] => InboundTopic::PairingStatus {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
            },
            ["farm", f, "coord", c, "pairing", "complete"] => InboundTopic::PairingComplete {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
            },
            ["farm", f, "coord", c, "cmd", "ack"] => InboundTopic::GatewayAck {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
            },
            ["farm", f, "coord", c, "tower", t, "cmd", "ack"] => InboundTopic::LeafAck {
                farm_id: f.to_string(),
                coord_id: c.to_string(),
                device_id: t.to_string(),
            },
            ["coordinator", c, "announce"] => InboundTopic::Announce { coord_id: c.to_string() },
            ["farm", _, "coord", _, "cmd"]
            | ["farm", _, "coord", _, "tower", _, "cmd"]
            | ["coordinator", _, "registered"] => InboundTopic::CommandEcho,
            ["farm", ..] if segs.len() < 5 => return Err(TopicError::TooShort),
            ["coordinator", ..] if segs.len() < 3 => return Err(TopicError::TooShort),
            _ => return Err(TopicError::Unrecognized),
        };

        Ok(parsed)
    }

    /// `(farm_id, coord_id)` for farm-scoped topics.
    pub fn farm_scope(&self) -> Option<(&str, &str)> {
        match self {
            InboundTopic::GatewayTelemetry { farm_id, coord_id }
            | InboundTopic::ReservoirTelemetry { farm_id, coord_id }
            | InboundTopic::LeafTelemetry {
                farm_id, coord_id, ..
            }
            | InboundTopic::ConnectionStatus { farm_id, coord_id }
            | InboundTopic::PairingRequest { farm_id, coord_id }
            | InboundTopic::PairingStatus { farm_id, coord_id }
            | InboundTopic::PairingComplete { farm_id, coord_id }
            | InboundTopic::GatewayAck { farm_id, coord_id }
            | InboundTopic::LeafAck {
                farm_id, coord_id, ..
            } => Some((farm_id.as_str(), coord_id.as_str())),
            InboundTopic::Announce { .. } | InboundTopic::CommandEcho => None,
        }
    }
}

pub fn gateway_cmd(farm_id: &str, coord_id: &str) -> String {
    format!("farm/{}/coord/{}/cmd", farm_id, coord_id)
}

pub fn leaf_cmd(farm_id: &str, coord_id: &str, device_id: &str) -> String {
    format!("farm/{}/coord/{}/tower/{}/cmd", farm_id, coord_id, device_id)
}

pub fn registered(coord_id: &str) -> String {
    format!("coordinator/{}/registered", coord_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_leaf_telemetry() {
        let t = InboundTopic::parse("farm/f1/coord/c1/tower/t9/telemetry").unwrap();
        assert_eq!(
            t,
            InboundTopic::LeafTelemetry {
                farm_id: "f1".into(),
                coord_id: "c1".into(),
                device_id: "t9".into(),
            }
        );
        assert_eq!(t.farm_scope(), Some(("f1", "c1")));
    }

    #[test]
    fn test_parse_reservoir_and_status() {
        assert!(matches!(
            InboundTopic::parse("farm/f1/coord/c1/reservoir/telemetry"),
            Ok(InboundTopic::ReservoirTelemetry { .. })
        ));
        assert!(matches!(
            InboundTopic::parse("farm/f1/coord/c1/status/connection"),
            Ok(InboundTopic::ConnectionStatus { .. })
        ));
        assert!(matches!(
            InboundTopic::parse("farm/f1/coord/c1/tower/t1/cmd/ack"),
            Ok(InboundTopic::LeafAck { .. })
        ));
    }

    #[test]
    fn test_announce_has_no_farm_scope() {
        let t = InboundTopic::parse("coordinator/AA:BB/announce").unwrap();
        assert_eq!(t.farm_scope(), None);
    }

    #[test]
    fn test_short_topics_are_rejected() {
        assert_eq!(InboundTopic::parse("farm/f1/coord"), Err(TopicError::TooShort));
        assert_eq!(InboundTopic::parse("farm"), Err(TopicError::TooShort));
        assert_eq!(InboundTopic::parse("coordinator/c1"), Err(TopicError::TooShort));
    }

    #[test]
    fn test_unknown_shapes() {
        assert_eq!(
            InboundTopic::parse("farm/f1/coord/c1/ota/status"),
            Err(TopicError::Unrecognized)
        );
        assert_eq!(
            InboundTopic::parse("farm//coord/c1/telemetry"),
            Err(TopicError::Unrecognized)
        );
        assert_eq!(InboundTopic::parse("telemetry/dev-1"), Err(TopicError::Unrecognized));
        assert_eq!(TopicError::TooShort.to_string(), "not enough topic segments");
    }

    #[test]
    fn test_own_commands_are_echoes() {
        assert_eq!(
            InboundTopic::parse(&gateway_cmd("f1", "c1")),
            Ok(InboundTopic::CommandEcho)
        );
        assert_eq!(
            InboundTopic::parse(&leaf_cmd("f1", "c1", "t1")),
            Ok(InboundTopic::CommandEcho)
        );
        assert_eq!(InboundTopic::parse(&registered("c1")), Ok(InboundTopic::CommandEcho));
    }
}
