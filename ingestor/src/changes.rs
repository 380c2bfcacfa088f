//! Twin change stream feeding the external mirror.
//!
//! Many producers, one consumer, bounded. Producers never wait: once the
//! consumer falls `capacity` events behind, the oldest events are overwritten
//! and the consumer is told how many it missed.

use crate::metrics::{CHANGE_EVENTS_DROPPED_TOTAL, CHANGE_EVENTS_TOTAL};
use crate::model::{DeviceKind, DeviceTwin, SyncStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TwinChange {
    Created,
    ReportedUpdated { fields: Vec<String> },
    DesiredUpdated { fields: Vec<String> },
    SyncStatusChanged { from: SyncStatus, to: SyncStatus },
    ConnectionChanged { connected: bool },
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub device_id: String,
    pub kind: DeviceKind,
    pub change: TwinChange,
    pub version: i64,
    /// Snapshot after the change; absent for deletions.
    pub twin: Option<DeviceTwin>,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(twin: &DeviceTwin, change: TwinChange, at: DateTime<Utc>) -> Self {
        Self {
            device_id: twin.device_id.clone(),
            kind: twin.kind,
            change,
            version: twin.metadata.version,
            twin: Some(twin.clone()),
            at,
        }
    }

    pub fn deleted(twin: &DeviceTwin, at: DateTime<Utc>) -> Self {
        Self {
            twin: None,
            ..Self::new(twin, TwinChange::Deleted, at)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeSender {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeSender {
    pub fn publish(&self, event: ChangeEvent) {
        CHANGE_EVENTS_TOTAL.inc();
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            CHANGE_EVENTS_DROPPED_TOTAL.inc();
            trace!(device_id = %event.device_id, "No change consumer, event dropped");
        }
    }
}

#[derive(Debug)]
pub struct ChangeReceiver {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeReceiver {
    /// Next retained event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => record_gap(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => record_gap(missed),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

fn record_gap(missed: u64) {
    warn!(
        "Change consumer lagged, {} oldest events were overwritten",
        missed
    );
    CHANGE_EVENTS_DROPPED_TOTAL.inc_by(missed as f64);
}

/// Events actually retained for a requested capacity. The broadcast ring is
/// sized to a power of two, at least one.
pub fn effective_capacity(requested: usize) -> usize {
    requested.max(1).next_power_of_two()
}

/// Creates the channel, sized by [`effective_capacity`].
pub fn change_channel(capacity: usize) -> (ChangeSender, ChangeReceiver) {
    let effective = effective_capacity(capacity);
    if effective != capacity {
        info!(
            requested = capacity,
            effective, "Change channel capacity rounded up to a power of two"
        );
    }
    let (tx, rx) = broadcast::channel(effective);
    (ChangeSender { tx }, ChangeReceiver { rx })
}

/// Stand-in mirror consumer: logs every event until the stream closes.
pub async fn drain(mut rx: ChangeReceiver) {
    info!("Change stream consumer started");
    while let Some(event) = rx.recv().await {
        debug!(
            device_id = %event.device_id,
            version = event.version,
            change = ?event.change,
            "Twin change"
        );
    }
    info!("Change stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TwinKey;

    fn event(n: i64) -> ChangeEvent {
        let mut twin = DeviceTwin::new(&TwinKey::leaf("f1", "c1", "t1"), Utc::now());
        twin.metadata.version = n;
        ChangeEvent::new(&twin, TwinChange::Created, Utc::now())
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (tx, mut rx) = change_channel(2);
        for n in 1..=3 {
            tx.publish(event(n));
        }

        assert_eq!(rx.try_recv().unwrap().version, 2);
        assert_eq!(rx.try_recv().unwrap().version, 3);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(effective_capacity(0), 1);
        assert_eq!(effective_capacity(3), 4);
        assert_eq!(effective_capacity(1024), 1024);

        let (tx, mut rx) = change_channel(3);
        for n in 1..=5 {
            tx.publish(event(n));
        }
        assert_eq!(rx.try_recv().unwrap().version, 2);
    }

    #[test]
    fn test_publish_without_consumer_is_silent() {
        let (tx, rx) = change_channel(4);
        drop(rx);
        tx.publish(event(1));
    }

    #[test]
    fn test_deleted_event_has_no_snapshot() {
        let twin = DeviceTwin::new(&TwinKey::gateway("f1", "c1"), Utc::now());
        let e = ChangeEvent::deleted(&twin, Utc::now());
        assert_eq!(e.change, TwinChange::Deleted);
        assert!(e.twin.is_none());
        assert_eq!(e.device_id, "c1");
    }

    #[tokio::test]
    async fn test_recv_ends_when_senders_drop() {
        let (tx, mut rx) = change_channel(4);
        tx.publish(event(7));
        drop(tx);
        assert_eq!(rx.recv().await.unwrap().version, 7);
        assert!(rx.recv().await.is_none());
    }
}
