#![allow(dead_code)]

use async_trait::async_trait;
use farm_ingestor::alerts::AlertEngine;
use farm_ingestor::batching::sample_channel;
use farm_ingestor::broadcast::{LiveBroadcaster, LiveEvent, LiveEventName};
use farm_ingestor::changes::{change_channel, ChangeReceiver};
use farm_ingestor::commands::{CommandDispatcher, CommandPublisher};
use farm_ingestor::config::AlertThresholds;
use farm_ingestor::errors::{Error, Result};
use farm_ingestor::model::TelemetrySample;
use farm_ingestor::pairing::PairingManager;
use farm_ingestor::registration::{ApproveCoordinator, RegistrationGate};
use farm_ingestor::repository::MemoryStore;
use farm_ingestor::router::Router;
use farm_ingestor::twin::TwinEngine;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Captures outbound commands instead of publishing them.
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

    pub fn sent_to(&self, topic: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body)
            .collect()
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

/// The whole ingest stack over an in-memory store.
pub struct Harness {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub twins: Arc<TwinEngine>,
    pub registration: Arc<RegistrationGate>,
    pub pairing: Arc<PairingManager>,
    pub alerts: Arc<AlertEngine>,
    pub live: broadcast::Receiver<LiveEvent>,
    pub changes: ChangeReceiver,
    pub samples: mpsc::Receiver<TelemetrySample>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let commands = CommandDispatcher::new(publisher.clone());
        let live = LiveBroadcaster::new(1024);
        let live_rx = live.subscribe();
        let (changes, change_rx) = change_channel(1024);

        let twins = Arc::new(TwinEngine::new(
            store.clone(),
            changes,
            commands.clone(),
            live.clone(),
            Duration::from_secs(600),
        ));
        let registration = Arc::new(RegistrationGate::new(
            store.clone(),
            twins.clone(),
            commands.clone(),
            live.clone(),
        ));
        let pairing = Arc::new(PairingManager::new(
            store.clone(),
            twins.clone(),
            commands,
            live.clone(),
        ));
        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            store.clone(),
            live.clone(),
            AlertThresholds::default(),
        ));
        let (writer, samples) = sample_channel(1024);
        let router = Router::new(
            registration.clone(),
            twins.clone(),
            pairing.clone(),
            alerts.clone(),
            writer,
            live,
        );

        Self {
            router,
            store,
            publisher,
            twins,
            registration,
            pairing,
            alerts,
            live: live_rx,
            changes: change_rx,
            samples,
        }
    }

    /// A harness with `coord_id` already registered to `farm_id`.
    pub async fn with_coordinator(farm_id: &str, coord_id: &str) -> Self {
        let h = Self::new();
        h.registration
            .approve(ApproveCoordinator {
                coord_id: coord_id.to_string(),
                farm_id: farm_id.to_string(),
                name: format!("{} coordinator", coord_id),
                ..Default::default()
            })
            .await
            .unwrap();
        h
    }

    pub async fn publish(&self, topic: &str, payload: Value) {
        let bytes = serde_json::to_vec(&payload).unwrap();
        self.router.handle(topic, &bytes).await;
    }

    /// Drains the live stream and counts events with `name`.
    pub fn count_live(&mut self, name: LiveEventName) -> usize {
        let mut n = 0;
        while let Ok(event) = self.live.try_recv() {
            if event.name == name {
                n += 1;
            }
        }
        n
    }
}
