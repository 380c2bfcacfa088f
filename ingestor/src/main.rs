use anyhow::Context;
use axum::{routing::get, Router as HttpRouter};
use farm_ingestor::alerts::AlertEngine;
use farm_ingestor::batching::{run_batcher, sample_channel};
use farm_ingestor::broadcast::LiveBroadcaster;
use farm_ingestor::changes::{change_channel, drain};
use farm_ingestor::commands::CommandDispatcher;
use farm_ingestor::config::{Config, StoreKind};
use farm_ingestor::metrics;
use farm_ingestor::mqtt::{self, MqttCommandPublisher};
use farm_ingestor::pairing::PairingManager;
use farm_ingestor::registration::RegistrationGate;
use farm_ingestor::repository::{MemoryStore, PgStore, Repositories};
use farm_ingestor::router::Router;
use farm_ingestor::sweeper::{run_sweeps, Sweeper};
use farm_ingestor::twin::TwinEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting farm ingestor");
    info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics();

    let repos = match config.store {
        StoreKind::Postgres => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            let store = PgStore::connect(&config.database_url)
                .await
                .context("failed to connect to database")?;
            Repositories::from_store(Arc::new(store))
        }
        StoreKind::Memory => {
            warn!("Using in-memory store, state is lost on restart");
            Repositories::from_store(Arc::new(MemoryStore::with_retention(config.memory)))
        }
    };

    let client_id = format!("{}-{}", config.mqtt.client_prefix, uuid::Uuid::new_v4());
    let (client, eventloop) = mqtt::connect(&config.mqtt, client_id);
    let commands = CommandDispatcher::new(Arc::new(MqttCommandPublisher::new(client.clone())));

    let live = LiveBroadcaster::new(config.live_channel_capacity);
    let (changes, change_rx) = change_channel(config.change_channel_capacity);

    let twins = Arc::new(TwinEngine::new(
        repos.twins.clone(),
        changes,
        commands.clone(),
        live.clone(),
        config.sweeps.stale_after,
    ));
    let registration = Arc::new(RegistrationGate::new(
        repos.coordinators.clone(),
        twins.clone(),
        commands.clone(),
        live.clone(),
    ));
    registration
        .refresh_cache()
        .await
        .context("failed to load registered coordinators")?;
    let pairing = Arc::new(PairingManager::new(
        repos.devices.clone(),
        twins.clone(),
        commands,
        live.clone(),
    ));
    let alerts = Arc::new(AlertEngine::new(
        repos.alerts.clone(),
        repos.farms.clone(),
        live.clone(),
        config.alerts.clone(),
    ));

    info!("Channel capacity: {}", config.batch.channel_capacity);
    let (samples, sample_rx) = sample_channel(config.batch.channel_capacity);
    let router = Arc::new(Router::new(
        registration.clone(),
        twins.clone(),
        pairing.clone(),
        alerts.clone(),
        samples,
        live,
    ));

    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(client, eventloop, router).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let batch = config.batch.clone();
    let sample_store = repos.samples.clone();
    let batcher_handle = tokio::spawn(async move {
        run_batcher(sample_rx, sample_store, batch.max_batch, batch.max_wait_ms).await;
    });

    let changes_handle = tokio::spawn(drain(change_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::new(Sweeper::new(twins, alerts, pairing, registration));
    let sweeps_handle = tokio::spawn(run_sweeps(sweeper, config.sweeps.clone(), shutdown_rx));

    let app = HttpRouter::new()
        .route("/metrics", get(metrics_handler))
        .route("/health/live", get(live_handler));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = batcher_handle => {
            error!("Batcher task terminated");
        }
        _ = changes_handle => {
            error!("Change stream consumer terminated");
        }
        _ = sweeps_handle => {
            error!("Sweeps terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn live_handler() -> &'static str {
    "ok"
}
