mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use serde_json::json;
use std::time::{Duration, Instant};
use telemetry::{random_mac, Reservoir, Tower, FW_VERSION};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes synthetic hydroponic farm traffic to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "farm-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "SIM_FARMS", default_value_t = 1)]
    farms: usize,

    /// Coordinators per farm.
    #[arg(long, env = "SIM_COORDINATORS", default_value_t = 2)]
    coordinators: usize,

    /// Towers per coordinator.
    #[arg(long, env = "SIM_TOWERS", default_value_t = 6)]
    towers: usize,

    /// Milliseconds between telemetry rounds.
    #[arg(long, env = "SIM_INTERVAL_MS", default_value_t = 5000)]
    interval_ms: u64,

    /// Chance per sample of a threshold excursion.
    #[arg(long, env = "SIM_EXCURSION_RATE", default_value_t = 0.02)]
    excursion_rate: f64,

    /// Discovery requests to publish per coordinator for unpaired towers.
    #[arg(long, env = "SIM_PAIRING_REQUESTS", default_value_t = 0)]
    pairing_requests: usize,
}

struct Coordinator {
    farm_id: String,
    coord_id: String,
    mac: String,
    reservoir: Reservoir,
    towers: Vec<Tower>,
}

impl Coordinator {
    fn topic(&self, suffix: &str) -> String {
        format!("farm/{}/coord/{}/{}", self.farm_id, self.coord_id, suffix)
    }
}

fn build_topology(args: &Args, rng: &mut impl Rng) -> Vec<Coordinator> {
    let mut coordinators = Vec::new();
    for f in 0..args.farms {
        let farm_id = format!("farm-{}", f + 1);
        for c in 0..args.coordinators {
            let coord_id = format!("{}-coord-{}", farm_id, c + 1);
            let towers = (0..args.towers)
                .map(|t| Tower::new(format!("{}-tower-{}", coord_id, t + 1), rng))
                .collect();
            coordinators.push(Coordinator {
                farm_id: farm_id.clone(),
                coord_id,
                mac: random_mac(rng),
                reservoir: Reservoir::new(rng),
                towers,
            });
        }
    }
    coordinators
}

async fn publish<T: Serialize>(client: &AsyncClient, topic: String, payload: &T) -> bool {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize payload for {}: {}", topic, e);
            return false;
        }
    };
    match client.publish(&topic, QoS::AtLeastOnce, false, body).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to publish to {}: {}", topic, e);
            false
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut rng = rand::thread_rng();
    let mut topology = build_topology(&args, &mut rng);
    let tower_count: usize = topology.iter().map(|c| c.towers.len()).sum();

    info!("Starting farm simulator");
    info!(
        "Broker: {}:{}, farms: {}, coordinators: {}, towers: {}",
        args.broker,
        args.port,
        args.farms,
        topology.len(),
        tower_count
    );

    let client_id = format!("farm-sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    for coord in &topology {
        publish(
            &client,
            format!("coordinator/{}/announce", coord.coord_id),
            &json!({
                "mac": coord.mac,
                "fw_version": FW_VERSION,
                "chip_model": "ESP32-S3",
                "wifi_rssi": rng.gen_range(-75..-40),
                "free_heap": rng.gen_range(120_000..200_000),
            }),
        )
        .await;
        publish(
            &client,
            coord.topic("status/connection"),
            &json!({"event": "connected", "wifi_connected": true, "mqtt_connected": true}),
        )
        .await;

        for n in 0..args.pairing_requests {
            publish(
                &client,
                coord.topic("pairing/request"),
                &json!({
                    "tower_id": format!("{}-new-{}", coord.coord_id, n + 1),
                    "mac_address": random_mac(&mut rng),
                    "fw_version": FW_VERSION,
                    "rssi": rng.gen_range(-80..-45),
                }),
            )
            .await;
        }
    }
    info!("Announced {} coordinators", topology.len());

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let uptime_s = started.elapsed().as_secs();
                for coord in topology.iter_mut() {
                    let reading = coord.reservoir.sample(
                        &mut rng,
                        coord.towers.len() as u32,
                        uptime_s,
                        args.excursion_rate,
                    );
                    if publish(&client, coord.topic("reservoir/telemetry"), &reading).await {
                        sent += 1;
                    }

                    let towers_prefix = coord.topic("tower");
                    for tower in coord.towers.iter_mut() {
                        let reading = tower.sample(&mut rng, uptime_s, args.excursion_rate);
                        let topic = format!("{}/{}/telemetry", towers_prefix, tower.id);
                        if publish(&client, topic, &reading).await {
                            sent += 1;
                        }
                    }
                }
                info!("Published {} messages", sent);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Stopping, marking coordinators disconnected");
                for coord in &topology {
                    publish(
                        &client,
                        coord.topic("status/connection"),
                        &json!({"event": "disconnected", "reason": "simulator stopped"}),
                    )
                    .await;
                }
                break;
            }
        }
    }
}
