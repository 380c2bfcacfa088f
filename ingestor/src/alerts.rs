//! Threshold evaluation with dedup and auto-resolve.
//!
//! Every sample re-runs every check it has input for, in both directions: a
//! breach creates the alert if none is active for its key, a recovery
//! resolves the active one. Checks whose input field is missing are skipped.

use crate::broadcast::{LiveBroadcaster, LiveEventName};
use crate::config::AlertThresholds;
use crate::errors::Result;
use crate::metrics::{ALERTS_CREATED_TOTAL, ALERTS_RESOLVED_TOTAL, DB_FAILURES_TOTAL};
use crate::model::{
    alert_key, Alert, AlertCategory, AlertStatus, DeviceKind, DeviceTwin, Severity,
};
use crate::payload::{GatewayAmbient, LeafTelemetry, ReservoirTelemetry, StatusMode};
use crate::repository::{AlertRepository, FarmRepository};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// pH this far outside the band is critical rather than a warning.
const PH_CRITICAL_MARGIN: f64 = 1.0;

/// A decoded sample to evaluate.
#[derive(Debug, Clone, Copy)]
pub enum Observation<'a> {
    Gateway(&'a GatewayAmbient),
    Reservoir {
        telemetry: &'a ReservoirTelemetry,
        /// The twin's desired `ec_target_ms_cm`.
        ec_target: Option<f64>,
    },
    Leaf(&'a LeafTelemetry),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub severity: Severity,
    pub message: String,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
}

/// One check's result. `None` means recovered.
pub type Verdict = (AlertCategory, Option<Breach>);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AlertOutcome {
    pub created: Vec<AlertCategory>,
    pub resolved: Vec<AlertCategory>,
}

fn breach(severity: Severity, message: String, value: f64, threshold: f64) -> Option<Breach> {
    Some(Breach {
        severity,
        message,
        value: Some(value),
        threshold: Some(threshold),
    })
}

pub struct AlertEngine {
    alerts: Arc<dyn AlertRepository>,
    farms: Arc<dyn FarmRepository>,
    live: LiveBroadcaster,
    thresholds: AlertThresholds,
}

impl AlertEngine {
    pub fn new(
        alerts: Arc<dyn AlertRepository>,
        farms: Arc<dyn FarmRepository>,
        live: LiveBroadcaster,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            alerts,
            farms,
            live,
            thresholds,
        }
    }

    fn temperature(&self, temp: f64, out: &mut Vec<Verdict>) {
        let t = &self.thresholds;
        let high = (temp > t.temp_high_c).then(|| {
            breach(
                Severity::Critical,
                format!("Temperature {:.1}°C above {:.1}°C", temp, t.temp_high_c),
                temp,
                t.temp_high_c,
            )
        });
        let low = (temp < t.temp_low_c).then(|| {
            breach(
                Severity::Critical,
                format!("Temperature {:.1}°C below {:.1}°C", temp, t.temp_low_c),
                temp,
                t.temp_low_c,
            )
        });
        out.push((AlertCategory::TemperatureHigh, high.flatten()));
        out.push((AlertCategory::TemperatureLow, low.flatten()));
    }

    /// Pure threshold checks for one sample. A sample always proves the
    /// device alive, so `connection_lost` recovers.
    pub fn evaluate(&self, observation: Observation<'_>) -> Vec<Verdict> {
        let t = &self.thresholds;
        let mut out = vec![(AlertCategory::ConnectionLost, None)];

        match observation {
            Observation::Gateway(_) => {}
            Observation::Reservoir {
                telemetry: r,
                ec_target,
            } => {
                if let Some(temp) = r.water_temp_c.or(r.temp_c) {
                    self.temperature(temp, &mut out);
                }

                if let Some(level) = r.water_level_pct {
                    let verdict = if level < t.water_critical_pct {
                        breach(
                            Severity::Critical,
                            format!("Water level critically low at {:.0}%", level),
                            level,
                            t.water_critical_pct,
                        )
                    } else if level < t.water_low_pct {
                        breach(
                            Severity::Warning,
                            format!("Water level low at {:.0}%", level),
                            level,
                            t.water_low_pct,
                        )
                    } else {
                        None
                    };
                    out.push((AlertCategory::WaterLevel, verdict));
                } else if let Some(low) = r.low_water_alert {
                    let verdict = low.then(|| Breach {
                        severity: Severity::Warning,
                        message: "Reservoir reports low water".to_string(),
                        value: None,
                        threshold: None,
                    });
                    out.push((AlertCategory::WaterLevel, verdict));
                }

                if let Some(ph) = r.ph {
                    let (bound, distance) = if ph < t.ph_min {
                        (t.ph_min, t.ph_min - ph)
                    } else if ph > t.ph_max {
                        (t.ph_max, ph - t.ph_max)
                    } else {
                        (ph, 0.0)
                    };
                    let verdict = (distance > 0.0).then(|| Breach {
                        severity: if distance > PH_CRITICAL_MARGIN {
                            Severity::Critical
                        } else {
                            Severity::Warning
                        },
                        message: format!(
                            "pH {:.2} outside {:.1}-{:.1}",
                            ph, t.ph_min, t.ph_max
                        ),
                        value: Some(ph),
                        threshold: Some(bound),
                    });
                    out.push((AlertCategory::PhOutOfRange, verdict));
                }

                if let Some(ec) = r.ec_ms_cm {
                    let verdict = ec_target.filter(|target| *target > 0.0).and_then(|target| {
                        let tolerance = target * t.ec_tolerance_pct / 100.0;
                        ((ec - target).abs() > tolerance).then(|| Breach {
                            severity: Severity::Warning,
                            message: format!(
                                "EC {:.2} mS/cm deviates from target {:.2} by more than {:.0}%",
                                ec, target, t.ec_tolerance_pct
                            ),
                            value: Some(ec),
                            threshold: Some(target),
                        })
                    });
                    out.push((AlertCategory::EcDeviation, verdict));
                }
            }
            Observation::Leaf(l) => {
                if let Some(mv) = l.vbat_mv {
                    let verdict = if mv < t.battery_critical_mv {
                        breach(
                            Severity::Critical,
                            format!("Battery critically low at {}mV", mv),
                            mv as f64,
                            t.battery_critical_mv as f64,
                        )
                    } else if mv < t.battery_low_mv {
                        breach(
                            Severity::Warning,
                            format!("Battery low at {}mV", mv),
                            mv as f64,
                            t.battery_low_mv as f64,
                        )
                    } else {
                        None
                    };
                    out.push((AlertCategory::BatteryLow, verdict));
                }

                if let Some(temp) = l.air_temp_c {
                    self.temperature(temp, &mut out);
                }

                if let Some(mode) = l.status_mode {
                    let offline = (mode == StatusMode::Offline).then(|| Breach {
                        severity: Severity::Warning,
                        message: "Device reports offline".to_string(),
                        value: None,
                        threshold: None,
                    });
                    let failed = (mode == StatusMode::Error).then(|| Breach {
                        severity: Severity::Critical,
                        message: "Device reports an error state".to_string(),
                        value: None,
                        threshold: None,
                    });
                    out.push((AlertCategory::DeviceOffline, offline));
                    out.push((AlertCategory::DeviceError, failed));
                }
            }
        }

        out
    }

    /// Evaluates a sample and applies every verdict. Storage failures on one
    /// category are logged and do not stop the others.
    pub async fn process(
        &self,
        farm_id: &str,
        device_id: &str,
        observation: Observation<'_>,
    ) -> AlertOutcome {
        let mut outcome = AlertOutcome::default();

        for (category, verdict) in self.evaluate(observation) {
            let applied = match verdict {
                Some(b) => self.raise(farm_id, device_id, category, b).await.map(|created| {
                    if created {
                        outcome.created.push(category);
                    }
                }),
                None => self.resolve(farm_id, device_id, category).await.map(|resolved| {
                    if resolved {
                        outcome.resolved.push(category);
                    }
                }),
            };
            if let Err(e) = applied {
                error!(farm_id, device_id, %category, "Alert update failed: {}", e);
                DB_FAILURES_TOTAL.inc();
            }
        }

        outcome
    }

    /// Raises `connection_lost` for a twin that has been silent longer than
    /// the connectivity timeout. Returns whether a new alert was created.
    pub async fn check_connectivity(&self, twin: &DeviceTwin, now: DateTime<Utc>) -> Result<bool> {
        let Some(last) = twin.metadata.last_reported_at else {
            return Ok(false);
        };
        if last >= self.connectivity_cutoff(now) {
            return Ok(false);
        }
        let timeout = now - self.connectivity_cutoff(now);
        let silent = now - last;

        let what = match twin.kind {
            DeviceKind::Gateway => "Coordinator",
            DeviceKind::Leaf => "Tower",
        };
        let b = Breach {
            severity: Severity::Warning,
            message: format!("{} silent for {}s", what, silent.num_seconds()),
            value: Some(silent.num_seconds() as f64),
            threshold: Some(timeout.num_seconds() as f64),
        };
        self.raise(&twin.farm_id, &twin.device_id, AlertCategory::ConnectionLost, b)
            .await
    }

    /// Devices whose last report is older than this have timed out.
    pub fn connectivity_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.thresholds.connectivity_timeout.as_secs() as i64)
    }

    /// Creates the alert unless one is already active for its key.
    pub async fn raise(
        &self,
        farm_id: &str,
        device_id: &str,
        category: AlertCategory,
        b: Breach,
    ) -> Result<bool> {
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_key: alert_key(farm_id, device_id, category),
            farm_id: farm_id.to_string(),
            device_id: device_id.to_string(),
            category,
            severity: b.severity,
            status: AlertStatus::Active,
            message: b.message,
            value: b.value,
            threshold: b.threshold,
            created_at: Utc::now(),
            resolved_at: None,
        };

        if !self.alerts.create_if_absent(&alert).await? {
            return Ok(false);
        }

        ALERTS_CREATED_TOTAL
            .with_label_values(&[&category.to_string()])
            .inc();
        warn!(
            farm_id,
            device_id,
            %category,
            severity = %alert.severity,
            "{}",
            alert.message
        );
        self.live.send(LiveEventName::AlertCreated, &alert);
        self.adjust_farm(farm_id, 1).await;
        Ok(true)
    }

    /// Resolves the active alert for the key, if any.
    pub async fn resolve(
        &self,
        farm_id: &str,
        device_id: &str,
        category: AlertCategory,
    ) -> Result<bool> {
        let key = alert_key(farm_id, device_id, category);
        let Some(alert) = self.alerts.resolve_active(&key, Utc::now()).await? else {
            return Ok(false);
        };

        ALERTS_RESOLVED_TOTAL
            .with_label_values(&[&category.to_string()])
            .inc();
        info!(farm_id, device_id, %category, "Alert resolved");
        self.live.send(LiveEventName::AlertResolved, &alert);
        self.adjust_farm(farm_id, -1).await;
        Ok(true)
    }

    async fn adjust_farm(&self, farm_id: &str, delta: i64) {
        match self.farms.adjust_active_alerts(farm_id, delta).await {
            Ok(summary) => self.live.send(LiveEventName::FarmSummary, &summary),
            Err(e) => {
                error!(farm_id, "Failed to adjust farm alert counter: {}", e);
                DB_FAILURES_TOTAL.inc();
            }
        }
    }

    pub async fn active_alerts(&self, farm_id: &str) -> Result<Vec<Alert>> {
        self.alerts.list_active(farm_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TwinKey;
    use crate::repository::MemoryStore;

    fn engine() -> (AlertEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = AlertEngine::new(
            store.clone(),
            store.clone(),
            LiveBroadcaster::new(64),
            AlertThresholds::default(),
        );
        (engine, store)
    }

    fn verdict(verdicts: &[Verdict], category: AlertCategory) -> Option<&Option<Breach>> {
        verdicts.iter().find(|(c, _)| *c == category).map(|(_, v)| v)
    }

    async fn active(store: &MemoryStore) -> i64 {
        FarmRepository::get(store, "f1")
            .await
            .unwrap()
            .map_or(0, |f| f.active_alerts)
    }

    #[test]
    fn test_missing_inputs_skip_checks() {
        let (engine, _) = engine();
        let leaf = LeafTelemetry::default();
        let verdicts = engine.evaluate(Observation::Leaf(&leaf));
        assert_eq!(verdicts, vec![(AlertCategory::ConnectionLost, None)]);
    }

    #[test]
    fn test_ph_severity_bands() {
        let (engine, _) = engine();
        let mild = ReservoirTelemetry {
            ph: Some(7.9),
            ..Default::default()
        };
        let severe = ReservoirTelemetry {
            ph: Some(4.0),
            ..Default::default()
        };

        let v = engine.evaluate(Observation::Reservoir {
            telemetry: &mild,
            ec_target: None,
        });
        let b = verdict(&v, AlertCategory::PhOutOfRange).unwrap().as_ref().unwrap();
        assert_eq!(b.severity, Severity::Warning);
        assert_eq!(b.threshold, Some(7.5));

        let v = engine.evaluate(Observation::Reservoir {
            telemetry: &severe,
            ec_target: None,
        });
        let b = verdict(&v, AlertCategory::PhOutOfRange).unwrap().as_ref().unwrap();
        assert_eq!(b.severity, Severity::Critical);
    }

    #[test]
    fn test_ec_deviation_needs_target() {
        let (engine, _) = engine();
        let r = ReservoirTelemetry {
            ec_ms_cm: Some(2.6),
            ..Default::default()
        };

        let v = engine.evaluate(Observation::Reservoir {
            telemetry: &r,
            ec_target: None,
        });
        assert_eq!(verdict(&v, AlertCategory::EcDeviation), Some(&None));

        let v = engine.evaluate(Observation::Reservoir {
            telemetry: &r,
            ec_target: Some(2.0),
        });
        assert!(verdict(&v, AlertCategory::EcDeviation).unwrap().is_some());

        let v = engine.evaluate(Observation::Reservoir {
            telemetry: &r,
            ec_target: Some(2.4),
        });
        assert_eq!(verdict(&v, AlertCategory::EcDeviation), Some(&None));
    }

    #[test]
    fn test_water_level_and_battery_severity() {
        let (engine, _) = engine();
        let r = ReservoirTelemetry {
            water_level_pct: Some(8.0),
            ..Default::default()
        };
        let v = engine.evaluate(Observation::Reservoir {
            telemetry: &r,
            ec_target: None,
        });
        let b = verdict(&v, AlertCategory::WaterLevel).unwrap().as_ref().unwrap();
        assert_eq!(b.severity, Severity::Critical);

        let l = LeafTelemetry {
            vbat_mv: Some(3200),
            status_mode: Some(StatusMode::Error),
            ..Default::default()
        };
        let v = engine.evaluate(Observation::Leaf(&l));
        let b = verdict(&v, AlertCategory::BatteryLow).unwrap().as_ref().unwrap();
        assert_eq!(b.severity, Severity::Warning);
        assert!(verdict(&v, AlertCategory::DeviceError).unwrap().is_some());
        assert_eq!(verdict(&v, AlertCategory::DeviceOffline), Some(&None));
    }

    #[tokio::test]
    async fn test_breach_then_recovery_cycle() {
        let (engine, store) = engine();
        let hot = LeafTelemetry {
            air_temp_c: Some(36.0),
            humidity_pct: Some(55.0),
            ..Default::default()
        };

        let outcome = engine.process("f1", "t1", Observation::Leaf(&hot)).await;
        assert_eq!(outcome.created, vec![AlertCategory::TemperatureHigh]);
        assert_eq!(active(&store).await, 1);
        let alert = store
            .get_active("f1:t1:temperature_high")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.severity, Severity::Critical);

        // Second breach while active is a no-op.
        let outcome = engine.process("f1", "t1", Observation::Leaf(&hot)).await;
        assert!(outcome.created.is_empty());
        assert_eq!(store.list_active("f1").await.unwrap().len(), 1);
        assert_eq!(active(&store).await, 1);

        let cool = LeafTelemetry {
            air_temp_c: Some(30.0),
            ..Default::default()
        };
        let outcome = engine.process("f1", "t1", Observation::Leaf(&cool)).await;
        assert_eq!(outcome.resolved, vec![AlertCategory::TemperatureHigh]);
        assert_eq!(active(&store).await, 0);

        let outcome = engine.process("f1", "t1", Observation::Leaf(&cool)).await;
        assert!(outcome.resolved.is_empty());
        assert_eq!(store.resolved_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_without_active_is_noop() {
        let (engine, store) = engine();
        assert!(!engine
            .resolve("f1", "t1", AlertCategory::BatteryLow)
            .await
            .unwrap());
        assert_eq!(active(&store).await, 0);
    }

    #[tokio::test]
    async fn test_connectivity_timeout_and_recovery() {
        let (engine, store) = engine();
        let mut twin = DeviceTwin::new(&TwinKey::gateway("f1", "c1"), Utc::now());
        let now = Utc::now();

        assert!(!engine.check_connectivity(&twin, now).await.unwrap());
        twin.metadata.last_reported_at = Some(now - chrono::Duration::seconds(60));
        assert!(!engine.check_connectivity(&twin, now).await.unwrap());
        twin.metadata.last_reported_at = Some(now - chrono::Duration::seconds(900));
        assert!(engine.check_connectivity(&twin, now).await.unwrap());
        assert!(!engine.check_connectivity(&twin, now).await.unwrap());
        assert_eq!(active(&store).await, 1);

        let ambient = GatewayAmbient::default();
        let outcome = engine.process("f1", "c1", Observation::Gateway(&ambient)).await;
        assert_eq!(outcome.resolved, vec![AlertCategory::ConnectionLost]);
        assert_eq!(active(&store).await, 0);
    }
}
