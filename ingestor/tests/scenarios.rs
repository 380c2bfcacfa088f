mod common;

use chrono::Utc;
use common::Harness;
use farm_ingestor::broadcast::LiveEventName;
use farm_ingestor::errors::Error;
use farm_ingestor::model::{AlertCategory, AlertStatus, DeviceStatus, Severity, SyncStatus};
use farm_ingestor::pairing::SessionStatus;
use farm_ingestor::registration::ApproveCoordinator;
use farm_ingestor::repository::{
    AlertRepository, CoordinatorRepository, DeviceRepository, FarmRepository, TwinRepository,
};
use farm_ingestor::twin::get_delta;
use serde_json::{json, Map, Value};
use std::time::Duration;

const LEAF_TOPIC: &str = "farm/f1/coord/c1/tower/t1/telemetry";

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

async fn active_alerts(h: &Harness, farm_id: &str) -> i64 {
    FarmRepository::get(h.store.as_ref(), farm_id)
        .await
        .unwrap()
        .map_or(0, |f| f.active_alerts)
}

#[tokio::test]
async fn test_temperature_breach_and_recovery() {
    let mut h = Harness::with_coordinator("f1", "c1").await;

    h.publish(LEAF_TOPIC, json!({"air_temp_c": 36, "humidity_pct": 55}))
        .await;

    let alerts = h.store.list_active("f1").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, AlertCategory::TemperatureHigh);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].device_id, "t1");
    assert_eq!(active_alerts(&h, "f1").await, 1);
    assert_eq!(h.count_live(LiveEventName::AlertCreated), 1);

    h.publish(LEAF_TOPIC, json!({"air_temp_c": 30})).await;

    assert!(h.store.list_active("f1").await.unwrap().is_empty());
    assert_eq!(active_alerts(&h, "f1").await, 0);
    let resolved = h.store.resolved_alerts().await;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].status, AlertStatus::Resolved);
    assert!(resolved[0].resolved_at.is_some());
}

#[tokio::test]
async fn test_rapid_breaches_yield_one_alert() {
    let h = Harness::with_coordinator("f1", "c1").await;
    let low = serde_json::to_vec(&json!({"vbat_mv": 2900})).unwrap();

    tokio::join!(
        h.router.handle(LEAF_TOPIC, &low),
        h.router.handle(LEAF_TOPIC, &low),
        h.router.handle(LEAF_TOPIC, &low),
        h.router.handle(LEAF_TOPIC, &low),
    );

    assert_eq!(
        h.store
            .count_active("f1", AlertCategory::BatteryLow)
            .await
            .unwrap(),
        1
    );
    assert_eq!(active_alerts(&h, "f1").await, 1);
}

#[tokio::test]
async fn test_recovery_without_alert_is_noop() {
    let h = Harness::with_coordinator("f1", "c1").await;

    h.publish(LEAF_TOPIC, json!({"air_temp_c": 22, "vbat_mv": 3900}))
        .await;

    assert!(h.store.resolved_alerts().await.is_empty());
    assert_eq!(active_alerts(&h, "f1").await, 0);
}

#[tokio::test]
async fn test_desired_state_round_trip() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.publish(LEAF_TOPIC, json!({"pump_on": false})).await;

    let twin = h
        .twins
        .set_desired_state("t1", &object(json!({"pump_on": true})))
        .await
        .unwrap();
    assert_eq!(twin.metadata.sync_status, SyncStatus::Pending);
    assert_eq!(
        get_delta(&twin.desired, &twin.reported),
        Some(object(json!({"pump_on": true})))
    );
    let commands = h.publisher.sent_to("farm/f1/coord/c1/tower/t1/cmd");
    assert_eq!(commands, vec![json!({"pump_on": true})]);

    h.publish(LEAF_TOPIC, json!({"pump_on": true})).await;

    let twin = TwinRepository::get(h.store.as_ref(), "t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(twin.metadata.sync_status, SyncStatus::InSync);
    assert_eq!(get_delta(&twin.desired, &twin.reported), None);
}

#[tokio::test]
async fn test_repeated_identical_telemetry_is_quiet() {
    let h = Harness::with_coordinator("f1", "c1").await;
    let before = h.publisher.sent().len();

    for _ in 0..5 {
        h.publish(LEAF_TOPIC, json!({"air_temp_c": 24.0, "light_on": true}))
            .await;
    }

    let twin = TwinRepository::get(h.store.as_ref(), "t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(twin.metadata.sync_status, SyncStatus::InSync);
    assert_eq!(h.publisher.sent().len(), before);
}

#[tokio::test]
async fn test_pending_sweep_resends_delta() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.publish(LEAF_TOPIC, json!({"light_on": false})).await;

    h.publisher.set_fail(true);
    h.twins
        .set_desired_state("t1", &object(json!({"light_on": true})))
        .await
        .unwrap();
    h.publisher.set_fail(false);

    assert_eq!(h.twins.process_pending_syncs().await.unwrap(), 1);
    assert_eq!(
        h.publisher.sent_to("farm/f1/coord/c1/tower/t1/cmd"),
        vec![json!({"light_on": true})]
    );
}

#[tokio::test]
async fn test_ack_marks_twin_in_sync() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.publish(LEAF_TOPIC, json!({"light_brightness": 10})).await;
    h.twins
        .set_desired_state("t1", &object(json!({"light_brightness": 200})))
        .await
        .unwrap();

    h.publish("farm/f1/coord/c1/tower/t1/cmd/ack", json!({"status": "ok"}))
        .await;

    let twin = TwinRepository::get(h.store.as_ref(), "t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(twin.metadata.sync_status, SyncStatus::InSync);
}

#[tokio::test]
async fn test_pairing_session_is_not_restarted() {
    let h = Harness::with_coordinator("f1", "c1").await;

    let first = h
        .pairing
        .start_session("f1", "c1", Duration::from_secs(60))
        .await
        .unwrap();
    let second = h
        .pairing
        .start_session("f1", "c1", Duration::from_secs(120))
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(first.expires_at, second.expires_at);
    assert_eq!(h.publisher.sent_to("farm/f1/coord/c1/cmd").len(), 1);
}

#[tokio::test]
async fn test_repeated_discovery_notifies_once() {
    let mut h = Harness::with_coordinator("f1", "c1").await;
    h.pairing
        .start_session("f1", "c1", Duration::from_secs(60))
        .await
        .unwrap();
    h.count_live(LiveEventName::PairingRequest);

    for i in 0..100 {
        h.publish(
            "farm/f1/coord/c1/pairing/request",
            json!({"tower_id": "t7", "mac_address": "AA:BB:CC:00:00:07", "rssi": -40 - i}),
        )
        .await;
    }

    assert_eq!(h.count_live(LiveEventName::PairingRequest), 1);
    let pending = h.pairing.pending_requests("f1", "c1");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].rssi, Some(-139));
}

#[tokio::test]
async fn test_expired_session_refuses_decisions() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.pairing
        .start_session("f1", "c1", Duration::from_secs(60))
        .await
        .unwrap();
    h.publish(
        "farm/f1/coord/c1/pairing/request",
        json!({"tower_id": "t7", "mac_address": "AA:BB:CC:00:00:07"}),
    )
    .await;

    let expired = h
        .pairing
        .expire_sweep(Utc::now() + chrono::Duration::seconds(61));
    assert_eq!(expired, 1);
    assert_eq!(
        h.pairing.session("f1", "c1").unwrap().status,
        SessionStatus::Expired
    );

    assert!(h.pairing.approve("f1", "c1", "t7").await.unwrap().is_none());
    assert!(h.pairing.reject("f1", "c1", "t7").await.is_none());
    assert!(DeviceRepository::get(h.store.as_ref(), "t7")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_pairing_approve_then_complete() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.pairing
        .start_session("f1", "c1", Duration::from_secs(60))
        .await
        .unwrap();
    h.publish(
        "farm/f1/coord/c1/pairing/request",
        json!({"tower_id": "t7", "mac_address": "AA:BB:CC:00:00:07", "fw_version": "1.0.0"}),
    )
    .await;

    let device = h.pairing.approve("f1", "c1", "t7").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Pairing);
    let approvals = h.publisher.sent_to("farm/f1/coord/c1/cmd");
    assert!(approvals
        .iter()
        .any(|c| c["command"] == "approve_pairing" && c["mac"] == "AA:BB:CC:00:00:07"));

    h.publish(
        "farm/f1/coord/c1/pairing/complete",
        json!({"tower_id": "t7", "status": "success", "fw_version": "1.0.1"}),
    )
    .await;

    let device = DeviceRepository::get(h.store.as_ref(), "t7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Operational);
    assert_eq!(device.fw_version.as_deref(), Some("1.0.1"));
    assert!(TwinRepository::get(h.store.as_ref(), "t7")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_registration_gate_and_conflict() {
    let mut h = Harness::new();

    h.publish(
        "coordinator/c5/announce",
        json!({"mac": "11:22:33:44:55:66", "fw_version": "2.0.0"}),
    )
    .await;
    h.publish("farm/f1/coord/c5/telemetry", json!({"temp_c": 22}))
        .await;

    assert!(h.samples.try_recv().is_err());
    let pending = h.registration.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].fw_version.as_deref(), Some("2.0.0"));

    let approve = ApproveCoordinator {
        coord_id: "c5".into(),
        farm_id: "f1".into(),
        name: "North greenhouse".into(),
        ..Default::default()
    };
    let registered = h.registration.approve(approve.clone()).await.unwrap();
    assert_eq!(registered.fw_version.as_deref(), Some("2.0.0"));
    assert_eq!(
        h.publisher.sent_to("coordinator/c5/registered"),
        vec![json!({"coord_id": "c5", "farm_id": "f1", "name": "North greenhouse"})]
    );

    let again = h
        .registration
        .approve(ApproveCoordinator {
            farm_id: "f2".into(),
            ..approve
        })
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));
    let stored = CoordinatorRepository::get(h.store.as_ref(), "c5")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.farm_id, "f1");

    h.publish("farm/f1/coord/c5/telemetry", json!({"temp_c": 22}))
        .await;
    assert!(h.samples.try_recv().is_ok());
}

#[tokio::test]
async fn test_rejected_coordinator_is_dropped() {
    let mut h = Harness::new();
    h.publish("farm/f1/coord/c6/telemetry", json!({"temp_c": 22}))
        .await;
    assert!(h.registration.reject("c6"));

    h.publish("farm/f1/coord/c6/telemetry", json!({"temp_c": 22}))
        .await;
    assert!(h.registration.list_pending().is_empty());
    assert!(h.registration.is_rejected("c6"));
    assert!(h.samples.try_recv().is_err());
}

#[tokio::test]
async fn test_reservoir_alerts_use_desired_ec_target() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.twins
        .set_desired_state("c1", &object(json!({"ec_target_ms_cm": 2.0})))
        .await
        .unwrap();

    h.publish(
        "farm/f1/coord/c1/reservoir/telemetry",
        json!({"ec_ms_cm": 3.0, "ph": 6.1, "water_level_pct": 15, "water_temp_c": 21}),
    )
    .await;

    let mut categories: Vec<_> = h
        .store
        .list_active("f1")
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.category, a.severity))
        .collect();
    categories.sort_by_key(|(c, _)| c.to_string());
    assert_eq!(
        categories,
        vec![
            (AlertCategory::EcDeviation, Severity::Warning),
            (AlertCategory::WaterLevel, Severity::Warning),
        ]
    );
    assert_eq!(active_alerts(&h, "f1").await, 2);
}

#[tokio::test]
async fn test_forget_removes_device_and_twin() {
    let h = Harness::with_coordinator("f1", "c1").await;
    h.publish(LEAF_TOPIC, json!({"air_temp_c": 24})).await;

    h.publisher.set_fail(true);
    assert!(!h.pairing.forget("f1", "c1", "t1").await.unwrap());
    assert!(TwinRepository::get(h.store.as_ref(), "t1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_completion_after_operator_reject_is_refused() {
    let mut h = Harness::with_coordinator("f1", "c1").await;
    h.pairing
        .start_session("f1", "c1", Duration::from_secs(60))
        .await
        .unwrap();
    h.publish(
        "farm/f1/coord/c1/pairing/request",
        json!({"tower_id": "t8", "mac_address": "AA:BB:CC:00:00:08"}),
    )
    .await;
    assert!(h.pairing.reject("f1", "c1", "t8").await.is_some());
    h.count_live(LiveEventName::PairingRejected);

    h.publish(
        "farm/f1/coord/c1/pairing/complete",
        json!({"tower_id": "t8", "status": "success", "fw_version": "1.0.1"}),
    )
    .await;

    assert!(DeviceRepository::get(h.store.as_ref(), "t8")
        .await
        .unwrap()
        .is_none());
    assert!(TwinRepository::get(h.store.as_ref(), "t8")
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.count_live(LiveEventName::PairingFailed), 1);
}

#[tokio::test]
async fn test_idle_pending_registration_expires_and_renotifies() {
    let mut h = Harness::new();
    for i in 0..20 {
        h.publish(
            &format!("farm/f1/coord/drifter-{}/telemetry", i),
            json!({"temp_c": 22}),
        )
        .await;
    }
    assert_eq!(h.registration.list_pending().len(), 20);
    assert_eq!(h.count_live(LiveEventName::CoordinatorPending), 20);

    let ttl = Duration::from_secs(3600);
    let later = Utc::now() + chrono::Duration::seconds(3601);
    assert_eq!(h.registration.expire_pending(later, ttl), 20);
    assert!(h.registration.list_pending().is_empty());

    h.publish("farm/f1/coord/drifter-3/telemetry", json!({"temp_c": 22}))
        .await;
    let pending = h.registration.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_count, 1);
    assert_eq!(h.count_live(LiveEventName::CoordinatorPending), 1);
}

#[tokio::test]
async fn test_telemetry_for_another_farm_is_dropped() {
    let mut h = Harness::with_coordinator("f1", "c1").await;

    h.publish(
        "farm/f2/coord/c1/tower/t1/telemetry",
        json!({"air_temp_c": 40}),
    )
    .await;

    assert!(h.samples.try_recv().is_err());
    assert!(TwinRepository::get(h.store.as_ref(), "t1")
        .await
        .unwrap()
        .is_none());
    assert!(h.store.list_active("f2").await.unwrap().is_empty());
    assert!(h.registration.list_pending().is_empty());

    h.publish(LEAF_TOPIC, json!({"air_temp_c": 24})).await;
    assert_eq!(h.samples.try_recv().unwrap().farm_id, "f1");
}
