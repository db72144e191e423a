//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Alarm state survives a restart, so a breach is not re-opened
//! - Device states survive a restart, so no cold start is repeated
//! - Deleting a point removes its history and alarms

use std::sync::Arc;

use chrono::Duration;
use plant_monitoring::protocols::RawValue;
use plant_monitoring::storage::StorageBackend;
use plant_monitoring::storage::schema::{AlarmState, HistoryQuery, NewDevice, ReachabilityTransition};
use plant_monitoring::storage::sqlite::SqliteBackend;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::helpers::*;

#[tokio::test]
async fn test_active_alarm_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("plant.db");
    let config = create_test_config();

    let point_id = {
        let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        let test = create_test_hub_on(backend, &config);
        let point = test
            .hub
            .register_point(create_test_point("chiller outlet", 2, Some(4.0), Some(12.0)))
            .await
            .unwrap();
        test.reader.set(2, RawValue::Float(15.0));
        test.hub.start_point_polling().await.unwrap();
        test.hub.poll_now().await.unwrap();
        test.hub.shutdown().await.unwrap();
        point.id
    };

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let test = create_test_hub_on(backend.clone(), &config);
    test.hub.start_point_polling().await.unwrap();

    // still breaching after the restart: same episode
    test.reader.set(2, RawValue::Float(16.0));
    test.clock.advance(Duration::minutes(1));
    test.hub.poll_now().await.unwrap();
    let alarms = backend.list_alarms().await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].value, 15.0);
    assert_eq!(alarms[0].state, AlarmState::Active);

    test.reader.set(2, RawValue::Float(8.0));
    test.clock.advance(Duration::minutes(1));
    test.hub.poll_now().await.unwrap();
    let alarms = backend.list_alarms().await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].state, AlarmState::Resolved);
    assert!(alarms[0].ended_at.is_some());

    let history = backend
        .query_history(HistoryQuery {
            point_id,
            since: None,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(
        history.iter().map(|h| h.value.as_str()).collect::<Vec<_>>(),
        vec!["15", "16", "8"]
    );

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_state_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("plant.db");
    let config = create_test_config();

    {
        let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        let test = create_test_hub_on(backend, &config);
        test.hub
            .add_device(NewDevice {
                name: "RTU-7".to_string(),
                address: "10.7.0.7".to_string(),
                location: None,
            })
            .await
            .unwrap();
        test.prober.set("10.7.0.7", true);
        test.hub.sweep_now().await.unwrap();
        test.hub.shutdown().await.unwrap();
    }

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let test = create_test_hub_on(backend, &config);
    let report = test.hub.sweep_now().await.unwrap();

    assert_eq!(report.transitions, 1);
    let log = test.hub.reachability_alarms().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].label, ReachabilityTransition::Alarm);
    assert_eq!(log[0].address, "10.7.0.7");

    let stats = test.hub.dashboard_stats().await.unwrap();
    assert_eq!(stats.latest.map(|s| s.comm_rate), Some(0.0));

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_point_cascades() {
    let temp_dir = tempdir().unwrap();
    let backend = Arc::new(SqliteBackend::new(temp_dir.path().join("plant.db")).await.unwrap());
    let test = create_test_hub_on(backend.clone(), &create_test_config());

    let point = test
        .hub
        .register_point(create_test_point("tank", 8, None, Some(1.0)))
        .await
        .unwrap();
    test.reader.set(8, RawValue::Float(2.0));
    test.hub.start_point_polling().await.unwrap();
    test.hub.poll_now().await.unwrap();
    assert_eq!(backend.list_alarms().await.unwrap().len(), 1);

    assert!(test.hub.remove_point(point.id).await.unwrap());
    assert!(!test.hub.remove_point(point.id).await.unwrap());

    assert!(backend.list_alarms().await.unwrap().is_empty());
    assert!(test.hub.alarm_groups().await.unwrap().is_empty());
    assert!(test.hub.points().await.unwrap().is_empty());

    test.hub.shutdown().await.unwrap();
}
