//! Integration tests for the point polling pipeline
//!
//! These tests verify that:
//! - Points are only read when due
//! - Readings flow through normalization, threshold evaluation and storage
//! - Alarm episodes follow the value sequence

use chrono::Duration;
use plant_monitoring::actors::messages::MonitorEvent;
use plant_monitoring::monitors::threshold::{AlarmChange, ThresholdKind};
use plant_monitoring::protocols::RawValue;
use plant_monitoring::storage::schema::{AlarmState, HistoryRange};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use crate::helpers::*;

fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_point_read_once_per_interval() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("line pressure", 7, None, None))
        .await
        .unwrap();
    test.reader.set(7, RawValue::Float(4.2));

    test.hub.start_point_polling().await.unwrap();

    // 1s ticks over 10s with a 5s interval
    for tick in 0..10 {
        if tick > 0 {
            test.clock.advance(Duration::seconds(1));
        }
        test.hub.poll_now().await.unwrap();
    }

    assert_eq!(test.reader.reads(), 2);
    let history = test.hub.history(point.id, HistoryRange::All).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp < history[1].timestamp);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_threshold_sequence_through_pipeline() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("boiler temperature", 1, Some(10.0), Some(20.0)))
        .await
        .unwrap();
    let mut rx = test.hub.subscribe();
    test.hub.start_point_polling().await.unwrap();

    for value in [5.0, 15.0, 25.0, 5.0] {
        test.reader.set(1, RawValue::Float(value));
        test.hub.poll_now().await.unwrap();
        test.clock.advance(Duration::seconds(5));
    }

    let changes: Vec<AlarmChange> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            MonitorEvent::ThresholdAlarm { change, .. } => Some(change),
            _ => None,
        })
        .collect();
    assert_eq!(changes.len(), 4);
    assert!(matches!(&changes[0], AlarmChange::Opened(a) if a.kind == ThresholdKind::Min && a.value == 5.0));
    assert!(matches!(&changes[1], AlarmChange::Resolved(a) if a.kind == ThresholdKind::Min));
    assert!(matches!(&changes[2], AlarmChange::Opened(a) if a.kind == ThresholdKind::Max && a.value == 25.0));
    assert!(matches!(
        &changes[3],
        AlarmChange::Switched { from: ThresholdKind::Max, opened } if opened.kind == ThresholdKind::Min
    ));

    let groups = test.hub.alarm_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.point.id, point.id);
    assert_eq!(group.point.last_value.as_deref(), Some("5"));
    assert!(group.is_active);
    assert_eq!(group.active.as_ref().map(|a| a.kind), Some(ThresholdKind::Min));
    assert_eq!(
        group.history.iter().map(|a| (a.kind, a.state)).collect::<Vec<_>>(),
        vec![
            (ThresholdKind::Min, AlarmState::Active),
            (ThresholdKind::Max, AlarmState::Resolved),
            (ThresholdKind::Min, AlarmState::Resolved),
        ]
    );

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_boolean_point_is_stored_but_never_evaluated() {
    let test = create_test_hub(&create_test_config());
    let mut new_point = create_test_point("pump running", 12, Some(0.0), Some(0.5));
    new_point.type_code = "coil".to_string();
    let point = test.hub.register_point(new_point).await.unwrap();
    test.reader.set(12, RawValue::Bool(true));

    test.hub.start_point_polling().await.unwrap();
    test.hub.poll_now().await.unwrap();

    let stored = test.hub.point(point.id).await.unwrap().unwrap();
    assert_eq!(stored.last_value.as_deref(), Some("ON"));
    assert!(test.hub.alarm_groups().await.unwrap().is_empty());

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_float_reading_is_rounded() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("flow", 3, None, None))
        .await
        .unwrap();
    test.reader.set(3, RawValue::Float(23.456));

    test.hub.start_point_polling().await.unwrap();
    test.hub.poll_now().await.unwrap();

    let history = test.hub.history(point.id, HistoryRange::FifteenMinutes).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].value, "23.46");

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_history_range_excludes_old_readings() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("level", 4, None, None))
        .await
        .unwrap();
    test.reader.set(4, RawValue::Integer(40));
    test.hub.start_point_polling().await.unwrap();

    test.hub.poll_now().await.unwrap();
    test.clock.advance(Duration::hours(2));
    test.hub.poll_now().await.unwrap();

    assert_eq!(test.hub.history(point.id, HistoryRange::OneHour).await.unwrap().len(), 1);
    assert_eq!(test.hub.history(point.id, HistoryRange::EightHours).await.unwrap().len(), 2);

    test.hub.shutdown().await.unwrap();
}
