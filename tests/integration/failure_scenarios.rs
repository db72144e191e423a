//! Integration tests for failure scenarios
//!
//! These tests verify that:
//! - A failing point does not stop other points in the same tick
//! - A storage outage skips the tick, shows in the health status, and polling
//!   recovers afterwards
//! - A point deleted mid-poll has its reading discarded

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use plant_monitoring::actors::poller::PollEngine;
use plant_monitoring::protocols::{PointReader, ProtocolReaders, RawValue, ReadResult};
use plant_monitoring::storage::schema::HistoryRange;
use plant_monitoring::storage::{MemoryBackend, StorageBackend};
use plant_monitoring::{ManualClock, MonitoredPoint};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use crate::helpers::*;

#[tokio::test]
async fn test_failed_point_does_not_block_others() {
    let test = create_test_hub(&create_test_config());
    let healthy = test
        .hub
        .register_point(create_test_point("healthy", 1, None, None))
        .await
        .unwrap();
    let broken = test
        .hub
        .register_point(create_test_point("broken", 2, None, None))
        .await
        .unwrap();
    test.reader.set(1, RawValue::Float(1.5));
    test.reader.fail(2);

    test.hub.start_point_polling().await.unwrap();
    test.clock.advance(Duration::seconds(10));
    let report = test.hub.poll_now().await.unwrap();

    assert_eq!(report.due, 2);
    assert_eq!(report.polled, 1);
    assert_eq!(report.failed, 1);
    let healthy = test.hub.point(healthy.id).await.unwrap().unwrap();
    assert_eq!(healthy.last_value.as_deref(), Some("1.5"));
    let broken = test.hub.point(broken.id).await.unwrap().unwrap();
    assert_eq!(broken.last_value, None);
    assert_eq!(broken.last_update, None);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_point_is_retried_next_tick() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("flaky", 5, None, None))
        .await
        .unwrap();
    test.hub.start_point_polling().await.unwrap();

    test.hub.poll_now().await.unwrap();
    assert_eq!(test.hub.point(point.id).await.unwrap().unwrap().last_value, None);

    test.reader.set(5, RawValue::Integer(17));
    test.clock.advance(Duration::seconds(1));
    let report = test.hub.poll_now().await.unwrap();

    assert_eq!(report.polled, 1);
    assert_eq!(
        test.hub.point(point.id).await.unwrap().unwrap().last_value.as_deref(),
        Some("17")
    );

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unparseable_value_is_discarded() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("status text", 9, Some(0.0), Some(10.0)))
        .await
        .unwrap();
    test.reader.set(9, RawValue::Text("n/a".to_string()));
    test.hub.start_point_polling().await.unwrap();

    test.clock.advance(Duration::seconds(1));
    test.hub.poll_now().await.unwrap();

    assert!(test.hub.history(point.id, HistoryRange::All).await.unwrap().is_empty());
    assert!(test.hub.alarm_groups().await.unwrap().is_empty());

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_storage_outage_skips_tick_and_recovers() {
    let test = create_test_hub(&create_test_config());
    let point = test
        .hub
        .register_point(create_test_point("pressure", 1, None, Some(3.0)))
        .await
        .unwrap();
    test.reader.set(1, RawValue::Float(2.0));

    assert!(test.hub.storage_health().await.unwrap().healthy);

    test.backend.set_unavailable(true);
    test.hub.start_point_polling().await.unwrap();
    let report = test.hub.poll_now().await.unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(test.reader.reads(), 0);
    let health = test.hub.storage_health().await.unwrap();
    assert!(!health.healthy);
    assert_eq!(health.metadata.get("backend").map(String::as_str), Some("memory"));

    test.backend.set_unavailable(false);
    assert!(test.hub.storage_health().await.unwrap().healthy);
    let report = test.hub.poll_now().await.unwrap();
    assert_eq!(report.polled, 1);
    assert_eq!(
        test.hub.point(point.id).await.unwrap().unwrap().last_value.as_deref(),
        Some("2")
    );

    test.hub.shutdown().await.unwrap();
}

/// Deletes the point it is asked to read, like a concurrent API call would
struct DeletingReader {
    backend: Arc<MemoryBackend>,
}

#[async_trait]
impl PointReader for DeletingReader {
    async fn read(&self, point: &MonitoredPoint) -> ReadResult<RawValue> {
        self.backend.delete_point(point.id).await.unwrap();
        Ok(RawValue::Float(99.0))
    }
}

#[tokio::test]
async fn test_point_deleted_mid_poll_is_discarded() {
    let backend = Arc::new(MemoryBackend::new());
    let point = backend
        .insert_point(create_test_point("temporary", 1, None, Some(50.0)).validate().unwrap())
        .await
        .unwrap();

    let reader = Arc::new(DeletingReader {
        backend: backend.clone(),
    });
    let (events, _) = broadcast::channel(16);
    let engine = PollEngine::new(
        backend.clone(),
        ProtocolReaders::new(reader.clone(), reader),
        Arc::new(ManualClock::new(Utc::now())),
        events,
        1,
    );

    let report = engine.tick().await;

    assert_eq!(report.due, 1);
    assert_eq!(report.discarded, 1);
    assert!(backend.get_point(point.id).await.unwrap().is_none());
    assert!(backend.list_alarms().await.unwrap().is_empty());
}
