//! Integration tests for the monitoring facade
//!
//! These tests verify that:
//! - Registration validates input before anything is stored
//! - Polling start is idempotent
//! - Configuration seeds are applied once

use assert_matches::assert_matches;
use plant_monitoring::config::parse_config;
use plant_monitoring::points::ValidationError;
use plant_monitoring::protocols::RawValue;
use plant_monitoring::{DataType, Protocol};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_register_point_applies_defaults() {
    let test = create_test_hub(&create_test_config());
    let mut new_point = create_test_point("room humidity", 30, None, None);
    new_point.interval_ms = None;
    new_point.unit = Some("  ".to_string());

    let point = test.hub.register_point(new_point).await.unwrap();

    assert_eq!(point.device_id, 1);
    assert_eq!(point.interval_ms, 5000);
    assert_eq!(point.unit, None);
    assert_eq!(point.protocol, Protocol::Modbus);
    assert_eq!(point.data_type, DataType::Float);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_register_point_rejects_invalid_input() {
    let test = create_test_hub(&create_test_config());

    let inverted = create_test_point("inverted", 1, Some(20.0), Some(10.0));
    let err = test.hub.register_point(inverted).await.unwrap_err();
    assert_matches!(
        err.downcast_ref::<ValidationError>(),
        Some(ValidationError::InvertedThresholds { .. })
    );

    let mut anonymous = create_test_point("anonymous", 1, None, None);
    anonymous.created_by = "Inconnu".to_string();
    let err = test.hub.register_point(anonymous).await.unwrap_err();
    assert_matches!(err.downcast_ref::<ValidationError>(), Some(ValidationError::UnknownCreator));

    let mut opcua = create_test_point("opcua", 1, None, None);
    opcua.protocol = "opcua".to_string();
    assert!(test.hub.register_point(opcua).await.is_err());

    let mut negative = create_test_point("negative", 1, None, None);
    negative.address = "-4".to_string();
    assert!(test.hub.register_point(negative).await.is_err());

    assert!(test.hub.points().await.unwrap().is_empty());

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_point_polling_is_idempotent() {
    let test = create_test_hub(&create_test_config());
    test.hub
        .register_point(create_test_point("flow", 2, None, None))
        .await
        .unwrap();
    test.reader.set(2, RawValue::Float(3.0));

    assert!(test.hub.poll_now().await.is_err());

    test.hub.start_point_polling().await.unwrap();
    test.hub.start_point_polling().await.unwrap();
    let report = test.hub.poll_now().await.unwrap();
    assert_eq!(report.polled, 1);
    assert_eq!(test.reader.reads(), 1);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_seed_from_config_runs_once() {
    let mut config = parse_config(
        r#"{
            "storage": { "backend": "none" },
            "protocol_types": [
                { "code": "float", "display_name": "Float 32 bits", "protocol": "modbus", "register_count": 2 },
                { "code": "ai", "display_name": "Analog input", "protocol": "bacnet", "bacnet_object_type": 0 }
            ],
            "points": [
                {
                    "name": "Boiler temperature",
                    "protocol": "modbus",
                    "host": "10.0.0.12",
                    "address": "40",
                    "type": "float",
                    "min": 10.0,
                    "max": 90.0,
                    "created_by": "ops"
                }
            ],
            "devices": [
                { "name": "PLC-1", "address": "10.0.0.12", "location": "Boiler room" },
                { "name": "Spare port" }
            ]
        }"#,
    )
    .unwrap();
    config.poller.tick_ms = 3_600_000;
    config.reachability.interval_secs = 3600;

    let test = create_test_hub(&config);
    test.hub.seed(&config).await.unwrap();
    test.hub.seed(&config).await.unwrap();

    let points = test.hub.points().await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].type_display_name.as_deref(), Some("Float 32 bits"));
    assert_eq!(test.hub.devices().await.unwrap().len(), 2);
    assert_eq!(test.hub.protocol_types().await.unwrap().len(), 2);

    // the spare port has no address and is never probed
    let report = test.hub.sweep_now().await.unwrap();
    assert_eq!(report.probed, 1);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_add_device_requires_name() {
    let test = create_test_hub(&create_test_config());

    assert!(
        test.hub
            .add_device(plant_monitoring::storage::schema::NewDevice::default())
            .await
            .is_err()
    );

    test.hub.shutdown().await.unwrap();
}
