//! Integration tests for reachability sweeps and indicators
//!
//! These tests verify that:
//! - Only OK/NOK changes are logged, never the first probe of a device
//! - Manual probes and sweeps share the same prior-state logic
//! - Indicators are computed and stored after every sweep

use chrono::Duration;
use futures::future::join_all;
use plant_monitoring::actors::messages::MonitorEvent;
use plant_monitoring::storage::schema::{CommState, NewDevice, ReachabilityTransition};
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn device(name: &str, address: &str) -> NewDevice {
    NewDevice {
        name: name.to_string(),
        address: address.to_string(),
        location: Some("Substation 4".to_string()),
    }
}

#[tokio::test]
async fn test_ok_nok_nok_ok_logs_two_records() {
    let test = create_test_hub(&create_test_config());
    let plc = test.hub.add_device(device("PLC-4", "10.4.0.10")).await.unwrap();

    for alive in [true, false, false, true] {
        test.prober.set("10.4.0.10", alive);
        test.hub.sweep_now().await.unwrap();
        test.clock.advance(Duration::minutes(15));
    }

    let log = test.hub.reachability_alarms().await.unwrap();
    assert_eq!(
        log.iter().map(|record| record.label).collect::<Vec<_>>(),
        vec![ReachabilityTransition::BackToNormal, ReachabilityTransition::Alarm]
    );
    assert!(log.iter().all(|record| record.device_name == "PLC-4"));
    assert_eq!(log[0].location.as_deref(), Some("Substation 4"));

    let plc = test
        .hub
        .devices()
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.id == plc.id)
        .unwrap();
    assert_eq!(plc.comm_state, Some(CommState::Ok));

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cold_start_never_logs() {
    let test = create_test_hub(&create_test_config());
    let dead = test.hub.add_device(device("meter", "10.4.0.11")).await.unwrap();

    let report = test.hub.sweep_now().await.unwrap();

    assert_eq!(report.probed, 1);
    assert_eq!(report.transitions, 0);
    assert!(test.hub.reachability_alarms().await.unwrap().is_empty());
    let dead = test.hub.devices().await.unwrap().into_iter().find(|d| d.id == dead.id).unwrap();
    assert_eq!(dead.comm_state, Some(CommState::Nok));

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_inventory_gives_zero_indicators() {
    let test = create_test_hub(&create_test_config());

    let report = test.hub.sweep_now().await.unwrap();

    assert_eq!(report.probed, 0);
    assert_eq!(report.snapshot.comm_rate, 0.0);
    assert_eq!(report.snapshot.avg_delay_ms, 0);
    assert_eq!(report.snapshot.avg_loss, 0.0);
    // 125 kB/s against the default 12.5 MB/s link
    assert_eq!(report.snapshot.bandwidth_util, 1.0);
    assert_eq!(report.snapshot.cpu_util, 25.0);

    let stats = test.hub.dashboard_stats().await.unwrap();
    assert_eq!(stats.latest, Some(report.snapshot));

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_probe_uses_sweep_state() {
    let test = create_test_hub(&create_test_config());
    let gateway = test.hub.add_device(device("gateway", "10.4.0.1")).await.unwrap();
    test.prober.set("10.4.0.1", true);
    test.hub.sweep_now().await.unwrap();

    test.prober.set("10.4.0.1", false);
    let state = test
        .hub
        .trigger_single_device_probe(gateway.id, "10.4.0.1")
        .await
        .unwrap();
    assert_eq!(state, CommState::Nok);

    // the sweep sees NOK as the prior state and logs nothing new
    test.hub.sweep_now().await.unwrap();

    let log = test.hub.reachability_alarms().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].label, ReachabilityTransition::Alarm);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_probes_log_one_transition() {
    let test = create_test_hub(&create_test_config());
    let switch = test.hub.add_device(device("switch", "10.4.0.2")).await.unwrap();
    test.prober.set("10.4.0.2", true);
    test.hub.sweep_now().await.unwrap();

    test.prober.set("10.4.0.2", false);
    let probes = (0..5).map(|_| test.hub.trigger_single_device_probe(switch.id, "10.4.0.2"));
    test.hub.trigger_full_reachability_sweep().unwrap();
    let states = join_all(probes).await;
    test.hub.sweep_now().await.unwrap();

    assert!(states.into_iter().all(|state| state.unwrap() == CommState::Nok));
    let log = test.hub.reachability_alarms().await.unwrap();
    assert_eq!(log.len(), 1);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_probe_of_unknown_device_fails() {
    let test = create_test_hub(&create_test_config());

    assert!(test.hub.trigger_single_device_probe(404, "10.4.0.99").await.is_err());

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_without_address_is_rejected() {
    let test = create_test_hub(&create_test_config());
    let pump = test.hub.add_device(device("pump", "10.4.0.5")).await.unwrap();
    test.prober.set("10.4.0.5", true);
    test.hub.sweep_now().await.unwrap();

    assert!(test.hub.trigger_single_device_probe(pump.id, "").await.is_err());

    assert!(test.hub.reachability_alarms().await.unwrap().is_empty());
    assert_eq!(test.prober.probes(), 1);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_active_widget_shows_five_latest_alarms() {
    let test = create_test_hub(&create_test_config());
    test.hub.add_device(device("radio", "10.4.0.3")).await.unwrap();

    // OK, then seven NOK/OK cycles
    test.prober.set("10.4.0.3", true);
    test.hub.sweep_now().await.unwrap();
    for _ in 0..7 {
        for alive in [false, true] {
            test.clock.advance(Duration::minutes(1));
            test.prober.set("10.4.0.3", alive);
            test.hub.sweep_now().await.unwrap();
        }
    }

    assert_eq!(test.hub.reachability_alarms().await.unwrap().len(), 14);
    let active = test.hub.active_reachability_alarms().await.unwrap();
    assert_eq!(active.len(), 5);
    assert!(active.iter().all(|r| r.label == ReachabilityTransition::Alarm));
    assert!(active.windows(2).all(|w| w[0].timestamp > w[1].timestamp));

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dashboard_evolution_over_sweeps() {
    let test = create_test_hub(&create_test_config());
    test.hub.add_device(device("a", "10.4.1.1")).await.unwrap();
    test.hub.add_device(device("b", "10.4.1.2")).await.unwrap();
    test.prober.set("10.4.1.1", true);
    test.prober.set("10.4.1.2", true);

    test.hub.sweep_now().await.unwrap();
    test.clock.advance(Duration::minutes(15));
    test.prober.set("10.4.1.2", false);
    test.hub.sweep_now().await.unwrap();

    let stats = test.hub.dashboard_stats().await.unwrap();
    assert_eq!(stats.history.len(), 2);
    assert_eq!(stats.latest.as_ref().map(|s| s.comm_rate), Some(50.0));
    assert_eq!(stats.latest.as_ref().map(|s| s.avg_loss), Some(50.0));
    assert_eq!(stats.latest.as_ref().map(|s| s.avg_delay_ms), Some(3));
    assert_eq!(stats.evolution, -50.0);

    // outside the 24h window
    test.clock.advance(Duration::hours(25));
    let stats = test.hub.dashboard_stats().await.unwrap();
    assert!(stats.history.is_empty());
    assert_eq!(stats.evolution, 0.0);

    test.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_triggered_sweep_publishes_indicators() {
    let test = create_test_hub(&create_test_config());
    let mut rx = test.hub.subscribe();

    test.hub.trigger_full_reachability_sweep().unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        loop {
            if let MonitorEvent::Indicators(snapshot) = rx.recv().await.unwrap() {
                return snapshot;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.comm_rate, 0.0);
    assert_eq!(test.prober.probes(), 0);

    test.hub.shutdown().await.unwrap();
}
