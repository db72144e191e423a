//! Helper functions and fakes for integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use plant_monitoring::config::Config;
use plant_monitoring::monitors::indicators::{ResourceUsage, SystemTelemetry};
use plant_monitoring::monitors::reachability::{ProbeResult, Prober};
use plant_monitoring::protocols::{PointReader, ProtocolReaders, RawValue, ReadError, ReadResult};
use plant_monitoring::storage::{MemoryBackend, StorageBackend};
use plant_monitoring::{HubParts, ManualClock, MonitoredPoint, MonitoringHub, NewPoint};

/// Reader answering from a per-address script
///
/// Unscripted addresses fail like an unreachable device.
#[derive(Default)]
pub struct ScriptedReader {
    values: Mutex<HashMap<u32, RawValue>>,
    reads: AtomicUsize,
}

impl ScriptedReader {
    pub fn set(&self, address: u32, value: RawValue) {
        self.values.lock().unwrap().insert(address, value);
    }

    pub fn fail(&self, address: u32) {
        self.values.lock().unwrap().remove(&address);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PointReader for ScriptedReader {
    async fn read(&self, point: &MonitoredPoint) -> ReadResult<RawValue> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap()
            .get(&point.address)
            .cloned()
            .ok_or_else(|| ReadError::Timeout(Duration::from_secs(2)))
    }
}

/// Prober answering from a per-address script, unreachable when unscripted
#[derive(Default)]
pub struct ScriptedProber {
    alive: Mutex<HashMap<String, bool>>,
    probes: AtomicUsize,
}

impl ScriptedProber {
    pub fn set(&self, address: &str, alive: bool) {
        self.alive.lock().unwrap().insert(address.to_string(), alive);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: &str) -> ProbeResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.lock().unwrap().get(address).copied();
        match alive {
            Some(true) => ProbeResult::reached(Duration::from_millis(3)),
            _ => ProbeResult::unreachable(),
        }
    }
}

pub struct FixedTelemetry(pub ResourceUsage);

impl SystemTelemetry for FixedTelemetry {
    fn sample(&mut self) -> ResourceUsage {
        self.0
    }
}

pub struct TestHub<B> {
    pub hub: MonitoringHub,
    pub backend: Arc<B>,
    pub reader: Arc<ScriptedReader>,
    pub prober: Arc<ScriptedProber>,
    pub clock: ManualClock,
}

/// Hub on in-memory storage with scripted readers and prober
pub fn create_test_hub(config: &Config) -> TestHub<MemoryBackend> {
    create_test_hub_on(Arc::new(MemoryBackend::new()), config)
}

pub fn create_test_hub_on<B: StorageBackend + 'static>(backend: Arc<B>, config: &Config) -> TestHub<B> {
    let reader = Arc::new(ScriptedReader::default());
    let prober = Arc::new(ScriptedProber::default());
    let clock = ManualClock::new(Utc::now());

    let hub = MonitoringHub::new(
        HubParts {
            backend: backend.clone() as Arc<dyn StorageBackend>,
            readers: ProtocolReaders::new(reader.clone(), reader.clone()),
            prober: prober.clone(),
            telemetry: Box::new(FixedTelemetry(ResourceUsage {
                cpu_pct: 25.0,
                tx_bytes_per_sec: 125_000.0,
            })),
            clock: Arc::new(clock.clone()),
        },
        config,
    );

    TestHub {
        hub,
        backend,
        reader,
        prober,
        clock,
    }
}

/// Config whose timers never fire during a test
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.poller.tick_ms = 3_600_000;
    config.reachability.interval_secs = 3600;
    config
}

pub fn create_test_point(name: &str, address: u32, min: Option<f64>, max: Option<f64>) -> NewPoint {
    NewPoint {
        name: name.to_string(),
        protocol: "modbus".to_string(),
        host: "10.10.0.20".to_string(),
        device_id: None,
        address: address.to_string(),
        type_code: "float".to_string(),
        interval_ms: Some(5000),
        unit: Some("bar".to_string()),
        min,
        max,
        created_by: "integration".to_string(),
    }
}
