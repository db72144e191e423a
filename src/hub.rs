//! Monitoring facade
//!
//! [`MonitoringHub`] owns the storage backend and both actors and is the
//! single entry point for an outer layer (HTTP API, CLI). Queries go straight
//! to storage; anything touching device state goes through the actors.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, warn};

use crate::actors::messages::{MonitorEvent, SweepReport, TickReport};
use crate::actors::poller::{PollEngine, PollerHandle};
use crate::actors::reachability::{ReachabilityHandle, ReachabilitySweeper};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, PollerConfig};
use crate::monitors::indicators::{SysinfoTelemetry, SystemTelemetry};
use crate::monitors::reachability::{IcmpProber, Prober};
use crate::points::{MonitoredPoint, NewPoint, ProtocolType};
use crate::protocols::ProtocolReaders;
use crate::storage::schema::{
    AlarmGroup, CommState, DashboardStats, Device, HistoryEntry, HistoryRange, NewDevice,
    ReachabilityAlarmRecord, ReachabilityTransition, group_alarms,
};
use crate::storage::{self, HealthStatus, StorageBackend};

/// Records shown by the active reachability alarm widget
pub const ACTIVE_REACHABILITY_ALARMS: usize = 5;

const EVENT_CAPACITY: usize = 256;

/// Collaborators injected into the hub
pub struct HubParts {
    pub backend: Arc<dyn StorageBackend>,
    pub readers: ProtocolReaders,
    pub prober: Arc<dyn Prober>,
    pub telemetry: Box<dyn SystemTelemetry>,
    pub clock: Arc<dyn Clock>,
}

pub struct MonitoringHub {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MonitorEvent>,
    poller_config: PollerConfig,
    readers: ProtocolReaders,
    poller: Mutex<Option<PollerHandle>>,
    reachability: ReachabilityHandle,
}

impl MonitoringHub {
    /// Wire the hub and start the reachability actor. Point polling starts
    /// with [`MonitoringHub::start_point_polling`].
    pub fn new(parts: HubParts, config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let sweeper = ReachabilitySweeper::new(
            parts.backend.clone(),
            parts.prober,
            parts.telemetry,
            parts.clock.clone(),
            events.clone(),
            &config.reachability,
        );
        let reachability = ReachabilityHandle::spawn(sweeper, config.reachability.interval());

        Self {
            backend: parts.backend,
            clock: parts.clock,
            events,
            poller_config: config.poller.clone(),
            readers: parts.readers,
            poller: Mutex::new(None),
            reachability,
        }
    }

    /// Build the real collaborators from the configuration and apply its
    /// catalogue, point and device seeds.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let backend = storage::open(&config.storage.clone().unwrap_or_default())
            .await
            .context("failed to open storage")?;
        let readers = ProtocolReaders::from_config(&config.poller)
            .await
            .context("failed to set up protocol readers")?;
        let prober = IcmpProber::new(config.reachability.probe_timeout())
            .context("failed to open ICMP socket")?;

        let hub = Self::new(
            HubParts {
                backend,
                readers,
                prober: Arc::new(prober),
                telemetry: Box::new(SysinfoTelemetry::new()),
                clock: Arc::new(SystemClock),
            },
            config,
        );
        hub.seed(config).await?;
        Ok(hub)
    }

    /// Upsert catalogue entries and add points and devices whose names are
    /// not taken yet
    #[instrument(skip_all)]
    pub async fn seed(&self, config: &Config) -> Result<()> {
        for protocol_type in &config.protocol_types {
            self.backend
                .upsert_protocol_type(protocol_type.clone())
                .await
                .with_context(|| format!("failed to store protocol type {}", protocol_type.code))?;
        }

        let existing = self.backend.list_points().await?;
        for point in &config.points {
            if existing.iter().any(|p| p.name == point.name) {
                debug!(name = %point.name, "point already registered");
                continue;
            }
            self.register_point(point.clone())
                .await
                .with_context(|| format!("invalid point {:?} in configuration", point.name))?;
        }

        let existing = self.backend.list_devices().await?;
        for device in &config.devices {
            if existing.iter().any(|d| d.name == device.name) {
                debug!(name = %device.name, "device already registered");
                continue;
            }
            self.add_device(device.clone()).await?;
        }

        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Start the poll scheduler. Calling it again while it runs does nothing.
    pub async fn start_point_polling(&self) -> Result<()> {
        let mut poller = self.poller.lock().await;
        if poller.as_ref().is_some_and(|handle| handle.is_running()) {
            debug!("point polling already running");
            return Ok(());
        }

        let engine = PollEngine::new(
            self.backend.clone(),
            self.readers.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.poller_config.max_concurrent_reads,
        );
        *poller = Some(PollerHandle::spawn(engine, self.poller_config.tick()));

        info!(tick = ?self.poller_config.tick(), "point polling started");
        Ok(())
    }

    /// Run one poll tick now. Fails unless polling was started.
    pub async fn poll_now(&self) -> Result<TickReport> {
        let poller = self.poller.lock().await.clone();
        match poller {
            Some(handle) => handle.tick_now().await,
            None => anyhow::bail!("point polling is not running"),
        }
    }

    /// Queue a full sweep and return without waiting for it
    pub fn trigger_full_reachability_sweep(&self) -> Result<()> {
        self.reachability.trigger_sweep()
    }

    /// Sweep and wait for the result
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.reachability.sweep_now().await
    }

    /// Probe one device, apply its transition and return the new state
    pub async fn trigger_single_device_probe(&self, device_id: i64, address: &str) -> Result<CommState> {
        self.reachability.probe_device(device_id, address).await
    }

    /// Validate and store a point. It is first polled on the next tick.
    #[instrument(skip(self, point), fields(name = %point.name))]
    pub async fn register_point(&self, point: NewPoint) -> Result<MonitoredPoint> {
        let registration = point.validate()?;
        let point = self.backend.insert_point(registration).await?;
        info!(id = point.id, "point registered");
        Ok(point)
    }

    /// Remove a point with its history and alarms. False if it did not exist.
    pub async fn remove_point(&self, id: i64) -> Result<bool> {
        let removed = self.backend.delete_point(id).await?;
        if removed {
            info!(id, "point removed");
        }
        Ok(removed)
    }

    pub async fn points(&self) -> Result<Vec<MonitoredPoint>> {
        Ok(self.backend.list_points().await?)
    }

    pub async fn point(&self, id: i64) -> Result<Option<MonitoredPoint>> {
        Ok(self.backend.get_point(id).await?)
    }

    pub async fn history(&self, point_id: i64, range: HistoryRange) -> Result<Vec<HistoryEntry>> {
        let query = range.to_query(point_id, self.clock.now());
        Ok(self.backend.query_history(query).await?)
    }

    pub async fn alarm_groups(&self) -> Result<Vec<AlarmGroup>> {
        let points = self.backend.list_points().await?;
        let alarms = self.backend.list_alarms().await?;
        Ok(group_alarms(&points, alarms))
    }

    /// Reachability log, newest first
    pub async fn reachability_alarms(&self) -> Result<Vec<ReachabilityAlarmRecord>> {
        Ok(self.backend.list_reachability_alarms(None, None).await?)
    }

    /// Most recent "Alarme" records
    pub async fn active_reachability_alarms(&self) -> Result<Vec<ReachabilityAlarmRecord>> {
        Ok(self
            .backend
            .list_reachability_alarms(
                Some(ACTIVE_REACHABILITY_ALARMS),
                Some(ReachabilityTransition::Alarm),
            )
            .await?)
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let latest = self.backend.latest_indicator_snapshot().await?;
        let since = self.clock.now() - Duration::hours(24);
        let history = self.backend.indicator_snapshots_since(since).await?;
        Ok(DashboardStats::new(latest, history))
    }

    pub async fn protocol_types(&self) -> Result<Vec<ProtocolType>> {
        Ok(self.backend.list_protocol_types().await?)
    }

    pub async fn upsert_protocol_type(&self, protocol_type: ProtocolType) -> Result<()> {
        Ok(self.backend.upsert_protocol_type(protocol_type).await?)
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.backend.list_devices().await?)
    }

    pub async fn add_device(&self, device: NewDevice) -> Result<Device> {
        if device.name.trim().is_empty() {
            anyhow::bail!("device name must not be empty");
        }
        let device = self.backend.insert_device(device).await?;
        info!(id = device.id, name = %device.name, "device added");
        Ok(device)
    }

    /// Storage status for a liveness endpoint
    pub async fn storage_health(&self) -> Result<HealthStatus> {
        let status = self.backend.health_check().await?;
        if !status.healthy {
            warn!(message = %status.message, "storage reported unhealthy");
        }
        Ok(status)
    }

    /// Stop both actors and close storage
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(poller) = self.poller.lock().await.take() {
            if let Err(e) = poller.shutdown().await {
                warn!("poller already stopped: {e:#}");
            }
        }
        if let Err(e) = self.reachability.shutdown().await {
            warn!("reachability actor already stopped: {e:#}");
        }

        self.backend.close().await?;
        info!("monitoring hub stopped");
        Ok(())
    }
}
