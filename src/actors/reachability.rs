//! ReachabilityActor - Probes the device inventory and computes indicators
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → probe devices → swap OK/NOK → log transitions → indicators → MonitorEvent
//!     ↑
//!     └─── Commands (SweepNow, ProbeDevice, Shutdown)
//! ```
//!
//! Periodic sweeps and on-demand probes all run inside this one actor, so a
//! device's prior state is never read and swapped by two callers at once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures::{FutureExt, StreamExt, stream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::clock::Clock;
use crate::config::ReachabilityConfig;
use crate::monitors::indicators::{IndicatorAccumulator, SystemTelemetry};
use crate::monitors::reachability::{ProbeResult, Prober};
use crate::storage::schema::{CommState, Device, NewReachabilityAlarm, ReachabilityTransition};
use crate::storage::{StorageBackend, StorageResult};

use super::messages::{MonitorEvent, ReachabilityCommand, SweepReport};

/// Sweep and probe logic, independent of any timer
pub struct ReachabilitySweeper {
    backend: Arc<dyn StorageBackend>,
    prober: Arc<dyn Prober>,
    telemetry: Box<dyn SystemTelemetry>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MonitorEvent>,
    max_concurrent_probes: usize,
    max_bandwidth_bytes_per_sec: u64,
}

impl ReachabilitySweeper {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        prober: Arc<dyn Prober>,
        telemetry: Box<dyn SystemTelemetry>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<MonitorEvent>,
        config: &ReachabilityConfig,
    ) -> Self {
        Self {
            backend,
            prober,
            telemetry,
            clock,
            events,
            max_concurrent_probes: config.max_concurrent_probes.max(1),
            max_bandwidth_bytes_per_sec: config.max_bandwidth_bytes_per_sec,
        }
    }

    /// Probe every device with an address, then store one indicator snapshot
    #[instrument(skip(self))]
    pub async fn sweep(&mut self) -> StorageResult<SweepReport> {
        let devices: Vec<Device> = self
            .backend
            .list_devices()
            .await?
            .into_iter()
            .filter(|device| !device.address.trim().is_empty())
            .collect();

        let prober = &self.prober;
        let probes: Vec<(Device, ProbeResult)> = stream::iter(devices)
            .map(|device| async move {
                let result = prober.probe(&device.address).await;
                (device, result)
            })
            .buffer_unordered(self.max_concurrent_probes)
            .collect()
            .await;

        let mut accumulator = IndicatorAccumulator::new();
        let mut transitions = 0;
        for (device, probe) in &probes {
            accumulator.record(probe);
            if self.apply(device, &device.address, probe.comm_state()).await?.is_some() {
                transitions += 1;
            }
        }

        let usage = self.telemetry.sample();
        let snapshot = accumulator.finish(usage, self.max_bandwidth_bytes_per_sec, self.clock.now());
        self.backend.insert_indicator_snapshot(snapshot.clone()).await?;
        self.publish(MonitorEvent::Indicators(snapshot.clone()));

        info!(
            probed = accumulator.total(),
            alive = accumulator.alive(),
            transitions,
            "reachability sweep finished"
        );

        Ok(SweepReport {
            probed: accumulator.total(),
            alive: accumulator.alive(),
            transitions,
            snapshot,
        })
    }

    /// Probe one device at `address` and apply the same transition rules as
    /// a sweep. Indicators are left untouched.
    #[instrument(skip(self))]
    pub async fn probe_device(&mut self, device_id: i64, address: &str) -> Result<CommState> {
        if address.trim().is_empty() {
            bail!("device {device_id} has no address to probe");
        }

        let device = self
            .backend
            .get_device(device_id)
            .await?
            .ok_or_else(|| anyhow!("device {device_id} does not exist"))?;

        let state = self.prober.probe(address).await.comm_state();
        self.apply(&device, address, state).await?;
        Ok(state)
    }

    /// Swap the stored state and log a transition if there is one
    #[instrument(skip(self, device), fields(device_id = device.id))]
    async fn apply(
        &self,
        device: &Device,
        address: &str,
        state: CommState,
    ) -> StorageResult<Option<ReachabilityTransition>> {
        let now = self.clock.now();
        let Some(prior) = self.backend.swap_comm_state(device.id, state, now).await? else {
            debug!("device deleted while probing");
            return Ok(None);
        };

        let transition = ReachabilityTransition::between(prior, state);
        if let Some(label) = transition {
            self.backend
                .insert_reachability_alarm(NewReachabilityAlarm {
                    device_name: device.name.clone(),
                    address: address.to_string(),
                    location: device.location.clone(),
                    label,
                    timestamp: now,
                })
                .await?;
            info!(device = %device.name, %label, "reachability changed");
        } else {
            trace!(?prior, %state, "no reachability change");
        }

        self.publish(MonitorEvent::Reachability {
            device_id: device.id,
            state,
            transition,
        });
        Ok(transition)
    }

    fn publish(&self, event: MonitorEvent) {
        if let Ok(receivers) = self.events.send(event) {
            trace!("published event to {receivers} receivers");
        }
    }
}

/// Actor running sweeps on a timer and serving on-demand probes
pub struct ReachabilityActor {
    sweeper: ReachabilitySweeper,
    command_rx: mpsc::Receiver<ReachabilityCommand>,
    interval: Duration,
}

impl ReachabilityActor {
    pub fn new(
        sweeper: ReachabilitySweeper,
        command_rx: mpsc::Receiver<ReachabilityCommand>,
        interval: Duration,
    ) -> Self {
        Self {
            sweeper,
            command_rx,
            interval,
        }
    }

    /// The first periodic sweep happens one interval after start
    #[instrument(skip(self), fields(interval = ?self.interval))]
    pub async fn run(mut self) {
        debug!("starting reachability actor");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_sweep().await {
                        error!("reachability sweep failed: {e:#}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ReachabilityCommand::SweepNow { respond_to } => {
                            debug!("received SweepNow command");
                            let result = self.run_sweep().await;
                            match respond_to {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => {
                                    if let Err(e) = result {
                                        error!("reachability sweep failed: {e:#}");
                                    }
                                }
                            }
                        }

                        ReachabilityCommand::ProbeDevice { device_id, address, respond_to } => {
                            debug!(device_id, "received ProbeDevice command");
                            let result = self.sweeper.probe_device(device_id, &address).await;
                            let _ = respond_to.send(result);
                        }

                        ReachabilityCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("reachability actor stopped");
    }

    async fn run_sweep(&mut self) -> Result<SweepReport> {
        match AssertUnwindSafe(self.sweeper.sweep()).catch_unwind().await {
            Ok(result) => result.context("sweep aborted by storage failure"),
            Err(_) => Err(anyhow!("reachability sweep panicked")),
        }
    }
}

/// Handle for controlling a ReachabilityActor
#[derive(Clone)]
pub struct ReachabilityHandle {
    sender: mpsc::Sender<ReachabilityCommand>,
}

impl ReachabilityHandle {
    pub fn spawn(sweeper: ReachabilitySweeper, interval: Duration) -> Self {
        // a small queue coalesces bursts of manual sweep triggers
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = ReachabilityActor::new(sweeper, cmd_rx, interval);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Queue a sweep and return at once. A full queue already holds
    /// pending sweeps, so the trigger is dropped.
    pub fn trigger_sweep(&self) -> Result<()> {
        match self
            .sender
            .try_send(ReachabilityCommand::SweepNow { respond_to: None })
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("sweep queue full, trigger coalesced");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("reachability actor is not running")),
        }
    }

    /// Run a sweep and wait for its report
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReachabilityCommand::SweepNow {
                respond_to: Some(tx),
            })
            .await
            .context("failed to send SweepNow command")?;

        rx.await.context("failed to receive sweep report")?
    }

    pub async fn probe_device(&self, device_id: i64, address: impl Into<String>) -> Result<CommState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReachabilityCommand::ProbeDevice {
                device_id,
                address: address.into(),
                respond_to: tx,
            })
            .await
            .context("failed to send ProbeDevice command")?;

        rx.await.context("failed to receive probe result")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ReachabilityCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
