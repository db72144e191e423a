//! PollSchedulerActor - Reads due points on a fixed tick
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → load points → due set → read → normalize → evaluate → store → MonitorEvent
//!     ↑
//!     └─── Commands (TickNow, Shutdown)
//! ```
//!
//! Ticks never overlap: the actor awaits the whole due set before it looks
//! at the timer or its commands again, and missed timer ticks are skipped.
//! Within a tick, reads for different points run concurrently up to
//! `max_concurrent_reads`; each point appears at most once per tick.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{FutureExt, StreamExt, stream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, instrument, trace, warn};

use crate::clock::Clock;
use crate::monitors::threshold::ThresholdEvaluator;
use crate::normalize::{NormalizeError, normalize};
use crate::points::MonitoredPoint;
use crate::protocols::{ProtocolReaders, ReadError};
use crate::storage::{StorageBackend, StorageError};

use super::messages::{MonitorEvent, PollerCommand, TickReport};

/// Why a point produced no stored reading
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Isolated to the point, retried when it is next due
    #[error("read failed: {0}")]
    Read(#[from] ReadError),

    /// Isolated to the point, retried when it is next due
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    /// Abandons the rest of the tick
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

enum PointOutcome {
    Stored,
    Discarded,
}

/// One pass over the due points, independent of any timer
pub struct PollEngine {
    backend: Arc<dyn StorageBackend>,
    readers: ProtocolReaders,
    evaluator: ThresholdEvaluator,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MonitorEvent>,
    max_concurrent_reads: usize,
}

impl PollEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        readers: ProtocolReaders,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<MonitorEvent>,
        max_concurrent_reads: usize,
    ) -> Self {
        Self {
            evaluator: ThresholdEvaluator::new(backend.clone(), clock.clone()),
            backend,
            readers,
            clock,
            events,
            max_concurrent_reads: max_concurrent_reads.max(1),
        }
    }

    /// Poll every due point once. Storage failures end the tick early and
    /// the remaining points wait for the next one.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let points = match self.backend.list_points().await {
            Ok(points) => points,
            Err(e) => {
                warn!("cannot load points, waiting for next tick: {e}");
                return TickReport::default();
            }
        };

        let now = self.clock.now();
        let due: Vec<MonitoredPoint> = points.into_iter().filter(|p| p.is_due(now)).collect();

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return report;
        }

        let reads: Vec<_> = due.iter().map(|point| self.poll_point(point).boxed()).collect();
        let mut results = stream::iter(reads).buffer_unordered(self.max_concurrent_reads);

        while let Some(result) = results.next().await {
            match result {
                Ok(PointOutcome::Stored) => report.polled += 1,
                Ok(PointOutcome::Discarded) => report.discarded += 1,
                Err(PollError::Storage(e)) => {
                    error!("storage failure, abandoning the rest of this tick: {e}");
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    debug!("{e}");
                }
            }
        }

        report.abandoned = report.due - report.polled - report.failed - report.discarded;
        report
    }

    #[instrument(skip(self, point), fields(point_id = point.id, host = %point.host))]
    async fn poll_point(&self, point: &MonitoredPoint) -> Result<PointOutcome, PollError> {
        let raw = self.readers.read(point).await?;
        let value = normalize(&raw, point.data_type)?;
        let at = self.clock.now();

        if let Some(numeric) = value.numeric {
            if let Some(change) = self.evaluator.evaluate(point, numeric).await? {
                self.publish(MonitorEvent::ThresholdAlarm {
                    point_id: point.id,
                    change,
                });
            }
        }

        if !self.backend.record_reading(point.id, &value.text, at).await? {
            debug!("point deleted while polling, reading discarded");
            return Ok(PointOutcome::Discarded);
        }

        trace!(value = %value.text, "reading stored");
        self.publish(MonitorEvent::Reading {
            point_id: point.id,
            value: value.text,
            at,
        });
        Ok(PointOutcome::Stored)
    }

    fn publish(&self, event: MonitorEvent) {
        // No subscribers is fine
        if let Ok(receivers) = self.events.send(event) {
            trace!("published event to {receivers} receivers");
        }
    }
}

/// Actor driving a [`PollEngine`] from a periodic timer
pub struct PollSchedulerActor {
    engine: PollEngine,
    command_rx: mpsc::Receiver<PollerCommand>,
    tick: Duration,
}

impl PollSchedulerActor {
    pub fn new(engine: PollEngine, command_rx: mpsc::Receiver<PollerCommand>, tick: Duration) -> Self {
        Self {
            engine,
            command_rx,
            tick,
        }
    }

    /// The first timer tick happens one period after start
    #[instrument(skip(self), fields(tick = ?self.tick))]
    pub async fn run(mut self) {
        debug!("starting poll scheduler");

        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        PollerCommand::TickNow { respond_to } => {
                            debug!("received TickNow command");
                            let report = self.run_tick().await;
                            let _ = respond_to.send(report);
                        }

                        PollerCommand::Shutdown => {
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

        debug!("poll scheduler stopped");
    }

    /// A panicking tick is logged and the timer keeps running
    async fn run_tick(&self) -> TickReport {
        match AssertUnwindSafe(self.engine.tick()).catch_unwind().await {
            Ok(report) => {
                if report.due > 0 {
                    debug!(?report, "tick finished");
                }
                report
            }
            Err(_) => {
                error!("poll tick panicked");
                TickReport::default()
            }
        }
    }
}

/// Handle for controlling a PollSchedulerActor
#[derive(Clone)]
pub struct PollerHandle {
    sender: mpsc::Sender<PollerCommand>,
}

impl PollerHandle {
    pub fn spawn(engine: PollEngine, tick: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = PollSchedulerActor::new(engine, cmd_rx, tick);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run one tick now and wait for its report
    pub async fn tick_now(&self) -> Result<TickReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::TickNow { respond_to: tx })
            .await
            .context("failed to send TickNow command")?;

        rx.await.context("failed to receive tick report")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PollerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    /// False once the actor has exited
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
