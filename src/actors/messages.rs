//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to any number of subscribers
//! 3. **Immutability**: Events are cloneable for multi-subscriber patterns

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::monitors::threshold::AlarmChange;
use crate::storage::schema::{CommState, IndicatorSnapshot, ReachabilityTransition};

/// Event published by the poller and the reachability actor
///
/// Slow subscribers may lag and lose events; storage remains the source of
/// truth.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A canonical value was stored for a point
    Reading {
        point_id: i64,
        value: String,
        at: DateTime<Utc>,
    },

    /// A threshold alarm was opened, switched or resolved
    ThresholdAlarm { point_id: i64, change: AlarmChange },

    /// A device was probed. `transition` is set only when a record was logged.
    Reachability {
        device_id: i64,
        state: CommState,
        transition: Option<ReachabilityTransition>,
    },

    /// A sweep finished and its indicators were stored
    Indicators(IndicatorSnapshot),
}

/// Commands that can be sent to the PollSchedulerActor
#[derive(Debug)]
pub enum PollerCommand {
    /// Run one tick immediately, outside the timer
    TickNow {
        respond_to: oneshot::Sender<TickReport>,
    },

    /// Gracefully shut down the scheduler
    ///
    /// A tick in progress runs to completion first.
    Shutdown,
}

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Points due at the start of the tick
    pub due: usize,

    /// Points read, normalized and stored
    pub polled: usize,

    /// Points whose read or normalization failed
    pub failed: usize,

    /// Readings dropped because the point was deleted mid-poll
    pub discarded: usize,

    /// Due points left unprocessed because storage failed
    pub abandoned: usize,
}

/// Commands that can be sent to the ReachabilityActor
#[derive(Debug)]
pub enum ReachabilityCommand {
    /// Sweep the whole inventory now
    SweepNow {
        /// `None` for fire-and-forget triggers
        respond_to: Option<oneshot::Sender<anyhow::Result<SweepReport>>>,
    },

    /// Probe one device and apply its transition
    ProbeDevice {
        device_id: i64,
        address: String,
        respond_to: oneshot::Sender<anyhow::Result<CommState>>,
    },

    Shutdown,
}

/// Outcome of one full sweep
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub probed: usize,
    pub alive: usize,

    /// Reachability records written during the sweep
    pub transitions: usize,

    pub snapshot: IndicatorSnapshot,
}
