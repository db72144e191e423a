use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::points::MonitoredPoint;
use crate::storage::schema::AlarmRecord;
use crate::storage::{StorageBackend, StorageResult};

pub use crate::storage::schema::ThresholdKind;

/// Which threshold, if any, `value` breaches. MAX is checked last and wins.
pub fn classify(value: f64, min: Option<f64>, max: Option<f64>) -> Option<ThresholdKind> {
    if max.is_some_and(|max| value > max) {
        Some(ThresholdKind::Max)
    } else if min.is_some_and(|min| value < min) {
        Some(ThresholdKind::Min)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdEvaluation {
    /// Within bounds without an open alarm, or still breaching the same way
    Unchanged,
    Opens(ThresholdKind),
    /// Direct MIN ↔ MAX jump: the open alarm is closed and a new one opened
    Switches {
        from: ThresholdKind,
        to: ThresholdKind,
    },
    Resolves(ThresholdKind),
}

impl ThresholdEvaluation {
    pub fn decide(active: Option<ThresholdKind>, breach: Option<ThresholdKind>) -> Self {
        match (active, breach) {
            (None, None) => ThresholdEvaluation::Unchanged,
            (None, Some(kind)) => ThresholdEvaluation::Opens(kind),
            (Some(active), Some(breach)) if active == breach => ThresholdEvaluation::Unchanged,
            (Some(from), Some(to)) => ThresholdEvaluation::Switches { from, to },
            (Some(active), None) => ThresholdEvaluation::Resolves(active),
        }
    }
}

/// Alarm write performed by an evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmChange {
    Opened(AlarmRecord),
    Switched {
        from: ThresholdKind,
        opened: AlarmRecord,
    },
    Resolved(AlarmRecord),
}

/// Threshold state machine backed by the alarm table
///
/// The open/closed state lives in storage, not here, so it survives
/// restarts. Callers must not evaluate the same point concurrently; the
/// scheduler guarantees this by handling each point once per tick.
pub struct ThresholdEvaluator {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl ThresholdEvaluator {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    #[instrument(skip(self, point), fields(point_id = point.id))]
    pub async fn evaluate(
        &self,
        point: &MonitoredPoint,
        value: f64,
    ) -> StorageResult<Option<AlarmChange>> {
        if !point.has_thresholds() {
            return Ok(None);
        }

        let breach = classify(value, point.min, point.max);
        let active = self.backend.active_alarm(point.id).await?;
        let now = self.clock.now();

        let change = match ThresholdEvaluation::decide(active.map(|alarm| alarm.kind), breach) {
            ThresholdEvaluation::Unchanged => None,
            ThresholdEvaluation::Opens(kind) => self
                .backend
                .open_alarm(point.id, kind, value, now)
                .await?
                .map(AlarmChange::Opened),
            ThresholdEvaluation::Switches { from, to } => self
                .backend
                .open_alarm(point.id, to, value, now)
                .await?
                .map(|opened| AlarmChange::Switched { from, opened }),
            ThresholdEvaluation::Resolves(_) => self
                .backend
                .resolve_alarm(point.id, now)
                .await?
                .map(AlarmChange::Resolved),
        };

        match &change {
            Some(AlarmChange::Opened(alarm)) => {
                info!(point = %point.name, kind = %alarm.kind, value, "threshold alarm opened");
            }
            Some(AlarmChange::Switched { from, opened }) => {
                info!(point = %point.name, %from, to = %opened.kind, value, "threshold alarm switched");
            }
            Some(AlarmChange::Resolved(alarm)) => {
                info!(point = %point.name, kind = %alarm.kind, value, "threshold alarm resolved");
            }
            None => debug!(value, ?breach, "no alarm change"),
        }

        Ok(change)
    }
}
