//! Persisted records and query shapes
//!
//! Timestamps are `DateTime<Utc>` in memory and Unix milliseconds on disk.
//! State enums are stored as their upper-case labels (`ACTIVE`, `MIN`, `OK`)
//! so the tables stay readable from a plain SQLite shell.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::points::MonitoredPoint;
use crate::util::round_to;

/// One persisted reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub point_id: i64,

    /// Canonical text, `ON`/`OFF` for booleans
    pub value: String,

    pub timestamp: DateTime<Utc>,
}

/// Threshold crossed by an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThresholdKind {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmState {
    Active,
    Resolved,
}

/// Communication state of an inventory device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommState {
    Ok,
    Nok,
}

/// Connectivity change of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReachabilityTransition {
    /// OK → NOK
    #[serde(rename = "Alarme")]
    Alarm,
    /// NOK → OK
    #[serde(rename = "Retour à la normale")]
    BackToNormal,
}

macro_rules! labelled {
    ($ty:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($ty))),
                }
            }
        }
    };
}

labelled!(ThresholdKind { Min => "MIN", Max => "MAX" });
labelled!(AlarmState { Active => "ACTIVE", Resolved => "RESOLVED" });
labelled!(CommState { Ok => "OK", Nok => "NOK" });
labelled!(ReachabilityTransition {
    Alarm => "Alarme",
    BackToNormal => "Retour à la normale",
});

impl CommState {
    pub fn from_alive(alive: bool) -> Self {
        if alive { CommState::Ok } else { CommState::Nok }
    }
}

/// Threshold alarm episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub point_id: i64,
    pub kind: ThresholdKind,

    /// Value that opened the episode
    pub value: f64,

    pub state: AlarmState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Logged reachability transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityAlarmRecord {
    pub id: i64,
    pub device_name: String,
    pub address: String,
    pub location: Option<String>,
    pub label: ReachabilityTransition,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReachabilityAlarm {
    pub device_name: String,
    pub address: String,
    pub location: Option<String>,
    pub label: ReachabilityTransition,
    pub timestamp: DateTime<Utc>,
}

/// Fleet indicators computed after one reachability sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Share of probed devices that answered, percent
    pub comm_rate: f64,

    /// Mean round trip over responders, milliseconds
    pub avg_delay_ms: i64,

    /// Mean packet loss over all probed devices, percent
    pub avg_loss: f64,

    /// Transmit rate against the configured link capacity, percent, capped at 100
    pub bandwidth_util: f64,

    pub cpu_util: f64,
    pub timestamp: DateTime<Utc>,
}

/// Reachability inventory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub location: Option<String>,

    /// Unset until the first probe
    pub comm_state: Option<CommState>,

    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Window accepted by history queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRange {
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "all")]
    All,
}

/// Row cap for unbounded history queries
pub const HISTORY_ALL_LIMIT: usize = 2000;

labelled!(HistoryRange {
    FifteenMinutes => "15m",
    OneHour => "1h",
    EightHours => "8h",
    Day => "24h",
    All => "all",
});

impl HistoryRange {
    pub fn to_query(self, point_id: i64, now: DateTime<Utc>) -> HistoryQuery {
        let window = match self {
            HistoryRange::FifteenMinutes => Some(Duration::minutes(15)),
            HistoryRange::OneHour => Some(Duration::hours(1)),
            HistoryRange::EightHours => Some(Duration::hours(8)),
            HistoryRange::Day => Some(Duration::hours(24)),
            HistoryRange::All => None,
        };

        HistoryQuery {
            point_id,
            since: window.map(|window| now - window),
            limit: window.is_none().then_some(HISTORY_ALL_LIMIT),
        }
    }
}

/// History read, always ascending by time
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub point_id: i64,

    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,

    /// Keep the first `limit` rows
    pub limit: Option<usize>,
}

/// Point fields shown next to its alarms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSummary {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last_value: Option<String>,
}

impl From<&MonitoredPoint> for PointSummary {
    fn from(point: &MonitoredPoint) -> Self {
        Self {
            id: point.id,
            name: point.name.clone(),
            host: point.host.clone(),
            unit: point.unit.clone(),
            min: point.min,
            max: point.max,
            last_value: point.last_value.clone(),
        }
    }
}

/// All alarm episodes of one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmGroup {
    pub point: PointSummary,
    pub is_active: bool,
    pub active: Option<AlarmRecord>,

    /// Newest first
    pub history: Vec<AlarmRecord>,
}

/// Group alarms per point. Groups follow the start time of their newest
/// episode, with groups holding an active alarm moved to the front. Alarms of
/// points that no longer exist are dropped.
pub fn group_alarms(points: &[MonitoredPoint], mut alarms: Vec<AlarmRecord>) -> Vec<AlarmGroup> {
    alarms.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));

    let mut groups: Vec<AlarmGroup> = Vec::new();
    for alarm in alarms {
        let index = match groups.iter().position(|g| g.point.id == alarm.point_id) {
            Some(index) => index,
            None => {
                let Some(point) = points.iter().find(|p| p.id == alarm.point_id) else {
                    continue;
                };
                groups.push(AlarmGroup {
                    point: point.into(),
                    is_active: false,
                    active: None,
                    history: Vec::new(),
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[index];
        if alarm.state == AlarmState::Active {
            group.is_active = true;
            group.active = Some(alarm.clone());
        }
        group.history.push(alarm);
    }

    // stable: keeps recency order inside each class
    groups.sort_by_key(|group| !group.is_active);
    groups
}

/// Dashboard header figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub latest: Option<IndicatorSnapshot>,

    /// Last 24 hours, ascending
    pub history: Vec<IndicatorSnapshot>,

    /// Communication rate change over `history`, one decimal
    pub evolution: f64,
}

impl DashboardStats {
    pub fn new(latest: Option<IndicatorSnapshot>, history: Vec<IndicatorSnapshot>) -> Self {
        let evolution = match (history.first(), history.last()) {
            (Some(oldest), Some(newest)) => round_to(newest.comm_rate - oldest.comm_rate, 1),
            _ => 0.0,
        };

        Self {
            latest,
            history,
            evolution,
        }
    }
}
