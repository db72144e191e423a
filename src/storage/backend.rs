//! Storage backend trait definition
//!
//! The engine consumes inventory, history, alarm and indicator storage only
//! through [`StorageBackend`]. Every read-modify-write the engine relies on
//! for correctness is a single trait call, so each backend can make it
//! atomic in its own way (a transaction for SQLite, one write lock for the
//! in-memory backend).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::{
    AlarmRecord, CommState, Device, HistoryEntry, HistoryQuery, IndicatorSnapshot, NewDevice,
    NewReachabilityAlarm, ReachabilityAlarmRecord, ReachabilityTransition, ThresholdKind,
};
use crate::points::{MonitoredPoint, PointRegistration, ProtocolType};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ------------------------------------------------------------------
    // Protocol type catalogue
    // ------------------------------------------------------------------

    async fn list_protocol_types(&self) -> StorageResult<Vec<ProtocolType>>;

    /// Insert or replace the entry with the same code
    async fn upsert_protocol_type(&self, protocol_type: ProtocolType) -> StorageResult<()>;

    // ------------------------------------------------------------------
    // Points
    // ------------------------------------------------------------------

    /// All points with catalogue metadata resolved, ordered by id
    async fn list_points(&self) -> StorageResult<Vec<MonitoredPoint>>;

    async fn get_point(&self, id: i64) -> StorageResult<Option<MonitoredPoint>>;

    /// Store a validated registration and return it with its id
    async fn insert_point(&self, point: PointRegistration) -> StorageResult<MonitoredPoint>;

    /// Delete a point with its history and alarms. Returns whether it existed.
    async fn delete_point(&self, id: i64) -> StorageResult<bool>;

    /// Update the point's last value and append a history entry, atomically.
    ///
    /// Returns `false` without writing anything when the point no longer
    /// exists.
    async fn record_reading(&self, point_id: i64, value: &str, at: DateTime<Utc>)
    -> StorageResult<bool>;

    /// Readings of one point, ascending by time
    async fn query_history(&self, query: HistoryQuery) -> StorageResult<Vec<HistoryEntry>>;

    // ------------------------------------------------------------------
    // Threshold alarms
    // ------------------------------------------------------------------

    async fn active_alarm(&self, point_id: i64) -> StorageResult<Option<AlarmRecord>>;

    /// Resolve the point's active alarm (if any) and open a new one, as one
    /// atomic write.
    ///
    /// Returns `None` when the point no longer exists.
    async fn open_alarm(
        &self,
        point_id: i64,
        kind: ThresholdKind,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<AlarmRecord>>;

    /// Resolve the point's active alarm. Returns the closed record, if any.
    async fn resolve_alarm(&self, point_id: i64, at: DateTime<Utc>)
    -> StorageResult<Option<AlarmRecord>>;

    /// Every alarm, newest first
    async fn list_alarms(&self) -> StorageResult<Vec<AlarmRecord>>;

    // ------------------------------------------------------------------
    // Reachability inventory
    // ------------------------------------------------------------------

    async fn list_devices(&self) -> StorageResult<Vec<Device>>;

    async fn get_device(&self, id: i64) -> StorageResult<Option<Device>>;

    async fn insert_device(&self, device: NewDevice) -> StorageResult<Device>;

    /// Store a device's new communication state and return the prior one.
    ///
    /// `None` when the device does not exist, `Some(None)` when it had no
    /// state yet.
    async fn swap_comm_state(
        &self,
        device_id: i64,
        state: CommState,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<Option<CommState>>>;

    async fn insert_reachability_alarm(
        &self,
        alarm: NewReachabilityAlarm,
    ) -> StorageResult<ReachabilityAlarmRecord>;

    /// Newest first, optionally filtered by label
    async fn list_reachability_alarms(
        &self,
        limit: Option<usize>,
        label: Option<ReachabilityTransition>,
    ) -> StorageResult<Vec<ReachabilityAlarmRecord>>;

    // ------------------------------------------------------------------
    // Indicators
    // ------------------------------------------------------------------

    async fn insert_indicator_snapshot(&self, snapshot: IndicatorSnapshot) -> StorageResult<()>;

    async fn latest_indicator_snapshot(&self) -> StorageResult<Option<IndicatorSnapshot>>;

    /// Snapshots at or after `since`, ascending
    async fn indicator_snapshots_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<IndicatorSnapshot>>;

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Performs a lightweight operation to verify the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
