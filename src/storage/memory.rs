//! In-memory storage backend (no persistence)
//!
//! Used when storage is configured as `none` and throughout the tests. All
//! state sits behind one `RwLock`, so every compound write is atomic.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Linear scans**: Fine for tests and small plants only

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AlarmRecord, AlarmState, CommState, Device, HistoryEntry, HistoryQuery, IndicatorSnapshot,
    NewDevice, NewReachabilityAlarm, ReachabilityAlarmRecord, ReachabilityTransition,
    ThresholdKind,
};
use crate::points::{MonitoredPoint, PointRegistration, ProtocolType};

#[derive(Default)]
struct State {
    protocol_types: BTreeMap<String, ProtocolType>,
    points: BTreeMap<i64, MonitoredPoint>,
    history: Vec<HistoryEntry>,
    alarms: Vec<AlarmRecord>,
    devices: BTreeMap<i64, Device>,
    reachability_alarms: Vec<ReachabilityAlarmRecord>,
    indicators: Vec<IndicatorSnapshot>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    /// Attach catalogue metadata the way a join would
    fn resolve(&self, point: &MonitoredPoint) -> MonitoredPoint {
        let mut point = point.clone();
        let entry = self.protocol_types.get(&point.type_code);
        point.type_display_name = entry.map(|entry| entry.display_name.clone());
        point.bacnet_object_type = entry.and_then(|entry| entry.bacnet_object_type);
        point
    }

    fn active_alarm_mut(&mut self, point_id: i64) -> Option<&mut AlarmRecord> {
        self.alarms
            .iter_mut()
            .find(|alarm| alarm.point_id == point_id && alarm.state == AlarmState::Active)
    }
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StorageError::Unavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "in-memory backend switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_protocol_types(&self) -> StorageResult<Vec<ProtocolType>> {
        self.check()?;
        Ok(self.state.read().await.protocol_types.values().cloned().collect())
    }

    async fn upsert_protocol_type(&self, protocol_type: ProtocolType) -> StorageResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        state
            .protocol_types
            .insert(protocol_type.code.clone(), protocol_type);
        Ok(())
    }

    async fn list_points(&self) -> StorageResult<Vec<MonitoredPoint>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state.points.values().map(|p| state.resolve(p)).collect())
    }

    async fn get_point(&self, id: i64) -> StorageResult<Option<MonitoredPoint>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state.points.get(&id).map(|p| state.resolve(p)))
    }

    async fn insert_point(&self, point: PointRegistration) -> StorageResult<MonitoredPoint> {
        self.check()?;
        let mut state = self.state.write().await;
        let id = state.next_id();

        let stored = MonitoredPoint {
            id,
            name: point.name,
            protocol: point.protocol,
            host: point.host,
            device_id: point.device_id,
            address: point.address,
            type_code: point.type_code,
            data_type: point.data_type,
            type_display_name: None,
            bacnet_object_type: None,
            interval_ms: point.interval_ms,
            unit: point.unit,
            min: point.min,
            max: point.max,
            created_by: point.created_by,
            last_value: None,
            last_update: None,
        };
        let resolved = state.resolve(&stored);
        state.points.insert(id, stored);

        debug!(id, "point registered in memory");
        Ok(resolved)
    }

    async fn delete_point(&self, id: i64) -> StorageResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        let existed = state.points.remove(&id).is_some();
        state.history.retain(|entry| entry.point_id != id);
        state.alarms.retain(|alarm| alarm.point_id != id);
        Ok(existed)
    }

    async fn record_reading(
        &self,
        point_id: i64,
        value: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;

        let Some(point) = state.points.get_mut(&point_id) else {
            return Ok(false);
        };
        point.last_value = Some(value.to_string());
        point.last_update = Some(at);

        state.history.push(HistoryEntry {
            point_id,
            value: value.to_string(),
            timestamp: at,
        });
        Ok(true)
    }

    async fn query_history(&self, query: HistoryQuery) -> StorageResult<Vec<HistoryEntry>> {
        self.check()?;
        let state = self.state.read().await;

        let mut entries: Vec<HistoryEntry> = state
            .history
            .iter()
            .filter(|entry| entry.point_id == query.point_id)
            .filter(|entry| query.since.is_none_or(|since| entry.timestamp >= since))
            .cloned()
            .collect();
        // stable: insertion order breaks ties
        entries.sort_by_key(|entry| entry.timestamp);
        entries.truncate(query.limit.unwrap_or(usize::MAX));
        Ok(entries)
    }

    async fn active_alarm(&self, point_id: i64) -> StorageResult<Option<AlarmRecord>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .alarms
            .iter()
            .find(|alarm| alarm.point_id == point_id && alarm.state == AlarmState::Active)
            .cloned())
    }

    async fn open_alarm(
        &self,
        point_id: i64,
        kind: ThresholdKind,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<AlarmRecord>> {
        self.check()?;
        let mut state = self.state.write().await;
        if !state.points.contains_key(&point_id) {
            return Ok(None);
        }

        if let Some(active) = state.active_alarm_mut(point_id) {
            active.state = AlarmState::Resolved;
            active.ended_at = Some(at);
        }

        let alarm = AlarmRecord {
            id: state.next_id(),
            point_id,
            kind,
            value,
            state: AlarmState::Active,
            started_at: at,
            ended_at: None,
        };
        state.alarms.push(alarm.clone());
        Ok(Some(alarm))
    }

    async fn resolve_alarm(
        &self,
        point_id: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<AlarmRecord>> {
        self.check()?;
        let mut state = self.state.write().await;
        Ok(state.active_alarm_mut(point_id).map(|active| {
            active.state = AlarmState::Resolved;
            active.ended_at = Some(at);
            active.clone()
        }))
    }

    async fn list_alarms(&self) -> StorageResult<Vec<AlarmRecord>> {
        self.check()?;
        let mut alarms = self.state.read().await.alarms.clone();
        alarms.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(alarms)
    }

    async fn list_devices(&self) -> StorageResult<Vec<Device>> {
        self.check()?;
        Ok(self.state.read().await.devices.values().cloned().collect())
    }

    async fn get_device(&self, id: i64) -> StorageResult<Option<Device>> {
        self.check()?;
        Ok(self.state.read().await.devices.get(&id).cloned())
    }

    async fn insert_device(&self, device: NewDevice) -> StorageResult<Device> {
        self.check()?;
        let mut state = self.state.write().await;
        let device = Device {
            id: state.next_id(),
            name: device.name,
            address: device.address.trim().to_string(),
            location: device.location,
            comm_state: None,
            last_update: None,
        };
        state.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn swap_comm_state(
        &self,
        device_id: i64,
        new_state: CommState,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<Option<CommState>>> {
        self.check()?;
        let mut state = self.state.write().await;
        Ok(state.devices.get_mut(&device_id).map(|device| {
            device.last_update = Some(at);
            device.comm_state.replace(new_state)
        }))
    }

    async fn insert_reachability_alarm(
        &self,
        alarm: NewReachabilityAlarm,
    ) -> StorageResult<ReachabilityAlarmRecord> {
        self.check()?;
        let mut state = self.state.write().await;
        let record = ReachabilityAlarmRecord {
            id: state.next_id(),
            device_name: alarm.device_name,
            address: alarm.address,
            location: alarm.location,
            label: alarm.label,
            timestamp: alarm.timestamp,
        };
        state.reachability_alarms.push(record.clone());
        Ok(record)
    }

    async fn list_reachability_alarms(
        &self,
        limit: Option<usize>,
        label: Option<ReachabilityTransition>,
    ) -> StorageResult<Vec<ReachabilityAlarmRecord>> {
        self.check()?;
        let state = self.state.read().await;
        let mut alarms: Vec<ReachabilityAlarmRecord> = state
            .reachability_alarms
            .iter()
            .filter(|alarm| label.is_none_or(|label| alarm.label == label))
            .cloned()
            .collect();
        alarms.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        alarms.truncate(limit.unwrap_or(usize::MAX));
        Ok(alarms)
    }

    async fn insert_indicator_snapshot(&self, snapshot: IndicatorSnapshot) -> StorageResult<()> {
        self.check()?;
        self.state.write().await.indicators.push(snapshot);
        Ok(())
    }

    async fn latest_indicator_snapshot(&self) -> StorageResult<Option<IndicatorSnapshot>> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .indicators
            .iter()
            .max_by_key(|snapshot| snapshot.timestamp)
            .cloned())
    }

    async fn indicator_snapshots_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<IndicatorSnapshot>> {
        self.check()?;
        let mut snapshots: Vec<IndicatorSnapshot> = self
            .state
            .read()
            .await
            .indicators
            .iter()
            .filter(|snapshot| snapshot.timestamp >= since)
            .cloned()
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.timestamp);
        Ok(snapshots)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let state = self.state.read().await;
        let healthy = !self.unavailable.load(Ordering::SeqCst);

        Ok(HealthStatus {
            healthy,
            message: if healthy {
                "In-memory storage operational".to_string()
            } else {
                "In-memory storage switched off".to_string()
            },
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("points".to_string(), state.points.len().to_string()),
                ("history".to_string(), state.history.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
