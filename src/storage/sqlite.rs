//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the poller's writes
//! - **Migrations**: Schema versioning with `sqlx::migrate!`
//! - **Foreign keys**: Deleting a point cascades to its history and alarms
//!
//! ## Atomic operations
//!
//! Compound writes (`record_reading`, `open_alarm`, `swap_comm_state`) run in
//! one transaction whose first statement is a write, so the write lock is
//! taken before anything is read and two callers cannot interleave.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AlarmRecord, AlarmState, CommState, Device, HistoryEntry, HistoryQuery, IndicatorSnapshot,
    NewDevice, NewReachabilityAlarm, ReachabilityAlarmRecord, ReachabilityTransition,
    ThresholdKind,
};
use crate::points::{DataType, MonitoredPoint, PointRegistration, Protocol, ProtocolType};

const POINT_COLUMNS: &str = r#"
    mp.id, mp.name, mp.protocol, mp.host, mp.device_id, mp.address, mp.type_code,
    mp.interval_ms, mp.unit, mp.min_threshold, mp.max_threshold, mp.created_by,
    mp.last_value, mp.last_update,
    pt.display_name AS type_display_name, pt.bacnet_object_type
"#;

const ALARM_COLUMNS: &str = "id, point_id, kind, value, state, started_at, ended_at";

const INDICATOR_COLUMNS: &str =
    "comm_rate, avg_delay_ms, avg_loss, bandwidth_util, cpu_util, timestamp";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn limit(limit: Option<usize>) -> i64 {
        // SQLite treats a negative LIMIT as unbounded
        limit.map(|l| l as i64).unwrap_or(-1)
    }

    async fn fetch_alarm(&self, id: i64) -> StorageResult<Option<AlarmRecord>> {
        let sql = format!("SELECT {ALARM_COLUMNS} FROM monitored_alarms WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_alarm)
            .transpose()
    }
}

fn corrupted(field: &str, value: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupted(format!("{field}: {value}"))
}

fn to_u32(value: i64, field: &str) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| corrupted(field, value))
}

fn parse_label<T: std::str::FromStr<Err = String>>(row: &SqliteRow, field: &str) -> StorageResult<T> {
    let raw: String = row.try_get(field)?;
    raw.parse::<T>().map_err(|e| corrupted(field, e))
}

fn row_to_point(row: &SqliteRow) -> StorageResult<MonitoredPoint> {
    let protocol: String = row.try_get("protocol")?;
    let type_code: String = row.try_get("type_code")?;
    let interval_ms: i64 = row.try_get("interval_ms")?;

    Ok(MonitoredPoint {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        protocol: protocol
            .parse::<Protocol>()
            .map_err(|_| corrupted("protocol", &protocol))?,
        host: row.try_get("host")?,
        device_id: to_u32(row.try_get("device_id")?, "device_id")?,
        address: to_u32(row.try_get("address")?, "address")?,
        data_type: DataType::from_type_code(&type_code),
        type_code,
        type_display_name: row.try_get("type_display_name")?,
        bacnet_object_type: row
            .try_get::<Option<i64>, _>("bacnet_object_type")?
            .map(|value| to_u32(value, "bacnet_object_type"))
            .transpose()?,
        interval_ms: u64::try_from(interval_ms).map_err(|_| corrupted("interval_ms", interval_ms))?,
        unit: row.try_get("unit")?,
        min: row.try_get("min_threshold")?,
        max: row.try_get("max_threshold")?,
        created_by: row.try_get("created_by")?,
        last_value: row.try_get("last_value")?,
        last_update: row
            .try_get::<Option<i64>, _>("last_update")?
            .map(SqliteBackend::millis_to_timestamp),
    })
}

fn row_to_alarm(row: &SqliteRow) -> StorageResult<AlarmRecord> {
    Ok(AlarmRecord {
        id: row.try_get("id")?,
        point_id: row.try_get("point_id")?,
        kind: parse_label::<ThresholdKind>(row, "kind")?,
        value: row.try_get("value")?,
        state: parse_label::<AlarmState>(row, "state")?,
        started_at: SqliteBackend::millis_to_timestamp(row.try_get("started_at")?),
        ended_at: row
            .try_get::<Option<i64>, _>("ended_at")?
            .map(SqliteBackend::millis_to_timestamp),
    })
}

fn row_to_device(row: &SqliteRow) -> StorageResult<Device> {
    Ok(Device {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        location: row.try_get("location")?,
        comm_state: row
            .try_get::<Option<String>, _>("comm_state")?
            .map(|state| state.parse::<CommState>().map_err(|e| corrupted("comm_state", e)))
            .transpose()?,
        last_update: row
            .try_get::<Option<i64>, _>("last_update")?
            .map(SqliteBackend::millis_to_timestamp),
    })
}

fn row_to_reachability_alarm(row: &SqliteRow) -> StorageResult<ReachabilityAlarmRecord> {
    Ok(ReachabilityAlarmRecord {
        id: row.try_get("id")?,
        device_name: row.try_get("device_name")?,
        address: row.try_get("address")?,
        location: row.try_get("location")?,
        label: parse_label::<ReachabilityTransition>(row, "label")?,
        timestamp: SqliteBackend::millis_to_timestamp(row.try_get("timestamp")?),
    })
}

fn row_to_indicator(row: &SqliteRow) -> StorageResult<IndicatorSnapshot> {
    Ok(IndicatorSnapshot {
        comm_rate: row.try_get("comm_rate")?,
        avg_delay_ms: row.try_get("avg_delay_ms")?,
        avg_loss: row.try_get("avg_loss")?,
        bandwidth_util: row.try_get("bandwidth_util")?,
        cpu_util: row.try_get("cpu_util")?,
        timestamp: SqliteBackend::millis_to_timestamp(row.try_get("timestamp")?),
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self))]
    async fn list_protocol_types(&self) -> StorageResult<Vec<ProtocolType>> {
        let rows = sqlx::query(
            r#"
            SELECT code, display_name, protocol, register_count, bacnet_object_type
            FROM protocol_types
            ORDER BY code ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let protocol: String = row.try_get("protocol")?;
                let register_count: i64 = row.try_get("register_count")?;
                Ok(ProtocolType {
                    code: row.try_get("code")?,
                    display_name: row.try_get("display_name")?,
                    protocol: protocol
                        .parse::<Protocol>()
                        .map_err(|_| corrupted("protocol", &protocol))?,
                    register_count: u16::try_from(register_count)
                        .map_err(|_| corrupted("register_count", register_count))?,
                    bacnet_object_type: row
                        .try_get::<Option<i64>, _>("bacnet_object_type")?
                        .map(|value| to_u32(value, "bacnet_object_type"))
                        .transpose()?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(code = %protocol_type.code))]
    async fn upsert_protocol_type(&self, protocol_type: ProtocolType) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO protocol_types (code, display_name, protocol, register_count, bacnet_object_type)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (code) DO UPDATE SET
                display_name = excluded.display_name,
                protocol = excluded.protocol,
                register_count = excluded.register_count,
                bacnet_object_type = excluded.bacnet_object_type
            "#,
        )
        .bind(&protocol_type.code)
        .bind(&protocol_type.display_name)
        .bind(protocol_type.protocol.as_str())
        .bind(protocol_type.register_count as i64)
        .bind(protocol_type.bacnet_object_type.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_points(&self) -> StorageResult<Vec<MonitoredPoint>> {
        let sql = format!(
            r#"
            SELECT {POINT_COLUMNS}
            FROM monitored_points mp
            LEFT JOIN protocol_types pt ON pt.code = mp.type_code
            ORDER BY mp.id ASC
            "#
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_point).collect()
    }

    #[instrument(skip(self))]
    async fn get_point(&self, id: i64) -> StorageResult<Option<MonitoredPoint>> {
        let sql = format!(
            r#"
            SELECT {POINT_COLUMNS}
            FROM monitored_points mp
            LEFT JOIN protocol_types pt ON pt.code = mp.type_code
            WHERE mp.id = ?
            "#
        );

        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_point)
            .transpose()
    }

    #[instrument(skip(self, point), fields(name = %point.name))]
    async fn insert_point(&self, point: PointRegistration) -> StorageResult<MonitoredPoint> {
        let result = sqlx::query(
            r#"
            INSERT INTO monitored_points (
                name, protocol, host, device_id, address, type_code,
                interval_ms, unit, min_threshold, max_threshold, created_by
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&point.name)
        .bind(point.protocol.as_str())
        .bind(&point.host)
        .bind(point.device_id as i64)
        .bind(point.address as i64)
        .bind(&point.type_code)
        .bind(point.interval_ms as i64)
        .bind(&point.unit)
        .bind(point.min)
        .bind(point.max)
        .bind(&point.created_by)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, "point registered");

        self.get_point(id)
            .await?
            .ok_or_else(|| StorageError::QueryFailed(format!("point {id} vanished after insert")))
    }

    #[instrument(skip(self))]
    async fn delete_point(&self, id: i64) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM monitored_points WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, value))]
    async fn record_reading(
        &self,
        point_id: i64,
        value: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let at = Self::timestamp_to_millis(&at);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE monitored_points SET last_value = ?, last_update = ? WHERE id = ?",
        )
        .bind(value)
        .bind(at)
        .bind(point_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("INSERT INTO points_history (point_id, value, timestamp) VALUES (?, ?, ?)")
            .bind(point_id)
            .bind(value)
            .bind(at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self), fields(point_id = query.point_id))]
    async fn query_history(&self, query: HistoryQuery) -> StorageResult<Vec<HistoryEntry>> {
        let since = query
            .since
            .as_ref()
            .map(Self::timestamp_to_millis)
            .unwrap_or(i64::MIN);

        let rows = sqlx::query(
            r#"
            SELECT point_id, value, timestamp
            FROM points_history
            WHERE point_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(query.point_id)
        .bind(since)
        .bind(Self::limit(query.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HistoryEntry {
                    point_id: row.try_get("point_id")?,
                    value: row.try_get("value")?,
                    timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn active_alarm(&self, point_id: i64) -> StorageResult<Option<AlarmRecord>> {
        let sql = format!(
            "SELECT {ALARM_COLUMNS} FROM monitored_alarms WHERE point_id = ? AND state = 'ACTIVE'"
        );

        sqlx::query(&sql)
            .bind(point_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_alarm)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn open_alarm(
        &self,
        point_id: i64,
        kind: ThresholdKind,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<AlarmRecord>> {
        let at = Self::timestamp_to_millis(&at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE monitored_alarms SET state = 'RESOLVED', ended_at = ?
            WHERE point_id = ? AND state = 'ACTIVE'
            "#,
        )
        .bind(at)
        .bind(point_id)
        .execute(&mut *tx)
        .await?;

        let exists = sqlx::query("SELECT 1 FROM monitored_points WHERE id = ?")
            .bind(point_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO monitored_alarms (point_id, kind, value, state, started_at)
            VALUES (?, ?, ?, 'ACTIVE', ?)
            "#,
        )
        .bind(point_id)
        .bind(kind.as_str())
        .bind(value)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.fetch_alarm(result.last_insert_rowid()).await
    }

    #[instrument(skip(self))]
    async fn resolve_alarm(
        &self,
        point_id: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<AlarmRecord>> {
        let sql = format!(
            r#"
            UPDATE monitored_alarms SET state = 'RESOLVED', ended_at = ?
            WHERE point_id = ? AND state = 'ACTIVE'
            RETURNING {ALARM_COLUMNS}
            "#
        );

        sqlx::query(&sql)
            .bind(Self::timestamp_to_millis(&at))
            .bind(point_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_alarm)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_alarms(&self) -> StorageResult<Vec<AlarmRecord>> {
        let sql = format!(
            "SELECT {ALARM_COLUMNS} FROM monitored_alarms ORDER BY started_at DESC, id DESC"
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_alarm).collect()
    }

    #[instrument(skip(self))]
    async fn list_devices(&self) -> StorageResult<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT id, name, address, location, comm_state, last_update FROM devices ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_device).collect()
    }

    #[instrument(skip(self))]
    async fn get_device(&self, id: i64) -> StorageResult<Option<Device>> {
        sqlx::query(
            "SELECT id, name, address, location, comm_state, last_update FROM devices WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(row_to_device)
        .transpose()
    }

    #[instrument(skip(self, device), fields(name = %device.name))]
    async fn insert_device(&self, device: NewDevice) -> StorageResult<Device> {
        let result = sqlx::query("INSERT INTO devices (name, address, location) VALUES (?, ?, ?)")
            .bind(&device.name)
            .bind(device.address.trim())
            .bind(&device.location)
            .execute(&self.pool)
            .await?;

        Ok(Device {
            id: result.last_insert_rowid(),
            name: device.name,
            address: device.address.trim().to_string(),
            location: device.location,
            comm_state: None,
            last_update: None,
        })
    }

    #[instrument(skip(self))]
    async fn swap_comm_state(
        &self,
        device_id: i64,
        state: CommState,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<Option<CommState>>> {
        let mut tx = self.pool.begin().await?;

        // write first: holds the lock across the read below
        let touched = sqlx::query("UPDATE devices SET last_update = ? WHERE id = ?")
            .bind(Self::timestamp_to_millis(&at))
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let prior: Option<String> = sqlx::query_scalar("SELECT comm_state FROM devices WHERE id = ?")
            .bind(device_id)
            .fetch_one(&mut *tx)
            .await?;
        let prior = prior
            .map(|state| state.parse::<CommState>().map_err(|e| corrupted("comm_state", e)))
            .transpose()?;

        sqlx::query("UPDATE devices SET comm_state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(device_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(prior))
    }

    #[instrument(skip(self, alarm), fields(device = %alarm.device_name, label = %alarm.label))]
    async fn insert_reachability_alarm(
        &self,
        alarm: NewReachabilityAlarm,
    ) -> StorageResult<ReachabilityAlarmRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO reachability_alarms (device_name, address, location, label, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alarm.device_name)
        .bind(&alarm.address)
        .bind(&alarm.location)
        .bind(alarm.label.as_str())
        .bind(Self::timestamp_to_millis(&alarm.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(ReachabilityAlarmRecord {
            id: result.last_insert_rowid(),
            device_name: alarm.device_name,
            address: alarm.address,
            location: alarm.location,
            label: alarm.label,
            timestamp: alarm.timestamp,
        })
    }

    #[instrument(skip(self))]
    async fn list_reachability_alarms(
        &self,
        limit: Option<usize>,
        label: Option<ReachabilityTransition>,
    ) -> StorageResult<Vec<ReachabilityAlarmRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_name, address, location, label, timestamp
            FROM reachability_alarms
            WHERE ?1 IS NULL OR label = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(label.map(|label| label.as_str()))
        .bind(Self::limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_reachability_alarm).collect()
    }

    #[instrument(skip(self, snapshot))]
    async fn insert_indicator_snapshot(&self, snapshot: IndicatorSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO indicators (comm_rate, avg_delay_ms, avg_loss, bandwidth_util, cpu_util, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.comm_rate)
        .bind(snapshot.avg_delay_ms)
        .bind(snapshot.avg_loss)
        .bind(snapshot.bandwidth_util)
        .bind(snapshot.cpu_util)
        .bind(Self::timestamp_to_millis(&snapshot.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_indicator_snapshot(&self) -> StorageResult<Option<IndicatorSnapshot>> {
        let sql = format!(
            "SELECT {INDICATOR_COLUMNS} FROM indicators ORDER BY timestamp DESC, id DESC LIMIT 1"
        );

        sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_indicator)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn indicator_snapshots_since(
        &self,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<IndicatorSnapshot>> {
        let sql = format!(
            "SELECT {INDICATOR_COLUMNS} FROM indicators WHERE timestamp >= ? ORDER BY timestamp ASC, id ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(Self::timestamp_to_millis(&since))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_indicator).collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
