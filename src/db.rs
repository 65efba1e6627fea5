//! SQLite persistence layer (via sqlx): the registries (users, sensors,
//! devices), the telemetry history, the rules/execution log, and
//! notifications.
//!
//! Every query here uses the runtime `sqlx::query()` / `query_as::<_, T>()`
//! form with explicit `.bind()` calls and manual row mapping rather than the
//! `sqlx::query!` compile-time macros, since those require either a live
//! database or a checked-in `.sqlx` query cache at build time. Row shapes are
//! plain structs deriving `sqlx::FromRow` (a derive macro, not a query-time
//! one, so it needs neither).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteQueryResult};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::path::Path;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    Channel, Condition, DeliveryStatus, Device, DeviceKind, DeviceStatus, Notification,
    NotificationTemplate, Reading, ReadingQuality, Role, Rule, RuleExecution, Sensor, SensorKind,
    Severity, TemplateVariable, User,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

impl Db {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(db_url)
            .await
            .with_context(|| format!("failed to open database at {db_url}"))?;

        sqlx::query("PRAGMA journal_mode = WAL;")
            .execute(&pool)
            .await
            .context("failed to enable WAL journal mode")?;
        sqlx::query("PRAGMA synchronous = NORMAL;")
            .execute(&pool)
            .await
            .context("failed to set synchronous mode")?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context("failed to enable foreign keys")?;

        let db = Self { pool };
        db.ensure_incremental_auto_vacuum().await?;
        Ok(db)
    }

    /// `auto_vacuum` can only be changed on an otherwise-empty database, so
    /// this only takes effect the very first time a fresh file is opened.
    async fn ensure_incremental_auto_vacuum(&self) -> Result<()> {
        let mode: i64 = sqlx::query_scalar("PRAGMA auto_vacuum;")
            .fetch_one(&self.pool)
            .await
            .context("failed to read auto_vacuum pragma")?;
        if mode != 2 {
            sqlx::query("PRAGMA auto_vacuum = INCREMENTAL;")
                .execute(&self.pool)
                .await
                .context("failed to set incremental auto_vacuum")?;
            sqlx::query("VACUUM;")
                .execute(&self.pool)
                .await
                .context("failed to vacuum after changing auto_vacuum mode")?;
        }
        Ok(())
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1;")
            .fetch_one(&self.pool)
            .await
            .context("health check query failed")?;
        Ok(())
    }

    /// Snapshot the database file to `dest` via `VACUUM INTO`, then return —
    /// the caller is responsible for making the result atomic (rename into
    /// place) if that matters for its use case.
    pub async fn backup(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create backup dir {}", parent.display()))?;
        }
        let dest_str = dest.to_string_lossy();
        sqlx::query(&format!("VACUUM INTO '{dest_str}';"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to vacuum into {dest_str}"))?;
        Ok(())
    }

    async fn prune_old_readings(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.to_rfc3339();
        let result: SqliteQueryResult = sqlx::query("DELETE FROM readings WHERE received_at < ?;")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune old readings")?;
        if result.rows_affected() > 0 {
            sqlx::query("PRAGMA incremental_vacuum(100);")
                .execute(&self.pool)
                .await
                .context("failed to run incremental vacuum")?;
        }
        Ok(result.rows_affected())
    }

    pub async fn retain_readings(&self, max_age: chrono::Duration) -> Result<u64> {
        self.prune_old_readings(Utc::now() - max_age).await
    }

    async fn prune_old_rule_executions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.to_rfc3339();
        let result: SqliteQueryResult = sqlx::query("DELETE FROM rule_executions WHERE triggered_at < ?;")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune old rule executions")?;
        Ok(result.rows_affected())
    }

    pub async fn retain_rule_executions(&self, max_age: chrono::Duration) -> Result<u64> {
        self.prune_old_rule_executions(Utc::now() - max_age).await
    }

    async fn prune_old_notifications(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.to_rfc3339();
        let result: SqliteQueryResult = sqlx::query("DELETE FROM notifications WHERE created_at < ? AND is_read = 1;")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune old notifications")?;
        Ok(result.rows_affected())
    }

    pub async fn retain_notifications(&self, max_age: chrono::Duration) -> Result<u64> {
        self.prune_old_notifications(Utc::now() - max_age).await
    }
}


/// Default database file path derived from the data directory, mirroring
/// the layout the rest of the persisted state (backups) uses.
pub fn db_file_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("greenhouse.db")
}

// ---------------------------------------------------------------------------
// Enum <-> TEXT column helpers (reuse the serde rename_all already on the
// domain enums instead of hand-writing a second string mapping).
// ---------------------------------------------------------------------------

fn enum_to_db<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        other => panic!("enum serialized to non-string JSON value: {other:?}"),
    }
}

fn enum_from_db<T: DeserializeOwned>(raw: &str) -> CoreResult<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| CoreError::InvalidPayload(format!("bad enum value '{raw}': {e}")))
}

fn parse_dt(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InvalidPayload(format!("bad timestamp '{raw}': {e}")))
}

fn parse_json(raw: &str) -> CoreResult<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| CoreError::InvalidPayload(format!("bad json: {e}")))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct UserRow {
    id: String,
    username: String,
    password_hash: String,
    role: String,
    active: bool,
    created_at: String,
}

impl TryFrom<UserRow> for User {
    type Error = CoreError;
    fn try_from(r: UserRow) -> CoreResult<Self> {
        Ok(User {
            id: r.id,
            username: r.username,
            password_hash: r.password_hash,
            role: enum_from_db(&r.role)?,
            active: r.active,
            created_at: parse_dt(&r.created_at)?,
        })
    }
}

impl Db {
    pub async fn create_user(&self, username: &str, password_hash: &str, role: Role) -> CoreResult<User> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, role, active, created_at)
             VALUES (?, ?, ?, ?, 1, ?);",
        )
        .bind(&id)
        .bind(username)
        .bind(password_hash)
        .bind(enum_to_db(&role))
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            role,
            active: true,
            created_at,
        })
    }

    pub async fn get_user_by_username(&self, username: &str) -> CoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, password_hash, role, active, created_at
             FROM users WHERE username = ?;",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct SensorRow {
    id: String,
    hardware_id: String,
    name: String,
    kind: String,
    mqtt_topic: String,
    location: Option<String>,
    configuration: String,
    active: bool,
    last_seen: Option<String>,
    created_at: String,
}

impl TryFrom<SensorRow> for Sensor {
    type Error = CoreError;
    fn try_from(r: SensorRow) -> CoreResult<Self> {
        Ok(Sensor {
            id: r.id,
            hardware_id: r.hardware_id,
            name: r.name,
            kind: enum_from_db(&r.kind)?,
            mqtt_topic: r.mqtt_topic,
            location: r.location,
            configuration: parse_json(&r.configuration)?,
            active: r.active,
            last_seen: r.last_seen.as_deref().map(parse_dt).transpose()?,
            created_at: parse_dt(&r.created_at)?,
        })
    }
}

const SENSOR_COLUMNS: &str = "id, hardware_id, name, kind, mqtt_topic, location, configuration, active, last_seen, created_at";

impl Db {
    /// Insert a sensor declared in the config file, or update its name/kind/
    /// topic if the hardware id is already registered.
    pub async fn upsert_sensor_config(
        &self,
        hardware_id: &str,
        name: &str,
        kind: &str,
        mqtt_topic: &str,
    ) -> Result<()> {
        let kind: SensorKind = enum_from_db(kind)
            .with_context(|| format!("unrecognized sensor kind '{kind}' for {hardware_id}"))?;
        sqlx::query(
            "INSERT INTO sensors (id, hardware_id, name, kind, mqtt_topic, configuration, active, created_at)
             VALUES (?, ?, ?, ?, ?, '{}', 1, ?)
             ON CONFLICT(hardware_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                mqtt_topic = excluded.mqtt_topic;",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(hardware_id)
        .bind(name)
        .bind(enum_to_db(&kind))
        .bind(mqtt_topic)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert sensor {hardware_id}"))?;
        Ok(())
    }

    /// Register a sensor discovered at runtime rather than declared up front.
    pub async fn create_sensor(
        &self,
        hardware_id: &str,
        name: &str,
        kind: SensorKind,
        mqtt_topic: &str,
        configuration: serde_json::Value,
    ) -> CoreResult<Sensor> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO sensors (id, hardware_id, name, kind, mqtt_topic, configuration, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?);",
        )
        .bind(&id)
        .bind(hardware_id)
        .bind(name)
        .bind(enum_to_db(&kind))
        .bind(mqtt_topic)
        .bind(configuration.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Sensor {
            id,
            hardware_id: hardware_id.to_string(),
            name: name.to_string(),
            kind,
            mqtt_topic: mqtt_topic.to_string(),
            location: None,
            configuration,
            active: true,
            last_seen: None,
            created_at,
        })
    }

    pub async fn list_sensors(&self) -> CoreResult<Vec<Sensor>> {
        let rows: Vec<SensorRow> = sqlx::query_as(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors ORDER BY created_at;"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Sensor::try_from).collect()
    }

    pub async fn get_sensor(&self, id: &str) -> CoreResult<Option<Sensor>> {
        let row: Option<SensorRow> = sqlx::query_as(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE id = ?;"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Sensor::try_from).transpose()
    }

    pub async fn get_sensor_by_topic(&self, topic: &str) -> CoreResult<Option<Sensor>> {
        let row: Option<SensorRow> = sqlx::query_as(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE mqtt_topic = ?;"
        ))
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Sensor::try_from).transpose()
    }

    pub async fn touch_sensor_last_seen(&self, id: &str, ts: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE sensors SET last_seen = ? WHERE id = ?;")
            .bind(ts.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct DeviceRow {
    id: String,
    hardware_id: String,
    name: String,
    kind: String,
    mqtt_command_topic: String,
    mqtt_status_topic: String,
    status: String,
    status_confirmed: bool,
    notifications_enabled: bool,
    configuration: String,
    owner_id: Option<String>,
    last_seen: Option<String>,
    created_at: String,
}

impl TryFrom<DeviceRow> for Device {
    type Error = CoreError;
    fn try_from(r: DeviceRow) -> CoreResult<Self> {
        Ok(Device {
            id: r.id,
            hardware_id: r.hardware_id,
            name: r.name,
            kind: enum_from_db(&r.kind)?,
            mqtt_command_topic: r.mqtt_command_topic,
            mqtt_status_topic: r.mqtt_status_topic,
            status: enum_from_db(&r.status)?,
            status_confirmed: r.status_confirmed,
            notifications_enabled: r.notifications_enabled,
            configuration: parse_json(&r.configuration)?,
            owner_id: r.owner_id,
            last_seen: r.last_seen.as_deref().map(parse_dt).transpose()?,
            created_at: parse_dt(&r.created_at)?,
        })
    }
}

const DEVICE_COLUMNS: &str = "id, hardware_id, name, kind, mqtt_command_topic, mqtt_status_topic, status, status_confirmed, notifications_enabled, configuration, owner_id, last_seen, created_at";

impl Db {
    pub async fn upsert_device_config(
        &self,
        hardware_id: &str,
        name: &str,
        kind: &str,
        mqtt_command_topic: &str,
        mqtt_status_topic: &str,
        notifications_enabled: bool,
        configuration: serde_json::Value,
    ) -> Result<()> {
        let kind: DeviceKind = enum_from_db(kind)
            .with_context(|| format!("unrecognized device kind '{kind}' for {hardware_id}"))?;
        sqlx::query(
            "INSERT INTO devices (id, hardware_id, name, kind, mqtt_command_topic, mqtt_status_topic, status, notifications_enabled, configuration, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'OFFLINE', ?, ?, ?)
             ON CONFLICT(hardware_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                mqtt_command_topic = excluded.mqtt_command_topic,
                mqtt_status_topic = excluded.mqtt_status_topic,
                notifications_enabled = excluded.notifications_enabled;",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(hardware_id)
        .bind(name)
        .bind(enum_to_db(&kind))
        .bind(mqtt_command_topic)
        .bind(mqtt_status_topic)
        .bind(notifications_enabled)
        .bind(configuration.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert device {hardware_id}"))?;
        Ok(())
    }

    pub async fn list_devices(&self) -> CoreResult<Vec<Device>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY created_at;"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Device::try_from).collect()
    }

    pub async fn get_device(&self, id: &str) -> CoreResult<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?;"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Device::try_from).transpose()
    }

    pub async fn get_device_by_status_topic(&self, topic: &str) -> CoreResult<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE mqtt_status_topic = ?;"
        ))
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Device::try_from).transpose()
    }

    pub async fn update_device_status(
        &self,
        id: &str,
        status: DeviceStatus,
        confirmed: bool,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE devices SET status = ?, status_confirmed = ?, last_seen = ? WHERE id = ?;",
        )
        .bind(enum_to_db(&status))
        .bind(confirmed)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct ReadingRow {
    id: String,
    sensor_id: String,
    received_at: String,
    raw: String,
    normalized: String,
    quality: String,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = CoreError;
    fn try_from(r: ReadingRow) -> CoreResult<Self> {
        Ok(Reading {
            id: r.id,
            sensor_id: r.sensor_id,
            received_at: parse_dt(&r.received_at)?,
            raw: parse_json(&r.raw)?,
            normalized: parse_json(&r.normalized)?,
            quality: enum_from_db(&r.quality)?,
        })
    }
}

impl Db {
    pub async fn insert_reading(
        &self,
        sensor_id: &str,
        raw: &serde_json::Value,
        normalized: &serde_json::Value,
        quality: ReadingQuality,
    ) -> CoreResult<Reading> {
        let id = Uuid::new_v4().to_string();
        let received_at = Utc::now();
        sqlx::query(
            "INSERT INTO readings (id, sensor_id, received_at, raw, normalized, quality)
             VALUES (?, ?, ?, ?, ?, ?);",
        )
        .bind(&id)
        .bind(sensor_id)
        .bind(received_at.to_rfc3339())
        .bind(raw.to_string())
        .bind(normalized.to_string())
        .bind(enum_to_db(&quality))
        .execute(&self.pool)
        .await?;

        Ok(Reading {
            id,
            sensor_id: sensor_id.to_string(),
            received_at,
            raw: raw.clone(),
            normalized: normalized.clone(),
            quality,
        })
    }

    pub async fn insert_generic_sample(&self, topic: &str, normalized: &serde_json::Value) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO sensor_data_generic (id, topic, received_at, normalized) VALUES (?, ?, ?, ?);",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(topic)
        .bind(Utc::now().to_rfc3339())
        .bind(normalized.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_reading(&self, sensor_id: &str) -> CoreResult<Option<Reading>> {
        let row: Option<ReadingRow> = sqlx::query_as(
            "SELECT id, sensor_id, received_at, raw, normalized, quality
             FROM readings WHERE sensor_id = ? ORDER BY received_at DESC LIMIT 1;",
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Reading::try_from).transpose()
    }

    pub async fn readings_since(&self, sensor_id: &str, since: DateTime<Utc>) -> CoreResult<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            "SELECT id, sensor_id, received_at, raw, normalized, quality
             FROM readings WHERE sensor_id = ? AND received_at >= ? ORDER BY received_at;",
        )
        .bind(sensor_id)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Reading::try_from).collect()
    }

    /// Cursor-paginated reading history for a sensor. `cursor` is an opaque
    /// RFC3339 timestamp from a previous page's `next_cursor`; pass `None`
    /// for the first page. Returns the page, the next cursor (if more rows
    /// remain), and the total row count for the sensor.
    pub async fn list_readings(
        &self,
        sensor_id: &str,
        cursor: Option<&str>,
        limit: i64,
    ) -> CoreResult<(Vec<Reading>, Option<String>, i64)> {
        let total_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM readings WHERE sensor_id = ?;",
        )
        .bind(sensor_id)
        .fetch_one(&self.pool)
        .await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, sensor_id, received_at, raw, normalized, quality FROM readings WHERE sensor_id = ",
        );
        qb.push_bind(sensor_id);
        if let Some(cursor) = cursor {
            qb.push(" AND received_at < ");
            qb.push_bind(cursor.to_string());
        }
        qb.push(" ORDER BY received_at DESC LIMIT ");
        qb.push_bind(limit + 1);

        let rows: Vec<ReadingRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut readings: Vec<Reading> = rows.into_iter().map(Reading::try_from).collect::<CoreResult<_>>()?;

        let next_cursor = if readings.len() as i64 > limit {
            readings.truncate(limit as usize);
            readings.last().map(|r| r.received_at.to_rfc3339())
        } else {
            None
        };

        Ok((readings, next_cursor, total_count))
    }
}

// ---------------------------------------------------------------------------
// Rules + executions
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct RuleRow {
    id: String,
    name: String,
    description: Option<String>,
    enabled: bool,
    priority: i64,
    cooldown_seconds: i64,
    max_executions_per_hour: Option<i64>,
    conditions: String,
    actions: String,
    last_triggered_at: Option<String>,
    trigger_count: i64,
    created_by: String,
}

impl TryFrom<RuleRow> for Rule {
    type Error = CoreError;
    fn try_from(r: RuleRow) -> CoreResult<Self> {
        Ok(Rule {
            id: r.id,
            name: r.name,
            description: r.description,
            enabled: r.enabled,
            priority: r.priority as i32,
            cooldown_seconds: r.cooldown_seconds,
            max_executions_per_hour: r.max_executions_per_hour,
            conditions: serde_json::from_str::<Condition>(&r.conditions)
                .map_err(|e| CoreError::InvalidPayload(format!("bad rule conditions: {e}")))?,
            actions: serde_json::from_str(&r.actions)
                .map_err(|e| CoreError::InvalidPayload(format!("bad rule actions: {e}")))?,
            last_triggered_at: r.last_triggered_at.as_deref().map(parse_dt).transpose()?,
            trigger_count: r.trigger_count,
            created_by: r.created_by,
        })
    }
}

const RULE_COLUMNS: &str = "id, name, description, enabled, priority, cooldown_seconds, max_executions_per_hour, conditions, actions, last_triggered_at, trigger_count, created_by";

impl Db {
    pub async fn create_rule(&self, rule: &Rule) -> CoreResult<()> {
        let conditions = serde_json::to_string(&rule.conditions)
            .map_err(|e| CoreError::Invalid(e.to_string()))?;
        let actions = serde_json::to_string(&rule.actions).map_err(|e| CoreError::Invalid(e.to_string()))?;
        sqlx::query(
            "INSERT INTO rules (id, name, description, enabled, priority, cooldown_seconds, max_executions_per_hour, conditions, actions, trigger_count, created_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?);",
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.enabled)
        .bind(rule.priority as i64)
        .bind(rule.cooldown_seconds)
        .bind(rule.max_executions_per_hour)
        .bind(conditions)
        .bind(actions)
        .bind(&rule.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_enabled_rules(&self) -> CoreResult<Vec<Rule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE enabled = 1 ORDER BY priority DESC;"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Rule::try_from).collect()
    }

    pub async fn get_rule(&self, id: &str) -> CoreResult<Option<Rule>> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE id = ?;"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Rule::try_from).transpose()
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> CoreResult<()> {
        sqlx::query("UPDATE rules SET enabled = ? WHERE id = ?;")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_rule_trigger(&self, id: &str, triggered_at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE rules SET last_triggered_at = ?, trigger_count = trigger_count + 1 WHERE id = ?;",
        )
        .bind(triggered_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_rule_execution(&self, exec: &RuleExecution) -> CoreResult<()> {
        let trigger_data = exec.trigger_data.to_string();
        let actions_executed = serde_json::to_string(&exec.actions_executed)
            .map_err(|e| CoreError::Invalid(e.to_string()))?;
        sqlx::query(
            "INSERT INTO rule_executions (id, rule_id, triggered_at, success, elapsed_ms, trigger_data, evaluation_result, actions_executed, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(&exec.id)
        .bind(&exec.rule_id)
        .bind(exec.triggered_at.to_rfc3339())
        .bind(exec.success)
        .bind(exec.elapsed_ms)
        .bind(trigger_data)
        .bind(exec.evaluation_result)
        .bind(actions_executed)
        .bind(&exec.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn executions_since(&self, rule_id: &str, since: DateTime<Utc>) -> CoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rule_executions WHERE rule_id = ? AND triggered_at >= ?;",
        )
        .bind(rule_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Notifications + templates
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct NotificationRow {
    id: String,
    title: String,
    body: String,
    kind: String,
    severity: String,
    channel: String,
    recipient_user_id: Option<String>,
    source: String,
    delivery_status: String,
    is_read: bool,
    created_at: String,
    read_at: Option<String>,
    delivered_at: Option<String>,
    template_id: Option<String>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = CoreError;
    fn try_from(r: NotificationRow) -> CoreResult<Self> {
        Ok(Notification {
            id: r.id,
            title: r.title,
            body: r.body,
            kind: r.kind,
            severity: enum_from_db(&r.severity)?,
            channel: enum_from_db(&r.channel)?,
            recipient_user_id: r.recipient_user_id,
            source: r.source,
            delivery_status: enum_from_db(&r.delivery_status)?,
            is_read: r.is_read,
            created_at: parse_dt(&r.created_at)?,
            read_at: r.read_at.as_deref().map(parse_dt).transpose()?,
            delivered_at: r.delivered_at.as_deref().map(parse_dt).transpose()?,
            template_id: r.template_id,
        })
    }
}

const NOTIFICATION_COLUMNS: &str = "id, title, body, kind, severity, channel, recipient_user_id, source, delivery_status, is_read, created_at, read_at, delivered_at, template_id";

impl Db {
    pub async fn create_notification(&self, n: &Notification) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO notifications (id, title, body, kind, severity, channel, recipient_user_id, source, delivery_status, is_read, created_at, template_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(&n.id)
        .bind(&n.title)
        .bind(&n.body)
        .bind(&n.kind)
        .bind(enum_to_db(&n.severity))
        .bind(enum_to_db(&n.channel))
        .bind(&n.recipient_user_id)
        .bind(&n.source)
        .bind(enum_to_db(&n.delivery_status))
        .bind(n.is_read)
        .bind(n.created_at.to_rfc3339())
        .bind(&n.template_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_delivery_status(&self, id: &str, status: DeliveryStatus) -> CoreResult<()> {
        let delivered_at = matches!(status, DeliveryStatus::Delivered).then(|| Utc::now().to_rfc3339());
        sqlx::query("UPDATE notifications SET delivery_status = ?, delivered_at = COALESCE(?, delivered_at) WHERE id = ?;")
            .bind(enum_to_db(&status))
            .bind(delivered_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_notification_read(&self, id: &str) -> CoreResult<()> {
        sqlx::query("UPDATE notifications SET is_read = 1, read_at = ? WHERE id = ?;")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_notifications(
        &self,
        cursor: Option<&str>,
        limit: i64,
        unread_only: bool,
    ) -> CoreResult<(Vec<Notification>, Option<String>)> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE 1 = 1"
        ));
        if unread_only {
            qb.push(" AND is_read = 0");
        }
        if let Some(cursor) = cursor {
            qb.push(" AND created_at < ");
            qb.push_bind(cursor.to_string());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(limit + 1);

        let rows: Vec<NotificationRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut notifications: Vec<Notification> =
            rows.into_iter().map(Notification::try_from).collect::<CoreResult<_>>()?;

        let next_cursor = if notifications.len() as i64 > limit {
            notifications.truncate(limit as usize);
            notifications.last().map(|n| n.created_at.to_rfc3339())
        } else {
            None
        };

        Ok((notifications, next_cursor))
    }
}

#[derive(FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    kind: String,
    title_template: String,
    body_template: String,
    supported_channels: String,
    variables: String,
}

impl TryFrom<TemplateRow> for NotificationTemplate {
    type Error = CoreError;
    fn try_from(r: TemplateRow) -> CoreResult<Self> {
        let supported_channels: Vec<Channel> = serde_json::from_str(&r.supported_channels)
            .map_err(|e| CoreError::InvalidPayload(format!("bad supported_channels: {e}")))?;
        let variables: Vec<TemplateVariable> = serde_json::from_str(&r.variables)
            .map_err(|e| CoreError::InvalidPayload(format!("bad variables: {e}")))?;
        Ok(NotificationTemplate {
            id: r.id,
            name: r.name,
            kind: r.kind,
            title_template: r.title_template,
            body_template: r.body_template,
            supported_channels,
            variables,
        })
    }
}

impl Db {
    pub async fn create_template(&self, t: &NotificationTemplate) -> CoreResult<()> {
        let channels = serde_json::to_string(&t.supported_channels).map_err(|e| CoreError::Invalid(e.to_string()))?;
        let variables = serde_json::to_string(&t.variables).map_err(|e| CoreError::Invalid(e.to_string()))?;
        sqlx::query(
            "INSERT INTO notification_templates (id, name, kind, title_template, body_template, supported_channels, variables)
             VALUES (?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(&t.id)
        .bind(&t.name)
        .bind(&t.kind)
        .bind(&t.title_template)
        .bind(&t.body_template)
        .bind(channels)
        .bind(variables)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_template_by_name(&self, name: &str) -> CoreResult<Option<NotificationTemplate>> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT id, name, kind, title_template, body_template, supported_channels, variables
             FROM notification_templates WHERE name = ?;",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(NotificationTemplate::try_from).transpose()
    }

    pub async fn list_templates(&self) -> CoreResult<Vec<NotificationTemplate>> {
        let rows: Vec<TemplateRow> = sqlx::query_as(
            "SELECT id, name, kind, title_template, body_template, supported_channels, variables
             FROM notification_templates ORDER BY name;",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NotificationTemplate::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceKind;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn health_check_passes_on_fresh_db() {
        let db = test_db().await;
        db.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn sensor_upsert_then_list_roundtrips() {
        let db = test_db().await;
        db.upsert_sensor_config("temhum1", "Greenhouse TemHum", "TEMHUM", "Invernadero/TemHum1/data")
            .await
            .unwrap();
        let sensors = db.list_sensors().await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].kind, SensorKind::Temhum);

        db.upsert_sensor_config("temhum1", "Renamed", "TEMHUM", "Invernadero/TemHum1/data")
            .await
            .unwrap();
        let sensors = db.list_sensors().await.unwrap();
        assert_eq!(sensors.len(), 1, "conflicting hardware_id updates in place");
        assert_eq!(sensors[0].name, "Renamed");
    }

    #[tokio::test]
    async fn device_upsert_then_status_update() {
        let db = test_db().await;
        db.upsert_device_config(
            "bomba_agua_01",
            "Water pump",
            "WATER_PUMP",
            "Invernadero/Bomba/sw",
            "Invernadero/Bomba/status",
            true,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::WaterPump);
        assert_eq!(devices[0].status, DeviceStatus::Offline);

        db.update_device_status(&devices[0].id, DeviceStatus::On, true)
            .await
            .unwrap();
        let updated = db.get_device(&devices[0].id).await.unwrap().unwrap();
        assert_eq!(updated.status, DeviceStatus::On);
        assert!(updated.status_confirmed);
    }

    #[tokio::test]
    async fn reading_pagination_returns_pages_newest_first() {
        let db = test_db().await;
        let sensor = db
            .create_sensor("temhum1", "TemHum", SensorKind::Temhum, "Invernadero/TemHum1/data", serde_json::json!({}))
            .await
            .unwrap();

        for i in 0..5 {
            db.insert_reading(
                &sensor.id,
                &serde_json::json!({"i": i}),
                &serde_json::json!({"i": i}),
                ReadingQuality::Good,
            )
            .await
            .unwrap();
        }

        let (page1, cursor1, total) = db.list_readings(&sensor.id, None, 2).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(total, 5);
        assert!(cursor1.is_some());

        let (page2, _cursor2, _) = db.list_readings(&sensor.id, cursor1.as_deref(), 2).await.unwrap();
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].id, page2[0].id);
    }

    #[tokio::test]
    async fn retain_readings_prunes_rows_older_than_cutoff() {
        let db = test_db().await;
        let sensor = db
            .create_sensor("temhum1", "TemHum", SensorKind::Temhum, "Invernadero/TemHum1/data", serde_json::json!({}))
            .await
            .unwrap();
        db.insert_reading(&sensor.id, &serde_json::json!({}), &serde_json::json!({}), ReadingQuality::Good)
            .await
            .unwrap();

        let pruned = db.retain_readings(chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(pruned, 1);
        let (remaining, _, total) = db.list_readings(&sensor.id, None, 10).await.unwrap();
        assert!(remaining.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn rule_trigger_counters_increment() {
        let db = test_db().await;
        let rule = Rule {
            id: Uuid::new_v4().to_string(),
            name: "high temp".into(),
            description: None,
            enabled: true,
            priority: 0,
            cooldown_seconds: 60,
            max_executions_per_hour: Some(6),
            conditions: Condition::Sensor {
                sensor_ref: "temhum1".into(),
                field: "temperatura".into(),
                operator: crate::model::CompareOp::Gt,
                value: serde_json::json!(30.0),
                max_age_seconds: 300,
            },
            actions: vec![],
            last_triggered_at: None,
            trigger_count: 0,
            created_by: "system".into(),
        };
        db.create_rule(&rule).await.unwrap();
        db.record_rule_trigger(&rule.id, Utc::now()).await.unwrap();
        let reloaded = db.get_rule(&rule.id).await.unwrap().unwrap();
        assert_eq!(reloaded.trigger_count, 1);
        assert!(reloaded.last_triggered_at.is_some());
    }
}
