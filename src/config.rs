//! Environment variables for connection endpoints/secrets, TOML file for the
//! slower-moving recognized options, applied/seeded into the Store at startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Auto,
    Monitor,
}

impl Default for OperationMode {
    fn default() -> Self {
        OperationMode::Auto
    }
}

// ---------------------------------------------------------------------------
// TOML config file structures (recognized options, §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    #[serde(default = "default_evaluation_period")]
    pub evaluation_period_sec: u64,
    #[serde(default = "default_true")]
    pub auto_discovery_enabled: bool,
    #[serde(default = "default_analysis_window")]
    pub analysis_window_sec: u64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_auto_create_threshold")]
    pub auto_create_threshold: u32,
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: u32,
    // A device candidate's score structurally caps at 75 (25 topic-suffix +
    // 30 boolean-shaped + 20 control-named), so it can never clear the
    // sensor-oriented `auto_create_threshold` (90). Devices get their own,
    // lower bar for immediate auto-creation.
    #[serde(default = "default_device_auto_create_threshold")]
    pub device_auto_create_threshold: u32,
    #[serde(default = "default_ingest_workers")]
    pub ingest_workers: usize,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_sec: u64,
    #[serde(default = "default_offline_after")]
    pub offline_after_sec: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_retry_count")]
    pub notification_retry_count: u32,
    #[serde(default = "default_mode")]
    pub mode: OperationMode,

    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

fn default_root_topic() -> String {
    "Invernadero".to_string()
}
fn default_evaluation_period() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_analysis_window() -> u64 {
    60
}
fn default_min_samples() -> u32 {
    3
}
fn default_auto_create_threshold() -> u32 {
    90
}
fn default_approval_threshold() -> u32 {
    70
}
fn default_device_auto_create_threshold() -> u32 {
    75
}
fn default_ingest_workers() -> usize {
    4
}
fn default_ack_timeout() -> u64 {
    10
}
fn default_offline_after() -> i64 {
    300
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_retry_count() -> u32 {
    3
}
fn default_mode() -> OperationMode {
    OperationMode::Auto
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub hardware_id: String,
    pub name: String,
    pub kind: String,
    pub mqtt_topic: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub hardware_id: String,
    pub name: String,
    pub kind: String,
    pub mqtt_command_topic: String,
    pub mqtt_status_topic: String,
    #[serde(default)]
    pub notifications_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config always parses")
    }
}

// ---------------------------------------------------------------------------
// Env-only connection settings (secrets never live in the TOML file)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_credentials: Option<(String, String)>,
    pub db_url: String,
}

pub fn load_connection_settings() -> ConnectionSettings {
    let broker_host = env::var("BROKER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let broker_port: u16 = env::var("BROKER_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let broker_credentials = match (env::var("BROKER_USER"), env::var("BROKER_PASS")) {
        (Ok(u), Ok(p)) => Some((u, p)),
        _ => None,
    };
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());

    ConnectionSettings {
        broker_host,
        broker_port,
        broker_credentials,
        db_url,
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Seed sensors and devices declared in the config file into the Store.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sensors {
        db.upsert_sensor_config(&s.hardware_id, &s.name, &s.kind, &s.mqtt_topic)
            .await
            .with_context(|| format!("failed to upsert sensor '{}'", s.hardware_id))?;
    }

    for d in &config.devices {
        db.upsert_device_config(
            &d.hardware_id,
            &d.name,
            &d.kind,
            &d.mqtt_command_topic,
            &d.mqtt_status_topic,
            d.notifications_enabled,
            serde_json::json!({}),
        )
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.hardware_id))?;
    }

    tracing::info!(
        sensors = config.sensors.len(),
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[[sensors]]
hardware_id = "temhum1"
name = "Greenhouse TemHum"
kind = "TEMHUM"
mqtt_topic = "Invernadero/TemHum1/data"

[[devices]]
hardware_id = "bomba_agua_01"
name = "Water pump"
kind = "WATER_PUMP"
mqtt_command_topic = "Invernadero/Bomba/sw"
mqtt_status_topic = "Invernadero/Bomba/status"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.root_topic, "Invernadero");
        assert_eq!(config.evaluation_period_sec, 30);
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.sensors.is_empty());
        assert!(config.devices.is_empty());
        assert_eq!(config.auto_create_threshold, 90);
        assert_eq!(config.mode, OperationMode::Auto);
    }

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config: Config = toml::from_str(
            r#"
[[sensors]]
hardware_id = "temhum1"
name = "Greenhouse TemHum"
kind = "TEMHUM"
mqtt_topic = "Invernadero/TemHum1/data"
"#,
        )
        .unwrap();

        apply(&config, &db).await.unwrap();

        let sensors = db.list_sensors().await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].hardware_id, "temhum1");
    }
}
