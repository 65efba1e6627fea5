//! Domain entity types: sensors, devices, rules, executions, notifications.
//!
//! These are the shapes the Store persists and the rules engine evaluates
//! against. Field names match the canonical JSON contracts the (external)
//! API layer exposes, not SQL column names — `db.rs` maps between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Operator,
    Viewer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    Temhum,
    WaterQuality,
    Light,
    TempPressure,
    SoilMoisture,
    Co2,
    Motion,
    Power,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingQuality {
    Good,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub hardware_id: String,
    pub name: String,
    pub kind: SensorKind,
    pub mqtt_topic: String,
    pub location: Option<String>,
    pub configuration: serde_json::Value,
    pub active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    pub sensor_id: String,
    pub received_at: DateTime<Utc>,
    pub raw: serde_json::Value,
    pub normalized: serde_json::Value,
    pub quality: ReadingQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    WaterPump,
    Ventilator,
    Heater,
    WaterHeater,
    Lights,
    Valve,
    Relay,
    Motor,
    SensorActuator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    On,
    Off,
    Offline,
    Error,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub hardware_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub mqtt_command_topic: String,
    pub mqtt_status_topic: String,
    pub status: DeviceStatus,
    pub status_confirmed: bool,
    pub notifications_enabled: bool,
    pub configuration: serde_json::Value,
    pub owner_id: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Condition {
    Sensor {
        sensor_ref: String,
        field: String,
        operator: CompareOp,
        value: serde_json::Value,
        max_age_seconds: i64,
    },
    Time {
        start: String,
        end: String,
    },
    Device {
        device_ref: String,
        state_equals: DeviceStatus,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuationVerb {
    TurnOn,
    TurnOff,
    Toggle,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Webhook,
    Email,
    Telegram,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    DeviceControl {
        device_ref: String,
        verb: ActuationVerb,
        value: Option<f64>,
        duration_seconds: Option<i64>,
    },
    Notification {
        template_ref: Option<String>,
        title: String,
        body_template: String,
        severity: Severity,
        channels: Vec<Channel>,
        variables: HashMap<String, String>,
    },
    RuleDisable,
    Webhook {
        url: String,
        payload_template: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub priority: i32,
    pub cooldown_seconds: i64,
    pub max_executions_per_hour: Option<i64>,
    pub conditions: Condition,
    pub actions: Vec<Action>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcomeKind {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub kind: ActionOutcomeKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecution {
    pub id: String,
    pub rule_id: String,
    pub triggered_at: DateTime<Utc>,
    pub success: bool,
    pub elapsed_ms: i64,
    pub trigger_data: serde_json::Value,
    pub evaluation_result: bool,
    pub actions_executed: Vec<ActionOutcome>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub severity: Severity,
    pub channel: Channel,
    pub recipient_user_id: Option<String>,
    pub source: String,
    pub delivery_status: DeliveryStatus,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    pub var_type: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub title_template: String,
    pub body_template: String,
    pub supported_channels: Vec<Channel>,
    pub variables: Vec<TemplateVariable>,
}

impl Role {
    /// Pure policy function the (external) transport layer calls instead of
    /// duplicating role checks.
    pub fn can(self, op: Operation) -> bool {
        use Operation::*;
        use Role::*;
        match (self, op) {
            (Admin, _) => true,
            (Editor, ManageRules | ManageTemplates | ReadAll) => true,
            (Operator, ControlDevice | ReadAll) => true,
            (Viewer, ReadAll) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ManageUsers,
    ManageRules,
    ManageTemplates,
    ControlDevice,
    ReadAll,
}
