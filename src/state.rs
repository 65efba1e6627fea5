//! In-memory liveness and session state: sensor/device liveness, rule
//! single-flight guards, and unknown-topic sample buffers for Auto-Discovery.
//!
//! `SharedState = Arc<RwLock<SystemState>>`, with a bounded ring buffer of
//! recent events for inspection, covering the broader set of ephemeral
//! caches this system needs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

const MAX_EVENTS: usize = 200;
const MAX_SAMPLES_PER_TOPIC: usize = 10;

pub type SharedState = Arc<RwLock<SystemState>>;

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Device,
    Rule,
    Discovery,
    Error,
    System,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone)]
pub struct SensorLiveness {
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

#[derive(Clone, Default)]
pub struct RuleCooldownState {
    pub in_flight: bool,
    pub recent_trigger_times: VecDeque<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub enum TopicSampleStatus {
    Analyzing,
    AutoCreated,
    Rejected,
}

#[derive(Clone)]
pub struct UnknownTopicSample {
    pub topic: String,
    pub first_seen: DateTime<Utc>,
    pub samples: VecDeque<serde_json::Value>,
    pub message_count: u64,
    pub status: TopicSampleStatus,
}

impl UnknownTopicSample {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            first_seen: Utc::now(),
            samples: VecDeque::with_capacity(MAX_SAMPLES_PER_TOPIC),
            message_count: 0,
            status: TopicSampleStatus::Analyzing,
        }
    }

    fn push(&mut self, payload: serde_json::Value) {
        if self.samples.len() >= MAX_SAMPLES_PER_TOPIC {
            self.samples.pop_front();
        }
        self.samples.push_back(payload);
        self.message_count += 1;
    }
}

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub sensor_liveness: HashMap<String, SensorLiveness>,
    pub rule_cooldowns: HashMap<String, RuleCooldownState>,
    pub unknown_topics: HashMap<String, UnknownTopicSample>,
    pub settled_topics: HashSet<String>,
    pub events: VecDeque<SystemEvent>,
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            sensor_liveness: HashMap::new(),
            rule_cooldowns: HashMap::new(),
            unknown_topics: HashMap::new(),
            settled_topics: HashSet::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_telemetry(&mut self, sensor_id: &str) {
        self.sensor_liveness.insert(
            sensor_id.to_string(),
            SensorLiveness {
                last_seen: Utc::now(),
                online: true,
            },
        );
        self.push_event(EventKind::Telemetry, format!("{sensor_id}: reading received"));
    }

    pub fn sweep_liveness(&mut self, offline_after_secs: i64) -> Vec<String> {
        let now = Utc::now();
        let mut newly_offline = Vec::new();
        for (sensor_id, live) in self.sensor_liveness.iter_mut() {
            if live.online && (now - live.last_seen).num_seconds() > offline_after_secs {
                live.online = false;
                newly_offline.push(sensor_id.clone());
            }
        }
        for sensor_id in &newly_offline {
            self.push_event(EventKind::System, format!("{sensor_id}: marked offline"));
        }
        newly_offline
    }

    pub fn record_device_event(&mut self, detail: String) {
        self.push_event(EventKind::Device, detail);
    }

    pub fn record_rule_event(&mut self, detail: String) {
        self.push_event(EventKind::Rule, detail);
    }

    pub fn record_discovery_event(&mut self, detail: String) {
        self.push_event(EventKind::Discovery, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Try to acquire the per-rule single-flight guard. Returns false if an
    /// execution for this rule is already in flight.
    pub fn try_acquire_rule_guard(&mut self, rule_id: &str) -> bool {
        let entry = self.rule_cooldowns.entry(rule_id.to_string()).or_default();
        if entry.in_flight {
            return false;
        }
        entry.in_flight = true;
        true
    }

    pub fn release_rule_guard(&mut self, rule_id: &str) {
        if let Some(entry) = self.rule_cooldowns.get_mut(rule_id) {
            entry.in_flight = false;
        }
    }

    /// Sliding-window count of triggers within the last hour, recording the
    /// new trigger as a side effect.
    pub fn record_trigger_and_count_last_hour(&mut self, rule_id: &str) -> usize {
        let now = Utc::now();
        let entry = self.rule_cooldowns.entry(rule_id.to_string()).or_default();
        entry.recent_trigger_times.retain(|t| (now - *t).num_seconds() < 3600);
        entry.recent_trigger_times.push_back(now);
        entry.recent_trigger_times.len()
    }

    pub fn executions_last_hour(&self, rule_id: &str) -> usize {
        let now = Utc::now();
        self.rule_cooldowns
            .get(rule_id)
            .map(|e| {
                e.recent_trigger_times
                    .iter()
                    .filter(|t| (now - **t).num_seconds() < 3600)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Append a sample for an unknown topic, creating the buffer on first sight.
    pub fn record_unknown_sample(&mut self, topic: &str, payload: serde_json::Value) -> usize {
        let entry = self
            .unknown_topics
            .entry(topic.to_string())
            .or_insert_with(|| UnknownTopicSample::new(topic));
        entry.push(payload);
        entry.message_count as usize
    }

    pub fn set_topic_status(&mut self, topic: &str, status: TopicSampleStatus) {
        if let Some(entry) = self.unknown_topics.get_mut(topic) {
            entry.status = status;
        }
        self.settled_topics.insert(topic.to_string());
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_telemetry_marks_sensor_online() {
        let mut st = SystemState::new();
        st.record_telemetry("temhum1");
        assert!(st.sensor_liveness["temhum1"].online);
    }

    #[test]
    fn sweep_liveness_marks_stale_sensor_offline() {
        let mut st = SystemState::new();
        st.sensor_liveness.insert(
            "agua".into(),
            SensorLiveness {
                last_seen: Utc::now() - chrono::Duration::seconds(600),
                online: true,
            },
        );
        let offline = st.sweep_liveness(300);
        assert_eq!(offline, vec!["agua".to_string()]);
        assert!(!st.sensor_liveness["agua"].online);
    }

    #[test]
    fn sweep_liveness_leaves_fresh_sensor_online() {
        let mut st = SystemState::new();
        st.record_telemetry("temhum1");
        let offline = st.sweep_liveness(300);
        assert!(offline.is_empty());
    }

    #[test]
    fn rule_guard_prevents_concurrent_acquisition() {
        let mut st = SystemState::new();
        assert!(st.try_acquire_rule_guard("r1"));
        assert!(!st.try_acquire_rule_guard("r1"));
        st.release_rule_guard("r1");
        assert!(st.try_acquire_rule_guard("r1"));
    }

    #[test]
    fn sliding_window_counts_only_recent_triggers() {
        let mut st = SystemState::new();
        let entry = st.rule_cooldowns.entry("r1".to_string()).or_default();
        entry.recent_trigger_times.push_back(Utc::now() - chrono::Duration::seconds(4000));
        assert_eq!(st.record_trigger_and_count_last_hour("r1"), 1);
        assert_eq!(st.executions_last_hour("r1"), 1);
    }

    #[test]
    fn unknown_sample_buffer_caps_and_counts() {
        let mut st = SystemState::new();
        for i in 0..(MAX_SAMPLES_PER_TOPIC + 5) {
            st.record_unknown_sample("Invernadero/Agua/data", serde_json::json!({"i": i}));
        }
        let entry = &st.unknown_topics["Invernadero/Agua/data"];
        assert_eq!(entry.samples.len(), MAX_SAMPLES_PER_TOPIC);
        assert_eq!(entry.message_count, (MAX_SAMPLES_PER_TOPIC + 5) as u64);
    }

    #[test]
    fn event_ring_buffer_caps_at_max() {
        let mut st = SystemState::new();
        for i in 0..MAX_EVENTS + 20 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
    }
}
