//! Detects unknown topics, scores their buffered samples, and auto-creates
//! sensors or devices once a verdict is reached.

use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::db::Db;
use crate::error::CoreResult;
use crate::model::{DeviceKind, SensorKind};
use crate::normalize::{CONTROL_FIELD_VOCABULARY, DIAGNOSTIC_FIELDS, SENSOR_FIELD_VOCABULARY};
use crate::state::{SharedState, TopicSampleStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AutoCreated,
    Analyzing,
    Rejected,
}

fn topic_suffix_matches(topic: &str, suffixes: &[&str]) -> bool {
    suffixes.iter().any(|s| topic.ends_with(s))
}

fn has_boolean_shaped_field(samples: &[Value]) -> bool {
    samples.iter().any(|sample| {
        sample
            .as_object()
            .map(|obj| {
                obj.values()
                    .any(|v| matches!(v, Value::Bool(_)) || matches!(v, Value::String(s) if matches!(s.to_uppercase().as_str(), "ON" | "OFF" | "TRUE" | "FALSE")))
            })
            .unwrap_or(false)
    })
}

fn has_control_named_field(samples: &[Value]) -> bool {
    samples.iter().any(|sample| {
        sample
            .as_object()
            .map(|obj| {
                obj.keys().any(|k| {
                    let lower = k.to_lowercase();
                    lower.ends_with("sw") || CONTROL_FIELD_VOCABULARY.contains(&lower.as_str())
                })
            })
            .unwrap_or(false)
    })
}

/// Distinct lowercased field names that carry a numeric value anywhere in
/// the buffered samples, deduplicating repeat readings of the same shape.
fn distinct_numeric_fields(samples: &[Value]) -> std::collections::HashSet<String> {
    samples
        .iter()
        .flat_map(|s| s.as_object().into_iter().flatten())
        .filter(|(_, v)| v.is_number())
        .map(|(k, _)| k.to_lowercase())
        .collect()
}

fn is_numeric_only(samples: &[Value]) -> bool {
    samples.iter().all(|sample| {
        sample
            .as_object()
            .map(|obj| obj.values().all(|v| v.is_number()))
            .unwrap_or(false)
    })
}

/// Score contribution for overlap with the canonical sensor-field
/// vocabulary: 25 for the first distinct overlapping field, +10 for each
/// additional one, so a multi-field fingerprint (e.g. `{ph,ec,ppm}`) scores
/// higher than a single coincidental match.
fn vocabulary_overlap_score(samples: &[Value]) -> i32 {
    let distinct: std::collections::HashSet<String> = samples
        .iter()
        .flat_map(|s| s.as_object().into_iter().flatten())
        .map(|(k, _)| k.to_lowercase())
        .collect();
    let overlap = distinct.iter().filter(|k| SENSOR_FIELD_VOCABULARY.contains(&k.as_str())).count();
    match overlap {
        0 => 0,
        n => 25 + 10 * (n as i32 - 1),
    }
}

fn diagnostic_field_score(samples: &[Value]) -> i32 {
    let distinct: std::collections::HashSet<String> = samples
        .iter()
        .flat_map(|s| s.as_object().into_iter().flatten())
        .map(|(k, _)| k.to_lowercase())
        .collect();
    5 * distinct.iter().filter(|k| DIAGNOSTIC_FIELDS.contains(&k.as_str())).count() as i32
}

/// Score a topic/sample set as a telemetry-shaped producer.
pub fn score_sensor(topic: &str, samples: &[Value]) -> i32 {
    let mut score = 0;
    if topic_suffix_matches(topic, &["/data", "/reading"]) || topic.contains("/sensor/") {
        score += 20;
    }
    if distinct_numeric_fields(samples).len() >= 2 {
        score += 25;
    }
    score += vocabulary_overlap_score(samples);
    score += diagnostic_field_score(samples);
    if !has_boolean_shaped_field(samples) && !has_control_named_field(samples) {
        score += 15;
    }
    score
}

/// Score a topic/sample set as a device-control endpoint.
pub fn score_device(topic: &str, samples: &[Value]) -> i32 {
    let mut score = 0;
    if topic_suffix_matches(topic, &["/sw", "/control", "/command", "/set"]) {
        score += 25;
    }
    if has_boolean_shaped_field(samples) {
        score += 30;
    }
    if has_control_named_field(samples) {
        score += 20;
    }
    if is_numeric_only(samples) {
        score -= 10;
    }
    score
}

/// Infer a sensor kind from the union of field names seen across samples.
pub fn infer_sensor_kind(samples: &[Value]) -> SensorKind {
    let keys: Vec<String> = samples
        .iter()
        .flat_map(|s| s.as_object().into_iter().flatten())
        .map(|(k, _)| k.to_lowercase())
        .collect();
    let has = |name: &str| keys.iter().any(|k| k == name);

    if has("ph") && has("ec") && has("ppm") {
        SensorKind::WaterQuality
    } else if has("temperatura") && has("humedad") {
        SensorKind::Temhum
    } else if has("temperatura") && has("presion") {
        SensorKind::TempPressure
    } else if has("light") {
        SensorKind::Light
    } else if has("ph") {
        SensorKind::WaterQuality
    } else {
        SensorKind::Custom
    }
}

/// Infer a device's detected label and canonical kind from its topic and
/// control field name.
pub fn infer_device_kind(topic: &str, samples: &[Value]) -> (&'static str, DeviceKind) {
    let control_field = samples
        .iter()
        .flat_map(|s| s.as_object().into_iter().flatten())
        .map(|(k, _)| k.to_lowercase())
        .find(|k| k.ends_with("sw"))
        .unwrap_or_default();
    let haystack = format!("{} {}", topic.to_lowercase(), control_field);

    if haystack.contains("calefactoragua") {
        ("water_heater", DeviceKind::WaterHeater)
    } else if haystack.contains("calefactor") {
        ("heater", DeviceKind::Heater)
    } else if haystack.contains("bomba") {
        ("water_pump", DeviceKind::WaterPump)
    } else if haystack.contains("ventilador") {
        ("ventilator", DeviceKind::Ventilator)
    } else if haystack.contains("led") || haystack.contains("luz") {
        ("lights", DeviceKind::Lights)
    } else {
        ("relay", DeviceKind::Relay)
    }
}

/// Evaluate a topic's buffered samples once it has reached `min_samples`,
/// creating a Sensor or Device row when the score clears `auto_create_threshold`.
pub async fn evaluate_topic(
    db: &Db,
    state: &SharedState,
    topic: &str,
    config: &Config,
) -> CoreResult<Option<Verdict>> {
    let (samples, message_count) = {
        let st = state.read().await;
        match st.unknown_topics.get(topic) {
            Some(entry) => (entry.samples.iter().cloned().collect::<Vec<_>>(), entry.message_count),
            None => return Ok(None),
        }
    };

    if message_count < config.min_samples as u64 {
        return Ok(None);
    }
    if state.read().await.settled_topics.contains(topic) {
        return Ok(None);
    }

    let sensor_score = score_sensor(topic, &samples);
    let device_score = score_device(topic, &samples);
    let (best_score, as_sensor) = if sensor_score >= device_score {
        (sensor_score, true)
    } else {
        (device_score, false)
    };

    // Sensor and device candidates clear auto-creation against their own
    // ceiling: a device score structurally tops out at 75 (§4.E), below the
    // sensor-oriented `auto_create_threshold`, so it's judged against
    // `device_auto_create_threshold` instead.
    let auto_create_bar = if as_sensor { config.auto_create_threshold } else { config.device_auto_create_threshold };

    let verdict = if best_score >= auto_create_bar as i32 {
        if as_sensor {
            let kind = infer_sensor_kind(&samples);
            let hardware_id = topic_to_hardware_id(topic);
            let detected = enum_json_name_sensor(kind);
            let configuration = serde_json::json!({
                "autoDiscovered": true,
                "detectedKind": detected,
                "canonicalKind": enum_json_name_sensor(kind),
                "payloadFields": distinct_field_names(&samples),
            });
            let sensor = db
                .create_sensor(&hardware_id, &hardware_id, kind, topic, configuration)
                .await?;
            info!(topic, hardware_id = %sensor.hardware_id, kind = ?kind, "auto-discovery created sensor");
            state.write().await.record_discovery_event(format!("sensor {} auto-created from {topic}", sensor.hardware_id));
        } else {
            let (detected, canonical) = infer_device_kind(topic, &samples);
            let hardware_id = topic_to_hardware_id(topic);
            let status_topic = topic.replacen("/sw", "/status", 1);
            let configuration = serde_json::json!({
                "autoDiscovered": true,
                "detectedKind": detected,
                "canonicalKind": enum_json_name(canonical),
                "payloadFields": distinct_field_names(&samples),
            });
            db.upsert_device_config(&hardware_id, &hardware_id, &enum_json_name(canonical), topic, &status_topic, false, configuration)
                .await
                .map_err(|e| crate::error::CoreError::ActionFailed(e.to_string()))?;
            info!(topic, hardware_id, detected, canonical = ?canonical, "auto-discovery created device");
        }
        Verdict::AutoCreated
    } else if best_score >= config.approval_threshold as i32 {
        Verdict::Analyzing
    } else {
        Verdict::Rejected
    };

    let status = match verdict {
        Verdict::AutoCreated => TopicSampleStatus::AutoCreated,
        Verdict::Analyzing => TopicSampleStatus::Analyzing,
        Verdict::Rejected => TopicSampleStatus::Rejected,
    };
    state.write().await.set_topic_status(topic, status);

    Ok(Some(verdict))
}

fn topic_to_hardware_id(topic: &str) -> String {
    topic
        .split('/')
        .nth(1)
        .unwrap_or(topic)
        .to_lowercase()
}

fn enum_json_name(kind: DeviceKind) -> String {
    match serde_json::to_value(kind) {
        Ok(Value::String(s)) => s,
        _ => unreachable!("DeviceKind always serializes to a string"),
    }
}

fn enum_json_name_sensor(kind: SensorKind) -> String {
    match serde_json::to_value(kind) {
        Ok(Value::String(s)) => s,
        _ => unreachable!("SensorKind always serializes to a string"),
    }
}

/// Distinct, sorted field names seen across the buffered samples — stored
/// in an auto-created entity's `configuration` as the inferred payload
/// fingerprint.
fn distinct_field_names(samples: &[Value]) -> Vec<String> {
    samples
        .iter()
        .flat_map(|s| s.as_object().into_iter().flatten())
        .map(|(k, _)| k.to_lowercase())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temhum_data_topic_scores_as_sensor() {
        let samples = vec![serde_json::json!({"temperatura": 26.2, "humedad": 43.0, "rssi": -78})];
        let score = score_sensor("Invernadero/TemHum1/data", &samples);
        assert!(score >= 90, "expected auto-create-eligible score, got {score}");
    }

    #[test]
    fn water_quality_topic_infers_correct_kind() {
        let samples = vec![serde_json::json!({"ph": 5, "ec": 1000, "ppm": 1000, "temp": 18})];
        assert_eq!(infer_sensor_kind(&samples), SensorKind::WaterQuality);
    }

    #[test]
    fn calefactor_sw_topic_scores_as_device_and_maps_to_heater() {
        let samples = vec![serde_json::json!({"calefactorSw": true})];
        let device_score = score_device("Invernadero/Calefactor/sw", &samples);
        let sensor_score = score_sensor("Invernadero/Calefactor/sw", &samples);
        assert!(device_score > sensor_score);

        let (detected, canonical) = infer_device_kind("Invernadero/Calefactor/sw", &samples);
        assert_eq!(detected, "heater");
        assert_eq!(canonical, DeviceKind::Heater);
    }

    #[test]
    fn calefactor_agua_is_distinguished_from_plain_calefactor() {
        let samples = vec![serde_json::json!({"calefactorAguaSw": true})];
        let (detected, canonical) = infer_device_kind("Invernadero/CalefactorAgua/sw", &samples);
        assert_eq!(detected, "water_heater");
        assert_eq!(canonical, DeviceKind::WaterHeater);
    }

    #[test]
    fn numeric_only_control_topic_is_penalized_as_device() {
        let samples = vec![serde_json::json!({"value": 42})];
        let score = score_device("Invernadero/Unknown/set", &samples);
        assert!(score < 25);
    }

    #[tokio::test]
    async fn evaluate_topic_returns_none_before_min_samples() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));
        state.write().await.record_unknown_sample("Invernadero/Agua/data", serde_json::json!({"ph": 5}));

        let config = Config::default();
        let verdict = evaluate_topic(&db, &state, "Invernadero/Agua/data", &config).await.unwrap();
        assert!(verdict.is_none());
    }

    #[tokio::test]
    async fn evaluate_topic_auto_creates_water_quality_sensor() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));

        for _ in 0..3 {
            state
                .write()
                .await
                .record_unknown_sample("Invernadero/Agua/data", serde_json::json!({"ph": 5, "ec": 1000, "ppm": 1000, "temp": 18}));
        }

        let config = Config::default();
        let verdict = evaluate_topic(&db, &state, "Invernadero/Agua/data", &config).await.unwrap();
        assert_eq!(verdict, Some(Verdict::AutoCreated));

        let sensors = db.list_sensors().await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].kind, SensorKind::WaterQuality);
        assert_eq!(sensors[0].hardware_id, "agua");

        let configuration = &sensors[0].configuration;
        assert_eq!(configuration["autoDiscovered"], serde_json::json!(true));
        assert_eq!(configuration["detectedKind"], serde_json::json!("WATER_QUALITY"));
        assert_eq!(configuration["canonicalKind"], serde_json::json!("WATER_QUALITY"));
        let fields = configuration["payloadFields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f == "ph"));
    }

    #[tokio::test]
    async fn evaluate_topic_auto_creates_heater_device_from_clear_control_topic() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));

        for _ in 0..3 {
            state
                .write()
                .await
                .record_unknown_sample("Invernadero/Calefactor/sw", serde_json::json!({"calefactorSw": true}));
        }

        let config = Config::default();
        let verdict = evaluate_topic(&db, &state, "Invernadero/Calefactor/sw", &config).await.unwrap();
        assert_eq!(verdict, Some(Verdict::AutoCreated), "a clean control topic must clear the device auto-create bar");

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::Heater);

        let configuration = &devices[0].configuration;
        assert_eq!(configuration["autoDiscovered"], serde_json::json!(true));
        assert_eq!(configuration["detectedKind"], serde_json::json!("heater"));
        assert_eq!(configuration["canonicalKind"], serde_json::json!("HEATER"));
    }
}
