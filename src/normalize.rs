//! Maps heterogeneous device payloads onto the canonical per-kind field
//! vocabulary, the way the reference hub's ad-hoc aliasing worked but
//! encoded as data instead of scattered `if` chains.

use crate::error::{CoreError, CoreResult};
use crate::model::{ReadingQuality, SensorKind};
use serde_json::{Map, Value};

/// Case-insensitive alias -> canonical field name. Applied uniformly; a
/// kind's mandatory-field check is what actually constrains which of these
/// are meaningful for a given sensor.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("ph", "ph"),
    ("temp", "temperatura"),
    ("temperature", "temperatura"),
    ("temperatura", "temperatura"),
    ("humedad", "humedad"),
    ("humidity", "humedad"),
    ("presion", "presion"),
    ("pressure", "presion"),
    ("ec", "ec"),
    ("ppm", "ppm"),
    ("light", "light"),
    ("voltage", "voltage"),
    ("watts", "watts"),
    ("current", "current"),
    ("frequency", "frequency"),
    ("rssi", "rssi"),
    ("boot", "boot"),
    ("mem", "mem"),
    ("timestamp", "timestamp"),
    ("estado", "estado"),
    ("bombasw", "state"),
    ("ventiladorsw", "state"),
    ("calefactorsw", "state"),
    ("calefactoraguasw", "state"),
    ("state", "state"),
];

fn canonical_field_name(raw_key: &str) -> Option<&'static str> {
    let lowered = raw_key.to_lowercase();
    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| *canonical)
}

/// Diagnostic fields every kind tolerates alongside its mandatory ones.
pub(crate) const DIAGNOSTIC_FIELDS: &[&str] = &["rssi", "boot", "mem", "timestamp"];

/// The canonical sensor-field vocabulary Auto-Discovery checks payloads
/// against when scoring an unknown topic.
pub(crate) const SENSOR_FIELD_VOCABULARY: &[&str] = &[
    "ph", "temperatura", "humedad", "presion", "ec", "ppm", "light", "voltage", "watts", "current",
];

/// Field names (case-insensitive) that signal a control/command payload
/// rather than telemetry.
pub(crate) const CONTROL_FIELD_VOCABULARY: &[&str] = &["estado", "state", "command", "action"];

pub(crate) fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.to_uppercase().as_str() {
            "TRUE" | "ON" | "ACTIVE" | "1" => Some(true),
            "FALSE" | "OFF" | "INACTIVE" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Per-kind [min, max] clamp ranges for a subset of fields. Out-of-range
/// values are clamped but the reading is flagged `quality=warning`.
fn clamp_range(field: &str) -> Option<(f64, f64)> {
    match field {
        "humedad" => Some((0.0, 100.0)),
        _ => None,
    }
}

fn mandatory_fields(kind: SensorKind) -> &'static [&'static [&'static str]] {
    // Each inner slice is an "at least one of" group; a kind needs all groups satisfied.
    match kind {
        SensorKind::Temhum => &[&["temperatura"], &["humedad"]],
        SensorKind::WaterQuality => &[&["ph"]],
        SensorKind::TempPressure => &[&["temperatura"], &["presion"]],
        SensorKind::Light => &[&["light"]],
        SensorKind::Power => &[&["watts", "voltage", "current"]],
        SensorKind::SoilMoisture | SensorKind::Co2 | SensorKind::Motion | SensorKind::Custom => &[],
    }
}

/// Normalize a sensor telemetry payload into canonical field names, with
/// range-clamped values and a quality verdict. Unknown extra fields survive
/// unchanged under their original key.
pub fn normalize_sensor_payload(kind: SensorKind, raw: &Value) -> CoreResult<(Map<String, Value>, ReadingQuality)> {
    let raw_obj = raw
        .as_object()
        .ok_or_else(|| CoreError::InvalidPayload("payload is not a JSON object".into()))?;

    let mut normalized = Map::new();
    let mut quality = ReadingQuality::Good;

    for (key, value) in raw_obj {
        match canonical_field_name(key) {
            Some(canonical) => {
                if let Some(mut n) = coerce_number(value) {
                    if let Some((min, max)) = clamp_range(canonical) {
                        if n < min || n > max {
                            quality = ReadingQuality::Warning;
                            n = n.clamp(min, max);
                        }
                    }
                    normalized.insert(canonical.to_string(), serde_json::json!(n));
                } else {
                    normalized.insert(canonical.to_string(), value.clone());
                }
            }
            None => {
                normalized.insert(key.clone(), value.clone());
            }
        }
    }

    for group in mandatory_fields(kind) {
        if !group.iter().any(|f| normalized.contains_key(*f)) {
            return Err(CoreError::InvalidPayload(format!(
                "missing mandatory field(s) {group:?} for sensor kind {kind:?}"
            )));
        }
    }

    Ok((normalized, quality))
}

/// A desired device state derived from a command-topic payload: either the
/// canonical `{estado,...}` shape or a legacy boolean alias.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub estado: bool,
    pub value: Option<f64>,
    pub duration_seconds: Option<i64>,
}

pub fn normalize_command_payload(raw: &Value) -> CoreResult<DesiredState> {
    let raw_obj = raw
        .as_object()
        .ok_or_else(|| CoreError::InvalidPayload("command payload is not a JSON object".into()))?;

    let estado_value = raw_obj
        .get("estado")
        .or_else(|| raw_obj.iter().find_map(|(k, v)| (canonical_field_name(k) == Some("state")).then_some(v)));

    let estado = estado_value
        .and_then(coerce_bool)
        .ok_or_else(|| CoreError::InvalidPayload("missing mandatory field 'estado' for device command".into()))?;

    let value = raw_obj.get("value").and_then(coerce_number);
    let duration_seconds = raw_obj
        .get("durationSeconds")
        .or_else(|| raw_obj.get("duration_seconds"))
        .and_then(|v| v.as_i64());

    Ok(DesiredState {
        estado,
        value,
        duration_seconds,
    })
}

/// Fields present in `normalized` that look numeric, for the Auto-Discovery
/// scorer and the ingest rolling-window stats.
pub fn numeric_fields(normalized: &Map<String, Value>) -> Vec<(&str, f64)> {
    normalized
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|n| (k.as_str(), n)))
        .collect()
}
