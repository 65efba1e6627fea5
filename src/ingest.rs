//! Turns an inbound telemetry frame into a persisted, normalized Reading,
//! updates sensor liveness, and maintains the rolling hourly statistics
//! exposed on the sensor record.

use chrono::Utc;
use std::collections::HashMap;
use tracing::warn;

use crate::bus::{Event, EventBus};
use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::model::Reading;
use crate::mqtt::InboundFrame;
use crate::normalize::{normalize_sensor_payload, numeric_fields};
use crate::state::SharedState;

/// A telemetry payload larger than this is dropped outright rather than
/// parsed, mirroring the reference hub's guard against a runaway producer.
const MAX_TELEMETRY_PAYLOAD_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    HandedToDiscovery,
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Ingest one frame already resolved to have arrived on a `/data`-style
/// topic. Frames on unrecognized topics should go to Auto-Discovery
/// instead of here.
pub async fn ingest_frame(
    db: &Db,
    bus: &EventBus,
    state: &SharedState,
    frame: &InboundFrame,
) -> CoreResult<IngestOutcome> {
    if frame.payload.len() > MAX_TELEMETRY_PAYLOAD_BYTES {
        warn!(topic = %frame.topic, bytes = frame.payload.len(), "telemetry payload too large, dropping");
        state
            .write()
            .await
            .record_error(format!("telemetry from {} dropped: payload too large", frame.topic));
        return Ok(IngestOutcome::Dropped);
    }

    let sensor = match db.get_sensor_by_topic(&frame.topic).await? {
        Some(s) => s,
        None => {
            state.write().await.record_unknown_sample(&frame.topic, parse_lenient(&frame.payload));
            return Ok(IngestOutcome::HandedToDiscovery);
        }
    };

    let raw: serde_json::Value = match serde_json::from_slice(&frame.payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(topic = %frame.topic, "invalid telemetry json: {e}");
            state.write().await.record_error(format!("invalid json from {}: {e}", frame.topic));
            return Ok(IngestOutcome::Dropped);
        }
    };

    let (normalized, quality) = match normalize_sensor_payload(sensor.kind, &raw) {
        Ok(v) => v,
        Err(CoreError::InvalidPayload(reason)) => {
            warn!(topic = %frame.topic, reason, "telemetry rejected by normalizer");
            state.write().await.record_error(format!("{}: {reason}", frame.topic));
            return Ok(IngestOutcome::Dropped);
        }
        Err(e) => return Err(e),
    };

    let reading = db
        .insert_reading(&sensor.id, &raw, &serde_json::Value::Object(normalized), quality)
        .await?;
    db.touch_sensor_last_seen(&sensor.id, reading.received_at).await?;

    state.write().await.record_telemetry(&sensor.id);
    bus.publish(Event::TelemetryUpdated(reading));

    Ok(IngestOutcome::Accepted)
}

fn parse_lenient(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null)
}

/// Min/max/avg per canonical numeric field over the last hour, the figures
/// the API surface exposes alongside a sensor's latest reading.
pub async fn stats_last_hour(db: &Db, sensor_id: &str) -> CoreResult<HashMap<String, FieldStats>> {
    let readings: Vec<Reading> = db.readings_since(sensor_id, Utc::now() - chrono::Duration::hours(1)).await?;
    let mut accum: HashMap<String, (f64, f64, f64, u64)> = HashMap::new();

    for reading in &readings {
        let Some(obj) = reading.normalized.as_object() else { continue };
        for (field, value) in numeric_fields(obj) {
            let entry = accum.entry(field.to_string()).or_insert((f64::MAX, f64::MIN, 0.0, 0));
            entry.0 = entry.0.min(value);
            entry.1 = entry.1.max(value);
            entry.2 += value;
            entry.3 += 1;
        }
    }

    Ok(accum
        .into_iter()
        .map(|(field, (min, max, sum, count))| {
            (
                field,
                FieldStats {
                    min,
                    max,
                    avg: sum / count.max(1) as f64,
                },
            )
        })
        .collect())
}

/// Sensors whose last reading is older than `offline_after` should be
/// swept to offline by the periodic liveness sweeper.
pub fn offline_after(sampling_interval: chrono::Duration, configured_default: chrono::Duration) -> chrono::Duration {
    (sampling_interval * 5).max(configured_default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReadingQuality, SensorKind};
    use crate::mqtt::data_topic;

    async fn seeded_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn known_topic_is_accepted_and_published() {
        let db = seeded_db().await;
        let sensor = db
            .create_sensor("temhum1", "TemHum", SensorKind::Temhum, &data_topic("Invernadero", "TemHum1"), serde_json::json!({}))
            .await
            .unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));

        let frame = InboundFrame {
            topic: data_topic("Invernadero", "TemHum1"),
            payload: br#"{"temperatura":26.2,"humedad":43.0,"rssi":-78}"#.to_vec(),
            received_at: Utc::now(),
        };

        let outcome = ingest_frame(&db, &bus, &state, &frame).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted);

        let (readings, _, total) = db.list_readings(&sensor.id, None, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(readings[0].quality, ReadingQuality::Good);

        let event = crate::bus::recv_lossy(&mut rx).await.unwrap();
        assert!(matches!(event, Event::TelemetryUpdated(_)));
    }

    #[tokio::test]
    async fn unknown_topic_is_handed_to_discovery() {
        let db = seeded_db().await;
        let bus = EventBus::new();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));

        let frame = InboundFrame {
            topic: "Invernadero/Agua/data".into(),
            payload: br#"{"ph":5}"#.to_vec(),
            received_at: Utc::now(),
        };

        let outcome = ingest_frame(&db, &bus, &state, &frame).await.unwrap();
        assert_eq!(outcome, IngestOutcome::HandedToDiscovery);
        assert!(state.read().await.unknown_topics.contains_key("Invernadero/Agua/data"));
    }

    #[tokio::test]
    async fn invalid_payload_is_dropped_not_persisted() {
        let db = seeded_db().await;
        db.create_sensor("temhum1", "TemHum", SensorKind::Temhum, &data_topic("Invernadero", "TemHum1"), serde_json::json!({}))
            .await
            .unwrap();
        let bus = EventBus::new();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));

        let frame = InboundFrame {
            topic: data_topic("Invernadero", "TemHum1"),
            payload: br#"{"temperatura":26.2}"#.to_vec(),
            received_at: Utc::now(),
        };

        let outcome = ingest_frame(&db, &bus, &state, &frame).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped);

        let sensors = db.list_sensors().await.unwrap();
        let (_, _, total) = db.list_readings(&sensors[0].id, None, 10).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn stats_last_hour_averages_numeric_fields() {
        let db = seeded_db().await;
        let sensor = db
            .create_sensor("temhum1", "TemHum", SensorKind::Temhum, "Invernadero/TemHum1/data", serde_json::json!({}))
            .await
            .unwrap();
        for temp in [24.0, 26.0, 28.0] {
            db.insert_reading(
                &sensor.id,
                &serde_json::json!({"temperatura": temp, "humedad": 40.0}),
                &serde_json::json!({"temperatura": temp, "humedad": 40.0}),
                ReadingQuality::Good,
            )
            .await
            .unwrap();
        }

        let stats = stats_last_hour(&db, &sensor.id).await.unwrap();
        let temp_stats = stats.get("temperatura").unwrap();
        assert_eq!(temp_stats.min, 24.0);
        assert_eq!(temp_stats.max, 28.0);
        assert_eq!(temp_stats.avg, 26.0);
    }

    #[test]
    fn offline_after_takes_the_larger_of_sampling_multiple_or_default() {
        let short_interval = chrono::Duration::seconds(10);
        let default = chrono::Duration::seconds(300);
        assert_eq!(offline_after(short_interval, default), default);

        let long_interval = chrono::Duration::seconds(120);
        assert_eq!(offline_after(long_interval, default), chrono::Duration::seconds(600));
    }
}
