//! Translates a `DeviceControl` action into an outbound MQTT command and
//! applies the optimistic state update; a later status-topic reply then
//! either confirms or overrides that guess.
//!
//! Follows the same optimistic-update-then-publish-then-reconcile shape as
//! device control elsewhere in this core, built on `mqtt::publish_with_retry`'s
//! retry idiom, generalized to the full `ActuationVerb` set with request-id
//! correlation.

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{Event, EventBus};
use crate::db::Db;
use crate::model::{ActionOutcome, ActionOutcomeKind, ActuationVerb, Device, DeviceStatus};
use crate::mqtt::{publish_with_retry, DeviceCommandPayload};
use crate::normalize::normalize_command_payload;
use crate::notifier::Notifier;
use crate::state::SharedState;

pub struct Actuator {
    client: AsyncClient,
    notifier: Notifier,
    ack_timeout: Duration,
}

impl Actuator {
    pub fn new(client: AsyncClient, notifier: Notifier, ack_timeout: Duration) -> Self {
        Self {
            client,
            notifier,
            ack_timeout,
        }
    }

    /// Resolve and send a `DeviceControl` action. Returns a `Failed` outcome
    /// rather than an error for anything a rule author can act on (unknown
    /// device, offline device, publish failure) — the Rules Engine logs the
    /// outcome either way and moves on.
    pub async fn control_device(
        &self,
        db: &Db,
        bus: &EventBus,
        state: &SharedState,
        device_ref: &str,
        verb: ActuationVerb,
        value: Option<f64>,
        duration_seconds: Option<i64>,
    ) -> ActionOutcome {
        let device = match db.get_device(device_ref).await {
            Ok(Some(d)) => d,
            Ok(None) => return failed(format!("unknown device: {device_ref}")),
            Err(e) => return failed(format!("device lookup failed: {e}")),
        };

        let estado = match desired_estado(verb, &device, value) {
            Some(v) => v,
            None => return failed(format!("verb {verb:?} requires a value")),
        };

        let payload = DeviceCommandPayload {
            estado,
            request_id: Uuid::new_v4().to_string(),
            requested_at: chrono::Utc::now(),
            duration_seconds,
            value,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => return failed(format!("failed to encode command: {e}")),
        };

        if let Err(e) = publish_with_retry(&self.client, &device.mqtt_command_topic, QoS::AtLeastOnce, false, body).await
        {
            warn!(device = %device.hardware_id, "command publish failed: {e}");
            state
                .write()
                .await
                .record_error(format!("{}: command publish failed: {e}", device.hardware_id));
            return failed(format!("publish failed: {e}"));
        }

        let optimistic_status = if estado { DeviceStatus::On } else { DeviceStatus::Off };
        if let Err(e) = db.update_device_status(&device.id, optimistic_status, false).await {
            return failed(format!("optimistic state update failed: {e}"));
        }

        let status_str = status_label(optimistic_status);
        bus.publish(Event::DeviceStateChanged {
            device_id: device.id.clone(),
            status: status_str.to_string(),
        });
        state
            .write()
            .await
            .record_device_event(format!("{}: commanded {status_str} (unconfirmed)", device.hardware_id));

        if device.notifications_enabled {
            let outcome = self.notifier.notify_device_state_change(db, bus, &device, status_str).await;
            if outcome.kind != ActionOutcomeKind::Success {
                warn!(device = %device.hardware_id, "companion notification failed: {}", outcome.detail);
            }
        }

        if let Some(secs) = duration_seconds.filter(|s| *s > 0) {
            spawn_reverse_command(
                self.client.clone(),
                db.clone(),
                bus.clone(),
                state.clone(),
                device.clone(),
                estado,
                Duration::from_secs(secs as u64),
            );
        }

        spawn_ack_watchdog(db.clone(), bus.clone(), state.clone(), self.notifier.clone(), device.clone(), self.ack_timeout);

        ActionOutcome {
            kind: ActionOutcomeKind::Success,
            detail: format!("sent {status_str} to {}", device.hardware_id),
        }
    }

    /// Apply the authoritative status reported on a device's status topic,
    /// overriding whatever the optimistic update guessed.
    pub async fn handle_status_reply(
        &self,
        db: &Db,
        bus: &EventBus,
        state: &SharedState,
        status_topic: &str,
        payload: &[u8],
    ) {
        let Ok(Some(device)) = db.get_device_by_status_topic(status_topic).await else {
            return;
        };

        let raw: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                state
                    .write()
                    .await
                    .record_error(format!("{}: invalid status payload: {e}", device.hardware_id));
                return;
            }
        };

        let desired = match normalize_command_payload(&raw) {
            Ok(d) => d,
            Err(e) => {
                state.write().await.record_error(format!("{}: {e}", device.hardware_id));
                return;
            }
        };

        let confirmed_status = if desired.estado { DeviceStatus::On } else { DeviceStatus::Off };
        if let Err(e) = db.update_device_status(&device.id, confirmed_status, true).await {
            state
                .write()
                .await
                .record_error(format!("{}: status update failed: {e}", device.hardware_id));
            return;
        }

        let status_str = status_label(confirmed_status);
        bus.publish(Event::DeviceStateChanged {
            device_id: device.id.clone(),
            status: status_str.to_string(),
        });
        state
            .write()
            .await
            .record_device_event(format!("{}: confirmed {status_str}", device.hardware_id));
    }
}

/// Publish the reverse of `current_estado` once `after` elapses, completing
/// the `durationSeconds` round-trip (`OFF→ON→OFF`) without waiting on a
/// status-topic reply.
fn spawn_reverse_command(client: AsyncClient, db: Db, bus: EventBus, state: SharedState, device: Device, current_estado: bool, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;

        let reverse_estado = !current_estado;
        let payload = DeviceCommandPayload {
            estado: reverse_estado,
            request_id: Uuid::new_v4().to_string(),
            requested_at: chrono::Utc::now(),
            duration_seconds: None,
            value: None,
        };
        let Ok(body) = serde_json::to_vec(&payload) else { return };

        if let Err(e) = publish_with_retry(&client, &device.mqtt_command_topic, QoS::AtLeastOnce, false, body).await {
            warn!(device = %device.hardware_id, "reverse command publish failed: {e}");
            state
                .write()
                .await
                .record_error(format!("{}: reverse command publish failed: {e}", device.hardware_id));
            return;
        }

        let status = if reverse_estado { DeviceStatus::On } else { DeviceStatus::Off };
        if db.update_device_status(&device.id, status, false).await.is_ok() {
            let status_str = status_label(status);
            bus.publish(Event::DeviceStateChanged {
                device_id: device.id.clone(),
                status: status_str.to_string(),
            });
            state
                .write()
                .await
                .record_device_event(format!("{}: reverse-commanded {status_str} after durationSeconds elapsed", device.hardware_id));
        }
    });
}

/// If no status-topic reply confirms the command within `ack_timeout`, mark
/// the device `ERROR` and publish — the device's own `status_confirmed` flag
/// is the signal: a reply (for this command or a later one) flips it back to
/// `true` before the watchdog fires.
fn spawn_ack_watchdog(db: Db, bus: EventBus, state: SharedState, notifier: Notifier, device: Device, ack_timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ack_timeout).await;

        let Ok(Some(current)) = db.get_device(&device.id).await else { return };
        if current.status_confirmed {
            return;
        }
        if db.update_device_status(&current.id, DeviceStatus::Error, true).await.is_err() {
            return;
        }

        bus.publish(Event::DeviceStateChanged {
            device_id: current.id.clone(),
            status: "ERROR".to_string(),
        });
        state
            .write()
            .await
            .record_error(format!("{}: no status reply within {ack_timeout:?}, marked ERROR", current.hardware_id));

        if current.notifications_enabled {
            let _ = notifier.notify_device_state_change(&db, &bus, &current, "ERROR").await;
        }
    });
}

fn desired_estado(verb: ActuationVerb, device: &Device, value: Option<f64>) -> Option<bool> {
    match verb {
        ActuationVerb::TurnOn => Some(true),
        ActuationVerb::TurnOff => Some(false),
        ActuationVerb::Toggle => Some(device.status != DeviceStatus::On),
        ActuationVerb::Set => value.map(|_| true),
    }
}

fn status_label(status: DeviceStatus) -> &'static str {
    match status {
        DeviceStatus::On => "ON",
        DeviceStatus::Off => "OFF",
        DeviceStatus::Offline => "OFFLINE",
        DeviceStatus::Error => "ERROR",
        DeviceStatus::Maintenance => "MAINTENANCE",
    }
}

fn failed(detail: String) -> ActionOutcome {
    ActionOutcome {
        kind: ActionOutcomeKind::Failed,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceKind;

    async fn seeded() -> (Db, EventBus, SharedState) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        (db, EventBus::new(), std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new())))
    }

    fn sample_device() -> Device {
        Device {
            id: "d1".into(),
            hardware_id: "bomba_agua_01".into(),
            name: "Water pump".into(),
            kind: DeviceKind::WaterPump,
            mqtt_command_topic: "Invernadero/Bomba/sw".into(),
            mqtt_status_topic: "Invernadero/Bomba/status".into(),
            status: DeviceStatus::Off,
            status_confirmed: true,
            notifications_enabled: true,
            configuration: serde_json::json!({}),
            owner_id: None,
            last_seen: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn turn_on_always_resolves_to_true() {
        let device = sample_device();
        assert_eq!(desired_estado(ActuationVerb::TurnOn, &device, None), Some(true));
    }

    #[test]
    fn toggle_flips_current_state() {
        let mut device = sample_device();
        device.status = DeviceStatus::On;
        assert_eq!(desired_estado(ActuationVerb::Toggle, &device, None), Some(false));
        device.status = DeviceStatus::Off;
        assert_eq!(desired_estado(ActuationVerb::Toggle, &device, None), Some(true));
    }

    #[test]
    fn set_without_a_value_is_rejected() {
        let device = sample_device();
        assert_eq!(desired_estado(ActuationVerb::Set, &device, None), None);
    }

    fn test_actuator() -> Actuator {
        let (client, _eventloop) = AsyncClient::new(rumqttc::MqttOptions::new("test", "127.0.0.1", 1883), 8);
        let notifier = Notifier::new(None, None, 0);
        Actuator::new(client, notifier, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn control_device_fails_cleanly_for_unknown_device() {
        let (db, bus, state) = seeded().await;
        let actuator = test_actuator();
        let outcome = actuator
            .control_device(&db, &bus, &state, "does-not-exist", ActuationVerb::TurnOn, None, None)
            .await;
        assert_eq!(outcome.kind, ActionOutcomeKind::Failed);
    }

    #[tokio::test]
    async fn ack_watchdog_marks_device_error_when_no_reply_arrives() {
        let (db, bus, state) = seeded().await;
        db.upsert_device_config(
            "bomba_agua_01",
            "Water pump",
            "WATER_PUMP",
            "Invernadero/Bomba/sw",
            "Invernadero/Bomba/status",
            false,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        let device = db.get_device_by_status_topic("Invernadero/Bomba/status").await.unwrap().unwrap();

        spawn_ack_watchdog(db.clone(), bus.clone(), state.clone(), Notifier::new(None, None, 0), device.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let updated = db.get_device(&device.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DeviceStatus::Error);
        assert!(updated.status_confirmed);
    }

    #[tokio::test]
    async fn ack_watchdog_is_a_no_op_once_a_reply_confirms_status() {
        let (db, bus, state) = seeded().await;
        db.upsert_device_config(
            "bomba_agua_01",
            "Water pump",
            "WATER_PUMP",
            "Invernadero/Bomba/sw",
            "Invernadero/Bomba/status",
            false,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        let device = db.get_device_by_status_topic("Invernadero/Bomba/status").await.unwrap().unwrap();
        db.update_device_status(&device.id, DeviceStatus::On, true).await.unwrap();

        spawn_ack_watchdog(db.clone(), bus.clone(), state.clone(), Notifier::new(None, None, 0), device.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let updated = db.get_device(&device.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DeviceStatus::On);
    }

    #[tokio::test]
    async fn reverse_command_flips_status_after_duration_elapses() {
        let (db, bus, state) = seeded().await;
        db.upsert_device_config(
            "bomba_agua_01",
            "Water pump",
            "WATER_PUMP",
            "Invernadero/Bomba/sw",
            "Invernadero/Bomba/status",
            false,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        let device = db.get_device_by_status_topic("Invernadero/Bomba/status").await.unwrap().unwrap();
        db.update_device_status(&device.id, DeviceStatus::On, false).await.unwrap();

        let (client, _eventloop) = AsyncClient::new(rumqttc::MqttOptions::new("test", "127.0.0.1", 1883), 8);
        spawn_reverse_command(client, db.clone(), bus, state, device.clone(), true, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let updated = db.get_device(&device.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DeviceStatus::Off);
    }
}
