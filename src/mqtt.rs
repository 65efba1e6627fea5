//! Broker connection setup, topic conventions, and inbound frame shapes.
//!
//! The actual read loop (`eventloop.poll()` in a `tokio::select!`) lives in
//! `main.rs`, matching the reference hub's split: this module owns topic
//! parsing/construction and the reconnect backoff schedule, not the loop
//! itself.

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConnectionSettings;

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A frame handed from the transport to the normalizer/discovery layer.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceCommandPayload {
    pub estado: bool,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "requestedAt")]
    pub requested_at: DateTime<Utc>,
    #[serde(rename = "durationSeconds", skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

// ---------------------------------------------------------------------------
// Topic conventions: "<root>/<hardwareId>/data|sw|status"
// ---------------------------------------------------------------------------

pub fn data_topic(root: &str, hardware_id: &str) -> String {
    format!("{root}/{hardware_id}/data")
}

pub fn command_topic(root: &str, hardware_id: &str) -> String {
    format!("{root}/{hardware_id}/sw")
}

pub fn status_topic(root: &str, hardware_id: &str) -> String {
    format!("{root}/{hardware_id}/status")
}

/// The wildcard subscription that lets Auto-Discovery see every frame in
/// the deployment, known sensor/device topics included.
pub fn discovery_wildcard(root: &str) -> String {
    format!("{root}/+/+")
}

/// Extract the hardware id from a topic ending in `/data`, under `root`.
pub fn parse_data_topic<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    parse_leaf(root, topic, "data")
}

/// Extract the hardware id from a device command topic (`/sw` or `/command`).
pub fn parse_command_topic<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    parse_leaf(root, topic, "sw").or_else(|| parse_leaf(root, topic, "command"))
}

pub fn parse_status_topic<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    parse_leaf(root, topic, "status")
}

fn parse_leaf<'a>(root: &str, topic: &'a str, leaf: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == root && parts[2] == leaf {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

pub fn connect(settings: &ConnectionSettings, client_id: &str, root_topic: &str) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(client_id, &settings.broker_host, settings.broker_port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(false);
    opts.set_last_will(LastWill::new(
        &status_topic(root_topic, "hub"),
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    if let Some((user, pass)) = &settings.broker_credentials {
        opts.set_credentials(user, pass);
    }
    AsyncClient::new(opts, 64)
}

/// Exponential backoff with jitter for the reconnect loop: doubles from
/// `RECONNECT_BASE` up to `RECONNECT_CAP`, jittered +/-25%.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(10);
    let unjittered = RECONNECT_BASE.saturating_mul(1u32 << exponent).min(RECONNECT_CAP);
    let jitter_fraction = fastrand::f64() * 0.5 - 0.25;
    let jittered_ms = (unjittered.as_millis() as f64) * (1.0 + jitter_fraction);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

/// Publish with up to 3 attempts, backing off between retries. Exhausting
/// retries is the caller's cue to consider the device in error.
pub async fn publish_with_retry(
    client: &AsyncClient,
    topic: &str,
    qos: QoS,
    retain: bool,
    payload: Vec<u8>,
) -> Result<(), rumqttc::ClientError> {
    let mut attempt = 0;
    loop {
        match client.publish(topic, qos, retain, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(_) if attempt < 2 => {
                attempt += 1;
                tokio::time::sleep(reconnect_delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
