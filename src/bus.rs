//! In-process publish/subscribe fan-out over a closed set of named topics.
//!
//! One `broadcast` channel per topic. Publishing never blocks the caller;
//! a subscriber that falls behind loses the oldest messages and sees
//! `RecvError::Lagged(n)` on its next `recv()`, which is where the "dropped,
//! logged" behavior surfaces.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::model::{Notification, Reading, RuleExecution};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
    #[serde(rename = "telemetry.updated")]
    TelemetryUpdated(Reading),
    #[serde(rename = "device.state.changed")]
    DeviceStateChanged { device_id: String, status: String },
    #[serde(rename = "rule.triggered")]
    RuleTriggered(RuleExecution),
    #[serde(rename = "notification.created")]
    NotificationCreated(Notification),
    #[serde(rename = "notification.updated")]
    NotificationUpdated(Notification),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error — ingest/rules run fine headless.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a receiver once, logging (not panicking on) a lag gap.
pub async fn recv_lossy(rx: &mut broadcast::Receiver<Event>) -> Option<Event> {
    loop {
        match rx.recv().await {
            Ok(ev) => return Some(ev),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "event bus subscriber lagged — messages dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReadingQuality};
    use chrono::Utc;

    fn sample_reading() -> Reading {
        Reading {
            id: "r1".into(),
            sensor_id: "temhum1".into(),
            received_at: Utc::now(),
            raw: serde_json::json!({"temperatura": 26.2}),
            normalized: serde_json::json!({"temperatura": 26.2}),
            quality: ReadingQuality::Good,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::TelemetryUpdated(sample_reading()));

        let ev = recv_lossy(&mut rx).await.unwrap();
        assert!(matches!(ev, Event::TelemetryUpdated(_)));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::TelemetryUpdated(sample_reading()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_in_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::DeviceStateChanged {
            device_id: "bomba_agua_01".into(),
            status: "ON".into(),
        });
        bus.publish(Event::DeviceStateChanged {
            device_id: "bomba_agua_01".into(),
            status: "OFF".into(),
        });

        for rx in [&mut rx1, &mut rx2] {
            let first = recv_lossy(rx).await.unwrap();
            let second = recv_lossy(rx).await.unwrap();
            match (first, second) {
                (
                    Event::DeviceStateChanged { status: s1, .. },
                    Event::DeviceStateChanged { status: s2, .. },
                ) => {
                    assert_eq!(s1, "ON");
                    assert_eq!(s2, "OFF");
                }
                _ => panic!("unexpected event variant"),
            }
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_after_drop_notice() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(Event::DeviceStateChanged {
                device_id: "d1".into(),
                status: "ON".into(),
            });
        }

        // recv_lossy should still hand back a valid event despite the lag.
        let ev = recv_lossy(&mut rx).await;
        assert!(ev.is_some());
    }
}
