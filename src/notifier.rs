//! Notification templating and outbound delivery.
//!
//! The retry/backoff idiom is carried over from `mqtt::publish_with_retry`
//! (bounded attempts, exponential backoff between them); the HTTP client
//! itself (`reqwest`, json feature) handles webhook delivery.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use tracing::warn;
use uuid::Uuid;

use crate::bus::{Event, EventBus};
use crate::db::Db;
use crate::error::CoreResult;
use crate::model::{Action, ActionOutcome, ActionOutcomeKind, Channel, DeliveryStatus, Device, Notification, Rule, Severity};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Notifier {
    http: Client,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    retry_count: u32,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>, webhook_secret: Option<String>, retry_count: u32) -> Self {
        Self {
            http: Client::builder().timeout(WEBHOOK_TIMEOUT).build().unwrap_or_default(),
            webhook_url,
            webhook_secret,
            retry_count,
        }
    }

    /// Dispatch a `Notification` or `Webhook` action: render the template,
    /// persist a Notification row, attempt delivery on every requested
    /// channel, and report the worst-case outcome.
    pub async fn send(&self, db: &Db, bus: &EventBus, rule: &Rule, action: &Action) -> ActionOutcome {
        match action {
            Action::Notification {
                template_ref,
                title,
                body_template,
                severity,
                channels,
                variables,
            } => {
                self.send_notification(db, bus, rule, template_ref.as_deref(), title, body_template, *severity, channels, variables)
                    .await
            }
            Action::Webhook { url, payload_template } => self.send_raw_webhook(url, payload_template, seed_well_known(rule, &HashMap::new())).await,
            _ => ActionOutcome {
                kind: ActionOutcomeKind::Failed,
                detail: "notifier invoked with a non-notification action".into(),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_notification(
        &self,
        db: &Db,
        bus: &EventBus,
        rule: &Rule,
        template_ref: Option<&str>,
        title: &str,
        body_template: &str,
        severity: Severity,
        channels: &[Channel],
        variables: &HashMap<String, String>,
    ) -> ActionOutcome {
        let seeded = seed_well_known(rule, variables);
        let body = render_template(body_template, &seeded);
        let title = render_template(title, &seeded);

        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            title,
            body,
            kind: template_ref.unwrap_or("rule").to_string(),
            severity,
            channel: channels.first().copied().unwrap_or(Channel::Webhook),
            recipient_user_id: None,
            source: format!("rule:{}", rule.id),
            delivery_status: DeliveryStatus::Pending,
            is_read: false,
            created_at: chrono::Utc::now(),
            read_at: None,
            delivered_at: None,
            template_id: None,
        };

        self.dispatch_notification(db, bus, notification, channels).await
    }

    /// Companion Notification for a device-control action whose device has
    /// `notificationsEnabled` set — no rule or template is involved, so this
    /// builds and dispatches the `Notification` row directly, on the
    /// `Webhook` channel only (the only channel with a concrete transport).
    pub async fn notify_device_state_change(&self, db: &Db, bus: &EventBus, device: &Device, status_label: &str) -> ActionOutcome {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            title: format!("{} state changed", device.name),
            body: format!("{} is now {status_label}", device.name),
            kind: "device_state_change".to_string(),
            severity: Severity::Low,
            channel: Channel::Webhook,
            recipient_user_id: None,
            source: format!("device:{}", device.hardware_id),
            delivery_status: DeliveryStatus::Pending,
            is_read: false,
            created_at: chrono::Utc::now(),
            read_at: None,
            delivered_at: None,
            template_id: None,
        };

        self.dispatch_notification(db, bus, notification, &[Channel::Webhook]).await
    }

    /// Persist, deliver over every requested channel, and record the
    /// resulting delivery status — shared by rule-triggered notifications
    /// and the device-control companion notification.
    async fn dispatch_notification(&self, db: &Db, bus: &EventBus, mut notification: Notification, channels: &[Channel]) -> ActionOutcome {
        if let Err(e) = db.create_notification(&notification).await {
            return failed(format!("failed to persist notification: {e}"));
        }
        bus.publish(Event::NotificationCreated(notification.clone()));

        let mut any_delivered = false;
        for channel in channels {
            match channel {
                Channel::Webhook => {
                    if self.deliver_webhook(&notification).await.is_ok() {
                        any_delivered = true;
                    }
                }
                // Email/Telegram/Push have no concrete transport in this
                // deployment's scope; they're accepted and logged, not sent.
                Channel::Email | Channel::Telegram | Channel::Push => {
                    warn!(channel = ?channel, "notification channel has no configured transport, skipping delivery");
                }
            }
        }

        let status = if any_delivered { DeliveryStatus::Sent } else { DeliveryStatus::Failed };
        if let Err(e) = db.update_delivery_status(&notification.id, status).await {
            return failed(format!("failed to record delivery status: {e}"));
        }
        notification.delivery_status = status;
        bus.publish(Event::NotificationUpdated(notification));

        if any_delivered {
            ActionOutcome {
                kind: ActionOutcomeKind::Success,
                detail: "notification delivered".into(),
            }
        } else {
            failed("no notification channel accepted delivery".into())
        }
    }

    async fn deliver_webhook(&self, notification: &Notification) -> CoreResult<()> {
        let payload = serde_json::json!({
            "title": notification.title,
            "message": notification.body,
            "severity": notification.severity,
            "kind": notification.kind,
            "source": notification.source,
            "createdAt": notification.created_at,
        });
        self.post_with_retry(&payload).await
    }

    async fn send_raw_webhook(&self, url: &str, payload_template: &str, variables: HashMap<String, String>) -> ActionOutcome {
        let rendered = render_template(payload_template, &variables);
        let body: serde_json::Value = serde_json::from_str(&rendered).unwrap_or(serde_json::Value::String(rendered));

        let mut attempt = 0;
        loop {
            let mut req = self.http.post(url).json(&body);
            if let Some(secret) = &self.webhook_secret {
                req = req.header("X-Webhook-Secret", secret);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return ActionOutcome {
                        kind: ActionOutcomeKind::Success,
                        detail: format!("webhook delivered to {url}"),
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= self.retry_count {
                        return failed(format!("webhook returned {status}"));
                    }
                }
                Err(e) => {
                    if attempt >= self.retry_count {
                        return failed(format!("webhook request failed: {e}"));
                    }
                }
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(1000 * 2u64.pow(attempt))).await;
        }
    }

    async fn post_with_retry(&self, payload: &serde_json::Value) -> CoreResult<()> {
        let Some(url) = &self.webhook_url else {
            return Err(crate::error::CoreError::NotificationChannelFailed("no webhook_url configured".into()));
        };

        let mut attempt = 0;
        loop {
            let mut req = self.http.post(url).json(payload);
            if let Some(secret) = &self.webhook_secret {
                req = req.header("X-Webhook-Secret", secret);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if attempt < self.retry_count => {
                    warn!(status = %resp.status(), attempt, "webhook delivery retrying");
                }
                Ok(resp) => return Err(crate::error::CoreError::NotificationChannelFailed(resp.status().to_string())),
                Err(e) if attempt < self.retry_count => {
                    warn!(attempt, "webhook delivery retrying after error: {e}");
                }
                Err(e) => return Err(crate::error::CoreError::NotificationChannelFailed(e.to_string())),
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(1000 * 2u64.pow(attempt))).await;
        }
    }
}

/// Seed the reserved template variables (`ruleId`, `ruleName`, `timestamp`)
/// on top of whatever the rule's own variable map already carries.
/// `timestamp` always resolves to the current instant — callers never get to
/// leave a literal `{{timestamp}}` in a rendered notification, and a stale
/// caller-supplied value is overwritten rather than trusted.
fn seed_well_known(rule: &Rule, variables: &HashMap<String, String>) -> HashMap<String, String> {
    let mut vars = variables.clone();
    vars.entry("ruleId".to_string()).or_insert_with(|| rule.id.clone());
    vars.entry("ruleName".to_string()).or_insert_with(|| rule.name.clone());
    vars.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
    vars
}

/// `{{var}}` substitution against the supplied variable map; an unmatched
/// placeholder is left verbatim rather than erroring, since a notification
/// still carries useful information even with one stale variable name.
fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in variables {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
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

    #[test]
    fn render_template_substitutes_known_variables() {
        let mut vars = HashMap::new();
        vars.insert("temp".to_string(), "34.0".to_string());
        let out = render_template("Temperature is {{temp}} degrees", &vars);
        assert_eq!(out, "Temperature is 34.0 degrees");
    }

    #[test]
    fn render_template_leaves_unknown_placeholder_untouched() {
        let vars = HashMap::new();
        let out = render_template("Value: {{missing}}", &vars);
        assert_eq!(out, "Value: {{missing}}");
    }

    fn test_rule() -> Rule {
        Rule {
            id: "r1".into(),
            name: "test rule".into(),
            description: None,
            enabled: true,
            priority: 0,
            cooldown_seconds: 0,
            max_executions_per_hour: None,
            conditions: crate::model::Condition::And(vec![]),
            actions: vec![],
            last_triggered_at: None,
            trigger_count: 0,
            created_by: "test".into(),
        }
    }

    #[test]
    fn seed_well_known_injects_timestamp_and_rule_identity() {
        let rule = test_rule();
        let vars = seed_well_known(&rule, &HashMap::new());
        assert_eq!(vars.get("ruleId").unwrap(), "r1");
        assert_eq!(vars.get("ruleName").unwrap(), "test rule");
        let rendered = render_template("at {{timestamp}}", &vars);
        assert!(!rendered.contains("{{timestamp}}"), "timestamp must resolve to a real instant");
    }

    #[test]
    fn seed_well_known_overwrites_a_stale_caller_supplied_timestamp() {
        let rule = test_rule();
        let mut caller_vars = HashMap::new();
        caller_vars.insert("timestamp".to_string(), "{{timestamp}}".to_string());
        caller_vars.insert("deviceName".to_string(), "Bomba".to_string());
        let vars = seed_well_known(&rule, &caller_vars);
        assert_ne!(vars.get("timestamp").unwrap(), "{{timestamp}}");
        assert_eq!(vars.get("deviceName").unwrap(), "Bomba");
    }

    #[tokio::test]
    async fn notification_without_webhook_configured_is_marked_failed() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let bus = EventBus::new();
        let notifier = Notifier::new(None, None, 0);

        let rule = Rule {
            id: "r1".into(),
            name: "test rule".into(),
            description: None,
            enabled: true,
            priority: 0,
            cooldown_seconds: 0,
            max_executions_per_hour: None,
            conditions: crate::model::Condition::And(vec![]),
            actions: vec![],
            last_triggered_at: None,
            trigger_count: 0,
            created_by: "test".into(),
        };

        let action = Action::Notification {
            template_ref: None,
            title: "Alert".into(),
            body_template: "something happened".into(),
            severity: Severity::High,
            channels: vec![Channel::Webhook],
            variables: HashMap::new(),
        };

        let outcome = notifier.send(&db, &bus, &rule, &action).await;
        assert_eq!(outcome.kind, ActionOutcomeKind::Failed);

        let (notifications, _) = db.list_notifications(None, 10, false).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].delivery_status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn email_channel_is_accepted_but_not_delivered() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let bus = EventBus::new();
        let notifier = Notifier::new(None, None, 0);

        let rule = Rule {
            id: "r1".into(),
            name: "test rule".into(),
            description: None,
            enabled: true,
            priority: 0,
            cooldown_seconds: 0,
            max_executions_per_hour: None,
            conditions: crate::model::Condition::And(vec![]),
            actions: vec![],
            last_triggered_at: None,
            trigger_count: 0,
            created_by: "test".into(),
        };

        let action = Action::Notification {
            template_ref: None,
            title: "Alert".into(),
            body_template: "something happened".into(),
            severity: Severity::Low,
            channels: vec![Channel::Email],
            variables: HashMap::new(),
        };

        let outcome = notifier.send(&db, &bus, &rule, &action).await;
        assert_eq!(outcome.kind, ActionOutcomeKind::Failed);
    }
}
