//! The Rules Engine: a tick clock plus an event-driven nudge, evaluating
//! enabled rules in priority order with per-rule single-flight guards and a
//! sliding-window execution cap.
//!
//! Same guard-check sequence before acting on every tick: already-in-flight,
//! rate-limited, then the actual condition check, with every decision logged
//! into `SharedState`. Rules are stateless between ticks — all cooldown and
//! single-flight bookkeeping lives in `state.rs`, not in a per-rule struct.

use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};
use uuid::Uuid;

use crate::actuator::Actuator;
use crate::bus::{recv_lossy, Event, EventBus};
use crate::conditions::evaluate;
use crate::db::Db;
use crate::error::CoreResult;
use crate::model::{Action, ActionOutcome, ActionOutcomeKind, Rule, RuleExecution};
use crate::notifier::Notifier;
use crate::state::SharedState;

pub struct RulesEngine {
    db: Db,
    bus: EventBus,
    state: SharedState,
    actuator: Actuator,
    notifier: Notifier,
    timezone_offset_minutes: i32,
}

impl RulesEngine {
    pub fn new(
        db: Db,
        bus: EventBus,
        state: SharedState,
        actuator: Actuator,
        notifier: Notifier,
        timezone_offset_minutes: i32,
    ) -> Self {
        Self {
            db,
            bus,
            state,
            actuator,
            notifier,
            timezone_offset_minutes,
        }
    }

    /// Runs until `shutdown` reports a change. Wakes on its own tick
    /// interval and on telemetry/device events so a rule doesn't have to
    /// wait a full tick to react to a reading that just arrived.
    pub async fn run(
        self,
        evaluation_period: std::time::Duration,
        mut events: broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(evaluation_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_all().await;
                }
                event = recv_lossy(&mut events) => {
                    match event {
                        Some(Event::TelemetryUpdated(_)) | Some(Event::DeviceStateChanged { .. }) => {
                            self.evaluate_all().await;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    pub async fn evaluate_all(&self) {
        let rules = match self.db.list_enabled_rules().await {
            Ok(r) => r,
            Err(e) => {
                error!("failed to load enabled rules: {e}");
                return;
            }
        };

        let mut candidates = rules;
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.last_triggered_at.cmp(&b.last_triggered_at)));

        for rule in &candidates {
            self.evaluate_one(rule).await;
        }
    }

    async fn evaluate_one(&self, rule: &Rule) {
        if !cooldown_elapsed(rule) {
            return;
        }

        if !self.state.write().await.try_acquire_rule_guard(&rule.id) {
            return;
        }

        let outcome = self.run_rule(rule).await;
        self.state.write().await.release_rule_guard(&rule.id);

        if let Err(e) = outcome {
            error!(rule = %rule.name, "rule evaluation failed: {e}");
        }
    }

    async fn run_rule(&self, rule: &Rule) -> CoreResult<()> {
        if let Some(cap) = rule.max_executions_per_hour {
            let count = self.state.read().await.executions_last_hour(&rule.id) as i64;
            if count >= cap {
                return Ok(());
            }
        }

        let now = Utc::now();
        let started = Instant::now();
        let matched = evaluate(&rule.conditions, &self.db, now, self.timezone_offset_minutes).await;
        if !matched {
            return Ok(());
        }

        let mut outcomes = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            outcomes.push(self.execute_action(rule, action).await);
        }
        let all_succeeded = outcomes.iter().all(|o| o.kind == ActionOutcomeKind::Success);

        let execution = RuleExecution {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            triggered_at: now,
            success: all_succeeded,
            elapsed_ms: started.elapsed().as_millis() as i64,
            trigger_data: serde_json::json!({ "conditions": rule.conditions }),
            evaluation_result: true,
            actions_executed: outcomes,
            error_message: None,
        };

        self.db.insert_rule_execution(&execution).await?;
        self.db.record_rule_trigger(&rule.id, now).await?;
        self.state.write().await.record_trigger_and_count_last_hour(&rule.id);
        self.state
            .write()
            .await
            .record_rule_event(format!("{}: triggered ({} action(s))", rule.name, rule.actions.len()));
        self.bus.publish(Event::RuleTriggered(execution));

        Ok(())
    }

    /// Fire a rule's actions immediately, bypassing condition evaluation.
    /// Cooldown and the hourly execution cap still apply — an operator
    /// forcing a rule shouldn't be able to blow past its own safety limits.
    pub async fn trigger_manually(&self, rule_id: &str) -> CoreResult<Option<RuleExecution>> {
        let Some(rule) = self.db.get_rule(rule_id).await? else {
            return Ok(None);
        };

        if !cooldown_elapsed(&rule) {
            warn!(rule = %rule.name, "manual trigger ignored — cooldown not elapsed");
            return Ok(None);
        }
        if !self.state.write().await.try_acquire_rule_guard(&rule.id) {
            return Ok(None);
        }

        let now = Utc::now();
        let started = Instant::now();
        let executions_last_hour = self.state.read().await.executions_last_hour(&rule.id) as i64;
        let should_skip_cap = rule
            .max_executions_per_hour
            .is_some_and(|cap| executions_last_hour >= cap);

        let execution = if should_skip_cap {
            self.state.write().await.release_rule_guard(&rule.id);
            None
        } else {
            let mut outcomes = Vec::with_capacity(rule.actions.len());
            for action in &rule.actions {
                outcomes.push(self.execute_action(&rule, action).await);
            }
            let all_succeeded = outcomes.iter().all(|o| o.kind == ActionOutcomeKind::Success);

            let execution = RuleExecution {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                triggered_at: now,
                success: all_succeeded,
                elapsed_ms: started.elapsed().as_millis() as i64,
                trigger_data: serde_json::json!({ "manual": true }),
                evaluation_result: true,
                actions_executed: outcomes,
                error_message: None,
            };

            self.db.insert_rule_execution(&execution).await?;
            self.db.record_rule_trigger(&rule.id, now).await?;
            self.state.write().await.record_trigger_and_count_last_hour(&rule.id);
            self.state.write().await.release_rule_guard(&rule.id);
            self.bus.publish(Event::RuleTriggered(execution.clone()));
            Some(execution)
        };

        Ok(execution)
    }

    async fn execute_action(&self, rule: &Rule, action: &Action) -> ActionOutcome {
        match action {
            Action::DeviceControl {
                device_ref,
                verb,
                value,
                duration_seconds,
            } => {
                self.actuator
                    .control_device(&self.db, &self.bus, &self.state, device_ref, *verb, *value, *duration_seconds)
                    .await
            }
            Action::Notification { .. } => self.notifier.send(&self.db, &self.bus, rule, action).await,
            Action::Webhook { .. } => self.notifier.send(&self.db, &self.bus, rule, action).await,
            Action::RuleDisable => match self.db.set_rule_enabled(&rule.id, false).await {
                Ok(()) => ActionOutcome {
                    kind: ActionOutcomeKind::Success,
                    detail: "rule disabled".into(),
                },
                Err(e) => ActionOutcome {
                    kind: ActionOutcomeKind::Failed,
                    detail: e.to_string(),
                },
            },
        }
    }
}

fn cooldown_elapsed(rule: &Rule) -> bool {
    match rule.last_triggered_at {
        Some(last) => (Utc::now() - last).num_seconds() >= rule.cooldown_seconds,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompareOp, Condition, DeviceKind, DeviceStatus, SensorKind};
    use rumqttc::AsyncClient;

    async fn harness() -> (Db, EventBus, SharedState, RulesEngine) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let bus = EventBus::new();
        let state: SharedState = std::sync::Arc::new(tokio::sync::RwLock::new(crate::state::SystemState::new()));
        let (client, _eventloop) = AsyncClient::new(rumqttc::MqttOptions::new("test", "127.0.0.1", 1883), 16);
        let notifier = Notifier::new(None, None, 1);
        let actuator = Actuator::new(client, notifier.clone(), std::time::Duration::from_secs(10));
        let engine = RulesEngine::new(db.clone(), bus.clone(), state.clone(), actuator, notifier, 0);
        (db, bus, state, engine)
    }

    fn always_true_rule(id: &str, cooldown: i64, cap: Option<i64>) -> Rule {
        Rule {
            id: id.into(),
            name: format!("rule-{id}"),
            description: None,
            enabled: true,
            priority: 0,
            cooldown_seconds: cooldown,
            max_executions_per_hour: cap,
            conditions: Condition::And(vec![]),
            actions: vec![Action::RuleDisable],
            last_triggered_at: None,
            trigger_count: 0,
            created_by: "test".into(),
        }
    }

    #[tokio::test]
    async fn matching_rule_executes_and_records_trigger() {
        let (db, _bus, _state, engine) = harness().await;
        let rule = always_true_rule("r1", 0, None);
        db.create_rule(&rule).await.unwrap();

        engine.evaluate_all().await;

        let stored = db.get_rule("r1").await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.trigger_count, 1);
    }

    #[tokio::test]
    async fn cooldown_blocks_second_evaluation_within_window() {
        let (db, _bus, _state, engine) = harness().await;
        let mut rule = always_true_rule("r1", 3600, None);
        rule.actions = vec![];
        db.create_rule(&rule).await.unwrap();

        engine.evaluate_all().await;
        let after_first = db.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(after_first.trigger_count, 1);

        engine.evaluate_all().await;
        let after_second = db.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(after_second.trigger_count, 1, "cooldown should have blocked a second trigger");
    }

    #[tokio::test]
    async fn disabled_rule_is_never_selected() {
        let (db, _bus, _state, engine) = harness().await;
        let mut rule = always_true_rule("r1", 0, None);
        rule.enabled = false;
        db.create_rule(&rule).await.unwrap();

        engine.evaluate_all().await;

        let stored = db.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(stored.trigger_count, 0);
    }

    #[tokio::test]
    async fn device_condition_gates_on_authoritative_state() {
        let (db, _bus, _state, engine) = harness().await;
        db.upsert_device_config("bomba_agua_01", "Pump", "WATER_PUMP", "Invernadero/Bomba/sw", "Invernadero/Bomba/status", true, serde_json::json!({}))
            .await
            .unwrap();
        let device = db.get_device_by_status_topic("Invernadero/Bomba/status").await.unwrap().unwrap();

        let mut rule = always_true_rule("r1", 0, None);
        rule.actions = vec![];
        rule.conditions = Condition::Device {
            device_ref: device.id.clone(),
            state_equals: DeviceStatus::On,
        };
        db.create_rule(&rule).await.unwrap();

        engine.evaluate_all().await;
        assert_eq!(db.get_rule("r1").await.unwrap().unwrap().trigger_count, 0);

        db.update_device_status(&device.id, DeviceStatus::On, true).await.unwrap();
        engine.evaluate_all().await;
        assert_eq!(db.get_rule("r1").await.unwrap().unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn sensor_condition_reacts_to_a_fresh_reading() {
        let (db, _bus, _state, engine) = harness().await;
        let sensor = db
            .create_sensor("temhum1", "TemHum", SensorKind::Temhum, "Invernadero/TemHum1/data", serde_json::json!({}))
            .await
            .unwrap();

        let mut rule = always_true_rule("r1", 0, None);
        rule.actions = vec![];
        rule.conditions = Condition::Sensor {
            sensor_ref: sensor.id.clone(),
            field: "temperatura".into(),
            operator: CompareOp::Gt,
            value: serde_json::json!(30.0),
            max_age_seconds: 300,
        };
        db.create_rule(&rule).await.unwrap();

        engine.evaluate_all().await;
        assert_eq!(db.get_rule("r1").await.unwrap().unwrap().trigger_count, 0);

        db.insert_reading(
            &sensor.id,
            &serde_json::json!({"temperatura": 34.0}),
            &serde_json::json!({"temperatura": 34.0}),
            crate::model::ReadingQuality::Good,
        )
        .await
        .unwrap();

        engine.evaluate_all().await;
        assert_eq!(db.get_rule("r1").await.unwrap().unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn manual_trigger_bypasses_conditions_but_respects_hourly_cap() {
        let (db, _bus, state, engine) = harness().await;
        let mut rule = always_true_rule("r1", 0, Some(1));
        rule.conditions = Condition::Or(vec![]);
        rule.actions = vec![];
        db.create_rule(&rule).await.unwrap();

        state.write().await.record_trigger_and_count_last_hour("r1");

        let result = engine.trigger_manually("r1").await.unwrap();
        assert!(result.is_none(), "hourly cap should block a manual trigger too");
    }

    #[tokio::test]
    async fn unknown_rule_id_returns_none() {
        let (_db, _bus, _state, engine) = harness().await;
        assert!(engine.trigger_manually("ghost").await.unwrap().is_none());
    }
}
