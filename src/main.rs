//! Core entry point: reads env/config, connects to MQTT and SQLite, wires up
//! ingestion, auto-discovery, the rules engine, actuation, notification
//! delivery, and the health endpoint.
//!
//! Safety/operational features:
//! - MQTT re-subscribe on every reconnect, `LastWill` announces the hub offline
//! - Exponential backoff with jitter on publish/connect errors
//! - Telemetry payload size/shape validation before it ever reaches the Store
//! - Sensor/device liveness sweeping independent of the MQTT connection state
//! - Data retention: periodic pruning of old readings
//! - Periodic database backup for single-board deployments

mod actuator;
mod api;
mod bus;
mod conditions;
mod config;
mod db;
mod discovery;
mod error;
mod health;
mod ingest;
mod model;
mod mqtt;
mod normalize;
mod notifier;
mod rules;
mod state;

use anyhow::Result;
use rumqttc::{Event as MqttEvent, Packet, QoS};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};

use actuator::Actuator;
use bus::EventBus;
use db::Db;
use mqtt::InboundFrame;
use notifier::Notifier;
use rules::RulesEngine;
use state::SystemState;

/// Data retention pruning interval.
const PRUNE_INTERVAL_SEC: u64 = 6 * 3600;

/// Default retention period for readings.
const READING_RETENTION_DEFAULT: chrono::Duration = chrono::Duration::days(90);

/// Rule executions and read notifications are retained longer since they're
/// small rows kept mostly for audit history.
const AUDIT_RETENTION_DEFAULT: chrono::Duration = chrono::Duration::days(180);

/// How often the liveness sweeper checks for stale sensors.
const LIVENESS_SWEEP_INTERVAL_SEC: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let conn = config::load_connection_settings();
    let db_backup_path = env::var("DB_BACKUP_PATH").ok().filter(|s| !s.is_empty());
    let db_backup_interval: u64 = env::var("DB_BACKUP_INTERVAL_SEC").ok().and_then(|s| s.parse().ok()).unwrap_or(1800);
    let health_port: u16 = env::var("HEALTH_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8090);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&conn.db_url).await?;
    db.migrate().await?;

    // ── Config file (seed sensors + devices) ─────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = Arc::new(config::load(&config_path).unwrap_or_default());
    config::apply(&cfg, &db).await?;
    info!(mode = ?cfg.mode, root_topic = %cfg.root_topic, "configuration applied");

    let timezone_offset_minutes = conditions::parse_fixed_offset_minutes(&cfg.timezone);

    // ── Shared state + event bus ─────────────────────────────────────
    let bus = EventBus::new();
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared.write().await.record_system("core started".to_string());

    // ── Health endpoint ───────────────────────────────────────────────
    let mut health_handle = {
        let health_shared = Arc::clone(&shared);
        let health_db = db.clone();
        tokio::spawn(async move {
            health::serve(health_shared, health_db, health_port).await;
        })
    };

    // ── MQTT ──────────────────────────────────────────────────────────
    let (client, mut eventloop) = mqtt::connect(&conn, "greenhouse-core", &cfg.root_topic);
    let wildcard = mqtt::discovery_wildcard(&cfg.root_topic);
    client.subscribe(&wildcard, QoS::AtLeastOnce).await?;
    info!(topic = %wildcard, "subscribed");

    // ── Ingest worker pool ────────────────────────────────────────────
    let (ingest_tx, ingest_rx) = mpsc::channel::<InboundFrame>(256);
    let ingest_rx = Arc::new(tokio::sync::Mutex::new(ingest_rx));
    let mut ingest_handles = Vec::with_capacity(cfg.ingest_workers);
    for worker_id in 0..cfg.ingest_workers {
        let worker_db = db.clone();
        let worker_bus = bus.clone();
        let worker_state = Arc::clone(&shared);
        let worker_rx = Arc::clone(&ingest_rx);
        let worker_cfg_root = cfg.root_topic.clone();
        let worker_cfg = Arc::clone(&cfg);
        ingest_handles.push(tokio::spawn(async move {
            loop {
                let frame = { worker_rx.lock().await.recv().await };
                let Some(frame) = frame else { break };
                match ingest::ingest_frame(&worker_db, &worker_bus, &worker_state, &frame).await {
                    Ok(ingest::IngestOutcome::HandedToDiscovery) => {
                        if worker_cfg.auto_discovery_enabled {
                            if let Err(e) = discovery::evaluate_topic(&worker_db, &worker_state, &frame.topic, &worker_cfg).await {
                                error!(worker = worker_id, "discovery evaluation failed: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(worker = worker_id, root = %worker_cfg_root, "ingest failed: {e}"),
                }
            }
        }));
    }

    // ── Actuator + Notifier + Rules Engine ───────────────────────────
    let notifier = Notifier::new(cfg.webhook_url.clone(), cfg.webhook_secret.clone(), cfg.notification_retry_count);
    let ack_timeout = Duration::from_secs(cfg.ack_timeout_sec);
    let actuator = Actuator::new(client.clone(), notifier.clone(), ack_timeout);
    let status_actuator = Actuator::new(client.clone(), notifier.clone(), ack_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut rules_handle = {
        let rules_db = db.clone();
        let rules_bus = bus.clone();
        let rules_state = Arc::clone(&shared);
        let rules_shutdown = shutdown_rx.clone();
        let engine = RulesEngine::new(rules_db, rules_bus.clone(), rules_state, actuator, notifier, timezone_offset_minutes);
        let period = Duration::from_secs(cfg.evaluation_period_sec);
        tokio::spawn(async move {
            engine.run(period, rules_bus.subscribe(), rules_shutdown).await;
        })
    };

    // ── Liveness sweeper ──────────────────────────────────────────────
    let mut liveness_handle = {
        let sweep_state = Arc::clone(&shared);
        let offline_after_sec = cfg.offline_after_sec;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(LIVENESS_SWEEP_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                let newly_offline = sweep_state.write().await.sweep_liveness(offline_after_sec);
                if !newly_offline.is_empty() {
                    warn!(count = newly_offline.len(), "sensors marked offline by liveness sweep");
                }
            }
        })
    };

    // ── Data retention pruning ────────────────────────────────────────
    let mut prune_handle = {
        let prune_db = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut ticker = tokio::time::interval(Duration::from_secs(PRUNE_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                match prune_db.retain_readings(READING_RETENTION_DEFAULT).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old readings"),
                    Ok(_) => {}
                    Err(e) => error!("data retention prune failed: {e}"),
                }
                match prune_db.retain_rule_executions(AUDIT_RETENTION_DEFAULT).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old rule executions"),
                    Ok(_) => {}
                    Err(e) => error!("rule execution retention prune failed: {e}"),
                }
                match prune_db.retain_notifications(AUDIT_RETENTION_DEFAULT).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old read notifications"),
                    Ok(_) => {}
                    Err(e) => error!("notification retention prune failed: {e}"),
                }
            }
        })
    };

    // ── Periodic database backup ─────────────────────────────────────
    let mut backup_handle = {
        let backup_db = db.clone();
        let backup_dest = db_backup_path.clone();
        tokio::spawn(async move {
            let Some(dest) = backup_dest else {
                std::future::pending::<()>().await;
                return;
            };
            info!(path = %dest, interval_sec = db_backup_interval, "database backup task started");
            tokio::time::sleep(Duration::from_secs(120)).await;
            let mut ticker = tokio::time::interval(Duration::from_secs(db_backup_interval));
            loop {
                ticker.tick().await;
                match backup_db.backup(std::path::Path::new(&dest)).await {
                    Ok(()) => info!(path = %dest, "database backup complete"),
                    Err(e) => error!("database backup failed: {e}"),
                }
            }
        })
    };

    // ── Signal handling ───────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    let mut mqtt_error_count: u32 = 0;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(ev) => {
                        if matches!(&ev, MqttEvent::Incoming(_)) && mqtt_error_count > 0 {
                            info!(recovered_after_errors = mqtt_error_count, "mqtt connection recovered");
                            mqtt_error_count = 0;
                        }

                        match ev {
                            MqttEvent::Incoming(Packet::Publish(p)) => {
                                let topic = p.topic.clone();
                                let payload = p.payload.to_vec();

                                if mqtt::parse_status_topic(&cfg.root_topic, &topic).is_some() {
                                    status_actuator.handle_status_reply(&db, &bus, &shared, &topic, &payload).await;
                                } else {
                                    let frame = InboundFrame {
                                        topic,
                                        payload,
                                        received_at: chrono::Utc::now(),
                                    };
                                    if let Err(e) = ingest_tx.try_send(frame) {
                                        warn!("ingest queue full, dropping frame: {e}");
                                        shared.write().await.record_error("ingest queue full, frame dropped".to_string());
                                    }
                                }
                            }

                            MqttEvent::Incoming(Packet::ConnAck(_)) => {
                                info!("mqtt connected");
                                if let Err(e) = client.subscribe(&wildcard, QoS::AtLeastOnce).await {
                                    error!("re-subscribe {wildcard} failed: {e}");
                                }
                                let status_topic = mqtt::status_topic(&cfg.root_topic, "hub");
                                let _ = client.publish(&status_topic, QoS::AtLeastOnce, true, b"online".to_vec()).await;

                                let mut st = shared.write().await;
                                st.mqtt_connected = true;
                                st.record_system("mqtt connected".to_string());
                            }

                            MqttEvent::Incoming(Packet::Disconnect) => {
                                warn!("mqtt disconnected");
                                let mut st = shared.write().await;
                                st.mqtt_connected = false;
                                st.record_system("mqtt disconnected".to_string());
                            }

                            _ => {}
                        }
                    }
                    Err(e) => {
                        mqtt_error_count += 1;
                        {
                            let mut st = shared.write().await;
                            if st.mqtt_connected {
                                st.mqtt_connected = false;
                                st.record_system(format!("mqtt error: {e}"));
                            }
                        }
                        warn!(consecutive_errors = mqtt_error_count, "mqtt error: {e}");
                        tokio::time::sleep(mqtt::reconnect_delay(mqtt_error_count)).await;
                    }
                }
            }

            // ── Critical task monitoring ──────────────────────────────
            result = &mut rules_handle => {
                error!("CRITICAL: rules engine task exited unexpectedly: {result:?}");
                exit_reason = "rules engine task died";
                break;
            }

            result = &mut health_handle => {
                error!("health endpoint task exited unexpectedly: {result:?}");
            }

            result = &mut liveness_handle => {
                error!("liveness sweeper task exited unexpectedly: {result:?}");
            }

            result = &mut prune_handle => {
                error!("data pruner task exited unexpectedly: {result:?}");
            }

            result = &mut backup_handle => {
                error!("database backup task exited unexpectedly: {result:?}");
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown ──────────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    let _ = shutdown_tx.send(true);
    drop(ingest_tx);
    for handle in ingest_handles {
        let _ = handle.await;
    }

    if let Some(ref dest) = db_backup_path {
        info!("performing final database backup");
        match db.backup(std::path::Path::new(dest)).await {
            Ok(()) => info!(path = %dest, "final database backup complete"),
            Err(e) => error!("final database backup failed: {e}"),
        }
    }

    let status_topic = mqtt::status_topic(&cfg.root_topic, "hub");
    let _ = client.publish(&status_topic, QoS::AtLeastOnce, true, b"offline".to_vec()).await;

    info!("shutdown complete");
    Ok(())
}
