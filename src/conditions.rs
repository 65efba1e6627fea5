//! Recursive evaluation of a rule's condition tree against the current
//! Store state.

use chrono::{DateTime, NaiveTime, Utc};
use tracing::debug;

use crate::db::Db;
use crate::model::{CompareOp, Condition};

/// Evaluate a condition tree. Sensor/Device leaves hit the Store; Time
/// leaves are pure. `AND`/`OR` short-circuit left-to-right; an empty `AND`
/// is true, an empty `OR` is false.
pub async fn evaluate(cond: &Condition, db: &Db, now: DateTime<Utc>, tz_offset_minutes: i32) -> bool {
    match cond {
        Condition::And(children) => {
            for child in children {
                if !Box::pin(evaluate(child, db, now, tz_offset_minutes)).await {
                    return false;
                }
            }
            true
        }
        Condition::Or(children) => {
            for child in children {
                if Box::pin(evaluate(child, db, now, tz_offset_minutes)).await {
                    return true;
                }
            }
            false
        }
        Condition::Not(inner) => !Box::pin(evaluate(inner, db, now, tz_offset_minutes)).await,
        Condition::Sensor {
            sensor_ref,
            field,
            operator,
            value,
            max_age_seconds,
        } => evaluate_sensor_leaf(db, sensor_ref, field, *operator, value, *max_age_seconds, now).await,
        Condition::Time { start, end } => time_window_contains(now, tz_offset_minutes, start, end),
        Condition::Device { device_ref, state_equals } => evaluate_device_leaf(db, device_ref, *state_equals).await,
    }
}

async fn evaluate_sensor_leaf(
    db: &Db,
    sensor_ref: &str,
    field: &str,
    operator: CompareOp,
    expected: &serde_json::Value,
    max_age_seconds: i64,
    now: DateTime<Utc>,
) -> bool {
    let reading = match db.latest_reading(sensor_ref).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            debug!(sensor_ref, "no reading yet, condition leaf unknown");
            return false;
        }
        Err(e) => {
            debug!(sensor_ref, "reading lookup failed: {e}");
            return false;
        }
    };

    if (now - reading.received_at).num_seconds() > max_age_seconds {
        debug!(sensor_ref, "stale reading, condition leaf unknown");
        return false;
    }

    match reading.normalized.get(field) {
        Some(actual) => compare(actual, operator, expected),
        None => {
            debug!(sensor_ref, field, "field absent from normalized reading");
            false
        }
    }
}

async fn evaluate_device_leaf(db: &Db, device_ref: &str, state_equals: crate::model::DeviceStatus) -> bool {
    match db.get_device(device_ref).await {
        Ok(Some(device)) => device.status == state_equals,
        _ => false,
    }
}

fn compare(actual: &serde_json::Value, op: CompareOp, expected: &serde_json::Value) -> bool {
    if let (Some(a), Some(e)) = (actual.as_f64(), expected.as_f64()) {
        return match op {
            CompareOp::Lt => a < e,
            CompareOp::Le => a <= e,
            CompareOp::Eq => (a - e).abs() < f64::EPSILON,
            CompareOp::Ge => a >= e,
            CompareOp::Gt => a > e,
            CompareOp::Ne => (a - e).abs() >= f64::EPSILON,
        };
    }
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        _ => false,
    }
}

/// `[start, end)` in `HH:MM`, wrapping past midnight when `end <= start`.
fn time_window_contains(now: DateTime<Utc>, tz_offset_minutes: i32, start: &str, end: &str) -> bool {
    let local = now + chrono::Duration::minutes(tz_offset_minutes as i64);
    let (Ok(start), Ok(end), t) = (
        NaiveTime::parse_from_str(start, "%H:%M"),
        NaiveTime::parse_from_str(end, "%H:%M"),
        local.time(),
    ) else {
        return false;
    };

    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

/// Parse a fixed `+HH:MM`/`-HH:MM` offset, or `0` for `UTC`/anything
/// unrecognized. The reference stack carries no IANA timezone database, so
/// configured zones are limited to a fixed UTC offset rather than DST-aware
/// named zones.
pub fn parse_fixed_offset_minutes(tz: &str) -> i32 {
    if tz.eq_ignore_ascii_case("UTC") {
        return 0;
    }
    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return 0,
    };
    let Some((h, m)) = rest.split_once(':') else { return 0 };
    let (Ok(h), Ok(m)) = (h.parse::<i32>(), m.parse::<i32>()) else { return 0 };
    sign * (h * 60 + m)
}
