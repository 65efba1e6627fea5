//! Typed error taxonomy for the ingestion/rules/actuation core.
//!
//! Call sites that only need to log-and-continue use `anyhow::Context`
//! instead of matching on these variants, mirroring how the rest of this
//! codebase mixes a closed error type at component boundaries with
//! `anyhow::Result` for glue code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("conflict: {0} already exists")]
    ConflictUnique(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("broker disconnected")]
    BrokerDisconnected,

    #[error("notification channel failed: {0}")]
    NotificationChannelFailed(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                CoreError::ConflictUnique(db_err.message().to_string())
            }
            other => CoreError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            CoreError::UnknownSensor("agua-01".into()).to_string(),
            "unknown sensor: agua-01"
        );
        assert_eq!(CoreError::BrokerDisconnected.to_string(), "broker disconnected");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let e: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(e, CoreError::NotFound(_)));
    }
}
