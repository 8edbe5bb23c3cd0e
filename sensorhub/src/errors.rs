use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MQTT broker unreachable after {attempts} consecutive attempts: {last_error}")]
    BrokerUnreachable { attempts: u32, last_error: String },

    #[error("Broker rejected subscription to {topic} {attempts} times")]
    SubscriptionRejected { topic: String, attempts: u32 },
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_transient(),
            Error::Io(_) => true,

            Error::Mqtt(_)
            | Error::Migration(_)
            | Error::Parse(_)
            | Error::Validation(_)
            | Error::Json(_)
            | Error::Config(_)
            | Error::BrokerUnreachable { .. }
            | Error::SubscriptionRejected { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Storage(StoreError::Transient("timeout".into())).is_transient());
        assert!(!Error::Storage(StoreError::Backend("constraint".into())).is_transient());
        assert!(!Error::Validation("empty".into()).is_transient());
        assert!(!Error::Parse("garbage".into()).is_transient());
    }
}
