use std::time::Duration;

use rabbitmq::RabbitMQError;
use thiserror::Error;

pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors raised by the messaging layer.
///
/// `Consumption` never escapes a dispatch worker: consumers report it on the
/// status channel and the producer surfaces it from `await_completion`.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("invalid messaging configuration: {0}")]
    Configuration(String),

    #[error("could not start messaging: {0}")]
    Startup(String),

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("failed to publish to exchange {exchange}: {reason}")]
    Publish { exchange: String, reason: String },

    #[error(
        "consumer {consumer_id} failed to consume evaluation {evaluation_id}{}: {cause}",
        .group_id.as_ref().map(|group| format!(" (group {group})")).unwrap_or_default()
    )]
    Consumption {
        evaluation_id: String,
        consumer_id: String,
        group_id: Option<String>,
        cause: String,
    },

    #[error("evaluation {evaluation_id} declared {declared} statistics messages but published {published}")]
    CompletionMismatch {
        evaluation_id: String,
        declared: u64,
        published: u64,
    },

    #[error("timed out after {waited:?} waiting for evaluation {evaluation_id}; still pending: {pending}")]
    Timeout {
        evaluation_id: String,
        waited: Duration,
        pending: String,
    },

    #[error("evaluation {evaluation_id} failed: {cause}")]
    EvaluationFailed { evaluation_id: String, cause: String },

    #[error("no subscriber negotiated for evaluation {evaluation_id}: {reason}")]
    Negotiation { evaluation_id: String, reason: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<RabbitMQError> for MessagingError {
    fn from(err: RabbitMQError) -> Self {
        match err {
            RabbitMQError::UriError(reason) | RabbitMQError::TlsError(reason) => {
                MessagingError::Configuration(reason)
            }
            RabbitMQError::PublishError(reason) => MessagingError::Publish {
                exchange: "unknown".to_string(),
                reason,
            },
            other => MessagingError::Connection(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for MessagingError {
    fn from(err: std::io::Error) -> Self {
        MessagingError::Connection(err.to_string())
    }
}
