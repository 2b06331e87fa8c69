use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced synchronously to a publisher or to whoever assembles the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unknown topic `{0}`")]
    UnknownTopic(String),

    #[error("Unknown subscription `{0}`")]
    UnknownSubscription(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

/// Malformed configuration, or a publish that violates the topic's configuration.
///
/// A publish rejected with one of these has produced no side effects.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Topic `{topic}` is ordered and requires a non-empty group id")]
    MissingGroupId { topic: String },

    #[error("Topic `{topic}` has content based deduplication disabled and requires a dedup key")]
    MissingDedupKey { topic: String },

    #[error("Malformed filter policy on field `{field}`: {reason}")]
    MalformedPolicy { field: String, reason: String },

    #[error("Filter policy must name at least one field")]
    EmptyPolicy,

    #[error("No destination is bound to name `{0}`")]
    UnknownDestination(String),

    #[error("Topic `{0}` is defined more than once")]
    DuplicateTopic(String),

    #[error("Subscription `{0}` is defined more than once")]
    DuplicateSubscription(String),

    #[error("Subscription `{subscription}` is FIFO but topic `{topic}` is not ordered")]
    FifoSubscriptionOnStandardTopic { topic: String, subscription: String },

    #[error("Ordered topic `{0}` needs a non-zero dedup window")]
    ZeroDedupWindow(String),

    #[error("Subscription `{0}` is not on the replay path")]
    NotReplaySubscription(String),

    #[error("Invalid configuration JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    pub(crate) fn malformed(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::MalformedPolicy {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Failure to hand a delivery to one destination. Never fails a publish.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnqueueError {
    #[error("Destination `{0}` is closed")]
    Closed(String),

    #[error("Destination `{0}` did not accept the message within {1:?}")]
    Timeout(String, Duration),

    #[error("Destination `{0}` rejected the message: {1}")]
    Rejected(String, String),
}
