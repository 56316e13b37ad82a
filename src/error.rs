use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Operation timeout")]
    Timeout,

    #[error("Topic name too long")]
    TopicTooLong,

    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("Subscription limit exceeded for connection: {0}")]
    SubscriptionLimitExceeded(String),

    #[error("Hub is shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
