use thiserror::Error;

/// Errors surfaced by the queue engine and its stores.
///
/// Everything here is fatal to the `send`/`consume` call that produced it.
/// Handler failures are not represented: they only suppress acknowledgment.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("no consumer group {group:?} on topic {topic:?}")]
    NoGroup { topic: String, group: String },
    #[error("key {0:?} holds the wrong kind of value")]
    WrongType(String),
    #[error("invalid entry id: {0:?}")]
    InvalidEntryId(String),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, Error>;
