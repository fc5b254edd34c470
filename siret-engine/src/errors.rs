use siret_core::storage::LogError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopicError>;

/// Error surface of the topic engine.
///
/// Callers always receive either a successful result or one of these kinds;
/// no operation leaves the topic in an ambiguous state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is temporarily unavailable")]
    Fenced,

    #[error("topic was already terminated")]
    Terminated,

    #[error("topic is closed")]
    Closed,

    #[error("topic is busy: {0}")]
    Busy(String),

    #[error("topic reached max producers limit")]
    ProducerBusy,

    #[error("consumer already connected on exclusive subscription: {0}")]
    ConsumerBusy(String),

    #[error("naming conflict: {0}")]
    NamingConflict(String),

    #[error("invalid name: {0}")]
    Naming(String),

    #[error("consumer does not support batched messages")]
    UnsupportedVersion,

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("compaction already in progress")]
    AlreadyRunning,

    #[error("metadata failure: {0}")]
    Metadata(String),
}

impl From<LogError> for TopicError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Fenced => TopicError::Fenced,
            LogError::Terminated => TopicError::Terminated,
            LogError::AlreadyClosed => TopicError::Closed,
            other => TopicError::Persistence(other.to_string()),
        }
    }
}
