use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Mailbox unavailable: {0}")]
    Unavailable(String),

    #[error("Record rejected: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Mailbox closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Key '{0}' holds a value of another type")]
    WrongType(String),
}
