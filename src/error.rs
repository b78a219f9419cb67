//! Error types for voxqueue.

use thiserror::Error;

use crate::auth::AuthError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Worker pool is not accepting deliveries")]
    ShuttingDown,

    #[error("Strategy '{name}' failed: {message}")]
    Strategy { name: String, message: String },

    #[error(transparent)]
    Authentication(#[from] AuthError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for capacity rejections, which the broker is expected to redeliver.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Error::QueueFull { .. })
    }
}
