use uuid::Uuid;

use crate::reliability::Transient;

/// Errors returned by a document store implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A generation with this id was already written
    #[error("generation already exists: {0}")]
    Duplicate(String),

    /// A stored document no longer decodes into its record type
    #[error("malformed document {id}: {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

/// Errors returned by a job queue implementation
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The delivery was already acknowledged, or its lease expired and it went to another consumer
    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(Uuid),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        match self {
            QueueError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

/// Connectivity failures and lock contention, as opposed to logic errors
pub(crate) fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // SQLITE_BUSY and SQLITE_LOCKED, including extended codes
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}
