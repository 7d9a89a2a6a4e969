//! Checkpoint store error types.

/// Errors produced by [`CheckpointStore`](crate::backend::CheckpointStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure, with the operation that raised it.
    #[error("sqlite error during {context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored JSON payload could not be encoded or decoded.
    #[error("corrupt checkpoint payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored enum column held an unknown value.
    #[error("unknown {column} value '{value}' in checkpoint")]
    UnknownValue { column: &'static str, value: String },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("checkpoint store lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Wrap a `SQLite` error with the name of the failing operation.
    pub(crate) fn sqlite(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Sqlite { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
