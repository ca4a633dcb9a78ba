//! State store error types.

/// Errors produced by [`WatermarkStore`](crate::WatermarkStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored value could not be decoded.
    #[error("corrupt state row: {0}")]
    Corrupt(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("watermark store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
