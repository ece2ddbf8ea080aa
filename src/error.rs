use thiserror::Error;

/// Failures talking to the external platform API.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid platform response: {0}")]
    Decode(String),

    #[error("platform client misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}

/// Failure of a single student's refresh that escaped per-date isolation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The platform calls that did run left the student unsynced.
    #[error("{failed_calls} platform calls failed; last error: {message}")]
    Fetch { failed_calls: usize, message: String },
}

/// Validation failures raised synchronously when a refresh job is requested.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no students matched the refresh request")]
    NoStudents,

    #[error(transparent)]
    Store(#[from] StoreError),
}
