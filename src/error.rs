use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaisinError {
    #[error("No backend candidate could be connected")]
    BackendUnavailable,

    #[error("Job execution failed: {0}")]
    JobExecution(String),

    #[error("Corrupt local state in {0}, reinitializing")]
    CorruptLocalState(String),

    #[error("Job {result_id} abandoned after {failures} failed workers")]
    JobAbandoned { result_id: String, failures: usize },

    #[error("Deadline elapsed before the operation completed")]
    DeadlineExceeded,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Transport-level failure of a single blob-store operation. Callers demote
/// these to `BackendUnavailable` or "candidate unusable" at component
/// boundaries; they never reach a submitter directly.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store not connected: {0}")]
    NotConnected(String),

    #[error("Malformed record at key {key}: {reason}")]
    MalformedRecord { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, RaisinError>;
