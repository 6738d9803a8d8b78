use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default reclamation timeout for a claimed job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// Key prefix for pending/claimed job records in the blob store.
pub const JOB_KEY_PREFIX: &str = "job:";

/// Key prefix for distributed lock records.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// An argument or result value. Jobs carry a registered function name plus
/// values from this enumerated set instead of serialized code, so a worker
/// never has to execute anything it did not already ship with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
}

impl ArgValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArgValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// The unit of work a submitter ships: a function identifier resolved
/// against the worker's local registry, plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub function: String,
    pub args: Vec<ArgValue>,
}

impl JobPayload {
    pub fn new(function: impl Into<String>, args: Vec<ArgValue>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Content hash of the payload. Identical payloads hash identically,
    /// which keys the local result cache and derives `result_id`, making
    /// resubmission idempotent end to end.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("payload serialization cannot fail");
        let digest = Sha256::digest(&bytes);
        format!("{:x}", digest)
    }

    /// Deterministic result identifier derived from the content hash.
    pub fn result_id(&self) -> String {
        self.content_hash()[..32].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    InProgress,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::InProgress => write!(f, "in_progress"),
        }
    }
}

/// Durable description of one unit of distributed work, stored at
/// `"job:" + result_id`. Mutated by whichever worker claims it; removed
/// once the result has been cached by the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub submitted_at: DateTime<Utc>,
    pub blacklisted_workers: Vec<String>,
    pub state: JobState,
    pub payload: JobPayload,
    pub last_claim_at: DateTime<Utc>,
    pub result_id: String,
    pub timeout: Duration,
}

impl JobRecord {
    pub fn new(payload: JobPayload, timeout: Duration) -> Self {
        let now = Utc::now();
        let result_id = payload.result_id();
        // Backdate the claim stamp so a fresh record is immediately
        // reclaimable on the permissive passes.
        let last_claim_at = now
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            submitted_at: now,
            blacklisted_workers: Vec::new(),
            state: JobState::Waiting,
            payload,
            last_claim_at,
            result_id,
            timeout,
        }
    }

    pub fn key(&self) -> String {
        job_key(&self.result_id)
    }

    /// A claim is considered abandoned once `last_claim_at + timeout` has
    /// elapsed, whatever the recorded state says.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        now > self.last_claim_at + timeout
    }

    pub fn is_blacklisted(&self, worker_id: &str) -> bool {
        self.blacklisted_workers.iter().any(|w| w == worker_id)
    }

    /// Add a worker to the blacklist. A worker id appears at most once per
    /// job.
    pub fn blacklist(&mut self, worker_id: &str) {
        if !self.is_blacklisted(worker_id) {
            self.blacklisted_workers.push(worker_id.to_string());
        }
    }
}

/// What a worker writes back at `result_id` once a job completes. Read once
/// by the submitter, then deleted from the store (but retained in the local
/// cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub worker_id: String,
    pub elapsed: Duration,
    pub value: ArgValue,
    pub produced_at: DateTime<Utc>,
}

/// Advisory lock record at `"lock:" + name`. Self-expiring so a crashed
/// holder cannot wedge the claim path forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub expires_at: DateTime<Utc>,
    pub owner_id: uuid::Uuid,
}

pub fn job_key(result_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{result_id}")
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{name}")
}

/// Extract the result id from a `"job:…"` key, if it is one.
pub fn parse_job_key(key: &str) -> Option<&str> {
    key.strip_prefix(JOB_KEY_PREFIX)
}
