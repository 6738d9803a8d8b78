//! The future-like contract every execution strategy hides behind.
//!
//! `get(wait = false)` answers immediately — value or "not ready" — and
//! `get(wait = true)` polls with backoff until the value arrives. Callers
//! never learn which strategy ran their job except by reading the result
//! metadata.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};

use crate::error::{RaisinError, Result};
use crate::model::{job_key, ArgValue, JobRecord, JobState, ResultRecord};
use crate::session::cache::{CachedResult, LocalResultCache};
use crate::store::BlobStore;

/// A resolved result plus its execution metadata.
#[derive(Debug, Clone)]
pub struct ResultEnvelope {
    pub value: ArgValue,
    pub worker_id: String,
    pub elapsed: Duration,
}

/// Slot a local strategy fills when its computation finishes. `Err` holds
/// the failure reason from inside the callable.
pub(crate) type LocalSlot = Arc<Mutex<Option<std::result::Result<ResultEnvelope, String>>>>;

pub(crate) struct RemoteHandle {
    pub store: Arc<dyn BlobStore>,
    pub cache: Arc<Mutex<LocalResultCache>>,
    pub payload_hash: String,
    pub result_id: String,
    pub max_failures: usize,
}

enum HandleInner {
    Ready(ResultEnvelope),
    Remote(RemoteHandle),
    Local(LocalSlot),
}

/// Handle on a submitted job. See module docs for the `get` contract.
pub struct JobHandle {
    inner: HandleInner,
    poll_initial: Duration,
    poll_max: Duration,
}

impl JobHandle {
    pub(crate) fn ready(envelope: ResultEnvelope) -> Self {
        Self {
            inner: HandleInner::Ready(envelope),
            poll_initial: Duration::from_millis(100),
            poll_max: Duration::from_secs(5),
        }
    }

    pub(crate) fn remote(handle: RemoteHandle, poll_initial: Duration, poll_max: Duration) -> Self {
        Self {
            inner: HandleInner::Remote(handle),
            poll_initial,
            poll_max,
        }
    }

    pub(crate) fn local(slot: LocalSlot, poll_initial: Duration, poll_max: Duration) -> Self {
        Self {
            inner: HandleInner::Local(slot),
            poll_initial,
            poll_max,
        }
    }

    /// Fetch the result value. `wait = false` returns `None` immediately
    /// when the result is not ready; `wait = true` polls until it is.
    pub async fn get(&mut self, wait: bool) -> Result<Option<ArgValue>> {
        Ok(self.resolve(wait, None).await?.map(|e| e.value))
    }

    /// Like [`JobHandle::get`], plus the worker id and elapsed time.
    pub async fn get_with_metadata(&mut self, wait: bool) -> Result<Option<ResultEnvelope>> {
        self.resolve(wait, None).await
    }

    /// Wait for the result, but give up with `DeadlineExceeded` once
    /// `deadline` has elapsed.
    pub async fn get_with_deadline(&mut self, deadline: Duration) -> Result<Option<ResultEnvelope>> {
        self.resolve(true, Some(deadline)).await
    }

    async fn resolve(
        &mut self,
        wait: bool,
        deadline: Option<Duration>,
    ) -> Result<Option<ResultEnvelope>> {
        if let HandleInner::Ready(envelope) = &self.inner {
            return Ok(Some(envelope.clone()));
        }

        let started = Instant::now();
        let mut backoff = self.poll_initial;
        loop {
            if let Some(envelope) = self.poll_once().await? {
                self.inner = HandleInner::Ready(envelope.clone());
                return Ok(Some(envelope));
            }
            if !wait {
                return Ok(None);
            }
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    return Err(RaisinError::DeadlineExceeded);
                }
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            sleep(backoff + Duration::from_millis(jitter)).await;
            backoff = (backoff * 2).min(self.poll_max);
        }
    }

    async fn poll_once(&self) -> Result<Option<ResultEnvelope>> {
        match &self.inner {
            HandleInner::Ready(envelope) => Ok(Some(envelope.clone())),
            HandleInner::Local(slot) => {
                let outcome = slot.lock().expect("slot mutex poisoned").clone();
                match outcome {
                    Some(Ok(envelope)) => Ok(Some(envelope)),
                    Some(Err(reason)) => Err(RaisinError::JobExecution(reason)),
                    None => Ok(None),
                }
            }
            HandleInner::Remote(remote) => remote.poll_once().await,
        }
    }
}

impl RemoteHandle {
    async fn poll_once(&self) -> Result<Option<ResultEnvelope>> {
        let bytes = match self.store.get(&self.result_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Backend churn is invisible to the caller; the next poll
                // may hit a healthier moment.
                tracing::debug!(error = %e, "Result poll failed, will retry");
                return Ok(None);
            }
        };

        let Some(bytes) = bytes else {
            return self.check_abandoned().await;
        };

        // A half-written record reads as "not ready"; the next poll sees
        // it whole.
        let Ok(record) = serde_json::from_slice::<ResultRecord>(&bytes) else {
            tracing::debug!(result_id = %self.result_id, "Result record not yet parseable");
            return Ok(None);
        };
        let envelope = ResultEnvelope {
            value: record.value,
            worker_id: record.worker_id,
            elapsed: record.elapsed,
        };

        // Cache durably first, then clear the remote records; a crash in
        // between leaves garbage the weekly GC will sweep, never a lost
        // result.
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .insert(
                self.payload_hash.clone(),
                CachedResult {
                    value: envelope.value.clone(),
                    worker_id: envelope.worker_id.clone(),
                    elapsed: envelope.elapsed,
                },
            );
        let _ = self.store.delete(&self.result_id).await;
        let _ = self.store.delete(&job_key(&self.result_id)).await;

        Ok(Some(envelope))
    }

    /// A job sitting in `Waiting` with `max_failures` distinct failed
    /// workers on its blacklist will never finish; surface that instead of
    /// letting the caller wait forever.
    async fn check_abandoned(&self) -> Result<Option<ResultEnvelope>> {
        let Ok(Some(bytes)) = self.store.get(&job_key(&self.result_id)).await else {
            return Ok(None);
        };
        let Ok(job) = serde_json::from_slice::<JobRecord>(&bytes) else {
            return Ok(None);
        };
        if job.state == JobState::Waiting && job.blacklisted_workers.len() >= self.max_failures {
            return Err(RaisinError::JobAbandoned {
                result_id: self.result_id.clone(),
                failures: job.blacklisted_workers.len(),
            });
        }
        Ok(None)
    }
}

/// Aggregate handle returned by [`RequestSession::map`]: one element per
/// zipped argument tuple, in submission order.
///
/// [`RequestSession::map`]: crate::session::RequestSession::map
pub struct MapHandle {
    handles: Vec<JobHandle>,
}

impl MapHandle {
    pub(crate) fn new(handles: Vec<JobHandle>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Fetch every element; unfinished ones come back as `None` when
    /// `wait` is false. The first hard failure aborts the collection.
    pub async fn get(&mut self, wait: bool) -> Result<Vec<Option<ArgValue>>> {
        let mut values = Vec::with_capacity(self.handles.len());
        for handle in &mut self.handles {
            values.push(handle.get(wait).await?);
        }
        Ok(values)
    }
}
