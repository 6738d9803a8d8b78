//! Submitter-side job lifecycle.
//!
//! A [`RequestSession`] executes a callable "somewhere", preferring the
//! remote worker pool and degrading gracefully: remote backend → bounded
//! local pool → plain background thread. Whatever ran it, the caller holds
//! the same [`JobHandle`].

pub mod cache;
pub mod handle;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::config::SessionConfig;
use crate::error::{RaisinError, Result};
use crate::model::{job_key, ArgValue, JobPayload, JobRecord};
use crate::registry::{BackendRegistry, ConnectOptions};
use crate::store::{BlobStore, StoreFactory};
use crate::worker::identity::WorkerIdentity;
use crate::worker::FunctionRegistry;

pub use cache::{CachedResult, LocalResultCache};
pub use handle::{JobHandle, MapHandle, ResultEnvelope};

use handle::RemoteHandle;

pub struct RequestSession {
    config: SessionConfig,
    registry: BackendRegistry,
    functions: Arc<FunctionRegistry>,
    cache: Arc<Mutex<LocalResultCache>>,
    remote: Option<Arc<dyn BlobStore>>,
    pool: Option<Arc<Semaphore>>,
    local_id: String,
}

impl RequestSession {
    /// The function registry doubles as the local fallback executor:
    /// a submitter can only fall back on functions it ships itself.
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn StoreFactory>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        let registry = BackendRegistry::new(config.registry.clone(), factory);
        let cache = Arc::new(Mutex::new(LocalResultCache::open(&config.registry.state_dir)));
        let pool = (config.local_pool_size > 0)
            .then(|| Arc::new(Semaphore::new(config.local_pool_size)));
        let local_id = WorkerIdentity::detect().id();
        Self {
            config,
            registry,
            functions,
            cache,
            remote: None,
            pool,
            local_id,
        }
    }

    /// Submit one job. Returns an already-resolved handle on a cache hit;
    /// otherwise tries the strategies in order. Only a failure inside the
    /// callable itself ever reaches the caller, and it arrives through the
    /// handle, not here.
    pub async fn submit(&mut self, function: &str, args: Vec<ArgValue>) -> JobHandle {
        let payload = JobPayload::new(function, args);
        let payload_hash = payload.content_hash();

        if let Some(hit) = self
            .cache
            .lock()
            .expect("cache mutex poisoned")
            .get(&payload_hash)
        {
            tracing::debug!(function, "Result cache hit");
            return JobHandle::ready(ResultEnvelope {
                value: hit.value.clone(),
                worker_id: hit.worker_id.clone(),
                elapsed: hit.elapsed,
            });
        }

        match self.submit_remote(&payload, &payload_hash).await {
            Ok(handle) => return handle,
            Err(e) => {
                tracing::debug!(function, error = %e, "Remote strategy unavailable, falling back");
                self.remote = None;
            }
        }

        if let Some(pool) = self.pool.clone() {
            return self.submit_pool(payload, pool);
        }
        self.submit_thread(payload)
    }

    /// Fan `submit` out over zipped argument lists: `arg_lists[p][i]` is
    /// parameter `p` of call `i`. The number of calls is the shortest
    /// list's length.
    pub async fn map(&mut self, function: &str, arg_lists: &[Vec<ArgValue>]) -> MapHandle {
        let calls = arg_lists.iter().map(Vec::len).min().unwrap_or(0);
        let mut handles = Vec::with_capacity(calls);
        for i in 0..calls {
            let args: Vec<ArgValue> = arg_lists.iter().map(|list| list[i].clone()).collect();
            handles.push(self.submit(function, args).await);
        }
        MapHandle::new(handles)
    }

    /// Number of locally memoized results.
    pub fn cached_results(&self) -> usize {
        self.cache.lock().expect("cache mutex poisoned").len()
    }

    async fn submit_remote(&mut self, payload: &JobPayload, payload_hash: &str) -> Result<JobHandle> {
        let store = self.ensure_connected().await?;
        let result_id = payload.result_id();
        let key = job_key(&result_id);

        // Resubmission is idempotent at the storage layer: if a prior run
        // already wrote this job (or its result is sitting there waiting),
        // do not write a second record.
        let already_submitted =
            store.get(&key).await?.is_some() || store.get(&result_id).await?.is_some();
        if !already_submitted {
            let record = JobRecord::new(payload.clone(), self.config.job_timeout);
            store.put(&key, &serde_json::to_vec(&record)?).await?;
            tracing::info!(result_id = %result_id, function = %payload.function, "Job submitted");
        } else {
            tracing::debug!(result_id = %result_id, "Job already on the backend");
        }

        Ok(JobHandle::remote(
            RemoteHandle {
                store,
                cache: Arc::clone(&self.cache),
                payload_hash: payload_hash.to_string(),
                result_id,
                max_failures: self.config.max_failures,
            },
            self.config.poll_initial,
            self.config.poll_max,
        ))
    }

    async fn ensure_connected(&mut self) -> Result<Arc<dyn BlobStore>> {
        if let Some(store) = &self.remote {
            return Ok(Arc::clone(store));
        }
        let opts = ConnectOptions {
            preferred_kind: self.config.preferred_kind,
            credential: self.config.credential.clone(),
            // An explicit backend means "use exactly that one"; discovery
            // over the whole candidate list is for unconfigured sessions.
            try_first_only: self.config.preferred_kind.is_some()
                && self.config.credential.is_some(),
            restrict_to_kind: self.config.preferred_kind.is_some(),
        };
        let store = self
            .registry
            .connect(&opts)
            .await
            .ok_or(RaisinError::BackendUnavailable)?;
        let store: Arc<dyn BlobStore> = Arc::from(store);
        self.remote = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Bounded local fallback: the job runs on a blocking thread once a
    /// pool permit frees up.
    fn submit_pool(&self, payload: JobPayload, pool: Arc<Semaphore>) -> JobHandle {
        tracing::debug!(function = %payload.function, "Running on the local pool");
        let slot: handle::LocalSlot = Arc::new(Mutex::new(None));
        let functions = Arc::clone(&self.functions);
        let local_id = self.local_id.clone();
        let filled = Arc::clone(&slot);

        tokio::spawn(async move {
            // Held until the job finishes; bounds local parallelism.
            let _permit = pool.acquire_owned().await.ok();
            let started = Instant::now();
            let outcome = tokio::task::spawn_blocking(move || {
                functions.call(&payload.function, &payload.args)
            })
            .await;
            let elapsed = started.elapsed();
            let entry = match outcome {
                Ok(Ok(value)) => Ok(ResultEnvelope {
                    value,
                    worker_id: local_id,
                    elapsed,
                }),
                Ok(Err(RaisinError::JobExecution(reason))) => Err(reason),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("execution task failed: {e}")),
            };
            *filled.lock().expect("slot mutex poisoned") = Some(entry);
        });

        JobHandle::local(slot, self.config.poll_initial, self.config.poll_max)
    }

    /// Last resort: a single background thread, so `get(wait = false)`
    /// still returns immediately instead of blocking the caller.
    fn submit_thread(&self, payload: JobPayload) -> JobHandle {
        tracing::debug!(function = %payload.function, "Running on a background thread");
        let slot: handle::LocalSlot = Arc::new(Mutex::new(None));
        let functions = Arc::clone(&self.functions);
        let local_id = self.local_id.clone();
        let filled = Arc::clone(&slot);

        std::thread::spawn(move || {
            let started = Instant::now();
            let outcome = functions.call(&payload.function, &payload.args);
            let elapsed = started.elapsed();
            let entry = match outcome {
                Ok(value) => Ok(ResultEnvelope {
                    value,
                    worker_id: local_id,
                    elapsed,
                }),
                Err(RaisinError::JobExecution(reason)) => Err(reason),
                Err(e) => Err(e.to_string()),
            };
            *filled.lock().expect("slot mutex poisoned") = Some(entry);
        });

        JobHandle::local(slot, self.config.poll_initial, self.config.poll_max)
    }
}
