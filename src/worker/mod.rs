//! Worker daemon: donate spare CPU by polling the shared store for work.
//!
//! Each iteration walks a fixed state machine:
//! wait for a backend → check the CPU budget → claim a job under the
//! global claim lock → execute it → report the result (or requeue with
//! ourselves blacklisted). One job at a time per daemon; fleets scale by
//! running more daemons, not more threads.

pub mod cpu;
pub mod functions;
pub mod identity;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{RaisinError, Result};
use crate::lock::DistributedLock;
use crate::model::{
    parse_job_key, ArgValue, JobPayload, JobRecord, JobState, ResultRecord, LOCK_KEY_PREFIX,
};
use crate::registry::{BackendCandidate, BackendRegistry, ConnectOptions, INFO_KEY};
use crate::store::{BlobStore, StoreFactory};

pub use cpu::{CpuPolicy, CpuSampler, ProcStatSampler};
pub use functions::FunctionRegistry;
pub use identity::WorkerIdentity;

/// Name of the global lock serializing job claims on one store.
pub const CLAIM_LOCK_NAME: &str = "claim";

pub struct WorkerDaemon {
    config: WorkerConfig,
    registry: BackendRegistry,
    functions: Arc<FunctionRegistry>,
    identity: WorkerIdentity,
    sampler: Box<dyn CpuSampler>,
    cleaned: bool,
}

impl WorkerDaemon {
    pub fn new(
        config: WorkerConfig,
        factory: Arc<dyn StoreFactory>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        let registry = BackendRegistry::new(config.registry.clone(), factory);
        Self {
            config,
            registry,
            functions,
            identity: WorkerIdentity::detect(),
            sampler: Box::new(ProcStatSampler),
            cleaned: false,
        }
    }

    /// Swap the utilization source. Tests inject scripted samplers.
    pub fn with_sampler(mut self, sampler: Box<dyn CpuSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_cpu_policy(mut self, cpu: CpuPolicy) -> Self {
        self.config.cpu = cpu;
        self
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn worker_id(&self) -> String {
        self.identity.id()
    }

    /// Main daemon loop. Runs until the token is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.identity.id(), "Worker daemon starting");
        let mut store: Option<Box<dyn BlobStore>> = None;

        while !shutdown.is_cancelled() {
            let connected = match store.take() {
                Some(s) => s,
                None => match self.wait_for_backend(&shutdown).await {
                    Some(s) => s,
                    None => break,
                },
            };

            self.check_cpu_budget(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once(connected.as_ref()).await {
                Ok(true) => {
                    self.registry.touch_current();
                    store = Some(connected);
                }
                Ok(false) => {
                    // Nothing claimable here; pause, then rotate to a
                    // possibly different backend.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.idle_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Backend failed mid-iteration, reconnecting");
                }
            }
        }
        tracing::info!(worker_id = %self.identity.id(), "Worker daemon stopped");
    }

    /// One claim-execute-report iteration against a connected store.
    /// Returns whether a job was processed.
    pub async fn run_once(&mut self, store: &dyn BlobStore) -> Result<bool> {
        let Some(job) = self.claim_job(store).await? else {
            return Ok(false);
        };
        let (outcome, elapsed) = self.execute(job.payload.clone()).await;
        self.report(store, job, outcome, elapsed).await?;
        Ok(true)
    }

    /// Single connection attempt through the registry. The first success
    /// triggers [`WorkerDaemon::clean`].
    pub async fn connect(&mut self) -> Option<Box<dyn BlobStore>> {
        let opts = ConnectOptions {
            preferred_kind: self.config.preferred_kind,
            credential: self.config.credential.clone(),
            try_first_only: false,
            restrict_to_kind: false,
        };
        let store = self.registry.connect(&opts).await?;
        if !self.cleaned {
            if let Err(e) = self.clean(store.as_ref()).await {
                tracing::debug!(error = %e, "Startup clean failed");
            }
            self.cleaned = true;
        }
        Some(store)
    }

    async fn wait_for_backend(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Option<Box<dyn BlobStore>> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(store) = self.connect().await {
                return Some(store);
            }
            tracing::debug!("No backend reachable, retrying");
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    /// Block until average utilization sits under the configured limit.
    /// A limit of 100 disables the gate entirely.
    pub async fn check_cpu_budget(&mut self, shutdown: &CancellationToken) {
        let limit = self.config.cpu.limit_at(chrono::Local::now().time());
        if limit >= 100.0 {
            return;
        }
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let usage = self.sampler.utilization(self.config.cpu_window).await;
            if usage <= limit {
                tracing::debug!(usage, limit, "CPU budget allows new work");
                return;
            }
            tracing::debug!(usage, limit, "CPU over budget, holding off");
        }
    }

    /// Scan the store for a claimable job under the global claim lock.
    ///
    /// Three increasingly permissive passes: (1) waiting jobs we have not
    /// failed before, (2) also jobs whose claim has expired — abandoned
    /// work, whatever state it was left in, (3) anything we have not
    /// already attempted. The claimed record is rewritten in place with
    /// our id appended to its blacklist before the lock is released.
    pub async fn claim_job(&self, store: &dyn BlobStore) -> Result<Option<JobRecord>> {
        let lock = DistributedLock::new(CLAIM_LOCK_NAME)
            .with_validity(self.config.claim_lock_validity);
        let token = match lock
            .acquire(store, Some(self.config.claim_lock_validity))
            .await
        {
            Ok(token) => token,
            // Contention is normal: somebody else is scanning. No job for
            // us this round.
            Err(RaisinError::DeadlineExceeded) => return Ok(None),
            Err(e) => return Err(e),
        };
        let claimed = self.scan_for_job(store).await;
        lock.release(store, token).await?;
        claimed
    }

    async fn scan_for_job(&self, store: &dyn BlobStore) -> Result<Option<JobRecord>> {
        let me = self.identity.id();
        let now = Utc::now();

        let mut records: Vec<(String, JobRecord)> = Vec::new();
        for key in store.list_keys().await? {
            if parse_job_key(&key).is_none() {
                continue;
            }
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            // A record another worker is rewriting right now may be
            // garbled; skip it, the next scan will see it whole.
            if let Ok(job) = serde_json::from_slice::<JobRecord>(&bytes) {
                records.push((key, job));
            }
        }

        for pass in 0..3u8 {
            for (key, job) in &records {
                if job.is_blacklisted(&me) {
                    continue;
                }
                let eligible = match pass {
                    0 => job.state == JobState::Waiting,
                    1 => job.state == JobState::Waiting || job.claim_expired(now),
                    _ => true,
                };
                if !eligible {
                    continue;
                }
                let mut claimed = job.clone();
                claimed.state = JobState::InProgress;
                claimed.last_claim_at = now;
                claimed.blacklist(&me);
                store.put(key, &serde_json::to_vec(&claimed)?).await?;
                tracing::info!(result_id = %claimed.result_id, pass, "Claimed job");
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    /// Run the payload on a blocking thread. There is no wall-clock
    /// preemption here — the job timeout only governs reclamation by other
    /// workers.
    async fn execute(&self, payload: JobPayload) -> (Result<ArgValue>, Duration) {
        let functions = Arc::clone(&self.functions);
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            functions.call(&payload.function, &payload.args)
        })
        .await;
        let elapsed = started.elapsed();
        let outcome = match outcome {
            Ok(result) => result,
            Err(e) => Err(RaisinError::JobExecution(format!(
                "execution task failed: {e}"
            ))),
        };
        (outcome, elapsed)
    }

    /// Success: publish the result and drop the job record. Failure: put
    /// the job back to waiting with a fresh claim stamp — our id is
    /// already on its blacklist, so we will never pick it up again.
    async fn report(
        &self,
        store: &dyn BlobStore,
        mut job: JobRecord,
        outcome: Result<ArgValue>,
        elapsed: Duration,
    ) -> Result<()> {
        match outcome {
            Ok(value) => {
                let record = ResultRecord {
                    worker_id: self.identity.id(),
                    elapsed,
                    value,
                    produced_at: Utc::now(),
                };
                store
                    .put(&job.result_id, &serde_json::to_vec(&record)?)
                    .await?;
                store.delete(&job.key()).await?;
                tracing::info!(
                    result_id = %job.result_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) => {
                tracing::warn!(result_id = %job.result_id, error = %e, "Job failed, requeueing");
                job.state = JobState::Waiting;
                job.last_claim_at = Utc::now();
                store.put(&job.key(), &serde_json::to_vec(&job)?).await?;
            }
        }
        Ok(())
    }

    /// Startup garbage collection: drop job and result records older than
    /// the configured age, then merge the store's advertised candidate
    /// list with ours.
    pub async fn clean(&mut self, store: &dyn BlobStore) -> Result<()> {
        let max_age = chrono::Duration::from_std(self.config.gc_max_age)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = Utc::now() - max_age;
        let mut removed = 0usize;

        for key in store.list_keys().await? {
            if key == INFO_KEY || key.starts_with(LOCK_KEY_PREFIX) {
                continue;
            }
            let Ok(Some(bytes)) = store.get(&key).await else {
                continue;
            };
            let expired = if parse_job_key(&key).is_some() {
                serde_json::from_slice::<JobRecord>(&bytes)
                    .map(|job| job.submitted_at < cutoff)
                    .unwrap_or(false)
            } else {
                serde_json::from_slice::<ResultRecord>(&bytes)
                    .map(|res| res.produced_at < cutoff)
                    .unwrap_or(false)
            };
            if expired && store.delete(&key).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Garbage collected stale records");
        }

        let remote: Vec<BackendCandidate> = match store.get(INFO_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            _ => Vec::new(),
        };
        self.registry.refresh_candidates(remote, store).await
    }
}
