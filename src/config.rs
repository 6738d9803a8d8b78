use std::path::PathBuf;
use std::time::Duration;

use crate::model::DEFAULT_JOB_TIMEOUT;
use crate::store::BackendKind;
use crate::worker::cpu::CpuPolicy;

/// Where submitter- and worker-local state lives: the candidate-backend
/// file and the result cache. Passed explicitly — there is no process-wide
/// default location.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub state_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".raisin"),
        }
    }
}

impl RegistryConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }
}

/// Submitter-side configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub registry: RegistryConfig,
    /// Backend kind to sort ahead of the rest during discovery.
    pub preferred_kind: Option<BackendKind>,
    /// Explicit credential tried before every discovered candidate.
    pub credential: Option<String>,
    /// Reclamation timeout written into submitted job records.
    pub job_timeout: Duration,
    /// Distinct failed workers after which a job is reported abandoned.
    pub max_failures: usize,
    /// Concurrency bound of the local fallback pool. Zero disables the
    /// pool, leaving only the background-thread strategy.
    pub local_pool_size: usize,
    /// Initial and maximum sleep while polling for a remote result.
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            preferred_kind: None,
            credential: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            max_failures: 3,
            local_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            poll_initial: Duration::from_millis(100),
            poll_max: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_backend(mut self, kind: BackendKind, credential: impl Into<String>) -> Self {
        self.preferred_kind = Some(kind);
        self.credential = Some(credential.into());
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }
}

/// Worker-daemon configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub registry: RegistryConfig,
    pub preferred_kind: Option<BackendKind>,
    pub credential: Option<String>,
    /// Admission-control policy; 100 everywhere disables the gate.
    pub cpu: CpuPolicy,
    /// Averaging window for a single utilization sample.
    pub cpu_window: Duration,
    /// Sleep between reconnection attempts while no backend is reachable.
    pub reconnect_interval: Duration,
    /// Validity window of the global claim lock.
    pub claim_lock_validity: Duration,
    /// Sleep after a scan that found no claimable job.
    pub idle_interval: Duration,
    /// Job and result records older than this are garbage collected on the
    /// first connection to a backend.
    pub gc_max_age: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            preferred_kind: None,
            credential: None,
            cpu: CpuPolicy::default(),
            cpu_window: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(60),
            claim_lock_validity: Duration::from_secs(60),
            idle_interval: Duration::from_secs(5),
            gc_max_age: Duration::from_secs(3600 * 24 * 7),
        }
    }
}

impl WorkerConfig {
    pub fn with_backend(mut self, kind: BackendKind, credential: impl Into<String>) -> Self {
        self.preferred_kind = Some(kind);
        self.credential = Some(credential.into());
        self
    }

    pub fn with_cpu_policy(mut self, cpu: CpuPolicy) -> Self {
        self.cpu = cpu;
        self
    }
}
