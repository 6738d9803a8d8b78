//! Shared fixtures for the integration suites.
//!
//! Simulated machines coordinate through named [`MemoryStore`] instances
//! handed out by [`SharedMemoryFactory`]; every session and worker built
//! against the same store name observes the same medium.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use raisin::config::{RegistryConfig, SessionConfig, WorkerConfig};
use raisin::session::RequestSession;
use raisin::store::{BackendKind, BlobStore, MemoryStore, StoreFactory};
use raisin::worker::cpu::CpuSampler;
use raisin::worker::{CpuPolicy, FunctionRegistry, WorkerDaemon};

/// Hands out clones of named in-memory stores, so several simulated
/// machines share one medium. The credential is the store name.
#[derive(Default)]
pub struct SharedMemoryFactory {
    stores: Mutex<HashMap<String, MemoryStore>>,
}

impl SharedMemoryFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get (or create) the store behind a credential, for direct
    /// inspection from tests.
    pub fn store(&self, name: &str) -> MemoryStore {
        self.stores
            .lock()
            .expect("factory mutex poisoned")
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl StoreFactory for SharedMemoryFactory {
    fn open(&self, kind: BackendKind, credential: &str) -> Option<Box<dyn BlobStore>> {
        match kind {
            BackendKind::Memory => Some(Box::new(self.store(credential))),
            BackendKind::Dir => None,
        }
    }
}

/// Demo functions plus failure/slowness knobs the suites rely on.
pub fn test_functions() -> Arc<FunctionRegistry> {
    let mut registry = FunctionRegistry::with_builtins();
    registry.register("always_fails", |_| Err("this function never succeeds".to_string()));
    registry.register("slow_square", |args| {
        std::thread::sleep(Duration::from_millis(200));
        let x = args
            .first()
            .and_then(raisin::model::ArgValue::as_int)
            .ok_or("slow_square expects one integer")?;
        Ok(raisin::model::ArgValue::Int(x * x))
    });
    Arc::new(registry)
}

/// Session wired to a shared in-memory store, with fast poll timings and
/// state under a per-test temp dir.
pub fn test_session(
    factory: &Arc<SharedMemoryFactory>,
    state: &TempDir,
    store_name: &str,
) -> RequestSession {
    let config = SessionConfig {
        registry: RegistryConfig::new(state.path()),
        job_timeout: Duration::from_millis(500),
        poll_initial: Duration::from_millis(20),
        poll_max: Duration::from_millis(100),
        ..SessionConfig::default()
    }
    .with_backend(BackendKind::Memory, store_name);
    let shared: Arc<dyn StoreFactory> = factory.clone();
    RequestSession::new(config, shared, test_functions())
}

/// Worker wired the same way, with the CPU gate disabled and short
/// claim-lock validity so suites run quickly.
pub fn test_worker(
    factory: &Arc<SharedMemoryFactory>,
    state: &TempDir,
    store_name: &str,
) -> WorkerDaemon {
    let config = WorkerConfig {
        registry: RegistryConfig::new(state.path()),
        cpu: CpuPolicy::Fixed(100.0),
        claim_lock_validity: Duration::from_millis(500),
        reconnect_interval: Duration::from_millis(50),
        idle_interval: Duration::from_millis(20),
        ..WorkerConfig::default()
    }
    .with_backend(BackendKind::Memory, store_name);
    let shared: Arc<dyn StoreFactory> = factory.clone();
    WorkerDaemon::new(config, shared, test_functions())
}

/// Utilization source replaying a fixed script; the last reading repeats
/// once the script runs out. The shared counter tells tests how many
/// samples the gate actually took.
pub struct ScriptedSampler {
    readings: Vec<f64>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSampler {
    pub fn new(readings: Vec<f64>) -> (Box<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let sampler = Box::new(Self {
            readings,
            calls: Arc::clone(&calls),
        });
        (sampler, calls)
    }
}

#[async_trait]
impl CpuSampler for ScriptedSampler {
    async fn utilization(&mut self, _window: Duration) -> f64 {
        let cursor = self.calls.fetch_add(1, Ordering::SeqCst);
        self.readings
            .get(cursor)
            .or_else(|| self.readings.last())
            .copied()
            .unwrap_or(0.0)
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
