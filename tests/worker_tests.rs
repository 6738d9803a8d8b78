//! Worker-daemon behavior: claim passes, blacklist discipline, failure
//! requeueing, the CPU gate, and startup garbage collection.

mod test_harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use raisin::model::{job_key, ArgValue, JobPayload, JobRecord, JobState, ResultRecord};
use raisin::registry::INFO_KEY;
use raisin::store::BlobStore;
use raisin::worker::CpuPolicy;
use test_harness::{test_worker, ScriptedSampler, SharedMemoryFactory};

/// Seed a job record directly, the way a session would write it.
async fn seed_job(
    store: &raisin::store::MemoryStore,
    function: &str,
    args: Vec<ArgValue>,
    timeout: Duration,
) -> JobRecord {
    let record = JobRecord::new(JobPayload::new(function, args), timeout);
    store
        .put(&record.key(), &serde_json::to_vec(&record).expect("serialize"))
        .await
        .expect("seed job");
    record
}

async fn read_job(store: &raisin::store::MemoryStore, result_id: &str) -> Option<JobRecord> {
    let bytes = store.get(&job_key(result_id)).await.expect("get")?;
    Some(serde_json::from_slice(&bytes).expect("parse job record"))
}

#[tokio::test]
async fn claim_takes_waiting_job_and_blacklists_itself() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let worker = test_worker(&factory, &state, "cluster");

    let seeded = seed_job(&store, "square", vec![ArgValue::Int(7)], Duration::from_secs(60)).await;

    let claimed = worker
        .claim_job(&store)
        .await
        .expect("claim scan")
        .expect("a waiting job is claimable");
    assert_eq!(claimed.result_id, seeded.result_id);
    assert_eq!(claimed.state, JobState::InProgress);
    assert!(claimed.is_blacklisted(&worker.worker_id()));

    // The rewrite is visible to everyone else too.
    let on_store = read_job(&store, &seeded.result_id).await.expect("record kept");
    assert_eq!(on_store.state, JobState::InProgress);
    assert!(on_store.is_blacklisted(&worker.worker_id()));
}

#[tokio::test]
async fn claim_prefers_waiting_over_expired_in_progress() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let worker = test_worker(&factory, &state, "cluster");

    // An in-progress job whose claim has expired...
    let mut abandoned = JobRecord::new(
        JobPayload::new("square", vec![ArgValue::Int(2)]),
        Duration::from_millis(50),
    );
    abandoned.state = JobState::InProgress;
    abandoned.last_claim_at = Utc::now() - chrono::Duration::seconds(10);
    store
        .put(&abandoned.key(), &serde_json::to_vec(&abandoned).expect("serialize"))
        .await
        .expect("seed abandoned");

    // ...and a plain waiting job.
    let waiting = seed_job(&store, "square", vec![ArgValue::Int(3)], Duration::from_secs(60)).await;

    let claimed = worker
        .claim_job(&store)
        .await
        .expect("claim scan")
        .expect("something claimable");
    assert_eq!(
        claimed.result_id, waiting.result_id,
        "pass 1 takes waiting work before reclaiming abandoned work"
    );
}

#[tokio::test]
async fn claim_reclaims_expired_in_progress_job() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let worker = test_worker(&factory, &state, "cluster");

    let mut abandoned = JobRecord::new(
        JobPayload::new("square", vec![ArgValue::Int(2)]),
        Duration::from_millis(50),
    );
    abandoned.state = JobState::InProgress;
    abandoned.last_claim_at = Utc::now() - chrono::Duration::seconds(10);
    abandoned.blacklist("some-other-worker");
    store
        .put(&abandoned.key(), &serde_json::to_vec(&abandoned).expect("serialize"))
        .await
        .expect("seed abandoned");

    let claimed = worker
        .claim_job(&store)
        .await
        .expect("claim scan")
        .expect("expired claims are reclaimable");
    assert_eq!(claimed.result_id, abandoned.result_id);
    assert!(claimed.is_blacklisted("some-other-worker"), "history survives");
    assert!(claimed.is_blacklisted(&worker.worker_id()));
}

#[tokio::test]
async fn last_pass_steals_live_claims_from_other_workers() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let worker = test_worker(&factory, &state, "cluster");

    // In progress elsewhere, claim still fresh. With nothing better on
    // offer, the most permissive pass assumes the holder is dead anyway —
    // execution is at-least-once, and the result key is idempotent.
    let mut live = JobRecord::new(
        JobPayload::new("square", vec![ArgValue::Int(5)]),
        Duration::from_secs(3600),
    );
    live.state = JobState::InProgress;
    live.last_claim_at = Utc::now();
    live.blacklist("other-worker");
    store
        .put(&live.key(), &serde_json::to_vec(&live).expect("serialize"))
        .await
        .expect("seed live claim");

    let claimed = worker
        .claim_job(&store)
        .await
        .expect("claim scan")
        .expect("pass 3 takes anything we have not attempted");
    assert_eq!(claimed.result_id, live.result_id);
}

#[tokio::test]
async fn worker_never_reclaims_its_own_failure() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let mut worker = test_worker(&factory, &state, "cluster");

    seed_job(&store, "always_fails", vec![], Duration::from_millis(50)).await;

    // First pass: claim, execute, fail, requeue with ourselves
    // blacklisted.
    assert!(worker.run_once(&store).await.expect("iteration"), "job processed");

    // Even with the claim stamp long expired, the same worker must never
    // pick the job up again, in any state.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(
        !worker.run_once(&store).await.expect("iteration"),
        "self-retry is forbidden"
    );

    let keys: Vec<String> = store
        .list_keys()
        .await
        .expect("list")
        .into_iter()
        .filter(|k| k.starts_with("job:"))
        .collect();
    assert_eq!(keys.len(), 1, "the failed job stays queued for other workers");
}

#[tokio::test]
async fn failed_job_is_requeued_waiting_with_fresh_stamp() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let mut worker = test_worker(&factory, &state, "cluster");

    let seeded = seed_job(&store, "always_fails", vec![], Duration::from_secs(60)).await;
    assert!(worker.run_once(&store).await.expect("iteration"));

    let requeued = read_job(&store, &seeded.result_id).await.expect("still queued");
    assert_eq!(requeued.state, JobState::Waiting);
    assert!(requeued.is_blacklisted(&worker.worker_id()));
    assert!(
        requeued.last_claim_at > seeded.last_claim_at,
        "the failure refreshes the claim stamp"
    );
    assert!(
        store.get(&seeded.result_id).await.expect("get").is_none(),
        "no result record for a failed job"
    );
}

#[tokio::test]
async fn successful_job_publishes_result_and_removes_record() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let mut worker = test_worker(&factory, &state, "cluster");

    let seeded = seed_job(&store, "square", vec![ArgValue::Int(9)], Duration::from_secs(60)).await;
    assert!(worker.run_once(&store).await.expect("iteration"));

    assert!(read_job(&store, &seeded.result_id).await.is_none(), "job record gone");
    let bytes = store
        .get(&seeded.result_id)
        .await
        .expect("get")
        .expect("result published");
    let result: ResultRecord = serde_json::from_slice(&bytes).expect("parse result");
    assert_eq!(result.value, ArgValue::Int(81));
    assert_eq!(result.worker_id, worker.worker_id());
}

#[tokio::test]
async fn cpu_gate_blocks_until_under_threshold() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let (sampler, calls) = ScriptedSampler::new(vec![90.0, 80.0, 30.0]);
    // Gate at 50%: two hot readings hold the worker, the third lets it
    // through.
    let mut worker = test_worker(&factory, &state, "cluster")
        .with_sampler(sampler)
        .with_cpu_policy(CpuPolicy::Fixed(50.0));

    let shutdown = CancellationToken::new();
    worker.check_cpu_budget(&shutdown).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3, "blocked until the meter dropped");
}

#[tokio::test]
async fn cpu_gate_disabled_at_full_threshold() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let (sampler, calls) = ScriptedSampler::new(vec![99.0]);
    let mut worker = test_worker(&factory, &state, "cluster")
        .with_sampler(sampler)
        .with_cpu_policy(CpuPolicy::Fixed(100.0));

    let shutdown = CancellationToken::new();
    worker.check_cpu_budget(&shutdown).await;
    assert_eq!(
        calls.load(Ordering::SeqCst),
        0,
        "a threshold of 100 skips sampling entirely"
    );
}

#[tokio::test]
async fn clean_sweeps_stale_records_and_advertises_candidates() {
    let state = TempDir::new().expect("tempdir");
    let factory = SharedMemoryFactory::new();
    let store = factory.store("cluster");
    let mut worker = test_worker(&factory, &state, "cluster");

    // A job from last month, a fresh one, and an uncollected result from
    // last month.
    let mut stale_job = JobRecord::new(
        JobPayload::new("square", vec![ArgValue::Int(1)]),
        Duration::from_secs(60),
    );
    stale_job.submitted_at = Utc::now() - chrono::Duration::days(30);
    store
        .put(&stale_job.key(), &serde_json::to_vec(&stale_job).expect("serialize"))
        .await
        .expect("seed stale job");

    let fresh_job = seed_job(&store, "square", vec![ArgValue::Int(2)], Duration::from_secs(60)).await;

    let stale_result = ResultRecord {
        worker_id: "w-old".to_string(),
        elapsed: Duration::from_millis(5),
        value: ArgValue::Int(1),
        produced_at: Utc::now() - chrono::Duration::days(30),
    };
    store
        .put("deadbeef", &serde_json::to_vec(&stale_result).expect("serialize"))
        .await
        .expect("seed stale result");

    worker.clean(&store).await.expect("clean");

    assert!(read_job(&store, &stale_job.result_id).await.is_none(), "month-old job swept");
    assert!(read_job(&store, &fresh_job.result_id).await.is_some(), "fresh job kept");
    assert!(store.get("deadbeef").await.expect("get").is_none(), "month-old result swept");
    assert!(
        store.get(INFO_KEY).await.expect("get").is_some(),
        "candidate list advertised after the merge"
    );
}
