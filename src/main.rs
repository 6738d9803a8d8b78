use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use raisin::config::{RegistryConfig, SessionConfig, WorkerConfig};
use raisin::model::{parse_job_key, ArgValue, JobRecord, ResultRecord, LOCK_KEY_PREFIX};
use raisin::registry::{BackendRegistry, ConnectOptions, INFO_KEY};
use raisin::session::RequestSession;
use raisin::shutdown::install_shutdown_handler;
use raisin::store::{BackendKind, DefaultStoreFactory, StoreFactory};
use raisin::worker::{CpuPolicy, FunctionRegistry, WorkerDaemon};

#[derive(Parser, Debug)]
#[command(name = "raisin")]
#[command(version)]
#[command(about = "Peer-to-peer job distribution over a shared blob store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker daemon donating spare CPU
    Worker(WorkerArgs),

    /// Submit a job and wait for its result
    Submit(SubmitArgs),

    /// List job and result records on the connected backend
    Status(BackendArgs),
}

// =============================================================================
// Shared Backend Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BackendArgs {
    /// Backend kind to prefer ("dir" or "memory")
    #[arg(long)]
    backend: Option<String>,

    /// Credential for the preferred backend (the directory path for "dir")
    #[arg(long)]
    credential: Option<String>,

    /// Directory holding the candidate file and the result cache
    #[arg(long, default_value = ".raisin")]
    state_dir: PathBuf,
}

impl BackendArgs {
    fn kind(&self) -> Result<Option<BackendKind>, String> {
        self.backend.as_deref().map(str::parse).transpose()
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// CPU admission policy: a fixed percentage ("80") or a time-of-day
    /// schedule ("4:00=100,8:30=50,23:00=10"). 100 disables the gate.
    #[arg(long, default_value = "100")]
    cpu: String,

    /// Averaging window for one CPU sample, in seconds
    #[arg(long, default_value = "30")]
    cpu_window_secs: u64,

    /// Sleep between reconnection attempts, in seconds
    #[arg(long, default_value = "60")]
    reconnect_secs: u64,

    /// Sleep after an empty scan, in seconds
    #[arg(long, default_value = "5")]
    idle_secs: u64,
}

// =============================================================================
// Submit Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// Registered function to run (e.g. "square")
    #[arg(long)]
    function: String,

    /// Argument value; repeat for multiple arguments. Parsed as integer,
    /// float, or boolean when possible, text otherwise.
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Give up after this many seconds instead of waiting forever
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Fail instead of falling back to local execution
    #[arg(long)]
    remote_only: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    value: serde_json::Value,
    worker_id: String,
    elapsed_ms: u64,
}

#[derive(Serialize)]
struct StatusJobOutput {
    result_id: String,
    state: String,
    function: String,
    failures: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_arg(raw: &str) -> ArgValue {
    if let Ok(v) = raw.parse::<i64>() {
        return ArgValue::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return ArgValue::Float(v);
    }
    if let Ok(v) = raw.parse::<bool>() {
        return ArgValue::Bool(v);
    }
    ArgValue::Text(raw.to_string())
}

fn render_value(value: &ArgValue) -> serde_json::Value {
    match value {
        ArgValue::Null => serde_json::Value::Null,
        ArgValue::Bool(v) => serde_json::Value::from(*v),
        ArgValue::Int(v) => serde_json::Value::from(*v),
        ArgValue::Float(v) => serde_json::Value::from(*v),
        ArgValue::Text(v) => serde_json::Value::from(v.clone()),
        ArgValue::Bytes(v) => serde_json::Value::from(v.clone()),
        ArgValue::List(items) => serde_json::Value::from(
            items.iter().map(render_value).collect::<Vec<_>>(),
        ),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cpu = CpuPolicy::parse(&args.cpu)?;
    let kind = args.backend.kind()?;

    let config = WorkerConfig {
        registry: RegistryConfig::new(&args.backend.state_dir),
        preferred_kind: kind,
        credential: args.backend.credential,
        cpu,
        cpu_window: Duration::from_secs(args.cpu_window_secs),
        reconnect_interval: Duration::from_secs(args.reconnect_secs),
        idle_interval: Duration::from_secs(args.idle_secs),
        ..WorkerConfig::default()
    };

    let factory: Arc<dyn StoreFactory> = Arc::new(DefaultStoreFactory);
    let functions = Arc::new(FunctionRegistry::with_builtins());
    let mut daemon = WorkerDaemon::new(config, factory, functions);

    tracing::info!(worker_id = %daemon.worker_id(), "Starting raisin worker");
    let shutdown = install_shutdown_handler();
    daemon.run(shutdown).await;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let kind = args.backend.kind()?;
    let config = SessionConfig {
        registry: RegistryConfig::new(&args.backend.state_dir),
        preferred_kind: kind,
        credential: args.backend.credential.clone(),
        ..SessionConfig::default()
    };

    let factory: Arc<dyn StoreFactory> = Arc::new(DefaultStoreFactory);
    if args.remote_only {
        // Probe connectivity up front so operators see "no backend" as an
        // error instead of a silent local fallback.
        let mut probe =
            BackendRegistry::new(RegistryConfig::new(&args.backend.state_dir), Arc::clone(&factory));
        let opts = ConnectOptions {
            preferred_kind: kind,
            credential: args.backend.credential.clone(),
            try_first_only: kind.is_some() && args.backend.credential.is_some(),
            restrict_to_kind: kind.is_some(),
        };
        if probe.connect(&opts).await.is_none() {
            eprintln!("Error: no backend reachable and --remote-only was given");
            std::process::exit(1);
        }
    }
    let functions = Arc::new(FunctionRegistry::with_builtins());
    let mut session = RequestSession::new(config, factory, functions);

    let values: Vec<ArgValue> = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let mut handle = session.submit(&args.function, values).await;

    let envelope = match args.timeout_secs {
        Some(secs) => handle.get_with_deadline(Duration::from_secs(secs)).await?,
        None => handle.get_with_metadata(true).await?,
    };

    let Some(envelope) = envelope else {
        eprintln!("Error: no result produced");
        std::process::exit(1);
    };

    match args.output {
        OutputFormat::Json => {
            let output = SubmitOutput {
                value: render_value(&envelope.value),
                worker_id: envelope.worker_id,
                elapsed_ms: envelope.elapsed.as_millis() as u64,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Result:   {}", render_value(&envelope.value));
            println!("Worker:   {}", envelope.worker_id);
            println!("Elapsed:  {} ms", envelope.elapsed.as_millis());
        }
    }
    Ok(())
}

async fn run_status(args: BackendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let kind = args.kind()?;
    let factory: Arc<dyn StoreFactory> = Arc::new(DefaultStoreFactory);
    let mut registry = BackendRegistry::new(RegistryConfig::new(&args.state_dir), factory);

    let opts = ConnectOptions {
        preferred_kind: kind,
        credential: args.credential.clone(),
        try_first_only: kind.is_some() && args.credential.is_some(),
        restrict_to_kind: kind.is_some(),
    };
    let Some(store) = registry.connect(&opts).await else {
        eprintln!("Error: no backend reachable");
        std::process::exit(1);
    };

    let mut jobs: Vec<StatusJobOutput> = Vec::new();
    let mut results = 0usize;
    for key in store.list_keys().await? {
        if key == INFO_KEY || key.starts_with(LOCK_KEY_PREFIX) {
            continue;
        }
        let Some(bytes) = store.get(&key).await? else {
            continue;
        };
        if parse_job_key(&key).is_some() {
            if let Ok(job) = serde_json::from_slice::<JobRecord>(&bytes) {
                jobs.push(StatusJobOutput {
                    result_id: job.result_id,
                    state: job.state.to_string(),
                    function: job.payload.function,
                    failures: job.blacklisted_workers.len(),
                });
            }
        } else if serde_json::from_slice::<ResultRecord>(&bytes).is_ok() {
            results += 1;
        }
    }

    if jobs.is_empty() && results == 0 {
        println!("No jobs or results on the backend.");
        return Ok(());
    }

    println!("{:<34} {:<12} {:<16} FAILURES", "RESULT ID", "STATE", "FUNCTION");
    println!("{}", "-".repeat(74));
    for job in &jobs {
        println!(
            "{:<34} {:<12} {:<16} {}",
            job.result_id, job.state, job.function, job.failures
        );
    }
    println!();
    println!("{} pending job(s), {} uncollected result(s)", jobs.len(), results);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Submit(submit_args) => run_submit(submit_args).await?,
        Commands::Status(status_args) => run_status(status_args).await?,
    }

    Ok(())
}
