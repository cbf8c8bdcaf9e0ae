//! CLI command definitions for abstract-pool.
//!
//! `supervise` runs the pool supervisor, which re-executes this binary with
//! the hidden `worker` subcommand once per slot. The remaining commands
//! feed the queues and inspect the abstracts index.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::index::{
    Abstract, DeleteTarget, DocumentIndex, ElasticIndex, IndexConfig, MemoryIndex, Pmid,
    DEFAULT_INDEX,
};
use crate::metrics::init_metrics;
use crate::scheduler::{
    wait_for_redis, IndexJobHandler, Job, JobHandler, JobPayload, JobPriority, PoolSupervisor,
    PriorityCounts, PriorityQueues, ProcessLauncher, QueueAssignment, QueueError, SupervisorConfig,
    Worker, WorkerConfig,
};

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_ELASTICSEARCH_URL: &str = "http://localhost:9200";

/// Attempts a worker makes to reach Redis before giving up.
const REDIS_CONNECT_ATTEMPTS: u32 = 5;

/// Priority worker pool and search client for PubMed abstracts.
#[derive(Parser)]
#[command(name = "abstract-pool")]
#[command(about = "Supervise priority workers that index and search PubMed abstracts")]
#[command(version)]
#[command(
    long_about = "abstract-pool keeps a pool of worker processes consuming the HIGH, MEDIUM and LOW job queues and runs their jobs against an Elasticsearch abstracts index.\n\nExample usage:\n  abstract-pool supervise -w 5 --high-priority 2 --medium-priority 1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Launch the worker pool and restart workers that die.
    Supervise(SuperviseArgs),

    /// Run one worker for a slot. Launched by `supervise`.
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Put a job on a priority queue.
    Enqueue(EnqueueArgs),

    /// Show the stored result of a job.
    Result(ResultArgs),

    /// Show per-queue job counts.
    Queues(QueuesArgs),

    /// Read or modify the abstracts index directly.
    Index(IndexArgs),
}

/// Broker and backend locations shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Redis URL of the job queues.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Elasticsearch base URL.
    #[arg(long, env = "ELASTICSEARCH_URL", default_value = DEFAULT_ELASTICSEARCH_URL)]
    pub elasticsearch_url: String,

    /// Name of the abstracts index.
    #[arg(long, env = "ABSTRACTS_INDEX", default_value = DEFAULT_INDEX)]
    pub index: String,

    /// Wait for writes to become searchable before returning.
    #[arg(long)]
    pub refresh: bool,
}

impl ConnectionArgs {
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig::new(&self.elasticsearch_url)
            .with_index_name(&self.index)
            .with_refresh_on_write(self.refresh)
    }

    /// The same connection settings as command-line flags, for child workers.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--redis-url".to_string(),
            self.redis_url.clone(),
            "--elasticsearch-url".to_string(),
            self.elasticsearch_url.clone(),
            "--index".to_string(),
            self.index.clone(),
        ];
        if self.refresh {
            args.push("--refresh".to_string());
        }
        args
    }
}

/// Settings each worker runs with.
#[derive(clap::Args, Debug, Clone)]
pub struct WorkerRuntimeArgs {
    /// Milliseconds to wait between polls when every queue is empty.
    #[arg(long, default_value = "1000")]
    pub worker_poll_interval_ms: u64,

    /// Maximum seconds a single job may run.
    #[arg(long, default_value = "43200")]
    pub job_timeout_secs: u64,

    /// Directory for Prometheus textfile snapshots.
    #[arg(long)]
    pub metrics_dir: Option<PathBuf>,

    /// Run jobs against an in-process index instead of Elasticsearch.
    #[arg(long)]
    pub memory_index: bool,
}

impl WorkerRuntimeArgs {
    fn worker_config(&self, slot: usize, queues: QueueAssignment) -> WorkerConfig {
        let config = WorkerConfig::new(slot, queues)
            .with_poll_interval(Duration::from_millis(self.worker_poll_interval_ms))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs));
        match &self.metrics_dir {
            Some(dir) => config.with_metrics_dir(dir),
            None => config,
        }
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--worker-poll-interval-ms".to_string(),
            self.worker_poll_interval_ms.to_string(),
            "--job-timeout-secs".to_string(),
            self.job_timeout_secs.to_string(),
        ];
        if let Some(dir) = &self.metrics_dir {
            args.push("--metrics-dir".to_string());
            args.push(dir.display().to_string());
        }
        if self.memory_index {
            args.push("--memory-index".to_string());
        }
        args
    }
}

/// Arguments for `abstract-pool supervise`.
#[derive(Parser, Debug)]
pub struct SuperviseArgs {
    /// Number of worker processes.
    #[arg(short = 'w', long)]
    pub workers: usize,

    /// Workers consuming only the HIGH queue.
    #[arg(long, default_value = "0")]
    pub high_priority: usize,

    /// Workers consuming only the MEDIUM queue.
    #[arg(long, default_value = "0")]
    pub medium_priority: usize,

    /// Workers consuming only the LOW queue. Any remaining workers consume all queues.
    #[arg(long, default_value = "0")]
    pub low_priority: usize,

    /// Seconds between worker liveness checks.
    #[arg(long, default_value = "5")]
    pub poll_interval_secs: u64,

    /// Seconds to wait before starting workers.
    #[arg(long, default_value = "10")]
    pub startup_delay_secs: u64,

    /// Run a single worker in this process instead of supervising a pool.
    #[arg(long)]
    pub inline: bool,

    #[command(flatten)]
    pub runtime: WorkerRuntimeArgs,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

impl SuperviseArgs {
    fn priorities(&self) -> PriorityCounts {
        PriorityCounts::new(self.high_priority, self.medium_priority, self.low_priority)
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let config = SupervisorConfig::new(self.workers)
            .with_priorities(self.priorities())
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_startup_delay(Duration::from_secs(self.startup_delay_secs));
        match &self.runtime.metrics_dir {
            Some(dir) => config.with_metrics_dir(dir),
            None => config,
        }
    }
}

/// Arguments for `abstract-pool worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Slot index assigned by the supervisor.
    #[arg(long)]
    pub slot: usize,

    /// Queues to consume, e.g. "HIGH" or "HIGH,MEDIUM,LOW".
    #[arg(long)]
    pub queues: QueueAssignment,

    #[command(flatten)]
    pub runtime: WorkerRuntimeArgs,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `abstract-pool enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Queue priority (HIGH, MEDIUM or LOW). Unknown values fall back to MEDIUM.
    #[arg(short, long, default_value = "MEDIUM")]
    pub priority: String,

    /// JSON file holding the job payload.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Attempts before the job goes to the dead letter list.
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `abstract-pool result`.
#[derive(Parser, Debug)]
pub struct ResultArgs {
    /// Job id printed by `enqueue`.
    pub job_id: Uuid,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `abstract-pool queues`.
#[derive(Parser, Debug)]
pub struct QueuesArgs {
    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `abstract-pool index`.
#[derive(Parser, Debug)]
pub struct IndexArgs {
    #[command(subcommand)]
    pub command: IndexSubcommand,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Index subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum IndexSubcommand {
    /// Create the index if it does not exist.
    Ensure,

    /// Print one abstract.
    Get { pmid: Pmid },

    /// Search titles and texts. Several queries run in one round trip.
    Search {
        #[arg(required = true)]
        queries: Vec<String>,
    },

    /// Print every indexed PMID.
    Ids,

    /// Upsert abstracts from a JSON array file.
    Post {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Delete abstracts by PMID, or the whole index with "all".
    Delete {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Merge citation counts from a JSON object file ({"<pmid>": count}).
    Citations {
        #[arg(short, long)]
        file: PathBuf,
    },
}

impl IndexSubcommand {
    /// Writes need the index with its mapping, not one the backend
    /// auto-creates on the first document.
    fn writes_documents(&self) -> bool {
        matches!(self, Self::Post { .. } | Self::Citations { .. })
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Supervise(args) => run_supervise_command(args, &cli.log_level).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Result(args) => run_result_command(args).await,
        Commands::Queues(args) => run_queues_command(args).await,
        Commands::Index(args) => run_index_command(args).await,
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Pool
// ============================================================================

async fn run_supervise_command(args: SuperviseArgs, log_level: &str) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    if args.inline {
        let queues = args.priorities().assign(0);
        let delay = Duration::from_secs(args.startup_delay_secs);
        if !delay.is_zero() {
            info!(delay = ?delay, "Waiting before starting worker");
            tokio::time::sleep(delay).await;
        }
        info!(queues = %queues, "Running a single worker in this process");
        return run_worker(0, queues, &args.runtime, &args.connection).await;
    }

    let mut worker_args = args.connection.to_args();
    worker_args.extend(args.runtime.to_args());
    let launcher = ProcessLauncher::current_exe()?
        .with_global_args(["--log-level", log_level])
        .with_worker_args(worker_args);

    let mut supervisor = PoolSupervisor::new(args.supervisor_config(), launcher)?;
    for slot in supervisor.slots() {
        info!(slot = slot.index, queues = %slot.queues, "Planned worker slot");
    }

    supervisor.run_until(shutdown_signal()).await;

    let stats = supervisor.stats();
    info!(total_restarts = stats.total_restarts, "Supervisor stopped");
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    run_worker(args.slot, args.queues, &args.runtime, &args.connection).await
}

async fn run_worker(
    slot: usize,
    queues: QueueAssignment,
    runtime: &WorkerRuntimeArgs,
    connection: &ConnectionArgs,
) -> anyhow::Result<()> {
    let job_queues = wait_for_redis(
        &connection.redis_url,
        REDIS_CONNECT_ATTEMPTS,
        Duration::from_secs(1),
    )
    .await
    .context("Failed to connect to Redis")?;

    let handler: Arc<dyn JobHandler> = if runtime.memory_index {
        warn!("Using an in-process index; documents are lost when the worker exits");
        Arc::new(IndexJobHandler::new(Arc::new(MemoryIndex::new())))
    } else {
        let index = ElasticIndex::connect(connection.index_config())
            .await
            .context("Failed to connect to Elasticsearch")?;
        Arc::new(IndexJobHandler::new(Arc::new(index)))
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let worker = Worker::new(
        runtime.worker_config(slot, queues),
        Arc::new(job_queues),
        handler,
        shutdown_rx,
    );
    let stats = worker.run().await;

    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        timed_out = stats.jobs_timed_out,
        "Worker exited"
    );
    Ok(())
}

// ============================================================================
// Queues
// ============================================================================

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let priority = JobPriority::parse_or_default(&args.priority);
    let payload: JobPayload = read_json(&args.file)?;

    let job = Job::new(priority, payload).with_max_attempts(args.max_attempts);
    let queues = PriorityQueues::connect(&args.connection.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    queues.enqueue(&job).await?;

    info!(job_id = %job.id, kind = job.payload.kind(), priority = %priority, "Job enqueued");
    println!("{}", job.id);
    Ok(())
}

async fn run_result_command(args: ResultArgs) -> anyhow::Result<()> {
    let queues = PriorityQueues::connect(&args.connection.redis_url)
        .await
        .context("Failed to connect to Redis")?;

    let result = queues
        .get_result(args.job_id)
        .await?
        .ok_or(QueueError::JobNotFound(args.job_id))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_queues_command(args: QueuesArgs) -> anyhow::Result<()> {
    let queues = PriorityQueues::connect(&args.connection.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let stats = queues.stats().await?;

    if args.json {
        let output: Vec<_> = stats
            .iter()
            .map(|s| {
                serde_json::json!({
                    "queue": s.priority.name(),
                    "pending": s.pending_jobs,
                    "processing": s.processing_jobs,
                    "dead_letter": s.dead_letter_jobs,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{:<8} {:>10} {:>12} {:>12}", "QUEUE", "PENDING", "PROCESSING", "DEAD");
        for s in &stats {
            println!(
                "{:<8} {:>10} {:>12} {:>12}",
                s.priority.name(),
                s.pending_jobs,
                s.processing_jobs,
                s.dead_letter_jobs
            );
        }
    }
    Ok(())
}

// ============================================================================
// Index
// ============================================================================

async fn run_index_command(args: IndexArgs) -> anyhow::Result<()> {
    let config = args.connection.index_config();
    let index = if args.command.writes_documents() {
        ElasticIndex::connect(config)
            .await
            .context("Failed to connect to Elasticsearch")?
    } else {
        ElasticIndex::new(config)?
    };

    match args.command {
        IndexSubcommand::Ensure => {
            if index.ensure_index().await? {
                println!("Created index {}", index.index_name());
            } else {
                println!("Index {} already exists", index.index_name());
            }
        }
        IndexSubcommand::Get { pmid } => {
            let doc = index.get(pmid).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        IndexSubcommand::Search { queries } => {
            if let [query] = queries.as_slice() {
                let hits = index.search(query).await?;
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                let results = index.multi_search(&queries).await?;
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
        }
        IndexSubcommand::Ids => {
            for pmid in index.get_all_identifiers().await? {
                println!("{}", pmid);
            }
        }
        IndexSubcommand::Post { file } => {
            let abstracts: Vec<Abstract> = read_json(&file)?;
            index.post(&abstracts).await?;
            println!("Posted {} abstracts", abstracts.len());
        }
        IndexSubcommand::Delete { targets } => {
            let target = DeleteTarget::from_args(&targets)?;
            index.delete(&target).await?;
            match target {
                DeleteTarget::All => println!("Deleted index {}", index.index_name()),
                DeleteTarget::Ids(ids) => println!("Deleted {} abstracts", ids.len()),
            }
        }
        IndexSubcommand::Citations { file } => {
            let counts: std::collections::BTreeMap<Pmid, u64> = read_json(&file)?;
            index.add_citation_counts(&counts).await?;
            println!("Updated {} citation counts", counts.len());
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}
