//! CLI command definitions for sweepq.
//!
//! Every command builds a [`SweepConfig`] from an optional YAML file, then
//! applies flag and `SWEEPQ_*` environment overrides on top.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::SweepConfig;
use crate::error::QueueError;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector, QueueSnapshot};
use crate::scheduler::compute::expected_square_summary;
use crate::scheduler::{
    aggregate, AggregateReport, BackendFamily, BackendKind, Connector, FailOn, ParamFunction,
    Producer, QueueBackend, ReclaimSweeper, SquareFunction, WorkerExit, WorkerOutcome,
    WorkerPool, WorkerPoolConfig,
};

/// Fault-tolerant distributed parameter sweeps.
#[derive(Parser)]
#[command(name = "sweepq")]
#[command(about = "Split a parameter range into chunks and process them on a pool of workers")]
#[command(version)]
#[command(
    long_about = "sweepq plans a parameter range into chunks, distributes them over Redis Streams or an AMQP broker, and folds the results.\n\nExample usage:\n  sweepq produce --backend stream --total 1000000 --chunk-size 1000\n  sweepq work --workers 4\n  sweepq aggregate"
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
    /// Plan the job and enqueue every chunk onto the task channel.
    Produce(ProduceArgs),

    /// Run workers that consume the task channel until idle.
    Work(WorkArgs),

    /// Reclaim stale entries on a stream backend.
    Sweep(SweepArgs),

    /// Fold the results channel into the job answer.
    #[command(alias = "agg")]
    Aggregate(AggregateArgs),

    /// Print channel depths, pending counts and dead-letter counts.
    Stats(StatsArgs),

    /// Run a whole job in-process against an in-memory backend.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

/// Backend and channel selection shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct BackendArgs {
    /// YAML configuration file; flags override its values.
    #[arg(short = 'c', long, env = "SWEEPQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend: stream, broker, memory-stream, memory-broker.
    #[arg(short = 'b', long, env = "SWEEPQ_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Redis URL for the stream backend.
    #[arg(long, env = "SWEEPQ_REDIS_URL")]
    pub redis_url: Option<String>,

    /// AMQP URL for the broker backend.
    #[arg(long, env = "SWEEPQ_AMQP_URL")]
    pub amqp_url: Option<String>,

    /// Task channel name.
    #[arg(long, env = "SWEEPQ_TASK_CHANNEL")]
    pub task_channel: Option<String>,

    /// Results channel name.
    #[arg(long, env = "SWEEPQ_RESULTS_CHANNEL")]
    pub results_channel: Option<String>,

    /// Consumer group (stream backends).
    #[arg(long, env = "SWEEPQ_GROUP")]
    pub group: Option<String>,
}

/// Arguments for `sweepq produce`.
#[derive(Parser, Debug)]
pub struct ProduceArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Total number of parameters to sweep.
    #[arg(short = 'n', long, env = "SWEEPQ_TOTAL_PARAMETERS")]
    pub total: Option<u64>,

    /// Parameters per chunk.
    #[arg(short = 's', long, env = "SWEEPQ_CHUNK_SIZE")]
    pub chunk_size: Option<u64>,

    /// Skip the first N chunks of the plan (resume an interrupted run).
    #[arg(long, default_value = "0")]
    pub resume_from: usize,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sweepq work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Number of workers in this process.
    #[arg(short = 'w', long, default_value = "1", env = "SWEEPQ_WORKERS")]
    pub workers: usize,

    /// Worker id prefix; defaults to a random one.
    #[arg(long, env = "SWEEPQ_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Exit after this many tasks per worker.
    #[arg(long, env = "SWEEPQ_MAX_TASKS")]
    pub max_tasks: Option<u64>,

    /// Exit after this long without a task, in milliseconds.
    #[arg(long, env = "SWEEPQ_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Exit with status 70 on the first compute failure.
    #[arg(long, env = "SWEEPQ_FAIL_FAST")]
    pub fail_fast: bool,

    /// Do not plan and produce the job if the task channel is empty.
    #[arg(long)]
    pub no_bootstrap: bool,

    /// Artificial compute latency per chunk, in milliseconds.
    #[arg(long, default_value = "0")]
    pub latency_ms: u64,
}

/// Arguments for `sweepq sweep`.
#[derive(Parser, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Consumer id the sweeper claims entries under.
    #[arg(long, default_value = "sweeper")]
    pub consumer_id: String,

    /// Run a single sweep and exit.
    #[arg(long)]
    pub once: bool,

    /// Idle time after which an entry is considered abandoned, in milliseconds.
    #[arg(long, env = "SWEEPQ_STALENESS_MS")]
    pub staleness_ms: Option<u64>,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sweepq aggregate`.
#[derive(Parser, Debug)]
pub struct AggregateArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Number of distinct chunks expected; defaults to the configured plan.
    #[arg(long)]
    pub expected: Option<u64>,

    /// Stop after this long without a result, in milliseconds.
    #[arg(long, default_value = "30000")]
    pub idle_deadline_ms: u64,

    /// Consumer id used on the results channel.
    #[arg(long, default_value = "aggregator")]
    pub consumer_id: String,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `sweepq stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Print the Prometheus text exposition instead of a table.
    #[arg(long)]
    pub prometheus: bool,

    /// Output as JSON.
    #[arg(short = 'j', long, conflicts_with = "prometheus")]
    pub json: bool,
}

/// Arguments for `sweepq simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// In-memory backend: memory-stream or memory-broker.
    #[arg(short = 'b', long, default_value = "memory-stream")]
    pub backend: BackendKind,

    /// Number of workers.
    #[arg(short = 'w', long, default_value = "3")]
    pub workers: usize,

    /// Total number of parameters.
    #[arg(short = 'n', long, default_value = "1000")]
    pub total: u64,

    /// Parameters per chunk.
    #[arg(short = 's', long, default_value = "10")]
    pub chunk_size: u64,

    /// Kill one worker once the pool has completed this many chunks.
    #[arg(long)]
    pub kill_after: Option<u64>,

    /// Parameters whose computation always fails (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub fail_params: Vec<u64>,

    /// Stream staleness threshold, in milliseconds.
    #[arg(long, default_value = "300")]
    pub staleness_ms: u64,

    /// Artificial compute latency per chunk, in milliseconds.
    #[arg(long, default_value = "1")]
    pub latency_ms: u64,

    /// Output the report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<u8> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns the process exit status for commands that finish without error.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<u8> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    match cli.command {
        Commands::Produce(args) => run_produce_command(args).await,
        Commands::Work(args) => run_work_command(args).await,
        Commands::Sweep(args) => run_sweep_command(args).await,
        Commands::Aggregate(args) => run_aggregate_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Simulate(args) => run_simulate_command(args).await,
    }
}

/// Exit status for an error returned by [`run_with_cli`].
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<QueueError>())
        .map_or(1, QueueError::exit_code)
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(args: &BackendArgs) -> anyhow::Result<SweepConfig> {
    let mut config = match &args.config {
        Some(path) => SweepConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SweepConfig::default(),
    };

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(url) = &args.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(url) = &args.amqp_url {
        config.amqp_url = url.clone();
    }
    if let Some(channel) = &args.task_channel {
        config.task_channel = channel.clone();
    }
    if let Some(channel) = &args.results_channel {
        config.results_channel = channel.clone();
    }
    if let Some(group) = &args.group {
        config.group = group.clone();
    }
    Ok(config)
}

fn validated(config: SweepConfig) -> anyhow::Result<SweepConfig> {
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn default_worker_prefix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn spawn_ctrl_c(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            let _ = shutdown.send(());
        }
    });
}

// ============================================================================
// Produce
// ============================================================================

async fn run_produce_command(args: ProduceArgs) -> anyhow::Result<u8> {
    let mut config = load_config(&args.backend)?;
    if let Some(total) = args.total {
        config.total_parameters = total;
    }
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    let config = validated(config)?;

    let backend = Connector::from_config(&config).connect().await?;
    for channel in [&config.task_channel, &config.results_channel] {
        match backend.initialize(channel, &config.group).await {
            Ok(()) => {}
            Err(e) if e.is_benign() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let chunks = crate::scheduler::planner::plan(config.total_parameters, config.chunk_size)?;
    let report = Producer::new(Arc::clone(&backend), config.task_channel.clone())
        .with_backoff(config.retry.backoff())
        .produce_from(&chunks, args.resume_from)
        .await?;
    // Workers starting later must not bootstrap the job a second time.
    backend.mark_initialized(&config.task_channel).await?;

    if args.json {
        #[derive(Serialize)]
        struct Output<'a> {
            channel: &'a str,
            planned: usize,
            enqueued: usize,
            skipped: usize,
            elapsed_ms: u64,
        }
        let output = Output {
            channel: &config.task_channel,
            planned: report.planned,
            enqueued: report.enqueued,
            skipped: report.skipped,
            elapsed_ms: report.elapsed.as_millis() as u64,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Produced {} chunks", report.enqueued);
        println!("  Channel:  {}", config.task_channel);
        println!("  Planned:  {}", report.planned);
        println!("  Skipped:  {}", report.skipped);
        println!("  Elapsed:  {:.2}s", report.elapsed.as_secs_f64());
    }
    Ok(0)
}

// ============================================================================
// Work
// ============================================================================

async fn run_work_command(args: WorkArgs) -> anyhow::Result<u8> {
    let mut config = load_config(&args.backend)?;
    if args.max_tasks.is_some() {
        config.worker.max_tasks = args.max_tasks;
    }
    if let Some(idle) = args.idle_timeout_ms {
        config.worker.idle_timeout_ms = idle;
    }
    if args.fail_fast {
        config.worker.fail_fast = true;
    }
    let config = validated(config)?;

    let function: Arc<dyn ParamFunction> = Arc::new(SquareFunction::with_latency(
        Duration::from_millis(args.latency_ms),
    ));
    let pool_config = WorkerPoolConfig::new(args.workers.max(1))
        .with_worker_prefix(args.worker_id.unwrap_or_else(default_worker_prefix))
        .with_bootstrap(!args.no_bootstrap);

    let mut pool = WorkerPool::new(
        pool_config,
        config.clone(),
        Connector::from_config(&config),
        function,
    );
    spawn_ctrl_c(pool.shutdown_signal());
    pool.start()?;
    let report = pool.wait().await?;

    for outcome in &report.outcomes {
        match outcome {
            WorkerOutcome::Finished(worker) => println!(
                "{}: {} (completed {}, failed {}, poison {}, reclaimed {})",
                worker.worker_id,
                worker.exit,
                worker.completed,
                worker.failed,
                worker.poison,
                worker.sweeps.reclaimed
            ),
            WorkerOutcome::Failed { worker_id, error } => {
                println!("{}: error: {}", worker_id, error)
            }
            WorkerOutcome::Killed { worker_id } => println!("{}: killed", worker_id),
        }
    }

    if let Some(error) = report.first_error() {
        return Ok(error.exit_code());
    }
    let code = report
        .finished()
        .map(|worker| worker.exit.exit_code())
        .max()
        .unwrap_or(0);
    Ok(code)
}

// ============================================================================
// Sweep
// ============================================================================

async fn run_sweep_command(args: SweepArgs) -> anyhow::Result<u8> {
    let mut config = load_config(&args.backend)?;
    if let Some(staleness) = args.staleness_ms {
        config.stream.staleness_threshold_ms = staleness;
    }
    let config = validated(config)?;

    if config.backend.family() != BackendFamily::Stream {
        return Err(QueueError::Unsupported {
            backend: config.backend.as_str(),
            operation: "sweep",
        }
        .into());
    }

    let backend = Connector::from_config(&config).connect().await?;
    let sweeper = ReclaimSweeper::new(backend, &config, args.consumer_id);

    let report = if args.once {
        sweeper.sweep_once().await?
    } else {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        spawn_ctrl_c(shutdown_tx);
        sweeper.run(shutdown_rx).await?
    };

    if args.json {
        let output = BTreeMap::from([
            ("reclaimed", report.reclaimed),
            ("requeued", report.requeued),
            ("dead_lettered", report.dead_lettered),
        ]);
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Sweep finished");
        println!("  Reclaimed:     {}", report.reclaimed);
        println!("  Requeued:      {}", report.requeued);
        println!("  Dead-lettered: {}", report.dead_lettered);
    }
    Ok(0)
}

// ============================================================================
// Aggregate
// ============================================================================

async fn run_aggregate_command(args: AggregateArgs) -> anyhow::Result<u8> {
    let config = validated(load_config(&args.backend)?)?;
    let expected = args.expected.unwrap_or_else(|| config.expected_chunks());

    let backend = Connector::from_config(&config).connect().await?;
    let report = aggregate(
        backend,
        &config.results_channel,
        &config.group,
        &args.consumer_id,
        expected,
        Duration::from_millis(args.idle_deadline_ms),
    )
    .await?;

    print_aggregate(&report, args.json)?;
    Ok(if report.complete { 0 } else { 1 })
}

fn print_aggregate(report: &AggregateReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("\n=== Aggregate ===");
    println!("Sum:             {}", report.sum);
    println!("Count:           {}", report.count);
    println!(
        "Chunks:          {}/{}",
        report.processed_chunks, report.expected_chunks
    );
    println!("Duplicates:      {}", report.duplicates);
    println!("Failed attempts: {}", report.failed_attempts);
    println!("Complete:        {}", report.complete);
    Ok(())
}

// ============================================================================
// Stats
// ============================================================================

async fn snapshot(
    backend: &Arc<dyn QueueBackend>,
    channel: &str,
    group: &str,
) -> Result<QueueSnapshot, QueueError> {
    let depth = backend.channel_depth(channel).await?;
    let pending = backend.pending_count(channel, group).await?;
    let dead_letter = backend.dead_letter_count(channel).await?;
    Ok(QueueSnapshot::new(channel, depth, pending, dead_letter))
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<u8> {
    let config = validated(load_config(&args.backend)?)?;
    let backend = Connector::from_config(&config).connect().await?;

    let collector = MetricsCollector::new();
    let mut snapshots = Vec::new();
    for channel in [&config.task_channel, &config.results_channel] {
        let snapshot = snapshot(&backend, channel, &config.group).await?;
        collector.record_queue(&snapshot);
        snapshots.push(snapshot);
    }

    if args.prometheus {
        print!("{}", export_metrics());
    } else if args.json {
        #[derive(Serialize)]
        struct Row<'a> {
            channel: &'a str,
            depth: u64,
            pending: u64,
            dead_letter: u64,
        }
        let rows: Vec<_> = snapshots
            .iter()
            .map(|s| Row {
                channel: &s.queue_name,
                depth: s.depth,
                pending: s.pending,
                dead_letter: s.dead_letter,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("Backend: {}", config.backend);
        println!("{:<24} {:>10} {:>10} {:>12}", "CHANNEL", "DEPTH", "PENDING", "DEAD-LETTER");
        for s in &snapshots {
            println!(
                "{:<24} {:>10} {:>10} {:>12}",
                s.queue_name, s.depth, s.pending, s.dead_letter
            );
        }
    }
    Ok(0)
}

// ============================================================================
// Simulate
// ============================================================================

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<u8> {
    if !matches!(
        args.backend,
        BackendKind::MemoryStream | BackendKind::MemoryBroker
    ) {
        anyhow::bail!(
            "simulate runs against memory-stream or memory-broker, not {}",
            args.backend
        );
    }

    let config = validated(
        SweepConfig::default()
            .with_backend(args.backend)
            .with_job(args.total, args.chunk_size)
            .with_staleness(
                Duration::from_millis(args.staleness_ms),
                Duration::from_millis((args.staleness_ms / 3).max(10)),
            )
            .with_broker_retries(3, Duration::from_millis(50))
            .with_idle_timeout(Duration::from_millis((args.staleness_ms * 4).max(1_000)))
            .with_block_timeout(Duration::from_millis(100)),
    )?;

    let square = SquareFunction::with_latency(Duration::from_millis(args.latency_ms));
    let function: Arc<dyn ParamFunction> = if args.fail_params.is_empty() {
        Arc::new(square)
    } else {
        Arc::new(FailOn::new(square, args.fail_params.iter().copied()))
    };

    let connector = Connector::from_config(&config);
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(args.workers.max(1)).with_worker_prefix("sim"),
        config.clone(),
        connector.clone(),
        function,
    );
    pool.start()?;

    if let Some(threshold) = args.kill_after {
        while pool.stats().chunks_completed < threshold && pool.live_workers() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Prefer a worker caught holding a chunk.
        let victim = pool
            .in_flight()
            .into_keys()
            .next()
            .or_else(|| pool.worker_ids().into_iter().next());
        if let Some(victim) = victim {
            pool.kill(&victim);
        }
    }

    let pool_report = pool.wait().await?;
    if let Some(error) = pool_report.first_error() {
        warn!(error = %error, "A simulated worker failed");
    }

    let backend = connector.connect().await?;
    let report = aggregate(
        Arc::clone(&backend),
        &config.results_channel,
        &config.group,
        "aggregator",
        config.expected_chunks(),
        Duration::from_millis(500),
    )
    .await?;
    let dead_letters = backend.dead_letter_count(&config.task_channel).await?;
    let expected = expected_square_summary(args.total);
    let matches = report.complete && report.sum == expected.sum && report.count == expected.count;

    if args.json {
        #[derive(Serialize)]
        struct Output<'a> {
            backend: &'a str,
            aggregate: &'a AggregateReport,
            killed: &'a [String],
            dead_letters: u64,
            expected_sum: i64,
            matches_expected: bool,
        }
        let output = Output {
            backend: args.backend.as_str(),
            aggregate: &report,
            killed: pool.killed(),
            dead_letters,
            expected_sum: expected.sum,
            matches_expected: matches,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_aggregate(&report, false)?;
        println!("Killed workers:  {:?}", pool.killed());
        println!("Dead letters:    {}", dead_letters);
        println!("Expected sum:    {}", expected.sum);
        println!(
            "Result:          {}",
            if matches { "✓ matches" } else { "✗ mismatch" }
        );
        let computed_exits = pool_report
            .finished()
            .filter(|w| matches!(w.exit, WorkerExit::ComputeFailed { .. }))
            .count();
        if computed_exits > 0 {
            println!("Fail-fast exits: {}", computed_exits);
        }
    }

    Ok(if matches || !args.fail_params.is_empty() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_work() {
        let cli = Cli::try_parse_from([
            "sweepq",
            "work",
            "--backend",
            "memory-broker",
            "--workers",
            "3",
            "--max-tasks",
            "10",
        ])
        .expect("parse");
        match cli.command {
            Commands::Work(args) => {
                assert_eq!(args.backend.backend, Some(BackendKind::MemoryBroker));
                assert_eq!(args.workers, 3);
                assert_eq!(args.max_tasks, Some(10));
            }
            _ => panic!("expected work command"),
        }
    }

    #[test]
    fn test_cli_parses_simulate_fail_params() {
        let cli = Cli::try_parse_from([
            "sweepq",
            "simulate",
            "--kill-after",
            "30",
            "--fail-params",
            "3,7",
        ])
        .expect("parse");
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.kill_after, Some(30));
                assert_eq!(args.fail_params, vec![3, 7]);
                assert_eq!(args.backend, BackendKind::MemoryStream);
            }
            _ => panic!("expected simulate command"),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = BackendArgs {
            config: None,
            backend: Some(BackendKind::MemoryStream),
            redis_url: None,
            amqp_url: None,
            task_channel: Some("jobs".into()),
            results_channel: None,
            group: Some("pool-a".into()),
        };
        let config = load_config(&args).expect("config");
        assert_eq!(config.backend, BackendKind::MemoryStream);
        assert_eq!(config.task_channel, "jobs");
        assert_eq!(config.results_channel, "results");
        assert_eq!(config.group, "pool-a");
    }

    #[test]
    fn test_exit_code_for_unavailable_backend() {
        let err = anyhow::Error::new(QueueError::BackendUnavailable("refused".into()))
            .context("connecting");
        assert_eq!(exit_code_for(&err), 69);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }

    #[tokio::test]
    async fn test_simulate_command_matches_expected() {
        let args = SimulateArgs {
            backend: BackendKind::MemoryBroker,
            workers: 2,
            total: 100,
            chunk_size: 10,
            kill_after: None,
            fail_params: Vec::new(),
            staleness_ms: 100,
            latency_ms: 0,
            json: true,
        };
        assert_eq!(run_simulate_command(args).await.expect("simulate"), 0);
    }
}
