//! CLI command definitions for case-orchestrator.
//!
//! Commands talk to the shared Redis-backed queue, so a `worker` started in
//! one process drains tasks enqueued by `enqueue`, `alert` or `workflow` in
//! another. Workflow records live in the same store under the queue name, so
//! a worker can run steps of a workflow it did not create.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::{
    Alert, AlertType, HttpRecommender, OrchestrationEngine, Recommender, StaticRecommender,
};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    HandlerRegistry, Payload, Task, TaskHandler, TaskPriority, TaskQueue, WorkerPool,
};
use crate::services::HttpServiceClient;
use crate::state_machine::{AuditTrailHandler, CaseState, HandlerTable, StateMachineManager};
use crate::workflow::{
    WorkflowDefinition, WorkflowOrchestrator, WorkflowStepHandler, WorkflowStore,
    WORKFLOW_STEP_TASK,
};

/// How often a running worker refreshes the queue depth gauges.
const DEPTH_REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Task types produced by accepted propositions.
const ACTION_TASK_TYPES: [&str; 3] = ["auto_fix", "manual_review", "escalate"];

/// Remediation case orchestrator.
#[derive(Parser)]
#[command(name = "case-orchestrator")]
#[command(about = "Priority task queue, DAG workflows and case lifecycle for incident remediation")]
#[command(version)]
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
    /// Run a worker pool until interrupted.
    Worker(WorkerArgs),

    /// Enqueue a single task.
    Enqueue(EnqueueArgs),

    /// Show queue depths and counters.
    Stats(StatsArgs),

    /// List dead-lettered tasks.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Move a dead-lettered task back into its queue.
    Replay(ReplayArgs),

    /// Process an alert and print the propositions for it.
    Alert(AlertArgs),

    /// Run or enqueue a workflow described in a YAML file.
    Workflow(WorkflowArgs),
}

#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (overrides CASE_ORCH_WORKERS).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Requeue tasks left in the processing list by a crashed worker before
    /// starting. Only use when no other worker is running.
    #[arg(long)]
    pub recover: bool,
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type used to pick the handler.
    pub task_type: String,

    /// JSON object payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// critical, high, normal or low.
    #[arg(short = 'P', long, default_value = "normal")]
    pub priority: TaskPriority,

    /// Deliver no earlier than this many seconds from now.
    #[arg(long)]
    pub delay_secs: Option<u64>,

    /// Retry budget (defaults to CASE_ORCH_MAX_RETRIES).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output as JSON.
    #[arg(long, conflicts_with = "prometheus")]
    pub json: bool,

    /// Output queue depth gauges in Prometheus text format.
    #[arg(long)]
    pub prometheus: bool,
}

#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of tasks to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// Id of the dead-lettered task.
    pub task_id: String,
}

#[derive(Parser, Debug)]
pub struct AlertArgs {
    /// Alert type, e.g. ci_failure or spam_incident.
    #[arg(short = 't', long = "type")]
    pub alert_type: AlertType,

    /// Human-readable description.
    #[arg(short, long)]
    pub description: String,

    /// Alert id; generated when omitted.
    #[arg(long)]
    pub id: Option<String>,

    #[arg(short, long, default_value = "medium")]
    pub severity: String,

    #[arg(long, default_value = "cli")]
    pub source: String,

    /// JSON object with extra context.
    #[arg(long, default_value = "{}")]
    pub metadata: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct WorkflowArgs {
    /// YAML file with `case_id` and `steps`.
    pub file: String,

    /// Case id, overriding the file.
    #[arg(long)]
    pub case_id: Option<String>,

    /// Push steps onto the queue instead of running them here.
    #[arg(long)]
    pub enqueue: bool,

    /// Priority for queued steps.
    #[arg(short = 'P', long, default_value = "normal")]
    pub priority: TaskPriority,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("Invalid configuration")?;
    match cli.command {
        Commands::Worker(args) => run_worker_command(&config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(&config, args).await,
        Commands::Stats(args) => run_stats_command(&config, args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(&config, args).await,
        Commands::Replay(args) => run_replay_command(&config, args).await,
        Commands::Alert(args) => run_alert_command(&config, args).await,
        Commands::Workflow(args) => run_workflow_command(&config, args).await,
    }
}

async fn connect_queue(config: &OrchestratorConfig) -> anyhow::Result<Arc<TaskQueue>> {
    let queue = TaskQueue::connect(&config.redis_url, &config.queue_name)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))?
        .with_poll_interval(config.poll_interval);
    Ok(Arc::new(queue))
}

async fn build_orchestrator(
    config: &OrchestratorConfig,
    queue: &TaskQueue,
) -> anyhow::Result<Arc<WorkflowOrchestrator>> {
    let client = HttpServiceClient::new().context("Failed to build HTTP client")?;
    let orchestrator = WorkflowOrchestrator::new(Arc::new(client))
        .with_store(WorkflowStore::new(queue.backend(), queue.queue_name()))
        .with_breaker_config(config.breaker_config());
    for (name, endpoint) in &config.services {
        orchestrator.register_service(name.as_str(), endpoint.as_str()).await;
    }
    Ok(Arc::new(orchestrator))
}

fn build_recommender(config: &OrchestratorConfig) -> anyhow::Result<Arc<dyn Recommender>> {
    match &config.recommender_url {
        Some(url) => Ok(Arc::new(
            HttpRecommender::new(url.as_str(), config.recommender_timeout)
                .context("Failed to build recommender client")?,
        )),
        None => Ok(Arc::new(StaticRecommender::default())),
    }
}

async fn build_engine(config: &OrchestratorConfig) -> anyhow::Result<OrchestrationEngine> {
    let queue = connect_queue(config).await?;
    let orchestrator = build_orchestrator(config, &queue).await?;
    let engine = OrchestrationEngine::new(queue, build_recommender(config)?, orchestrator)
    .with_breaker(config.breaker_config())
    .with_task_max_retries(config.max_retries);
    Ok(engine)
}

/// Parse a JSON object argument.
fn parse_payload(raw: &str) -> anyhow::Result<Payload> {
    match serde_json::from_str::<Value>(raw).context("Payload is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Payload must be a JSON object, got {other}"),
    }
}

/// Read and validate a workflow definition from a YAML file.
pub fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition: WorkflowDefinition = serde_yaml::from_str(&raw)
        .with_context(|| format!("Invalid workflow file {}", path.display()))?;
    definition
        .validate()
        .with_context(|| format!("Invalid workflow file {}", path.display()))?;
    Ok(definition)
}

/// Case manager for a worker: logs every transition into a finished state.
fn worker_case_manager() -> Arc<StateMachineManager> {
    let audit: Arc<AuditTrailHandler> = Arc::new(AuditTrailHandler);
    let mut handlers = HandlerTable::new();
    for state in [CaseState::Resolved, CaseState::Failed] {
        handlers.register(state, audit.clone());
    }
    Arc::new(StateMachineManager::with_handlers(handlers))
}

/// Forwards proposition tasks to a service of the same name when one is
/// registered; otherwise acknowledges them.
struct ActionTaskHandler {
    orchestrator: Arc<WorkflowOrchestrator>,
}

#[async_trait]
impl TaskHandler for ActionTaskHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<Option<Value>> {
        let services = self.orchestrator.registered_services().await;
        if !services.iter().any(|name| name == &task.task_type) {
            info!(
                task_id = %task.task_id,
                task_type = %task.task_type,
                alert_id = task.payload_str("alert_id").unwrap_or("-"),
                "No service registered for action, acknowledging"
            );
            return Ok(None);
        }
        let result = self
            .orchestrator
            .call_service(&task.task_type, "execute", &task.payload)
            .await?;
        Ok(Some(result))
    }
}

async fn run_worker_command(config: &OrchestratorConfig, args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let queue = connect_queue(config).await?;
    let orchestrator = build_orchestrator(config, &queue).await?;

    let step_handler =
        WorkflowStepHandler::new(Arc::clone(&orchestrator)).with_case_manager(worker_case_manager());
    let mut handlers = HandlerRegistry::new().with_handler(WORKFLOW_STEP_TASK, Arc::new(step_handler));
    let action_handler: Arc<dyn TaskHandler> = Arc::new(ActionTaskHandler {
        orchestrator: Arc::clone(&orchestrator),
    });
    for task_type in ACTION_TASK_TYPES {
        handlers.register(task_type, Arc::clone(&action_handler));
    }

    let mut pool_config = config.worker_pool_config().with_recovery(args.recover);
    if let Some(workers) = args.workers {
        pool_config.num_workers = workers;
    }

    let mut pool = WorkerPool::new(pool_config, Arc::clone(&queue), handlers);
    pool.start().await?;
    info!("Worker pool running, press Ctrl-C to stop");

    let depth_reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEPTH_REPORT_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = queue.publish_depth_metrics().await {
                warn!(error = %e, "Failed to publish queue depth");
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    depth_reporter.abort();
    pool.shutdown().await?;

    let stats = pool.stats();
    println!(
        "Processed {} tasks ({} completed, {} failed, {} timed out)",
        stats.total_processed(),
        stats.tasks_completed,
        stats.tasks_failed,
        stats.tasks_timed_out
    );
    Ok(())
}

async fn run_enqueue_command(config: &OrchestratorConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let payload = parse_payload(&args.payload)?;
    let scheduled_at = args
        .delay_secs
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

    let task = queue
        .enqueue(
            &args.task_type,
            payload,
            args.priority,
            scheduled_at,
            args.max_retries.unwrap_or(config.max_retries),
        )
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Enqueued {} ({}, {})", task.task_id, task.task_type, task.priority);
    }
    Ok(())
}

async fn run_stats_command(config: &OrchestratorConfig, args: StatsArgs) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;

    if args.prometheus {
        init_metrics().context("Failed to initialize metrics")?;
        queue.publish_depth_metrics().await?;
        print!("{}", export_metrics());
        return Ok(());
    }

    let stats = queue.get_stats().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("\n=== Queue '{}' ===", stats.queue_name);
        for priority in TaskPriority::ALL {
            println!("{:<14}{}", format!("{priority}:"), stats.depth(priority));
        }
        println!("{:<14}{}", "scheduled:", stats.scheduled);
        println!("{:<14}{}", "processing:", stats.processing);
        println!("{:<14}{}", "dead letters:", stats.dead_lettered);
        println!("{:<14}{}", "total tasks:", stats.total_tasks);
    }
    Ok(())
}

async fn run_dead_letters_command(
    config: &OrchestratorConfig,
    args: DeadLettersArgs,
) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let tasks = queue.get_dead_letter_tasks(args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No dead-lettered tasks");
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{} [{}] {} retries={} error={}",
            task.task_id,
            task.priority,
            task.task_type,
            task.retry_count,
            task.error_message.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_replay_command(config: &OrchestratorConfig, args: ReplayArgs) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let task = queue.replay_dead_letter(&args.task_id).await?;
    println!("Replayed {} into {} queue", task.task_id, task.priority);
    Ok(())
}

async fn run_alert_command(config: &OrchestratorConfig, args: AlertArgs) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let alert = Alert::new(
        args.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        args.alert_type,
        args.description,
    )
    .with_severity(args.severity)
    .with_source(args.source)
    .with_metadata(parse_payload(&args.metadata)?);

    let response = engine.process_alert(alert).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    println!(
        "Alert {} ({}) processed, request {}",
        response.alert_id, response.alert_type, response.request_id
    );
    if response.degraded {
        println!("Recommender unavailable, no propositions");
    }
    for prop in &response.propositions {
        println!(
            "  [{}] {} ({}, confidence {:.2})",
            prop.priority, prop.title, prop.action_type, prop.confidence_score
        );
    }
    Ok(())
}

async fn run_workflow_command(config: &OrchestratorConfig, args: WorkflowArgs) -> anyhow::Result<()> {
    let definition = load_workflow(Path::new(&args.file))?;
    let case_id = args
        .case_id
        .or(definition.case_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let engine = build_engine(config).await?;

    if args.enqueue {
        let queued = engine
            .enqueue_workflow(&case_id, definition.steps, args.priority)
            .await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&queued)?);
        } else {
            println!(
                "Queued workflow {} for case {} ({} steps)",
                queued.workflow_id,
                queued.case_id,
                queued.task_ids.len()
            );
        }
        return Ok(());
    }

    let status = engine.run_workflow(&case_id, definition.steps).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Workflow {} for case {}: {}", status.workflow_id, status.case_id, status.state);
        for (step_id, step_status) in &status.step_status {
            println!("  {step_id}: {step_status}");
        }
    }
    Ok(())
}
