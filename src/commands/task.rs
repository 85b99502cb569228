use clap::{Args, Subcommand};
use lyra_engine::types::{Target, TaskBudget, TaskId};

use crate::commands::engine;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a new research task from a hypothesis.
    Create(CreateArgs),
    /// Queue search/DOI/URL targets against an existing task.
    Queue(QueueArgs),
    /// Report a task's current status, searches, metrics, and auth queue.
    Status(StatusArgs),
    /// Print the claims, fragments, and evidence graph gathered so far.
    Materials(MaterialsArgs),
    /// Cancel a task's non-terminal jobs.
    Stop(StopArgs),
}

#[derive(Args)]
pub struct CreateArgs {
    pub hypothesis: String,
    #[arg(long)]
    pub pages_limit: Option<u32>,
    #[arg(long)]
    pub time_limit_s: Option<u64>,
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Args)]
pub struct QueueArgs {
    pub task_id: String,
    /// One or more search queries to enqueue.
    #[arg(long = "query")]
    pub queries: Vec<String>,
    /// One or more DOIs to enqueue for ingestion.
    #[arg(long = "doi")]
    pub dois: Vec<String>,
    /// One or more URLs to enqueue for ingestion.
    #[arg(long = "url")]
    pub urls: Vec<String>,
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Args)]
pub struct StatusArgs {
    pub task_id: String,
    /// Long-poll up to this many seconds for in-flight jobs to settle.
    #[arg(long)]
    pub wait_seconds: Option<u64>,
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Args)]
pub struct MaterialsArgs {
    pub task_id: String,
    #[arg(long)]
    pub include_graph: bool,
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Args)]
pub struct StopArgs {
    pub task_id: String,
    /// Cancel every non-terminal job instead of just the target search queue.
    #[arg(long)]
    pub all: bool,
    #[arg(short, long)]
    pub config: Option<String>,
}

fn parse_task_id(raw: &str) -> anyhow::Result<TaskId> {
    raw.parse().map_err(|_| anyhow::anyhow!("invalid task id: {raw}"))
}

pub async fn run(cmd: TaskCommand) -> anyhow::Result<()> {
    match cmd {
        TaskCommand::Create(args) => create(args).await,
        TaskCommand::Queue(args) => queue(args).await,
        TaskCommand::Status(args) => status(args).await,
        TaskCommand::Materials(args) => materials(args).await,
        TaskCommand::Stop(args) => stop(args).await,
    }
}

async fn create(args: CreateArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;

    let mut budget = TaskBudget::default();
    if let Some(pages_limit) = args.pages_limit {
        budget.pages_limit = pages_limit;
    }
    if let Some(time_limit_s) = args.time_limit_s {
        budget.time_limit_s = time_limit_s;
    }

    let response = protocol.create_task(args.hypothesis, Some(budget)).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn queue(args: QueueArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;
    let task_id = parse_task_id(&args.task_id)?;

    let mut targets = Vec::new();
    targets.extend(args.queries.into_iter().map(|text| Target::Query { text }));
    targets.extend(args.dois.into_iter().map(|value| Target::Doi { value }));
    targets.extend(args.urls.into_iter().map(|value| Target::Url { value }));
    if targets.is_empty() {
        anyhow::bail!("pass at least one --query, --doi, or --url");
    }

    let response = protocol.queue_targets(task_id, targets).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn status(args: StatusArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;
    let task_id = parse_task_id(&args.task_id)?;

    let response = protocol.get_status(task_id, args.wait_seconds).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn materials(args: MaterialsArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;
    let task_id = parse_task_id(&args.task_id)?;

    let response = protocol.get_materials(task_id, args.include_graph).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn stop(args: StopArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;
    let task_id = parse_task_id(&args.task_id)?;

    let scope = if args.all { lyra_engine::scheduler::StopScope::AllJobs } else { lyra_engine::scheduler::StopScope::TargetQueueOnly };
    let response = protocol.stop_task(task_id, scope).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
