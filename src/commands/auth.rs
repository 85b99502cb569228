use clap::{Args, Subcommand};
use lyra_engine::types::{InterventionId, TaskId};

use crate::commands::engine;

#[derive(Subcommand)]
pub enum AuthCommand {
    /// List interventions waiting on a human (CAPTCHA, login wall, ...).
    List(ListArgs),
    /// Resolve a pending intervention and requeue its parked jobs.
    Resolve(ResolveArgs),
}

#[derive(Args)]
pub struct ListArgs {
    pub task_id: String,
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Args)]
pub struct ResolveArgs {
    pub queue_id: String,
    /// Session data (cookies, conditional headers) as a JSON object, captured
    /// out of band by an operator. Omit to let the engine's own fetcher
    /// capture the session.
    #[arg(long)]
    pub session_data: Option<String>,
    #[arg(short, long)]
    pub config: Option<String>,
}

pub async fn run(cmd: AuthCommand) -> anyhow::Result<()> {
    match cmd {
        AuthCommand::List(args) => list(args).await,
        AuthCommand::Resolve(args) => resolve(args).await,
    }
}

async fn list(args: ListArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;
    let task_id: TaskId = args.task_id.parse().map_err(|_| anyhow::anyhow!("invalid task id"))?;

    let pending = protocol.get_auth_queue(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&pending)?);
    Ok(())
}

async fn resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;
    let queue_id: InterventionId = args.queue_id.parse().map_err(|_| anyhow::anyhow!("invalid queue id"))?;
    let session_data = args.session_data.as_deref().map(serde_json::from_str).transpose()?;

    let response = protocol.resolve_auth(queue_id, session_data).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
