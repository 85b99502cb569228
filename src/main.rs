#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};

mod commands;

use commands::auth::AuthCommand;
use commands::task::TaskCommand;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lyra", version = VERSION, about = "Local-first research-automation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler's worker loops, processing queued jobs until interrupted.
    Serve(commands::serve::ServeArgs),
    /// Create, queue, inspect, and stop research tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Resolve recorded corrections into the evidence graph.
    Feedback(commands::feedback::FeedbackArgs),
    /// Manage the human-in-the-loop authentication queue.
    #[command(subcommand)]
    Auth(AuthCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Task(cmd) => commands::task::run(cmd).await,
        Command::Feedback(args) => commands::feedback::run(args).await,
        Command::Auth(cmd) => commands::auth::run(cmd).await,
    }
}
