use clap::Args;

use crate::commands::engine;

#[derive(Args)]
pub struct ServeArgs {
    /// Path to a YAML/TOML/JSON config file. Defaults to the built-in config.
    #[arg(short, long)]
    pub config: Option<String>,
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (_protocol, scheduler) = engine::build(config)?;

    let handles = scheduler.start();
    println!("lyra engine running, workers: {}", handles.len());
    println!("press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
