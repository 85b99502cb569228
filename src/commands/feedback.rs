use clap::Args;

use crate::commands::engine;

#[derive(Args)]
pub struct FeedbackArgs {
    /// One of `edge_correct`, `claim_mark`, `domain_reclassify`.
    pub action: String,
    /// The edge id, claim id, or domain name the correction targets.
    pub target_id: String,
    /// Action-specific fields as a JSON object, e.g. `{"relation":"refutes"}`.
    #[arg(long, default_value = "{}")]
    pub payload: String,
    #[arg(short, long)]
    pub config: Option<String>,
}

pub async fn run(args: FeedbackArgs) -> anyhow::Result<()> {
    let config = engine::load_config(args.config.as_deref())?;
    let (protocol, _scheduler) = engine::build(config)?;

    let payload: serde_json::Value = serde_json::from_str(&args.payload)?;
    let response = protocol.feedback(&args.action, &args.target_id, payload).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
