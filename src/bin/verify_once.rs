//! One-shot verifier
//!
//! Usage: `verify-once <task description>`
//!
//! Verifies the task against the newest screenshot in `RUN_FOLDER` and prints
//! the verdict as JSON on stdout.

use desk_verifier::{
    config::VerifierConfig,
    verifier::{LatestScreenshot, Task, Verifier},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "desk_verifier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        anyhow::bail!("usage: verify-once <task description>");
    }

    let config = VerifierConfig::from_env()?;
    let verifier = Verifier::from_config(&config);
    let screenshots = LatestScreenshot::new(config.run_folder.clone());

    let verification = verifier
        .verify_current(&Task::new(task), &screenshots)
        .await?;

    let output = serde_json::json!({
        "thinking": verification.verdict.thinking,
        "is_completed": verification.verdict.is_completed,
        "model": verification.model,
        "checked_at": verification.checked_at.to_rfc3339(),
        "usage": verification.usage(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
