//! desk-verifier - session server entry point
//!
//! Accepts orchestrator sessions over WebSocket and reports screenshot
//! verdicts for each session's query.

use std::sync::Arc;

use desk_verifier::{
    config::{ServerConfig, VerifierConfig},
    session::{server, VerificationDriver},
    verifier::{LatestScreenshot, Verifier},
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "desk_verifier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let verifier_config = VerifierConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;
    info!(
        "Loaded configuration: model={}, os={}, run_folder={}",
        verifier_config.model,
        verifier_config.controlled_os,
        verifier_config.run_folder.display()
    );

    let verifier = Arc::new(Verifier::from_config(&verifier_config));
    let screenshots = Arc::new(LatestScreenshot::new(verifier_config.run_folder.clone()));
    let driver = Arc::new(VerificationDriver::new(verifier, screenshots));

    server::serve(server_config, driver).await
}
