//! Session client
//!
//! Connects to a session server, sends the token and the role configuration
//! from the environment, stores every received image, and acknowledges each
//! progress message until the server completes or interrupts the session.

use desk_verifier::{
    config::ClientConfig,
    session::{client, SessionEnd},
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "desk_verifier=info,session_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    info!("Connecting to {}", config.url);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&serde_json::Value::from(envelope)) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Could not print envelope: {}", e),
            }
        }
    });

    let report = client::run_from_config(&config, Some(tx)).await?;
    let _ = printer.await;

    info!(
        session = %report.session_id,
        acks = report.acks_sent,
        images = report.artifacts.len(),
        decode_failures = report.decode_failures,
        "Session closed"
    );
    for path in &report.artifacts {
        info!("Stored {}", path.display());
    }

    match report.end {
        SessionEnd::Completed(_) => Ok(()),
        SessionEnd::Interrupted(envelope) => {
            let reason = envelope
                .extra
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("no reason given")
                .to_string();
            anyhow::bail!("Session interrupted by server: {}", reason)
        }
        SessionEnd::PeerClosed => anyhow::bail!("Server closed the session without a terminal message"),
    }
}
