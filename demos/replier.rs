use anyhow::{Context, Result};
use mill_socket::{net::patterns::Replier, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Answers every "ping" with "pong" and echoes anything else.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:5555".to_string());

    let replier = Replier::bind(&address, EngineConfig::default())
        .with_context(|| format!("failed to listen on {address}"))?;
    info!(addr = %replier.local_addr()?, "waiting for requests");

    replier.run(|request| {
        info!(message = %String::from_utf8_lossy(request), "request");
        if request == b"ping" {
            Some(b"pong".to_vec())
        } else {
            Some(request.to_vec())
        }
    })?;

    Ok(())
}
