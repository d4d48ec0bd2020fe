use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mill_socket::{net::patterns::Requester, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let address = args
        .next()
        .unwrap_or_else(|| "tcp://127.0.0.1:5555".to_string());
    let count: usize = match args.next() {
        Some(n) => n.parse().context("request count must be a number")?,
        None => 10,
    };

    let config = EngineConfig::builder().pool_size(8).workers(2).build();
    let requester = Requester::connect(&address, config, Duration::from_secs(5))
        .with_context(|| format!("failed to connect to {address}"))?;

    for i in 0..count {
        let start = Instant::now();
        let reply = requester.request(b"ping")?;
        info!(
            seq = i,
            reply = %String::from_utf8_lossy(&reply),
            elapsed_us = start.elapsed().as_micros() as u64,
            "reply"
        );
    }

    requester.close()?;
    Ok(())
}
