use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, util::SubscriberInitExt};

use tracegate_agent::reconcile::AgentPaths;
use tracegate_agent::{router, AgentState, AgentStateStore};
use tracegate_config::AgentConfig;

fn init_tracing() {
	let filter = EnvFilter::from_str(std::env::var("RUST_LOG").ok().as_deref().unwrap_or("info")).unwrap();
	tracing_subscriber::fmt().with_env_filter(filter).finish().init();
}

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	init_tracing();

	let config = AgentConfig::parse();
	if config.agent_auth_token.is_empty() {
		bail!("AGENT_AUTH_TOKEN is required");
	}
	if config.role == "VPS_T" && config.stats_secret.is_empty() {
		bail!("AGENT_STATS_SECRET is required for VPS_T health checks");
	}

	let paths = AgentPaths::new(std::path::Path::new(&config.data_root));
	paths.ensure_dirs()?;
	let store = AgentStateStore::open(std::path::Path::new(&config.data_root)).await?;

	let state = AgentState { config: Arc::new(config.clone()), store: Arc::new(store) };
	let app = router(state);

	let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
	tracing::info!(addr = %listener.local_addr()?, role = %config.role, "agent listening");

	let shutdown = CancellationToken::new();
	let signal_shutdown = shutdown.clone();
	tokio::spawn(async move {
		tokio::signal::ctrl_c().await.ok();
		tracing::info!("received ctrl-c, shutting down agent");
		signal_shutdown.cancel();
	});

	axum::serve(listener, app).with_graceful_shutdown(async move { shutdown.cancelled().await }).await?;
	tracing::info!("agent stopped");
	Ok(())
}
