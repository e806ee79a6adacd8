use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, util::SubscriberInitExt};

use tracegate_config::{DbConfig, DispatcherConfig};
use tracegate_outbox::{dispatcher_id, outbox_retention_loop, Dispatcher};

fn init_tracing() {
	let filter = EnvFilter::from_str(std::env::var("RUST_LOG").ok().as_deref().unwrap_or("info")).unwrap();
	tracing_subscriber::fmt().with_env_filter(filter).finish().init();
}

/// Parses a config struct from its env vars/defaults only. `DbConfig` and
/// `DispatcherConfig` are each full `clap::Parser`s sharing this process's
/// argv, so this binary is configured via environment rather than flags.
fn parse_env_only<T: Parser>() -> T {
	T::parse_from(std::iter::once(std::env::args().next().unwrap_or_default()))
}

#[tokio::main]
async fn main() -> Result<()> {
	dotenv::dotenv().ok();
	init_tracing();

	let db_config: DbConfig = parse_env_only();
	let dispatcher_config: DispatcherConfig = parse_env_only();

	let pool = tracegate_db::connect(&db_config).await?;
	let dispatcher = Dispatcher::new(pool.clone(), dispatcher_config.clone())?;

	let shutdown = CancellationToken::new();
	let signal_shutdown = shutdown.clone();
	tokio::spawn(async move {
		tokio::signal::ctrl_c().await.ok();
		tracing::info!("received ctrl-c, shutting down dispatcher");
		signal_shutdown.cancel();
	});

	if dispatcher_config.outbox_retention_enabled {
		let retention_pool = pool.clone();
		let retention_config = dispatcher_config.clone();
		tokio::spawn(outbox_retention_loop(retention_pool, retention_config));
	}

	tracing::info!(dispatcher_id = %dispatcher_id(), "dispatcher starting");

	tokio::select! {
		() = dispatcher.run() => {}
		() = shutdown.cancelled() => {
			tracing::info!("dispatcher stopped");
		}
	}

	Ok(())
}
