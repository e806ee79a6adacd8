//! Environment-driven configuration structs shared by the dispatcher and agent binaries.

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

fn parse_duration_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

/// Control-plane database connectivity.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
pub struct DbConfig {
	#[arg(long, env = "DATABASE_URL", default_value = "sqlite://tracegate.db")]
	pub database_url: String,

	#[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "5")]
	pub max_connections: u32,
}

impl DbConfig {
	pub fn new() -> Self {
		Self::parse()
	}
}

impl Default for DbConfig {
	fn default() -> Self {
		Self { database_url: "sqlite::memory:".to_string(), max_connections: 5 }
	}
}

/// Dispatcher loop tuning plus the shared agent bearer token and optional mTLS material.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
pub struct DispatcherConfig {
	#[arg(long, env = "AGENT_AUTH_TOKEN")]
	pub agent_auth_token: String,

	#[arg(long, env = "DISPATCHER_POLL_SECS", default_value = "2", value_parser = parse_duration_secs)]
	pub poll_interval: Duration,

	#[arg(long, env = "DISPATCHER_BATCH_SIZE", default_value = "50")]
	pub batch_size: u32,

	#[arg(long, env = "DISPATCHER_CONCURRENCY", default_value = "8")]
	pub concurrency: usize,

	#[arg(long, env = "DISPATCHER_MAX_ATTEMPTS", default_value = "8")]
	pub max_attempts: u32,

	#[arg(long, env = "DISPATCHER_LOCK_TTL_SECS", default_value = "30", value_parser = parse_duration_secs)]
	pub lock_ttl: Duration,

	#[arg(long, env = "DISPATCHER_HTTP_TIMEOUT_SECS", default_value = "20", value_parser = parse_duration_secs)]
	pub http_timeout: Duration,

	#[arg(long, env = "DISPATCHER_CLIENT_CERT")]
	pub client_cert: Option<String>,

	#[arg(long, env = "DISPATCHER_CLIENT_KEY")]
	pub client_key: Option<String>,

	#[arg(long, env = "DISPATCHER_CA_CERT")]
	pub ca_cert: Option<String>,

	#[arg(long, env = "DISPATCHER_OUTBOX_RETENTION_ENABLED", default_value = "true")]
	pub outbox_retention_enabled: bool,

	#[arg(long, env = "DISPATCHER_OUTBOX_RETENTION_INTERVAL_SECS", default_value = "3600", value_parser = parse_duration_secs)]
	pub outbox_retention_interval: Duration,

	#[arg(long, env = "DISPATCHER_OUTBOX_RETENTION_SENT_DAYS", default_value = "7")]
	pub outbox_retention_sent_days: i64,

	#[arg(long, env = "DISPATCHER_OUTBOX_RETENTION_FAILED_DAYS", default_value = "30")]
	pub outbox_retention_failed_days: i64,

	#[arg(long, env = "DISPATCHER_OUTBOX_RETENTION_BATCH_SIZE", default_value = "500")]
	pub outbox_retention_batch_size: u32,
}

impl DispatcherConfig {
	pub fn new() -> Self {
		Self::parse()
	}

	#[cfg(test)]
	pub fn test() -> Self {
		Self {
			agent_auth_token: "test-token".to_string(),
			poll_interval: Duration::from_millis(10),
			batch_size: 10,
			concurrency: 2,
			max_attempts: 3,
			lock_ttl: Duration::from_secs(5),
			http_timeout: Duration::from_secs(1),
			client_cert: None,
			client_key: None,
			ca_cert: None,
			outbox_retention_enabled: false,
			outbox_retention_interval: Duration::from_secs(60),
			outbox_retention_sent_days: 7,
			outbox_retention_failed_days: 30,
			outbox_retention_batch_size: 100,
		}
	}
}

/// Per-node agent configuration: role, data root, reload commands, live-apply.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
pub struct AgentConfig {
	#[arg(long, env = "AGENT_AUTH_TOKEN")]
	pub agent_auth_token: String,

	#[arg(long, env = "AGENT_ROLE", default_value = "VPS_T")]
	pub role: String,

	#[arg(long, env = "AGENT_HOST", default_value = "0.0.0.0")]
	pub host: String,

	#[arg(long, env = "AGENT_PORT", default_value = "8443")]
	pub port: u16,

	#[arg(long, env = "AGENT_DATA_ROOT", default_value = "/var/lib/tracegate-agent")]
	pub data_root: String,

	#[arg(long, env = "AGENT_DRY_RUN", default_value = "false")]
	pub dry_run: bool,

	#[arg(long, env = "AGENT_RELOAD_XRAY_CMD", default_value = "systemctl reload xray")]
	pub reload_xray_cmd: String,

	#[arg(long, env = "AGENT_RELOAD_HYSTERIA_CMD", default_value = "systemctl reload hysteria-server")]
	pub reload_hysteria_cmd: String,

	#[arg(long, env = "AGENT_RELOAD_WG_CMD", default_value = "wg syncconf wg0 <(wg-quick strip wg0)")]
	pub reload_wg_cmd: String,

	#[arg(long, env = "AGENT_XRAY_API_ENABLED", default_value = "false")]
	pub xray_api_enabled: bool,

	#[arg(long, env = "AGENT_XRAY_API_SERVER", default_value = "127.0.0.1:10085")]
	pub xray_api_server: String,

	#[arg(long, env = "AGENT_XRAY_API_TIMEOUT_SECS", default_value = "3", value_parser = parse_duration_secs)]
	pub xray_api_timeout: Duration,

	#[arg(long, env = "AGENT_STATS_URL", default_value = "")]
	pub stats_url: String,

	#[arg(long, env = "AGENT_STATS_SECRET", default_value = "")]
	pub stats_secret: String,

	#[arg(long, env = "AGENT_WG_INTERFACE", default_value = "wg0")]
	pub wg_interface: String,

	#[arg(long, env = "AGENT_WG_EXPECTED_PORT", default_value = "51820")]
	pub wg_expected_port: u16,

	/// Comma-separated REALITY SNI allow-list seeded into every managed
	/// inbound regardless of which SNIs are currently in use, so a user
	/// issuing a revision with a new camouflage SNI doesn't force a restart.
	#[arg(long, env = "AGENT_SNI_SEED", default_value = "google.com,yandex.ru,microsoft.com,twitch.tv")]
	pub sni_seed: String,
}

impl AgentConfig {
	pub fn new() -> Self {
		Self::parse()
	}

	pub fn sni_seed_list(&self) -> Vec<String> {
		self.sni_seed.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
	}

	#[cfg(test)]
	pub fn test(data_root: impl Into<String>) -> Self {
		Self {
			agent_auth_token: "test-token".to_string(),
			role: "VPS_T".to_string(),
			host: "127.0.0.1".to_string(),
			port: 0,
			data_root: data_root.into(),
			dry_run: true,
			reload_xray_cmd: "true".to_string(),
			reload_hysteria_cmd: "true".to_string(),
			reload_wg_cmd: "true".to_string(),
			xray_api_enabled: false,
			xray_api_server: "127.0.0.1:10085".to_string(),
			xray_api_timeout: Duration::from_secs(1),
			stats_url: String::new(),
			stats_secret: String::new(),
			wg_interface: "wg0".to_string(),
			wg_expected_port: 51820,
			sni_seed: "google.com".to_string(),
		}
	}
}

/// Role-scoped default hosts used when no active `NodeEndpoint` row exists yet for a role.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
pub struct EndpointDefaults {
	#[arg(long, env = "DEFAULT_VPS_T_HOST", default_value = "")]
	pub default_vps_t_host: String,

	#[arg(long, env = "DEFAULT_VPS_E_HOST", default_value = "")]
	pub default_vps_e_host: String,
}

impl EndpointDefaults {
	pub fn new() -> Self {
		Self::parse()
	}
}

impl Default for EndpointDefaults {
	fn default() -> Self {
		Self { default_vps_t_host: String::new(), default_vps_e_host: String::new() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dispatcher_config_defaults() {
		let cfg = DispatcherConfig::test();
		assert_eq!(cfg.max_attempts, 3);
		assert_eq!(cfg.lock_ttl, Duration::from_secs(5));
	}

	#[test]
	fn agent_config_parses_from_args() {
		let args = vec!["program", "--agent-auth-token", "tok", "--agent-role", "VPS_E", "--agent-port", "9000"];
		let cfg = AgentConfig::try_parse_from(args).unwrap();
		assert_eq!(cfg.role, "VPS_E");
		assert_eq!(cfg.port, 9000);
	}
}
