//! The dispatcher loop: claims due deliveries, POSTs each to its target
//! node's agent, and reschedules or dead-letters on failure. Grounded in
//! the original `dispatcher/main.py` (`_claim_deliveries`, `_send_to_agent`,
//! `_process_delivery`, `dispatcher_loop`), adapted from the original's
//! `SELECT ... FOR UPDATE SKIP LOCKED` claim to the lock-column overlay
//! `tracegate_db::repos::outbox::OutboxRepository::claim_deliveries` uses
//! under SQLite.

use std::time::Duration;

use tracegate_config::DispatcherConfig;
use tracegate_db::models::{OutboxDelivery, OutboxEvent};
use tracegate_db::repos::node_endpoints::NodeEndpointRepository;
use tracegate_db::repos::outbox::OutboxRepository;
use tracegate_db::{now_rfc3339, SqlitePool};

use crate::error::OutboxError;

/// `"{hostname}:{pid}"`, identifying this dispatcher process as the current
/// lock holder for the deliveries it claims.
pub fn dispatcher_id() -> String {
	let hostname = hostname_or_unknown();
	format!("{hostname}:{}", std::process::id())
}

fn hostname_or_unknown() -> String {
	std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()).unwrap_or_else(|| "unknown-host".to_string())
}

/// `min(300, 2^min(attempts, 8))` seconds.
pub fn backoff_seconds(attempts: u32) -> i64 {
	let capped = attempts.min(8);
	(1i64 << capped).min(300)
}

pub struct Dispatcher {
	outbox: OutboxRepository,
	node_endpoints: NodeEndpointRepository,
	http: reqwest::Client,
	config: DispatcherConfig,
	id: String,
}

impl Dispatcher {
	pub fn new(pool: SqlitePool, config: DispatcherConfig) -> Result<Self, OutboxError> {
		let mut builder = reqwest::Client::builder().timeout(config.http_timeout);
		if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
			if let (Ok(cert_bytes), Ok(key_bytes)) = (std::fs::read(cert), std::fs::read(key)) {
				if let Ok(identity) = reqwest::Identity::from_pem(&[cert_bytes, key_bytes].concat()) {
					builder = builder.identity(identity);
				}
			}
		}
		if let Some(ca) = &config.ca_cert {
			if let Ok(ca_bytes) = std::fs::read(ca) {
				if let Ok(cert) = reqwest::Certificate::from_pem(&ca_bytes) {
					builder = builder.add_root_certificate(cert);
				}
			}
		}
		let http = builder.build().map_err(|e| OutboxError::MissingEndpoint(e.to_string()))?;

		Ok(Self {
			outbox: OutboxRepository::new(pool.clone()),
			node_endpoints: NodeEndpointRepository::new(pool),
			http,
			id: dispatcher_id(),
			config,
		})
	}

	/// Runs the claim-dispatch-recompute cycle forever, sleeping
	/// `poll_interval` between empty batches.
	pub async fn run(&self) -> ! {
		loop {
			match self.tick().await {
				Ok(0) => tokio::time::sleep(self.config.poll_interval).await,
				Ok(_) => {}
				Err(e) => {
					tracing::error!(error = %e, "dispatcher tick failed");
					tokio::time::sleep(self.config.poll_interval).await;
				}
			}
		}
	}

	/// Claims and processes one batch; returns the number of deliveries
	/// processed.
	pub async fn tick(&self) -> Result<usize, OutboxError> {
		let now = now_rfc3339();
		let claimed = self.outbox.claim_deliveries(&self.id, self.config.lock_ttl.as_secs() as i64, i64::from(self.config.batch_size), &now).await?;

		let mut handles = Vec::with_capacity(claimed.len());
		for delivery in claimed {
			handles.push(self.process_delivery(delivery));
		}
		let count = handles.len();
		futures_lite_join_all(handles, self.config.concurrency).await;
		Ok(count)
	}

	async fn process_delivery(&self, delivery: OutboxDelivery) -> Result<(), OutboxError> {
		let event = match self.outbox.get_event(&delivery.outbox_event_id).await? {
			Some(event) => event,
			None => return Ok(()),
		};
		let node = match self.node_endpoints.get_by_id(&delivery.node_id).await? {
			Some(node) => node,
			None => return Ok(()),
		};

		let result = self.send_to_agent(&node.base_url, &event).await;
		let attempts = delivery.attempts + 1;

		match result {
			Ok(()) => {
				self.outbox.mark_delivery_sent(&delivery.id).await?;
			}
			Err(err) => {
				tracing::warn!(delivery_id = %delivery.id, node = %node.name, error = %err, "delivery attempt failed");
				let next_attempt_at = tracegate_db::now_rfc3339_plus_seconds(backoff_seconds(attempts as u32));
				self.outbox.mark_delivery_failed(&delivery.id, &err.to_string(), &next_attempt_at, attempts, i64::from(self.config.max_attempts)).await?;
			}
		}

		self.outbox.recompute_event_status(&event.id).await?;
		Ok(())
	}

	async fn send_to_agent(&self, base_url: &str, event: &OutboxEvent) -> Result<(), reqwest::Error> {
		let url = format!("{}/v1/events", base_url.trim_end_matches('/'));
		let body = serde_json::json!({
			"event_id": event.id,
			"idempotency_key": event.idempotency_key,
			"event_type": event.event_type.as_str(),
			"aggregate_id": event.aggregate_id,
			"payload": event.payload_json.0,
		});
		self.http.post(url).header("x-agent-token", self.config.agent_auth_token.as_str()).json(&body).send().await?.error_for_status()?;
		Ok(())
	}
}

/// Runs futures with bounded concurrency without pulling in an extra
/// executor-agnostic crate; chunks the claimed batch instead of spawning
/// unbounded tasks.
async fn futures_lite_join_all(mut handles: Vec<impl std::future::Future<Output = Result<(), OutboxError>>>, concurrency: usize) {
	while !handles.is_empty() {
		let chunk: Vec<_> = handles.drain(..handles.len().min(concurrency.max(1))).collect();
		let results = futures::future::join_all(chunk).await;
		for result in results {
			if let Err(e) = result {
				tracing::error!(error = %e, "delivery processing error");
			}
		}
	}
}

/// Deletes terminal (`SENT`/`FAILED`) outbox events past their retention
/// window, in batches, on `outbox_retention_interval`. Grounded in the
/// original `dispatcher/ops.py`'s `outbox_purge_loop` (the Kubernetes /
/// Prometheus / Telegram alerting glue in that module stays out of scope).
pub async fn outbox_retention_loop(pool: SqlitePool, config: DispatcherConfig) {
	if !config.outbox_retention_enabled {
		return;
	}
	let outbox = OutboxRepository::new(pool);
	loop {
		tokio::time::sleep(config.outbox_retention_interval).await;
		let now = now_rfc3339();
		loop {
			match outbox.purge_batch(config.outbox_retention_sent_days, config.outbox_retention_failed_days, i64::from(config.outbox_retention_batch_size), &now).await {
				Ok(0) => break,
				Ok(n) => tracing::info!(purged = n, "purged outbox history"),
				Err(e) => {
					tracing::error!(error = %e, "outbox retention purge failed");
					break;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_and_caps_at_300() {
		assert_eq!(backoff_seconds(0), 1);
		assert_eq!(backoff_seconds(3), 8);
		assert_eq!(backoff_seconds(8), 256);
		assert_eq!(backoff_seconds(20), 256);
	}
}
