//! `create_event` / fan-out: inserting an outbox event atomically creates
//! one delivery per active node endpoint of the target role. Grounded in
//! the original `services/outbox.py`'s `create_event`.

use tracegate_db::enums::{NodeRole, OutboxEventType};
use tracegate_db::models::OutboxEvent;
use tracegate_db::repos::node_endpoints::NodeEndpointRepository;
use tracegate_db::repos::outbox::OutboxRepository;
use tracegate_db::SqlitePool;

use crate::error::OutboxError;
use crate::idempotency::build_key;

pub struct OutboxService {
	outbox: OutboxRepository,
	node_endpoints: NodeEndpointRepository,
}

impl OutboxService {
	pub fn new(pool: SqlitePool) -> Self {
		Self { outbox: OutboxRepository::new(pool.clone()), node_endpoints: NodeEndpointRepository::new(pool) }
	}

	/// Builds the idempotency key, and if an event with that key already
	/// exists returns it unchanged rather than erroring — `create_event` is
	/// idempotent by construction. Otherwise inserts the event plus one
	/// delivery per currently-active endpoint for `role_target`.
	pub async fn create_event(
		&self,
		event_type: OutboxEventType,
		aggregate_id: &str,
		payload: &serde_json::Value,
		role_target: NodeRole,
		idempotency_suffix: Option<&str>,
	) -> Result<OutboxEvent, OutboxError> {
		let key = build_key(event_type.as_str(), aggregate_id, idempotency_suffix, payload);

		if let Some(existing) = self.outbox.get_by_idempotency_key(&key).await? {
			return Ok(existing);
		}

		let endpoints = self.node_endpoints.active_for_role(role_target).await?;
		let node_ids: Vec<String> = endpoints.into_iter().map(|e| e.id).collect();
		if node_ids.is_empty() {
			tracing::warn!(event_type = event_type.as_str(), aggregate_id, role = role_target.as_str(), "no active node targets for fan-out");
		}

		match self.outbox.create_with_deliveries(event_type, aggregate_id, payload, Some(role_target), &key, &node_ids).await? {
			Some(event) => Ok(event),
			None => self
				.outbox
				.get_by_idempotency_key(&key)
				.await?
				.ok_or_else(|| OutboxError::Db(tracegate_db::DbError::NotFound(format!("outbox event {key} vanished")))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use sqlx::sqlite::SqlitePoolOptions;

	async fn test_pool() -> SqlitePool {
		let pool = SqlitePoolOptions::new().connect(":memory:").await.unwrap();
		sqlx::migrate!("../tracegate-db/migrations").run(&pool).await.unwrap();
		pool
	}

	#[tokio::test]
	async fn creating_twice_with_same_key_is_idempotent() {
		let db = test_pool().await;
		let svc = OutboxService::new(db);
		let payload = json!({"uuid": "conn-1"});

		let first = svc.create_event(OutboxEventType::UpsertUser, "conn-1", &payload, NodeRole::VpsT, Some("rev-1:VPS_T")).await.unwrap();
		let second = svc.create_event(OutboxEventType::UpsertUser, "conn-1", &payload, NodeRole::VpsT, Some("rev-1:VPS_T")).await.unwrap();
		assert_eq!(first.id, second.id);
	}
}
