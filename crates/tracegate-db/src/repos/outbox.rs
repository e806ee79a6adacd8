use sqlx::SqlitePool;

use crate::enums::{DeliveryStatus, NodeRole, OutboxEventType, OutboxStatus};
use crate::error::{DbError, ResultExt};
use crate::models::{OutboxDelivery, OutboxEvent};
use crate::{new_id, now_rfc3339};

pub struct OutboxRepository {
	pool: SqlitePool,
}

impl OutboxRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_event(&self, id: &str) -> Result<Option<OutboxEvent>, DbError> {
		Ok(sqlx::query_as::<_, OutboxEvent>("SELECT * FROM outbox_event WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	pub async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<OutboxEvent>, DbError> {
		Ok(sqlx::query_as::<_, OutboxEvent>("SELECT * FROM outbox_event WHERE idempotency_key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await?)
	}

	/// Inserts the event and one delivery row per target node in a single
	/// transaction, so a partial fan-out is never observable. A duplicate
	/// idempotency key is mapped to `None` rather than surfaced as an error:
	/// the caller already has the prior event.
	pub async fn create_with_deliveries(
		&self,
		event_type: OutboxEventType,
		aggregate_id: &str,
		payload_json: &serde_json::Value,
		role_target: Option<NodeRole>,
		idempotency_key: &str,
		node_ids: &[String],
	) -> Result<Option<OutboxEvent>, DbError> {
		let mut tx = self.pool.begin().await?;
		let id = new_id();
		let now = now_rfc3339();

		let insert = sqlx::query(
			"INSERT INTO outbox_event (id, event_type, aggregate_id, payload_json, role_target, idempotency_key, status, attempts, created_at, updated_at) \
			 VALUES (?, ?, ?, ?, ?, ?, 'PENDING', 0, ?, ?)",
		)
		.bind(&id)
		.bind(event_type.as_str())
		.bind(aggregate_id)
		.bind(payload_json)
		.bind(role_target.map(|r| r.as_str()))
		.bind(idempotency_key)
		.bind(&now)
		.bind(&now)
		.execute(&mut *tx)
		.await
		.on_constraint("outbox_event.idempotency_key", |_| DbError::NotFound(String::new()));

		match insert {
			Ok(_) => {}
			Err(DbError::NotFound(_)) => return Ok(None),
			Err(e) => return Err(e),
		}

		if node_ids.is_empty() {
			// No active endpoint matched the target role: there is nothing
			// to fan out to, so the event is dead-on-arrival rather than
			// left PENDING forever with zero deliveries.
			sqlx::query("UPDATE outbox_event SET status = 'FAILED', last_error = ?, updated_at = ? WHERE id = ?")
				.bind("no active node targets")
				.bind(&now)
				.bind(&id)
				.execute(&mut *tx)
				.await?;
		}

		for node_id in node_ids {
			let delivery_id = new_id();
			sqlx::query(
				"INSERT INTO outbox_delivery (id, outbox_event_id, node_id, status, attempts, next_attempt_at, created_at) \
				 VALUES (?, ?, ?, 'PENDING', 0, ?, ?)",
			)
			.bind(&delivery_id)
			.bind(&id)
			.bind(node_id)
			.bind(&now)
			.bind(&now)
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		self.get_event(&id).await
	}

	pub async fn get_delivery(&self, id: &str) -> Result<Option<OutboxDelivery>, DbError> {
		Ok(sqlx::query_as::<_, OutboxDelivery>("SELECT * FROM outbox_delivery WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	pub async fn deliveries_for_event(&self, event_id: &str) -> Result<Vec<OutboxDelivery>, DbError> {
		Ok(sqlx::query_as::<_, OutboxDelivery>("SELECT * FROM outbox_delivery WHERE outbox_event_id = ?")
			.bind(event_id)
			.fetch_all(&self.pool)
			.await?)
	}

	/// Claims up to `batch_size` due, unlocked-or-expired-lock deliveries for
	/// `claimant`, stamping a lease of `lock_ttl_seconds`. SQLite has no
	/// `SELECT ... FOR UPDATE SKIP LOCKED`, so this approximates it with an
	/// `UPDATE ... WHERE id IN (subquery) RETURNING`, relying on SQLite's
	/// single-writer model to make the claim atomic.
	pub async fn claim_deliveries(&self, claimant: &str, lock_ttl_seconds: i64, batch_size: i64, now: &str) -> Result<Vec<OutboxDelivery>, DbError> {
		let locked_until = add_seconds(now, lock_ttl_seconds);
		let rows = sqlx::query_as::<_, OutboxDelivery>(
			"UPDATE outbox_delivery SET locked_until = ?, locked_by = ? \
			 WHERE id IN ( \
			   SELECT id FROM outbox_delivery \
			   WHERE status IN ('PENDING', 'FAILED') \
			     AND next_attempt_at <= ? \
			     AND (locked_until IS NULL OR locked_until <= ?) \
			   ORDER BY created_at \
			   LIMIT ? \
			 ) \
			 RETURNING *",
		)
		.bind(&locked_until)
		.bind(claimant)
		.bind(now)
		.bind(now)
		.bind(batch_size)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	pub async fn mark_delivery_sent(&self, id: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE outbox_delivery SET status = 'SENT', locked_until = NULL, locked_by = NULL WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Records a failed delivery attempt, rescheduling `next_attempt_at`
	/// under the caller-computed backoff, or moving the delivery to `DEAD`
	/// once `max_attempts` is exhausted.
	pub async fn mark_delivery_failed(
		&self,
		id: &str,
		error: &str,
		next_attempt_at: &str,
		attempts: i64,
		max_attempts: i64,
	) -> Result<(), DbError> {
		let status = if attempts >= max_attempts { DeliveryStatus::Dead } else { DeliveryStatus::Failed };
		sqlx::query(
			"UPDATE outbox_delivery SET status = ?, attempts = ?, next_attempt_at = ?, last_error = ?, locked_until = NULL, locked_by = NULL \
			 WHERE id = ?",
		)
		.bind(status.as_str())
		.bind(attempts)
		.bind(next_attempt_at)
		.bind(error)
		.bind(id)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// An event is `SENT` once every delivery is `SENT`, `FAILED` once any
	/// delivery is `DEAD` with no deliveries still pending, `INFLIGHT` once
	/// at least one delivery has been claimed, and `PENDING` otherwise.
	pub async fn recompute_event_status(&self, event_id: &str) -> Result<OutboxStatus, DbError> {
		let deliveries = self.deliveries_for_event(event_id).await?;
		let status = if deliveries.iter().all(|d| d.status == DeliveryStatus::Sent) {
			OutboxStatus::Sent
		} else if deliveries.iter().any(|d| d.status == DeliveryStatus::Dead) && deliveries.iter().all(|d| d.status != DeliveryStatus::Pending) {
			OutboxStatus::Failed
		} else if deliveries.iter().any(|d| d.locked_by.is_some()) {
			OutboxStatus::Inflight
		} else {
			OutboxStatus::Pending
		};

		sqlx::query("UPDATE outbox_event SET status = ?, updated_at = ? WHERE id = ?")
			.bind(status.as_str())
			.bind(now_rfc3339())
			.bind(event_id)
			.execute(&self.pool)
			.await?;
		Ok(status)
	}

	/// Deletes delivered (`SENT`) events older than `sent_days` and
	/// dead-lettered (`FAILED`) events older than `failed_days`, in batches,
	/// for the retention loop.
	pub async fn purge_batch(&self, sent_days: i64, failed_days: i64, batch_size: i64, now: &str) -> Result<u64, DbError> {
		let sent_cutoff = add_seconds(now, -sent_days * 86_400);
		let failed_cutoff = add_seconds(now, -failed_days * 86_400);

		let result = sqlx::query(
			"DELETE FROM outbox_event WHERE id IN ( \
			   SELECT id FROM outbox_event \
			   WHERE (status = 'SENT' AND updated_at <= ?) \
			      OR (status = 'FAILED' AND updated_at <= ?) \
			   LIMIT ? \
			 )",
		)
		.bind(&sent_cutoff)
		.bind(&failed_cutoff)
		.bind(batch_size)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}
}

fn add_seconds(rfc3339: &str, seconds: i64) -> String {
	let parsed = chrono::DateTime::parse_from_rfc3339(rfc3339).unwrap_or_else(|_| chrono::Utc::now().into());
	(parsed + chrono::Duration::seconds(seconds)).to_rfc3339()
}
