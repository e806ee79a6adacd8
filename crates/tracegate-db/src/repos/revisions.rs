use sqlx::SqlitePool;

use crate::error::DbError;
use crate::models::ConnectionRevision;
use crate::{new_id, now_rfc3339};

/// Revisions are kept in a bounded three-slot history per connection; see
/// `tracegate_revisions` for the slot-shift/compaction logic that decides
/// which slot a new revision lands in. This repository only does CRUD.
pub struct RevisionRepository {
	pool: SqlitePool,
}

impl RevisionRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<ConnectionRevision>, DbError> {
		Ok(sqlx::query_as::<_, ConnectionRevision>("SELECT * FROM connection_revision WHERE id = ?")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?)
	}

	pub async fn list_for_connection(&self, connection_id: &str) -> Result<Vec<ConnectionRevision>, DbError> {
		Ok(
			sqlx::query_as::<_, ConnectionRevision>("SELECT * FROM connection_revision WHERE connection_id = ? ORDER BY slot")
				.bind(connection_id)
				.fetch_all(&self.pool)
				.await?,
		)
	}

	pub async fn active_for_connection(&self, connection_id: &str) -> Result<Option<ConnectionRevision>, DbError> {
		Ok(
			sqlx::query_as::<_, ConnectionRevision>("SELECT * FROM connection_revision WHERE connection_id = ? AND status = 'ACTIVE'")
				.bind(connection_id)
				.fetch_optional(&self.pool)
				.await?,
		)
	}

	pub async fn insert(
		&self,
		connection_id: &str,
		slot: i64,
		camouflage_sni_id: Option<i64>,
		effective_config_json: &serde_json::Value,
	) -> Result<ConnectionRevision, DbError> {
		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query(
			"INSERT INTO connection_revision (id, connection_id, slot, status, camouflage_sni_id, effective_config_json, created_at) \
			 VALUES (?, ?, ?, 'ACTIVE', ?, ?, ?)",
		)
		.bind(&id)
		.bind(connection_id)
		.bind(slot)
		.bind(camouflage_sni_id)
		.bind(effective_config_json)
		.bind(&created_at)
		.execute(&self.pool)
		.await?;

		self.get_by_id(&id).await?.ok_or_else(|| DbError::NotFound(format!("revision {id} vanished after insert")))
	}

	pub async fn set_status(&self, id: &str, status: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE connection_revision SET status = ? WHERE id = ?").bind(status).bind(id).execute(&self.pool).await?;
		Ok(())
	}

	/// Shifts every ACTIVE revision of a connection one slot back (0->1,
	/// 1->2, ...) ahead of a new revision landing in slot 0; anything that
	/// would land past slot 2 is REVOKED and clamped to slot 2, per the
	/// three-slot compaction rule. Never deletes history.
	pub async fn shift_history(&self, connection_id: &str) -> Result<(), DbError> {
		let mut tx = self.pool.begin().await?;
		// Moved through a negative intermediate slot so the partial unique
		// index on (connection_id, slot) WHERE status = 'ACTIVE' never sees
		// a transient duplicate while every row's slot shifts by one.
		sqlx::query("UPDATE connection_revision SET slot = -(slot + 1) WHERE connection_id = ? AND status = 'ACTIVE'")
			.bind(connection_id)
			.execute(&mut *tx)
			.await?;
		sqlx::query("UPDATE connection_revision SET slot = -slot WHERE connection_id = ? AND status = 'ACTIVE' AND slot < 0")
			.bind(connection_id)
			.execute(&mut *tx)
			.await?;
		sqlx::query("UPDATE connection_revision SET status = 'REVOKED', slot = 2 WHERE connection_id = ? AND status = 'ACTIVE' AND slot > 2")
			.bind(connection_id)
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		Ok(())
	}

	/// Re-numbers slots so `revision_id` becomes slot 0 and the connection's
	/// other ACTIVE revisions keep their relative order in slots 1 and 2;
	/// excess is REVOKED and clamped to slot 2. Used by `activate_revision`.
	pub async fn renumber_with_slot_zero(&self, connection_id: &str, revision_id: &str) -> Result<(), DbError> {
		let mut tx = self.pool.begin().await?;

		// First move every ACTIVE row (including `revision_id`) to a
		// distinct negative slot — a pure function of its prior slot, so
		// this single statement can never collide with the partial unique
		// index. Final positive slots are assigned in a second pass below,
		// by which point every row sits outside the 0..=2 range.
		sqlx::query("UPDATE connection_revision SET slot = -(slot + 10) WHERE connection_id = ? AND status = 'ACTIVE'")
			.bind(connection_id)
			.execute(&mut *tx)
			.await?;

		let others: Vec<(String,)> =
			sqlx::query_as("SELECT id FROM connection_revision WHERE connection_id = ? AND status = 'ACTIVE' AND id != ? ORDER BY slot DESC")
				.bind(connection_id)
				.bind(revision_id)
				.fetch_all(&mut *tx)
				.await?;

		sqlx::query("UPDATE connection_revision SET slot = 0 WHERE id = ?").bind(revision_id).execute(&mut *tx).await?;

		for (index, (id,)) in others.into_iter().enumerate() {
			let slot = (index as i64) + 1;
			if slot > 2 {
				sqlx::query("UPDATE connection_revision SET status = 'REVOKED', slot = 2 WHERE id = ?").bind(&id).execute(&mut *tx).await?;
			} else {
				sqlx::query("UPDATE connection_revision SET slot = ? WHERE id = ?").bind(slot).bind(&id).execute(&mut *tx).await?;
			}
		}

		tx.commit().await?;
		Ok(())
	}
}
