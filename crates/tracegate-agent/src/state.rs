//! Durable per-node ledger of processed event ids, so a redelivered event
//! (the dispatcher retries on any non-2xx, including "we already applied
//! this but our ack was lost") is a no-op at the agent. Grounded in the
//! original `agent/state.py`.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub struct AgentStateStore {
	pool: SqlitePool,
}

impl AgentStateStore {
	pub async fn open(root: &Path) -> Result<Self, sqlx::Error> {
		let dir = root.join("events");
		std::fs::create_dir_all(&dir).map_err(|e| sqlx::Error::Io(e))?;
		let db_path = dir.join("state.db");
		let url = format!("sqlite://{}?mode=rwc", db_path.display());
		let pool = SqlitePoolOptions::new().max_connections(1).connect(&url).await?;
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS processed_event (\
				event_id TEXT PRIMARY KEY, \
				idempotency_key TEXT NOT NULL, \
				processed_at TEXT NOT NULL\
			)",
		)
		.execute(&pool)
		.await?;
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS aggregate_op_ts (\
				aggregate_key TEXT PRIMARY KEY, \
				op_ts INTEGER NOT NULL\
			)",
		)
		.execute(&pool)
		.await?;
		Ok(Self { pool })
	}

	pub async fn seen(&self, event_id: &str) -> Result<bool, sqlx::Error> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM processed_event WHERE event_id = ?").bind(event_id).fetch_optional(&self.pool).await?;
		Ok(row.is_some())
	}

	pub async fn mark(&self, event_id: &str, idempotency_key: &str) -> Result<(), sqlx::Error> {
		let now = chrono::Utc::now().to_rfc3339();
		sqlx::query("INSERT OR REPLACE INTO processed_event(event_id, idempotency_key, processed_at) VALUES (?, ?, ?)")
			.bind(event_id)
			.bind(idempotency_key)
			.bind(now)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// The latest `op_ts` this node has applied for `aggregate_key`, or
	/// `None` if it has never seen one.
	pub async fn last_op_ts(&self, aggregate_key: &str) -> Result<Option<i64>, sqlx::Error> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT op_ts FROM aggregate_op_ts WHERE aggregate_key = ?").bind(aggregate_key).fetch_optional(&self.pool).await?;
		Ok(row.map(|(v,)| v))
	}

	/// Raises the stored `op_ts` for `aggregate_key` to `op_ts`, never
	/// lowering it — a redelivered or merely out-of-order-arriving older
	/// event must not un-gate a newer one already applied.
	pub async fn bump_op_ts(&self, aggregate_key: &str, op_ts: i64) -> Result<(), sqlx::Error> {
		sqlx::query(
			"INSERT INTO aggregate_op_ts(aggregate_key, op_ts) VALUES (?, ?) \
			 ON CONFLICT(aggregate_key) DO UPDATE SET op_ts = MAX(op_ts, excluded.op_ts)",
		)
		.bind(aggregate_key)
		.bind(op_ts)
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn marks_and_recognizes_seen_events() {
		let dir = tempfile::tempdir().unwrap();
		let store = AgentStateStore::open(dir.path()).await.unwrap();
		assert!(!store.seen("evt-1").await.unwrap());
		store.mark("evt-1", "UPSERT_USER:conn-1:abc").await.unwrap();
		assert!(store.seen("evt-1").await.unwrap());
	}

	#[tokio::test]
	async fn op_ts_never_regresses() {
		let dir = tempfile::tempdir().unwrap();
		let store = AgentStateStore::open(dir.path()).await.unwrap();
		assert_eq!(store.last_op_ts("conn-1").await.unwrap(), None);
		store.bump_op_ts("conn-1", 100).await.unwrap();
		assert_eq!(store.last_op_ts("conn-1").await.unwrap(), Some(100));
		store.bump_op_ts("conn-1", 50).await.unwrap();
		assert_eq!(store.last_op_ts("conn-1").await.unwrap(), Some(100));
		store.bump_op_ts("conn-1", 150).await.unwrap();
		assert_eq!(store.last_op_ts("conn-1").await.unwrap(), Some(150));
	}
}
