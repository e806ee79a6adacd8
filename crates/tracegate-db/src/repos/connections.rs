use sqlx::SqlitePool;

use crate::enums::{ConnectionMode, ConnectionProtocol, ConnectionVariant};
use crate::error::DbError;
use crate::models::Connection;
use crate::{new_id, now_rfc3339};

pub struct ConnectionRepository {
	pool: SqlitePool,
}

impl ConnectionRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<Connection>, DbError> {
		Ok(sqlx::query_as::<_, Connection>("SELECT * FROM connection WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	pub async fn list_for_device(&self, device_id: &str) -> Result<Vec<Connection>, DbError> {
		Ok(sqlx::query_as::<_, Connection>("SELECT * FROM connection WHERE device_id = ? ORDER BY created_at")
			.bind(device_id)
			.fetch_all(&self.pool)
			.await?)
	}

	pub async fn create(
		&self,
		device_id: &str,
		user_id: &str,
		protocol: ConnectionProtocol,
		mode: ConnectionMode,
		variant: ConnectionVariant,
		custom_overrides_json: &serde_json::Value,
	) -> Result<Connection, DbError> {
		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query(
			"INSERT INTO connection (id, device_id, user_id, protocol, mode, variant, custom_overrides_json, status, created_at) \
			 VALUES (?, ?, ?, ?, ?, ?, ?, 'ACTIVE', ?)",
		)
		.bind(&id)
		.bind(device_id)
		.bind(user_id)
		.bind(protocol.as_str())
		.bind(mode.as_str())
		.bind(variant.as_str())
		.bind(custom_overrides_json)
		.bind(&created_at)
		.execute(&self.pool)
		.await?;

		self.get_by_id(&id).await?.ok_or_else(|| DbError::NotFound(format!("connection {id} vanished after insert")))
	}

	pub async fn mark_revoked(&self, id: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE connection SET status = 'REVOKED' WHERE id = ?").bind(id).execute(&self.pool).await?;
		Ok(())
	}
}
