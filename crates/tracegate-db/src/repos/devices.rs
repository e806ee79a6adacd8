use sqlx::SqlitePool;

use crate::error::DbError;
use crate::models::Device;
use crate::{new_id, now_rfc3339};

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
	#[error("device quota exceeded")]
	QuotaExceeded,

	#[error(transparent)]
	Db(#[from] DbError),
}

pub struct DeviceRepository {
	pool: SqlitePool,
}

impl DeviceRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<Device>, DbError> {
		Ok(sqlx::query_as::<_, Device>("SELECT * FROM device WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	/// Registers a device, enforcing the user's active-device quota.
	pub async fn create(&self, user_id: &str, name: &str, quota: i64) -> Result<Device, DeviceError> {
		let (active,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device WHERE user_id = ? AND status = 'ACTIVE'")
			.bind(user_id)
			.fetch_one(&self.pool)
			.await
			.map_err(DbError::from)?;
		if active >= quota {
			return Err(DeviceError::QuotaExceeded);
		}

		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query("INSERT INTO device (id, user_id, name, status, created_at) VALUES (?, ?, ?, 'ACTIVE', ?)")
			.bind(&id)
			.bind(user_id)
			.bind(name)
			.bind(&created_at)
			.execute(&self.pool)
			.await
			.map_err(DbError::from)?;

		self.get_by_id(&id).await?.ok_or_else(|| DeviceError::Db(DbError::NotFound(format!("device {id} vanished after insert"))))
	}

	pub async fn revoke(&self, id: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE device SET status = 'REVOKED' WHERE id = ?").bind(id).execute(&self.pool).await?;
		Ok(())
	}
}
