use sqlx::SqlitePool;

use crate::enums::UserEntitlement;
use crate::error::DbError;
use crate::models::User;
use crate::{new_id, now_rfc3339};

pub struct UserRepository {
	pool: SqlitePool,
}

impl UserRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<User>, DbError> {
		let row = sqlx::query_as::<_, User>("SELECT * FROM tg_user WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
		Ok(row)
	}

	/// Loads the user for a telegram id, creating it on first contact (never
	/// hard-deleted, per the data model's lifecycle note).
	pub async fn get_or_create(&self, telegram_id: i64) -> Result<User, DbError> {
		if let Some(existing) = sqlx::query_as::<_, User>("SELECT * FROM tg_user WHERE telegram_id = ?")
			.bind(telegram_id)
			.fetch_optional(&self.pool)
			.await?
		{
			return Ok(existing);
		}

		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query("INSERT INTO tg_user (id, telegram_id, role, entitlement, device_quota, created_at) VALUES (?, ?, 'user', 'ACTIVE', 3, ?)")
			.bind(&id)
			.bind(telegram_id)
			.bind(&created_at)
			.execute(&self.pool)
			.await?;

		self.get_by_id(&id).await?.ok_or_else(|| DbError::NotFound(format!("user {id} vanished after insert")))
	}

	pub async fn set_entitlement(&self, id: &str, entitlement: UserEntitlement, grace_ends_at: Option<&str>) -> Result<(), DbError> {
		sqlx::query("UPDATE tg_user SET entitlement = ?, grace_ends_at = ? WHERE id = ?")
			.bind(entitlement.as_str())
			.bind(grace_ends_at)
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn active_device_count(&self, user_id: &str) -> Result<i64, DbError> {
		let (count,): (i64,) =
			sqlx::query_as("SELECT COUNT(*) FROM device WHERE user_id = ? AND status = 'ACTIVE'").bind(user_id).fetch_one(&self.pool).await?;
		Ok(count)
	}

	pub async fn admin_telegram_ids(&self) -> Result<Vec<i64>, DbError> {
		let rows: Vec<(i64,)> = sqlx::query_as("SELECT telegram_id FROM tg_user WHERE role IN ('admin', 'superadmin') ORDER BY telegram_id")
			.fetch_all(&self.pool)
			.await?;
		Ok(rows.into_iter().map(|(id,)| id).collect())
	}
}
