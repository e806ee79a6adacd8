use sqlx::SqlitePool;

use crate::enums::OwnerType;
use crate::error::DbError;
use crate::models::{IpamLease, IpamPool};
use crate::{new_id, now_rfc3339};

pub struct IpamRepository {
	pool: SqlitePool,
}

impl IpamRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_pool(&self, id: &str) -> Result<Option<IpamPool>, DbError> {
		Ok(sqlx::query_as::<_, IpamPool>("SELECT * FROM ipam_pool WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	pub async fn get_pool_by_cidr(&self, cidr: &str) -> Result<Option<IpamPool>, DbError> {
		Ok(sqlx::query_as::<_, IpamPool>("SELECT * FROM ipam_pool WHERE cidr = ?").bind(cidr).fetch_optional(&self.pool).await?)
	}

	pub async fn create_pool(&self, cidr: &str, gateway: &str, quarantine_seconds: i64) -> Result<IpamPool, DbError> {
		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query("INSERT INTO ipam_pool (id, cidr, gateway, quarantine_seconds, created_at) VALUES (?, ?, ?, ?, ?)")
			.bind(&id)
			.bind(cidr)
			.bind(gateway)
			.bind(quarantine_seconds)
			.bind(&created_at)
			.execute(&self.pool)
			.await?;

		self.get_pool(&id).await?.ok_or_else(|| DbError::NotFound(format!("ipam pool {id} vanished after insert")))
	}

	/// All non-`RELEASED` IPs in a pool, ascending, for the allocator to skip
	/// over when scanning host addresses.
	pub async fn taken_ips(&self, pool_id: &str) -> Result<Vec<String>, DbError> {
		let rows: Vec<(String,)> = sqlx::query_as("SELECT ip FROM ipam_lease WHERE pool_id = ? AND status != 'RELEASED' ORDER BY ip")
			.bind(pool_id)
			.fetch_all(&self.pool)
			.await?;
		Ok(rows.into_iter().map(|(ip,)| ip).collect())
	}

	pub async fn get_active_lease(&self, pool_id: &str, owner_type: OwnerType, owner_id: &str) -> Result<Option<IpamLease>, DbError> {
		Ok(sqlx::query_as::<_, IpamLease>(
			"SELECT * FROM ipam_lease WHERE pool_id = ? AND owner_type = ? AND owner_id = ? AND status = 'ACTIVE'",
		)
		.bind(pool_id)
		.bind(owner_type.as_str())
		.bind(owner_id)
		.fetch_optional(&self.pool)
		.await?)
	}

	pub async fn insert_lease(&self, pool_id: &str, owner_type: OwnerType, owner_id: &str, ip: &str) -> Result<IpamLease, DbError> {
		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query("INSERT INTO ipam_lease (id, pool_id, owner_type, owner_id, ip, status, created_at) VALUES (?, ?, ?, ?, ?, 'ACTIVE', ?)")
			.bind(&id)
			.bind(pool_id)
			.bind(owner_type.as_str())
			.bind(owner_id)
			.bind(ip)
			.bind(&created_at)
			.execute(&self.pool)
			.await?;

		self.get_lease(&id).await?.ok_or_else(|| DbError::NotFound(format!("ipam lease {id} vanished after insert")))
	}

	pub async fn get_lease(&self, id: &str) -> Result<Option<IpamLease>, DbError> {
		Ok(sqlx::query_as::<_, IpamLease>("SELECT * FROM ipam_lease WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	pub async fn quarantine(&self, id: &str, until: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE ipam_lease SET status = 'QUARANTINED', quarantined_until = ? WHERE id = ?")
			.bind(until)
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn release(&self, id: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE ipam_lease SET status = 'RELEASED' WHERE id = ?").bind(id).execute(&self.pool).await?;
		Ok(())
	}

	/// Leases whose quarantine window has elapsed as of `now`, ready to be
	/// released back into the free pool.
	pub async fn expired_quarantine(&self, now: &str) -> Result<Vec<IpamLease>, DbError> {
		Ok(sqlx::query_as::<_, IpamLease>(
			"SELECT * FROM ipam_lease WHERE status = 'QUARANTINED' AND quarantined_until IS NOT NULL AND quarantined_until <= ?",
		)
		.bind(now)
		.fetch_all(&self.pool)
		.await?)
	}
}
