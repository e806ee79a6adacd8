use sqlx::SqlitePool;

use crate::error::DbError;
use crate::models::WireguardPeer;
use crate::{new_id, now_rfc3339};

pub struct WireguardPeerRepository {
	pool: SqlitePool,
}

impl WireguardPeerRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<WireguardPeer>, DbError> {
		Ok(sqlx::query_as::<_, WireguardPeer>("SELECT * FROM wireguard_peer WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	pub async fn get_for_device(&self, device_id: &str) -> Result<Option<WireguardPeer>, DbError> {
		Ok(sqlx::query_as::<_, WireguardPeer>("SELECT * FROM wireguard_peer WHERE device_id = ?")
			.bind(device_id)
			.fetch_optional(&self.pool)
			.await?)
	}

	pub async fn create(
		&self,
		device_id: &str,
		lease_id: &str,
		peer_public_key: &str,
		preshared_key: Option<&str>,
	) -> Result<WireguardPeer, DbError> {
		let id = new_id();
		let created_at = now_rfc3339();
		sqlx::query(
			"INSERT INTO wireguard_peer (id, device_id, lease_id, peer_public_key, preshared_key, status, created_at) \
			 VALUES (?, ?, ?, ?, ?, 'ACTIVE', ?)",
		)
		.bind(&id)
		.bind(device_id)
		.bind(lease_id)
		.bind(peer_public_key)
		.bind(preshared_key)
		.bind(&created_at)
		.execute(&self.pool)
		.await?;

		self.get_by_id(&id).await?.ok_or_else(|| DbError::NotFound(format!("wireguard peer {id} vanished after insert")))
	}

	pub async fn revoke(&self, id: &str) -> Result<(), DbError> {
		sqlx::query("UPDATE wireguard_peer SET status = 'REVOKED' WHERE id = ?").bind(id).execute(&self.pool).await?;
		Ok(())
	}
}
