//! IP address management over a single CIDR pool: host-address allocation,
//! quarantine-on-release, and quarantine reaping. Grounded in the original
//! `services/ipam.py` allocator, rebuilt on `ipnetwork` for CIDR host
//! iteration instead of the original's manual octet arithmetic.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use tracegate_db::enums::OwnerType;
use tracegate_db::models::{IpamLease, IpamPool};
use tracegate_db::repos::ipam::IpamRepository;
use tracegate_db::{DbError, SqlitePool};

#[derive(thiserror::Error, Debug)]
pub enum IpamError {
	#[error("pool exhausted: {0}")]
	PoolExhausted(String),

	#[error("invalid cidr: {0}")]
	InvalidCidr(String),

	#[error(transparent)]
	Db(#[from] DbError),
}

pub struct IpamAllocator {
	repo: IpamRepository,
}

impl IpamAllocator {
	pub fn new(pool: SqlitePool) -> Self {
		Self { repo: IpamRepository::new(pool) }
	}

	pub async fn ensure_pool(&self, cidr: &str, gateway: &str, quarantine_seconds: i64) -> Result<IpamPool, IpamError> {
		if let Some(existing) = self.repo.get_pool_by_cidr(cidr).await? {
			return Ok(existing);
		}
		Ipv4Network::from_str(cidr).map_err(|_| IpamError::InvalidCidr(cidr.to_string()))?;
		Ok(self.repo.create_pool(cidr, gateway, quarantine_seconds).await?)
	}

	/// Returns the owner's existing active lease if one exists, otherwise
	/// allocates the lowest free host address in the pool (ascending
	/// network order, network/broadcast/gateway excluded) and leases it.
	pub async fn allocate(&self, pool: &IpamPool, owner_type: OwnerType, owner_id: &str) -> Result<IpamLease, IpamError> {
		if let Some(existing) = self.repo.get_active_lease(&pool.id, owner_type, owner_id).await? {
			return Ok(existing);
		}

		let network = Ipv4Network::from_str(&pool.cidr).map_err(|_| IpamError::InvalidCidr(pool.cidr.clone()))?;
		let gateway: Ipv4Addr = pool.gateway.parse().map_err(|_| IpamError::InvalidCidr(pool.gateway.clone()))?;
		let taken = self.repo.taken_ips(&pool.id).await?;

		for host in network.iter() {
			if host == network.network() || host == network.broadcast() || host == gateway {
				continue;
			}
			let candidate = host.to_string();
			if taken.binary_search(&candidate).is_ok() {
				continue;
			}
			return Ok(self.repo.insert_lease(&pool.id, owner_type, owner_id, &candidate).await?);
		}

		Err(IpamError::PoolExhausted(pool.cidr.clone()))
	}

	/// Moves an active lease into quarantine for the pool's configured
	/// window rather than releasing it immediately, so a reused IP doesn't
	/// collide with in-flight traffic from the previous owner.
	pub async fn release(&self, pool: &IpamPool, lease: &IpamLease) -> Result<(), IpamError> {
		let until = tracegate_db::now_rfc3339_plus_seconds(pool.quarantine_seconds);
		self.repo.quarantine(&lease.id, &until).await?;
		Ok(())
	}

	/// Transitions every quarantined lease whose window has elapsed to
	/// `RELEASED`, freeing the address for reallocation. Intended to run on
	/// a periodic tick from the owning service.
	pub async fn reap_quarantine(&self, now: &str) -> Result<usize, IpamError> {
		let expired = self.repo.expired_quarantine(now).await?;
		for lease in &expired {
			self.repo.release(&lease.id).await?;
		}
		Ok(expired.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sqlx::sqlite::SqlitePoolOptions;

	async fn test_pool() -> SqlitePool {
		let pool = SqlitePoolOptions::new().connect(":memory:").await.unwrap();
		sqlx::migrate!("../tracegate-db/migrations").run(&pool).await.unwrap();
		pool
	}

	#[tokio::test]
	async fn allocates_ascending_and_skips_gateway() {
		let db = test_pool().await;
		let allocator = IpamAllocator::new(db);
		let pool = allocator.ensure_pool("10.80.0.0/29", "10.80.0.1", 300).await.unwrap();

		let first = allocator.allocate(&pool, OwnerType::Device, "dev-1").await.unwrap();
		assert_ne!(first.ip, "10.80.0.1");
		assert_ne!(first.ip, "10.80.0.0");

		let second = allocator.allocate(&pool, OwnerType::Device, "dev-2").await.unwrap();
		assert_ne!(first.ip, second.ip);
	}

	#[tokio::test]
	async fn reallocating_same_owner_is_idempotent() {
		let db = test_pool().await;
		let allocator = IpamAllocator::new(db);
		let pool = allocator.ensure_pool("10.80.1.0/29", "10.80.1.1", 300).await.unwrap();

		let first = allocator.allocate(&pool, OwnerType::Device, "dev-1").await.unwrap();
		let second = allocator.allocate(&pool, OwnerType::Device, "dev-1").await.unwrap();
		assert_eq!(first.id, second.id);
	}
}
