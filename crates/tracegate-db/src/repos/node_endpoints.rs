use sqlx::SqlitePool;

use crate::enums::NodeRole;
use crate::error::DbError;
use crate::models::NodeEndpoint;

pub struct NodeEndpointRepository {
	pool: SqlitePool,
}

impl NodeEndpointRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<NodeEndpoint>, DbError> {
		Ok(sqlx::query_as::<_, NodeEndpoint>("SELECT * FROM node_endpoint WHERE id = ?").bind(id).fetch_optional(&self.pool).await?)
	}

	/// Active endpoints for a role, oldest first, matching the original
	/// "earliest-registered-preferred" node selection order.
	pub async fn active_for_role(&self, role: NodeRole) -> Result<Vec<NodeEndpoint>, DbError> {
		Ok(
			sqlx::query_as::<_, NodeEndpoint>("SELECT * FROM node_endpoint WHERE role = ? AND active = 1 ORDER BY created_at")
				.bind(role.as_str())
				.fetch_all(&self.pool)
				.await?,
		)
	}

	pub async fn list_all(&self) -> Result<Vec<NodeEndpoint>, DbError> {
		Ok(sqlx::query_as::<_, NodeEndpoint>("SELECT * FROM node_endpoint ORDER BY role, created_at").fetch_all(&self.pool).await?)
	}
}
