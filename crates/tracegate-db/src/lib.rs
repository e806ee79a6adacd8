pub mod enums;
pub mod error;
pub mod models;
pub mod repos;

pub use error::DbError;
pub use sqlx::SqlitePool;

use sqlx::sqlite::SqlitePoolOptions;
use tracegate_config::DbConfig;

/// Connects the control-plane pool and runs pending migrations, mirroring
/// `nest`'s `main.rs` startup sequence.
pub async fn connect(config: &DbConfig) -> Result<SqlitePool, DbError> {
	let pool = SqlitePoolOptions::new().max_connections(config.max_connections).connect(&config.database_url).await?;
	sqlx::migrate!("./migrations").run(&pool).await?;
	Ok(pool)
}

pub fn new_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
	chrono::Utc::now().to_rfc3339()
}

pub fn now_rfc3339_plus_seconds(seconds: i64) -> String {
	(chrono::Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339()
}
