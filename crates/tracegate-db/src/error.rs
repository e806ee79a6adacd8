#[derive(thiserror::Error, Debug)]
pub enum DbError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("database error")]
	Sqlx(#[from] sqlx::Error),

	#[error("migration error")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("invalid enum value: {0}")]
	InvalidEnum(String),
}

/// Maps a unique-constraint violation to a domain error, mirroring `nest`'s
/// `ResultExt::on_constraint`.
pub trait ResultExt<T> {
	fn on_constraint(self, name: &str, f: impl FnOnce(Box<dyn sqlx::error::DatabaseError>) -> DbError) -> Result<T, DbError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
	E: Into<DbError>,
{
	fn on_constraint(self, name: &str, map_err: impl FnOnce(Box<dyn sqlx::error::DatabaseError>) -> DbError) -> Result<T, DbError> {
		self.map_err(|e| match e.into() {
			DbError::Sqlx(sqlx::Error::Database(dbe)) if dbe.constraint() == Some(name) => map_err(dbe),
			other => other,
		})
	}
}
