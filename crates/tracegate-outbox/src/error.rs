#[derive(thiserror::Error, Debug)]
pub enum OutboxError {
	#[error(transparent)]
	Db(#[from] tracegate_db::DbError),

	#[error("node endpoint {0} has no base_url")]
	MissingEndpoint(String),
}
