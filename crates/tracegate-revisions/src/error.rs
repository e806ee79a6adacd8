#[derive(thiserror::Error, Debug)]
pub enum RevisionError {
	#[error(transparent)]
	Db(#[from] tracegate_db::DbError),

	#[error(transparent)]
	Outbox(#[from] tracegate_outbox::OutboxError),

	#[error(transparent)]
	Ipam(#[from] tracegate_ipam::IpamError),

	#[error(transparent)]
	Grace(#[from] crate::grace::GraceError),

	#[error(transparent)]
	Override(#[from] crate::overrides::OverrideError),

	#[error("connection {0} not found")]
	ConnectionNotFound(String),

	#[error("revision {0} not found")]
	RevisionNotFound(String),

	#[error("no camouflage SNI available")]
	NoSniAvailable,

	#[error("connection triple is not allowed")]
	DisallowedTriple,
}
