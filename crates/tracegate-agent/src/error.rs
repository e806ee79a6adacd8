#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
	#[error("{0}")]
	BadPayload(String),

	#[error("reload command failed: {0}")]
	ReloadFailed(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("state store error: {0}")]
	Db(#[from] sqlx::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
	#[error(transparent)]
	Handler(#[from] HandlerError),

	#[error(transparent)]
	Db(#[from] sqlx::Error),

	#[error("authentication required")]
	Unauthorized,
}

impl axum::response::IntoResponse for AgentError {
	fn into_response(self) -> axum::response::Response {
		let status = match &self {
			Self::Handler(HandlerError::BadPayload(_)) => axum::http::StatusCode::BAD_REQUEST,
			Self::Unauthorized => axum::http::StatusCode::UNAUTHORIZED,
			Self::Handler(HandlerError::ReloadFailed(_)) | Self::Handler(HandlerError::Io(_)) | Self::Handler(HandlerError::Db(_)) | Self::Db(_) => {
				axum::http::StatusCode::INTERNAL_SERVER_ERROR
			}
		};
		(status, axum::Json(serde_json::json!({"detail": self.to_string()}))).into_response()
	}
}
