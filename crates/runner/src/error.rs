use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{FormRejection, JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use herd::SupervisorError;
use serde_json::json;

/// Error type for HTTP handlers. Renders as `{"success": false, "error": ..}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
	#[error(transparent)]
	Supervisor(#[from] SupervisorError),

	#[error("{0}")]
	BadRequest(String),

	#[error("{0}")]
	NotFound(String),

	#[error("Invalid API key")]
	Forbidden,

	#[error("{0}")]
	Internal(String),

	/// A request body or query string axum could not extract.
	#[error("{message}")]
	Rejected { status: StatusCode, message: String },
}

macro_rules! from_rejection {
	($($ty:ty),*) => {$(
		impl From<$ty> for AppError {
			fn from(rejection: $ty) -> Self {
				AppError::Rejected {
					status: rejection.status(),
					message: rejection.body_text(),
				}
			}
		}
	)*};
}

from_rejection!(JsonRejection, FormRejection, QueryRejection, MultipartRejection, MultipartError);

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
	pub fn internal(e: impl std::fmt::Display) -> Self {
		AppError::Internal(e.to_string())
	}

	pub fn status(&self) -> StatusCode {
		match self {
			AppError::Supervisor(e) => match e {
				SupervisorError::InvalidName { .. } => StatusCode::BAD_REQUEST,
				SupervisorError::NotFound { .. } | SupervisorError::NotRunning { .. } => {
					StatusCode::NOT_FOUND
				}
				SupervisorError::Spawn { .. } | SupervisorError::Log { .. } => {
					StatusCode::INTERNAL_SERVER_ERROR
				}
			},
			AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
			AppError::NotFound(_) => StatusCode::NOT_FOUND,
			AppError::Forbidden => StatusCode::FORBIDDEN,
			AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
			AppError::Rejected { status, .. } => *status,
		}
	}
}

impl IntoResponse for AppError {
	fn into_response(self) -> Response {
		let status = self.status();
		if status.is_server_error() {
			tracing::error!("request failed: {}", self);
		}
		let body = json!({
			"success": false,
			"error": self.to_string(),
		});
		(status, axum::Json(body)).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn supervisor_errors_map_to_statuses() {
		let not_running = AppError::from(SupervisorError::NotRunning { key: "script:x".into() });
		assert_eq!(not_running.status(), StatusCode::NOT_FOUND);
		assert_eq!(not_running.to_string(), "script:x: not running");

		let spawn = AppError::from(SupervisorError::Spawn {
			key: "project:y".into(),
			source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
		});
		assert_eq!(spawn.status(), StatusCode::INTERNAL_SERVER_ERROR);

		assert_eq!(AppError::Forbidden.status(), StatusCode::FORBIDDEN);
	}
}
