use axum::extract::{Query, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;

use crate::api::AppState;
use crate::error::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests that do not carry the configured API key, taken from the
/// `x-api-key` header or a `key` / `apikey` query parameter.
pub async fn require_api_key(
	State(state): State<AppState>,
	request: Request,
	next: Next,
) -> Result<Response, AppError> {
	let (parts, body) = request.into_parts();
	match provided_key(&parts) {
		Some(key) if key == state.config.server.api_key => {
			Ok(next.run(Request::from_parts(parts, body)).await)
		}
		_ => {
			tracing::debug!("rejected {} {}: bad api key", parts.method, parts.uri.path());
			Err(AppError::Forbidden)
		}
	}
}

fn provided_key(parts: &Parts) -> Option<String> {
	if let Some(value) = parts.headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
		return Some(value.to_string());
	}
	let Query(params) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri).ok()?;
	params.get("key").or_else(|| params.get("apikey")).cloned()
}
