//! Request extractors that report failures as [`AppError`] JSON.

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::{Form, Json};
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// Request body as JSON or `application/x-www-form-urlencoded`, picked by
/// content type. Anything that is not a form is read as JSON.
pub struct Payload<T>(pub T);

impl<T, S> FromRequest<S> for Payload<T>
where
	T: DeserializeOwned + Send,
	S: Send + Sync,
{
	type Rejection = AppError;

	async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
		if is_form(&req) {
			let Form(value) = Form::<T>::from_request(req, state).await?;
			Ok(Payload(value))
		} else {
			let Json(value) = Json::<T>::from_request(req, state).await?;
			Ok(Payload(value))
		}
	}
}

fn is_form(req: &Request) -> bool {
	req.headers()
		.get(CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|ct| ct.trim_start().starts_with("application/x-www-form-urlencoded"))
		.unwrap_or(false)
}

/// Query string extractor with JSON errors.
pub struct Params<T>(pub T);

impl<T, S> FromRequestParts<S> for Params<T>
where
	T: DeserializeOwned + Send,
	S: Send + Sync,
{
	type Rejection = AppError;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
		Ok(Params(value))
	}
}
