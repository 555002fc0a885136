pub mod rest;
pub mod ws;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::StreamError;

/// Error body returned by every JSON endpoint: `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unauthorized(String),
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::NotFound(_) => Self::NotFound(err.to_string()),
            StreamError::Unauthorized(_) => Self::Unauthorized(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
