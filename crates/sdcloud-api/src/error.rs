//! API error handling.
//!
//! Grounded on `buildit_api::error::ApiError`'s enum-plus-`IntoResponse`
//! shape, adapted for spec.md §6's validation-error rule: a 422 body
//! carries `{"message": ...}` only when the service is running in `dev`;
//! every other status always includes a message, matching the teacher.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sdcloud_config::Environment;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    /// A submission failed validation. `dev` records whether the service is
    /// running in development mode at the time the error was raised, since
    /// `IntoResponse::into_response` has no access to `AppState`.
    Validation { message: String, dev: bool },
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    pub fn validation(env: Environment, message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            dev: env.is_dev(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    /// Map a core/domain error into this API's error surface, given the
    /// environment a 422 body's visibility depends on.
    pub fn from_core(err: sdcloud_core::Error, env: Environment) -> Self {
        match err {
            sdcloud_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            sdcloud_core::Error::InvalidInput(msg) => ApiError::validation(env, msg),
            sdcloud_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation { message, dev } => {
                if dev {
                    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "message": message })))
                        .into_response()
                } else {
                    StatusCode::UNPROCESSABLE_ENTITY.into_response()
                }
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "message": msg }))).into_response()
            }
            ApiError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(json!({ "message": msg }))).into_response()
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": msg })))
                    .into_response()
            }
        }
    }
}

impl From<sdcloud_db::DbError> for ApiError {
    fn from(err: sdcloud_db::DbError) -> Self {
        match err {
            sdcloud_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
