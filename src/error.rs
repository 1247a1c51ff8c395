//! Error types for the application
//!
//! Rule violations carry a machine-readable reason string plus a numeric
//! class (400 generic, 401 authorization, 402 business-rule conflict,
//! 403 timing); the boundary renders both as the `{code, msg}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::lifecycle::LifecycleError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Rule(#[from] LifecycleError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Conflict(String),

    #[error("WeChat error: {0}")]
    Wx(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Numeric error class reported in the envelope
    pub fn class(&self) -> u16 {
        match self {
            AppError::Database(_) | AppError::Internal(_) => 500,
            AppError::Rule(e) => e.class(),
            AppError::NotFound(_) | AppError::BadRequest(_) => 400,
            AppError::Auth(_) => 401,
            AppError::Conflict(_) => 402,
            AppError::Wx(_) => 502,
        }
    }

    /// Stable reason string reported in the envelope
    pub fn reason(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "unknown_error".to_string(),
            AppError::Rule(e) => e.reason().to_string(),
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Auth(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::Wx(_) => "wx_auth_failed".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => tracing::error!("Database error: {}", e),
            AppError::Internal(e) => tracing::error!("Internal error: {}", e),
            AppError::Wx(e) => tracing::error!("WeChat error: {}", e),
            _ => tracing::debug!("Request rejected: {}", self),
        }

        let class = self.class();
        let status = StatusCode::from_u16(class).unwrap_or(StatusCode::BAD_REQUEST);
        let body = Json(json!({
            "code": class,
            "msg": self.reason(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
