use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use tally_core::protocol::{RpcResponse, CODE_DUPLICATE_ID, CODE_SESSION_ACTIVE};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Session active elsewhere for user {0}")]
    SessionActive(String),
    #[error("Duplicate primary key: {0}")]
    DuplicateId(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    const fn code(&self) -> Option<&'static str> {
        match self {
            Self::DuplicateId(_) => Some(CODE_DUPLICATE_ID),
            Self::SessionActive(_) => Some(CODE_SESSION_ACTIVE),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::BadRequest(error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionActive(_) => StatusCode::FORBIDDEN,
            Self::DuplicateId(_) => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = RpcResponse {
            success: false,
            error: Some(self.to_string()),
            code: self.code().map(String::from),
            ..RpcResponse::default()
        };
        (status, Json(body)).into_response()
    }
}
