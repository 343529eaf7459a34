use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Account field that must be unique across the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    LoginId,
}

impl UniqueField {
    /// Message shown to the registering user.
    pub fn message(self) -> &'static str {
        match self {
            UniqueField::Email => "Email already registered",
            UniqueField::LoginId => "Login ID already taken",
        }
    }
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniqueField::Email => f.write_str("email"),
            UniqueField::LoginId => f.write_str("loginId"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} already exists")]
    Duplicate(UniqueField),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<r2d2::Error> for DirectoryError {
    fn from(e: r2d2::Error) -> Self {
        DirectoryError::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DirectoryError {
    fn from(e: tokio::task::JoinError) -> Self {
        DirectoryError::Unavailable(e.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Errors surfaced by the REST gateway as `{success: false, ...}` bodies.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("validation error")]
    Validation(Vec<String>),
    #[error("{}", .0.message())]
    Duplicate(UniqueField),
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResp {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, errors) = match self {
            ApiError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                "Validation Error".to_string(),
                Some(errors),
            ),
            ApiError::Duplicate(field) => {
                (StatusCode::BAD_REQUEST, field.message().to_string(), None)
            }
            ApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "Invalid login credentials".to_string(),
                None,
            ),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string(), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };
        let body = ErrorResp {
            success: false,
            message,
            errors,
        };
        (status, Json(body)).into_response()
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Duplicate(field) => ApiError::Duplicate(field),
            other => {
                tracing::error!(error = %other, "directory failure");
                ApiError::Internal("Storage unavailable".into())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => ApiError::InvalidCredentials,
            AuthError::Directory(e) => e.into(),
            AuthError::Hash(msg) => {
                tracing::error!(error = %msg, "password hashing failed");
                ApiError::Internal("Login failed".into())
            }
        }
    }
}
