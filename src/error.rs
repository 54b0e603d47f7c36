use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NestError>;

#[derive(Debug, Error)]
pub enum NestError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("database does not exist")]
    DatabaseNotFound,
    #[error("document does not exist")]
    DocumentNotFound,
    #[error("collection does not exist")]
    CollectionNotFound,
    #[error("{0} already exists")]
    Conflict(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("patch failed: {0}")]
    PatchFailed(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for NestError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for NestError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for NestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for NestError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::DatabaseNotFound | Self::DocumentNotFound | Self::CollectionNotFound => {
                StatusCode::NOT_FOUND
            }
            // The v1 wire contract reports create conflicts and schema
            // rejections as plain bad requests.
            Self::Conflict(_)
            | Self::SchemaViolation(_)
            | Self::InvalidSchema(_)
            | Self::BadRequest(_)
            | Self::PatchFailed(_)
            | Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Cancelled | Self::Io(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
