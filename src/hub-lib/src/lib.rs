mod client;
mod http_client;
mod mem_hub;
mod types;

pub use client::{FileWriter, HubClient};
pub use http_client::HttpHubClient;
pub use mem_hub::MemHub;
pub use types::*;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl HubError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => HubError::NotFound(info),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HubError::PermissionDenied(info),
            StatusCode::BAD_REQUEST => HubError::InvalidParam(info),
            StatusCode::CONFLICT => HubError::AlreadyExists(info),
            StatusCode::INTERNAL_SERVER_ERROR => HubError::Internal(info),
            _ => HubError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::NotFound(_))
    }
}

pub type HubResult<T> = std::result::Result<T, HubError>;

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::IoError(err.to_string())
    }
}
