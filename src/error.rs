//! Error types for tsidp

use std::io;

use thiserror::Error;

/// Result type alias for tsidp
pub type Result<T> = std::result::Result<T, Error>;

/// tsidp errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer-identity lookup failure
    #[error("Identity lookup failed: {0}")]
    Identity(String),

    /// Signing-key load/generate/sign failure
    #[error("Signing key error: {0}")]
    Key(String),

    /// Client registry persistence failure
    #[error("Persistence error: {0}")]
    Persist(String),

    /// Rejected redirect URI
    #[error("Invalid redirect URI: {0}")]
    RedirectUri(String),

    /// JWT encoding error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
