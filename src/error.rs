//! Error types for the Clauth daemon
//!
//! The taxonomy is a closed set: every failure surfaced to a caller carries
//! one of these variants, a stable string code, and an HTTP-ish status.

use std::io;

use thiserror::Error;

/// Result type alias for Clauth
pub type Result<T> = std::result::Result<T, Error>;

/// Clauth errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed inputs, missing fields, unsupported enum values,
    /// envelope format errors, missing required delivery configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// No matching grant, rate limit exceeded, firewall block,
    /// credential/provider mismatch, vault locked
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Unknown credential handle, expired credential on read,
    /// revoke matching zero grants
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing/invalid skill token, missing/invalid session claim,
    /// admin token mismatch
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Identity-verify per-skill or per-IP limiter exceeded
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Network failure reaching a provider
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Unexpected invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the error maps to at the surface.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 422,
            Self::AccessDenied(_) => 403,
            Self::NotFound(_) => 404,
            Self::Unauthorized(_) => 401,
            Self::RateLimited(_) => 429,
            Self::Upstream(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Internal(format!("IO error: {e}"))
    }
}
