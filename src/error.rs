//! # Error Types
//!
//! Typed errors for the analysis pipeline. Every failure a caller can react
//! to has its own variant; the HTTP layer maps variants to status codes and
//! the walker decides which failures localize as error nodes and which abort
//! the request.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected user input: bad URL, SSRF target, malformed ID, oversized body.
    #[error("{0}")]
    InvalidInput(String),

    /// Graph, node or file absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider rejected the supplied token (or required one that is missing).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Provider rate limit hit; `reset` is the provider-reported reset time
    /// (unix epoch seconds when known).
    #[error("rate limited until {reset}")]
    RateLimited { reset: String },

    /// Provider 5xx, network failure, TLS dial failure.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Invalid YAML or unparseable reference.
    #[error("parse failure: {0}")]
    Parse(String),

    /// The kustomize engine rejected the build input.
    #[error("build failure: {0}")]
    Build(String),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid-input",
            Error::NotFound(_) => "not-found",
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited { .. } => "rate-limited",
            Error::Upstream(_) => "upstream-failure",
            Error::Parse(_) => "parse-failure",
            Error::Build(_) => "build-failure",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::InvalidInput("x".into()).kind(), "invalid-input");
        assert_eq!(Error::NotFound("x".into()).kind(), "not-found");
        assert_eq!(
            Error::RateLimited { reset: "0".into() }.kind(),
            "rate-limited"
        );
        assert_eq!(Error::Build("x".into()).kind(), "build-failure");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from(io), Error::NotFound(_)));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(Error::from(io), Error::Internal(_)));
    }
}
