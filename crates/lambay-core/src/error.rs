//! Engine error types.

use std::fmt;
use std::io;

/// Engine error codes.
pub mod codes {
    pub const REGISTRY_UNAVAILABLE: &str = "REGISTRY_UNAVAILABLE";
    pub const REGISTRY_CORRUPT: &str = "REGISTRY_CORRUPT";
    pub const VERSION_NOT_FOUND: &str = "VERSION_NOT_FOUND";
    pub const DOWNLOAD_FAILED: &str = "DOWNLOAD_FAILED";
    pub const EXTRACT_FAILED: &str = "EXTRACT_FAILED";
    pub const LINK_DENIED: &str = "LINK_DENIED";
    pub const SLOT_CONFLICT: &str = "SLOT_CONFLICT";
    pub const SPEC_INVALID: &str = "SPEC_INVALID";
    pub const MANIFEST_INVALID: &str = "MANIFEST_INVALID";
    pub const MANIFEST_NOT_FOUND: &str = "MANIFEST_NOT_FOUND";
    pub const LOCKFILE_WRITE_FAILED: &str = "LOCKFILE_WRITE_FAILED";
    pub const IO_ERROR: &str = "IO_ERROR";
}

/// Engine error: a stable code plus a human-readable message.
#[derive(Debug)]
pub struct EngineError {
    code: &'static str,
    message: String,
}

impl EngineError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the error belongs to a transient category that warrants a
    /// single retry (network-level registry and download failures).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.code == codes::REGISTRY_UNAVAILABLE || self.code == codes::DOWNLOAD_FAILED
    }

    /// Registry could not be reached and no usable on-disk cache exists.
    pub fn registry_unavailable(msg: impl Into<String>) -> Self {
        Self::new(codes::REGISTRY_UNAVAILABLE, msg)
    }

    /// A cached registry document is unparseable and cannot be refetched.
    pub fn registry_corrupt(msg: impl Into<String>) -> Self {
        Self::new(codes::REGISTRY_CORRUPT, msg)
    }

    /// No registry version satisfies the normalized spec.
    #[must_use]
    pub fn version_not_found(name: &str, spec: &str) -> Self {
        Self::new(
            codes::VERSION_NOT_FOUND,
            format!("no version of {name} satisfies spec: {spec}"),
        )
    }

    /// Tarball fetch failed.
    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::DOWNLOAD_FAILED, msg)
    }

    /// Gzip/tar error, path escape, or write error during extraction.
    pub fn extract_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::EXTRACT_FAILED, msg)
    }

    /// Link creation was denied after every fallback.
    pub fn link_denied(msg: impl Into<String>) -> Self {
        Self::new(codes::LINK_DENIED, msg)
    }

    /// An existing slot could not be removed.
    pub fn slot_conflict(msg: impl Into<String>) -> Self {
        Self::new(codes::SLOT_CONFLICT, msg)
    }

    /// A package spec argument could not be parsed.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::SPEC_INVALID, msg)
    }

    /// The project manifest is missing.
    #[must_use]
    pub fn manifest_not_found(path: &std::path::Path) -> Self {
        Self::new(
            codes::MANIFEST_NOT_FOUND,
            format!("manifest not found: {}", path.display()),
        )
    }

    /// The project manifest could not be parsed.
    pub fn manifest_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::MANIFEST_INVALID, msg)
    }

    /// The lockfile snapshot could not be persisted.
    pub fn lockfile_write_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::LOCKFILE_WRITE_FAILED, msg)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::IO_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(
                codes::REGISTRY_UNAVAILABLE,
                format!("request timed out: {e}"),
            )
        } else if e.is_connect() {
            Self::new(
                codes::REGISTRY_UNAVAILABLE,
                format!("connection failed: {e}"),
            )
        } else {
            Self::new(codes::REGISTRY_UNAVAILABLE, e.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::REGISTRY_CORRUPT, format!("invalid JSON: {e}"))
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
