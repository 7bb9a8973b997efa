//! Lockfile snapshot.
//!
//! After a successful install the orchestrator persists a flat, ordered
//! list of every resolved package. This revision writes the file but does
//! not consume it during resolution.

use crate::error::{EngineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lockfile name inside a project.
pub const LOCKFILE_NAME: &str = "lambay.lock";

/// Schema version for the lockfile format.
pub const LOCKFILE_VERSION: u32 = 1;

/// Metadata about the snapshot itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    /// When the snapshot was generated (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    /// Version of lambay that generated the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambay_version: Option<String>,
}

/// One resolved package in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    /// Tarball URL the version resolved to.
    pub resolved_url: String,
    /// SHA-256 of the raw tarball, as computed by the store; omitted when
    /// unknown rather than ever written as a placeholder.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub integrity: String,
}

/// A flat ordered lockfile snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockfileSnapshot {
    pub lockfile_version: u32,
    #[serde(default)]
    pub meta: LockMeta,
    pub packages: Vec<LockedPackage>,
}

impl LockfileSnapshot {
    /// Build a snapshot around an ordered package list.
    #[must_use]
    pub fn new(packages: Vec<LockedPackage>) -> Self {
        Self {
            lockfile_version: LOCKFILE_VERSION,
            meta: LockMeta {
                generated_at: Some(Utc::now().to_rfc3339()),
                lambay_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            packages,
        }
    }

    /// Load a snapshot from a project directory.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(LOCKFILE_NAME);
        let bytes = std::fs::read(&path).map_err(|e| {
            EngineError::lockfile_write_failed(format!(
                "failed to read {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::lockfile_write_failed(format!("invalid lockfile: {e}")))
    }

    /// Persist the snapshot into a project directory.
    pub fn save(&self, project_root: &Path) -> Result<()> {
        let path = project_root.join(LOCKFILE_NAME);
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::lockfile_write_failed(e.to_string()))?;
        bytes.push(b'\n');
        lambay_util::fs::atomic_write(&path, &bytes)
            .map_err(|e| EngineError::lockfile_write_failed(e.to_string()))
    }
}
