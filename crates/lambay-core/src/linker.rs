//! Project-tree linking.
//!
//! Materializes `<deps_dir>/<name>` slots from store entries using the best
//! available filesystem primitive, mirrors each slot into a cross-project
//! shared directory, creates executable shims for declared binaries, and
//! maintains the per-slot integrity marker that makes re-installs
//! idempotent.

use crate::error::{EngineError, Result};
use crate::store::link_or_copy_tree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Integrity marker file name inside a slot.
pub const MARKER_NAME: &str = ".integrity";

/// Per-slot install record. A marker whose `version` matches the requested
/// version is the sufficient condition to skip reinstalling that slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityMarker {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub hash: String,
}

/// The `bin` field of a package manifest: either a single path or a map of
/// shim name to path. The two shapes stay distinct through parsing.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BinField {
    Single(String),
    Many(BTreeMap<String, String>),
}

#[derive(Debug, Default, Deserialize)]
struct BinManifest {
    #[serde(default)]
    bin: Option<BinField>,
}

/// Linker for one project tree.
#[derive(Debug, Clone)]
pub struct Linker {
    deps_dir: PathBuf,
    shared_dir: PathBuf,
}

impl Linker {
    /// Create a linker writing slots under `deps_dir` and cross-project
    /// links under `shared_dir`.
    #[must_use]
    pub fn new(deps_dir: impl Into<PathBuf>, shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            deps_dir: deps_dir.into(),
            shared_dir: shared_dir.into(),
        }
    }

    /// The dependency directory this linker writes into.
    #[must_use]
    pub fn deps_dir(&self) -> &Path {
        &self.deps_dir
    }

    /// Slot path for a package name. Scoped names nest under their scope
    /// directory.
    #[must_use]
    pub fn slot_path(&self, name: &str) -> PathBuf {
        self.deps_dir.join(name)
    }

    /// Materialize the slot for `name` from a store path.
    ///
    /// Any existing entry at the slot is removed first (symlinks are
    /// unlinked, directories deleted). Returns the slot path.
    ///
    /// # Errors
    /// - `SLOT_CONFLICT` when an existing entry cannot be removed.
    /// - `LINK_DENIED` when every link strategy fails.
    pub fn link_slot(&self, name: &str, target: &Path) -> Result<PathBuf> {
        let slot = self.slot_path(name);
        if let Some(parent) = slot.parent() {
            fs::create_dir_all(parent)?;
        }

        remove_existing(&slot).map_err(|e| {
            EngineError::slot_conflict(format!(
                "could not remove existing entry at {}: {e}",
                slot.display()
            ))
        })?;

        link_dir_with_fallback(target, &slot)?;
        debug!(package = name, slot = %slot.display(), "slot linked");
        Ok(slot)
    }

    /// Mirror a slot into the global shared directory.
    ///
    /// # Errors
    /// Returns `LINK_DENIED` when the link cannot be created.
    pub fn link_shared(&self, name: &str, target: &Path) -> Result<PathBuf> {
        let link = self.shared_dir.join(name);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }

        // Point at the real directory, not at another link.
        let resolved = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());

        remove_existing(&link)
            .map_err(|e| EngineError::link_denied(format!("shared link cleanup failed: {e}")))?;
        link_dir_with_fallback(&resolved, &link)?;
        Ok(link)
    }

    /// Create executable shims for the binaries a slot declares.
    ///
    /// Reads `<slot>/package.json`; a missing or binless manifest produces
    /// no shims. The string form creates one shim named after the package;
    /// the object form additionally creates one per differing key.
    pub fn write_shims(&self, name: &str, slot: &Path) -> Result<Vec<PathBuf>> {
        let Ok(data) = fs::read_to_string(slot.join("package.json")) else {
            return Ok(Vec::new());
        };
        let manifest: BinManifest = serde_json::from_str(&data).unwrap_or_default();
        let Some(bin) = manifest.bin else {
            return Ok(Vec::new());
        };

        let bin_dir = self.deps_dir.join(".bin");
        fs::create_dir_all(&bin_dir)?;

        let shim_name = unscoped(name);
        let mut created = Vec::new();

        match bin {
            BinField::Single(rel) => {
                if !rel.is_empty() {
                    created.push(create_shim(&bin_dir, shim_name, name, &rel)?);
                }
            }
            BinField::Many(bins) => {
                for (key, rel) in &bins {
                    if rel.is_empty() {
                        continue;
                    }
                    created.push(create_shim(&bin_dir, shim_name, name, rel)?);
                    if key != shim_name {
                        created.push(create_shim(&bin_dir, key, name, rel)?);
                    }
                }
            }
        }

        Ok(created)
    }

    /// Write the slot's integrity marker atomically (temp file + rename).
    pub fn write_marker(&self, name: &str, marker: &IntegrityMarker) -> Result<()> {
        let slot = self.slot_path(name);
        fs::create_dir_all(&slot)?;
        let mut bytes = serde_json::to_vec_pretty(marker)
            .map_err(|e| EngineError::new(crate::error::codes::IO_ERROR, e.to_string()))?;
        bytes.push(b'\n');
        lambay_util::fs::atomic_write(&slot.join(MARKER_NAME), &bytes)?;
        Ok(())
    }

    /// Read a slot's integrity marker, if one is present and parseable.
    #[must_use]
    pub fn read_marker(&self, name: &str) -> Option<IntegrityMarker> {
        let bytes = fs::read(self.slot_path(name).join(MARKER_NAME)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Return the existing marker when the slot already holds the requested
    /// version.
    #[must_use]
    pub fn up_to_date(&self, name: &str, version: &str) -> Option<IntegrityMarker> {
        let marker = self.read_marker(name)?;
        (marker.version == version).then_some(marker)
    }

    /// Remove a stale slot ahead of a reinstall.
    ///
    /// # Errors
    /// Returns `SLOT_CONFLICT` when the entry cannot be removed.
    pub fn remove_slot(&self, name: &str) -> Result<()> {
        let slot = self.slot_path(name);
        remove_existing(&slot).map_err(|e| {
            EngineError::slot_conflict(format!(
                "could not remove stale slot {}: {e}",
                slot.display()
            ))
        })
    }
}

fn unscoped(name: &str) -> &str {
    name.split('/').next_back().unwrap_or(name)
}

/// Remove whatever sits at `path`: symlink, directory, or file.
fn remove_existing(path: &Path) -> io::Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        if metadata.file_type().is_symlink() {
            return fs::remove_file(path);
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        // FILE_ATTRIBUTE_REPARSE_POINT marks junctions and symlinks.
        if metadata.file_attributes() & 0x400 != 0 {
            return fs::remove_dir(path);
        }
    }

    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Create a directory link at `link` pointing at `target`, walking the
/// fallback chain: relative symlink, absolute symlink (junction on
/// Windows), hardlink tree, deep copy.
fn link_dir_with_fallback(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let relative = link
            .parent()
            .and_then(|parent| lambay_util::fs::relative_from(parent, target));
        if let Some(rel) = relative {
            if std::os::unix::fs::symlink(&rel, link).is_ok() {
                return Ok(());
            }
        }
        if std::os::unix::fs::symlink(target, link).is_ok() {
            return Ok(());
        }
    }

    #[cfg(windows)]
    {
        if junction::create(target, link).is_ok() {
            return Ok(());
        }
    }

    link_or_copy_tree(target, link).map_err(|e| {
        EngineError::link_denied(format!(
            "all link strategies failed for {}: {e}",
            link.display()
        ))
    })
}

/// Create one shim. On POSIX this is a relative symlink into the sibling
/// slot; on Windows a small cmd launcher that invokes node.
fn create_shim(bin_dir: &Path, shim_name: &str, pkg_name: &str, rel: &str) -> Result<PathBuf> {
    let link_path = bin_dir.join(shim_name);
    let _ = remove_existing(&link_path);
    let _ = remove_existing(&link_path.with_extension("cmd"));

    let target_rel = Path::new("..").join(pkg_name).join(rel);

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&target_rel, &link_path).map_err(|e| {
            EngineError::link_denied(format!("failed to create shim '{shim_name}': {e}"))
        })?;

        // Entry scripts in tarballs frequently ship without the exec bit.
        use std::os::unix::fs::PermissionsExt;
        let resolved = bin_dir.join(&target_rel);
        if let Ok(metadata) = fs::metadata(&resolved) {
            let mut perms = metadata.permissions();
            perms.set_mode(perms.mode() | 0o111);
            let _ = fs::set_permissions(&resolved, perms);
        }

        Ok(link_path)
    }

    #[cfg(not(unix))]
    {
        let cmd_path = link_path.with_extension("cmd");
        let content = format!(
            "@ECHO off\r\nnode \"%~dp0\\{}\" %*\r\n",
            target_rel.display()
        );
        fs::write(&cmd_path, content).map_err(|e| {
            EngineError::link_denied(format!("failed to create shim '{shim_name}': {e}"))
        })?;
        Ok(cmd_path)
    }
}
