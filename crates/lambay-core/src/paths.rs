//! User-cache filesystem layout.
//!
//! Everything the engine persists outside a project lives under one
//! user-scoped base directory:
//!
//! ```text
//! <cache_root>/
//!   registry-cache/<name>.json           cached registry index document
//!   registry-cache/<name>.meta.json      ETag / Last-Modified sidecar
//!   registry-cache/versions/<safe>@<ver>.json
//!   store/<sha256>/package/              content-addressed extracted package
//!   shared/<name>                        cross-project package link
//! ```

use std::path::{Path, PathBuf};

/// Default user cache root for lambay.
///
/// Uses the platform cache directory, falling back to `~/.cache/lambay`,
/// then to a relative directory when no home exists.
#[must_use]
pub fn user_cache_root() -> PathBuf {
    dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".lambay-cache"),
                |p| p.join(".cache").join("lambay"),
            )
        },
        |p| p.join("lambay"),
    )
}

/// Registry document cache directory under a cache root.
#[must_use]
pub fn registry_cache_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("registry-cache")
}

/// Per-version entry cache directory under a cache root.
#[must_use]
pub fn version_cache_dir(cache_root: &Path) -> PathBuf {
    registry_cache_dir(cache_root).join("versions")
}

/// Content-addressed store root under a cache root.
#[must_use]
pub fn store_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("store")
}

/// Cross-project shared link directory under a cache root.
#[must_use]
pub fn shared_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("shared")
}

/// Derive a filesystem-safe file name from a package name.
///
/// Scoped names keep their `@` but `/` and `\` become `-`.
#[must_use]
pub fn safe_file_name(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let root = Path::new("/tmp/cache");
        assert_eq!(
            registry_cache_dir(root),
            PathBuf::from("/tmp/cache/registry-cache")
        );
        assert_eq!(
            version_cache_dir(root),
            PathBuf::from("/tmp/cache/registry-cache/versions")
        );
        assert_eq!(store_dir(root), PathBuf::from("/tmp/cache/store"));
        assert_eq!(shared_dir(root), PathBuf::from("/tmp/cache/shared"));
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("react"), "react");
        assert_eq!(safe_file_name("@types/node"), "@types-node");
        assert_eq!(safe_file_name("weird\\name"), "weird-name");
    }

    #[test]
    fn test_user_cache_root_is_nonempty() {
        let root = user_cache_root();
        assert!(!root.as_os_str().is_empty());
    }
}
