//! Content-addressed extraction store.
//!
//! Every distinct tarball, keyed by the SHA-256 of its raw bytes, has its
//! extracted contents at exactly one canonical location:
//! `<root>/<hash>/package/`. An entry either does not exist or is complete;
//! promotion is a rename, so no partially-populated entry is ever
//! observable. Entries are append-only.

use crate::error::{EngineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a store over the given root directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical package path for a hash: `<root>/<hash>/package/`.
    #[must_use]
    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(hash).join("package")
    }

    /// Whether the entry for a hash exists (and is a directory).
    #[must_use]
    pub fn exists(&self, hash: &str) -> bool {
        self.path_for(hash).is_dir()
    }

    /// Scratch area for in-progress extractions.
    ///
    /// Lives inside the store root so the promoting rename stays on one
    /// filesystem.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn scratch_base(&self) -> Result<PathBuf> {
        let dir = self.root.join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Atomically install a fully extracted scratch directory as the
    /// canonical entry for `hash`.
    ///
    /// Concurrent promotions for the same hash all succeed: the loser
    /// observes the existing entry, discards its scratch, and returns the
    /// canonical path.
    ///
    /// # Errors
    /// Returns an error if the entry cannot be created.
    pub fn promote(&self, scratch: &Path, hash: &str) -> Result<PathBuf> {
        let canonical = self.path_for(hash);

        if canonical.is_dir() {
            let _ = fs::remove_dir_all(scratch);
            return Ok(canonical);
        }

        let entry_dir = self.root.join(hash);
        fs::create_dir_all(&entry_dir)?;

        match fs::rename(scratch, &canonical) {
            Ok(()) => {
                debug!(%hash, "store entry promoted");
                Ok(canonical)
            }
            Err(rename_err) => {
                // A concurrent promotion may have won the rename.
                if canonical.is_dir() {
                    let _ = fs::remove_dir_all(scratch);
                    return Ok(canonical);
                }

                // Cross-device move: stage a linked/copied tree next to the
                // canonical path, then rename it in so the entry still
                // appears atomically.
                let staged = entry_dir.join(format!(".package-{}", std::process::id()));
                let _ = fs::remove_dir_all(&staged);
                if let Err(copy_err) = link_or_copy_tree(scratch, &staged) {
                    let _ = fs::remove_dir_all(&staged);
                    let _ = fs::remove_dir_all(scratch);
                    return Err(EngineError::new(
                        crate::error::codes::IO_ERROR,
                        format!(
                            "failed to move or copy extracted package: rename={rename_err}, copy={copy_err}"
                        ),
                    ));
                }
                let _ = fs::remove_dir_all(scratch);

                match fs::rename(&staged, &canonical) {
                    Ok(()) => Ok(canonical),
                    Err(e) => {
                        let _ = fs::remove_dir_all(&staged);
                        if canonical.is_dir() {
                            return Ok(canonical);
                        }
                        Err(EngineError::from(e))
                    }
                }
            }
        }
    }
}

/// Recursively mirror a directory tree, hardlinking each regular file and
/// copying when hardlinking fails.
pub(crate) fn link_or_copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            link_or_copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            if fs::hard_link(&src_path, &dst_path).is_err() {
                fs::copy(&src_path, &dst_path)?;
            }
        }
        // Symlinks and other special entries never enter the store.
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HASH: &str = "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33";

    fn make_scratch(base: &Path) -> PathBuf {
        let scratch = base.join("scratch").join("package");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("package.json"), r#"{"name":"x"}"#).unwrap();
        fs::create_dir_all(scratch.join("lib")).unwrap();
        fs::write(scratch.join("lib").join("index.js"), "module.exports = 1;").unwrap();
        scratch
    }

    #[test]
    fn test_path_for_layout() {
        let store = Store::new("/cas");
        assert_eq!(
            store.path_for("abc"),
            PathBuf::from("/cas").join("abc").join("package")
        );
    }

    #[test]
    fn test_promote_rename() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store"));
        let scratch = make_scratch(dir.path());

        let canonical = store.promote(&scratch, HASH).unwrap();
        assert_eq!(canonical, store.path_for(HASH));
        assert!(store.exists(HASH));
        assert!(canonical.join("package.json").exists());
        assert!(canonical.join("lib").join("index.js").exists());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_promote_second_scratch_discarded() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store"));

        let first = make_scratch(&dir.path().join("a"));
        store.promote(&first, HASH).unwrap();

        // A concurrent worker produced the same hash; its scratch has
        // different bytes, which must not replace the existing entry.
        let second = dir.path().join("b").join("package");
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("other.txt"), "other").unwrap();

        let canonical = store.promote(&second, HASH).unwrap();
        assert!(canonical.join("package.json").exists());
        assert!(!canonical.join("other.txt").exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_exists_false_for_file() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        fs::create_dir_all(dir.path().join(HASH)).unwrap();
        fs::write(dir.path().join(HASH).join("package"), "not a dir").unwrap();
        assert!(!store.exists(HASH));
    }

    #[test]
    fn test_link_or_copy_tree_mirrors() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("nested").join("b.txt"), "b").unwrap();

        let dst = dir.path().join("dst");
        link_or_copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(
            fs::read_to_string(dst.join("nested").join("b.txt")).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_scratch_base_under_root() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("store"));
        let scratch = store.scratch_base().unwrap();
        assert!(scratch.starts_with(store.root()));
        assert!(scratch.is_dir());
    }
}
