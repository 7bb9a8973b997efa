//! Project manifest (package.json) reading.
//!
//! The engine consumes the manifest only as a mapping of dependency name to
//! version specifier; everything else in the file is preserved but ignored.

use crate::error::EngineError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Manifest file name inside a project.
pub const MANIFEST_NAME: &str = "package.json";

/// A parsed project manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
}

impl Manifest {
    /// Read and parse a manifest file.
    ///
    /// # Errors
    /// Returns `MANIFEST_NOT_FOUND` when the file is missing and
    /// `MANIFEST_INVALID` when it cannot be parsed.
    pub fn read(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::manifest_not_found(path));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::manifest_invalid(format!("failed to read: {e}")))?;

        serde_json::from_str(&content)
            .map_err(|e| EngineError::manifest_invalid(format!("invalid JSON: {e}")))
    }

    /// Whether the manifest declares any installable dependency.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
            || !self.dev_dependencies.is_empty()
            || !self.optional_dependencies.is_empty()
    }

    /// Build the root requirement set for the resolver.
    ///
    /// Optional dependencies are treated as required, the same way they are
    /// merged into a node's child map during graph construction. Regular
    /// dependencies take precedence on name collisions, and dev dependencies
    /// are included only when requested.
    #[must_use]
    pub fn root_specs(&self, include_dev: bool) -> BTreeMap<String, String> {
        let mut specs = self.optional_dependencies.clone();
        if include_dev {
            for (name, spec) in &self.dev_dependencies {
                specs.insert(name.clone(), spec.clone());
            }
        }
        for (name, spec) in &self.dependencies {
            specs.insert(name.clone(), spec.clone());
        }
        specs
    }
}
