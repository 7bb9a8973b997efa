//! Install orchestration.
//!
//! Drives end-to-end installation over a resolved node list with a
//! two-stage pipeline: a fetch+extract stage that populates the
//! content-addressed store and a link stage that materializes project
//! slots. The stages communicate through bounded stream buffers, so neither
//! blocks the other beyond that capacity, and link order is irrelevant to
//! correctness.
//!
//! Idempotency contract: a slot whose integrity marker already names the
//! requested version is skipped before any network or extraction work.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::linker::{IntegrityMarker, Linker};
use crate::lockfile::{LockedPackage, LockfileSnapshot};
use crate::paths;
use crate::pipeline::{fetch_package, FetchedPackage};
use crate::registry::RegistryClient;
use crate::resolver::DepNode;
use crate::store::Store;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One unit of pipeline work: a resolved package to materialize.
#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub name: String,
    pub version: String,
    pub tarball_url: String,
}

impl From<&DepNode> for PackageRequest {
    fn from(node: &DepNode) -> Self {
        Self {
            name: node.name.clone(),
            version: node.resolved.clone(),
            tarball_url: node.tarball_url.clone(),
        }
    }
}

/// Outcome for one slot.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub tarball_url: String,
    /// Store hash; empty when a pre-existing marker carried none.
    pub hash: String,
    /// True when the slot was already up to date and untouched.
    pub skipped: bool,
}

/// Result of an `install_all` run, in resolver order.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub packages: Vec<InstalledPackage>,
}

impl InstallReport {
    /// Number of slots skipped as already up to date.
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.packages.iter().filter(|p| p.skipped).count()
    }

    /// Build the lockfile snapshot for this report.
    #[must_use]
    pub fn to_snapshot(&self) -> LockfileSnapshot {
        LockfileSnapshot::new(
            self.packages
                .iter()
                .map(|p| LockedPackage {
                    name: p.name.clone(),
                    version: p.version.clone(),
                    resolved_url: p.tarball_url.clone(),
                    integrity: p.hash.clone(),
                })
                .collect(),
        )
    }
}

/// Install orchestrator for one project.
#[derive(Debug, Clone)]
pub struct Installer {
    registry: RegistryClient,
    store: Store,
    linker: Linker,
    project_root: PathBuf,
    dl_workers: usize,
    link_workers: usize,
}

impl Installer {
    /// Create an installer for a project from an engine configuration.
    pub fn new(config: &EngineConfig, project_root: &Path) -> Result<Self> {
        let registry = RegistryClient::from_config(config)?;
        let store = Store::new(paths::store_dir(&config.cache_root));
        let linker = Linker::new(
            project_root.join("node_modules"),
            paths::shared_dir(&config.cache_root),
        );
        Ok(Self::from_parts(
            registry,
            store,
            linker,
            project_root,
            config.dl_workers,
            config.link_workers,
        ))
    }

    /// Assemble an installer from explicit components.
    #[must_use]
    pub fn from_parts(
        registry: RegistryClient,
        store: Store,
        linker: Linker,
        project_root: &Path,
        dl_workers: usize,
        link_workers: usize,
    ) -> Self {
        Self {
            registry,
            store,
            linker,
            project_root: project_root.to_path_buf(),
            dl_workers: dl_workers.max(1),
            link_workers: link_workers.max(1),
        }
    }

    /// The linker this installer writes through.
    #[must_use]
    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    /// Install a single package by name and raw specifier, returning the
    /// resolved version.
    pub async fn install_one(&self, name: &str, spec: &str) -> Result<String> {
        // An exact spec can satisfy the idempotency check before any
        // network work; range-ish specs need the registry to learn the
        // version first.
        let normalized = crate::resolver::normalize_version(spec);
        if crate::registry::is_exact_version(&normalized)
            && self.linker.up_to_date(name, &normalized).is_some()
        {
            debug!(package = name, version = %normalized, "slot up to date");
            return Ok(normalized);
        }

        let registry = &self.registry;
        let entry = retry_transient(|| registry.get_version_entry(name, spec)).await?;

        if self.linker.up_to_date(name, &entry.version).is_some() {
            debug!(package = name, version = %entry.version, "slot up to date");
            return Ok(entry.version);
        }
        self.linker.remove_slot(name)?;

        let store = &self.store;
        let url = entry.dist.tarball.clone();
        let fetched = retry_transient(|| fetch_package(registry, store, &url)).await?;
        self.link_stage(&PackageRequest {
            name: name.to_string(),
            version: entry.version.clone(),
            tarball_url: url,
        }, &fetched)?;

        info!(package = name, version = %entry.version, "installed");
        Ok(entry.version)
    }

    /// Install every package in a resolved, ordered node list.
    ///
    /// All nodes are driven to completion before the first collected error
    /// is returned; partially failed runs leave the successful slots in
    /// place. On full success the lockfile snapshot is persisted.
    pub async fn install_all(&self, requests: &[PackageRequest]) -> Result<InstallReport> {
        let mut slots: Vec<Option<InstalledPackage>> = vec![None; requests.len()];
        let mut pending: Vec<(usize, PackageRequest)> = Vec::new();

        for (index, request) in requests.iter().enumerate() {
            if let Some(marker) = self.linker.up_to_date(&request.name, &request.version) {
                debug!(package = %request.name, version = %request.version, "slot up to date");
                slots[index] = Some(InstalledPackage {
                    name: request.name.clone(),
                    version: request.version.clone(),
                    tarball_url: request.tarball_url.clone(),
                    hash: marker.hash,
                    skipped: true,
                });
            } else {
                pending.push((index, request.clone()));
            }
        }

        let outcomes: Vec<(usize, Result<InstalledPackage>)> = stream::iter(pending)
            .map(|(index, request)| {
                let registry = self.registry.clone();
                let store = self.store.clone();
                async move {
                    let url = request.tarball_url.clone();
                    let fetched =
                        retry_transient(|| fetch_package(&registry, &store, &url)).await;
                    (index, request, fetched)
                }
            })
            .buffer_unordered(self.dl_workers)
            .map(|(index, request, fetched)| async move {
                let outcome = match fetched {
                    Ok(fetched) => self.link_stage(&request, &fetched).map(|()| {
                        InstalledPackage {
                            name: request.name,
                            version: request.version,
                            tarball_url: request.tarball_url,
                            hash: fetched.hash,
                            skipped: false,
                        }
                    }),
                    Err(e) => Err(e),
                };
                (index, outcome)
            })
            .buffer_unordered(self.link_workers)
            .collect()
            .await;

        let mut first_error: Option<EngineError> = None;
        for (index, outcome) in outcomes {
            match outcome {
                Ok(installed) => slots[index] = Some(installed),
                Err(e) => {
                    warn!(package = %requests[index].name, error = %e, "install failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        let report = InstallReport {
            packages: slots.into_iter().flatten().collect(),
        };
        report.to_snapshot().save(&self.project_root)?;
        info!(
            installed = report.packages.len() - report.skipped_count(),
            skipped = report.skipped_count(),
            "install complete"
        );
        Ok(report)
    }

    /// Stage B work for one package: link the slot, mirror it into the
    /// shared directory, create shims, and write the integrity marker.
    fn link_stage(&self, request: &PackageRequest, fetched: &FetchedPackage) -> Result<()> {
        let slot = self.linker.link_slot(&request.name, &fetched.cas_path)?;

        if let Err(e) = self.linker.link_shared(&request.name, &slot) {
            warn!(package = %request.name, error = %e, "shared link failed");
        }
        if let Err(e) = self.linker.write_shims(&request.name, &slot) {
            warn!(package = %request.name, error = %e, "shim creation failed");
        }

        self.linker.write_marker(
            &request.name,
            &IntegrityMarker {
                name: request.name.clone(),
                version: request.version.clone(),
                hash: fetched.hash.clone(),
            },
        )
    }
}

/// Run an operation, retrying once when it fails with a transient error
/// (registry unreachable, download failure).
async fn retry_transient<T, F, Fut>(operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => {
            warn!(error = %e, "transient failure, retrying once");
            operation().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn offline_installer(base: &Path) -> Installer {
        let registry = RegistryClient::new("http://127.0.0.1:9/", base).unwrap();
        let store = Store::new(base.join("store"));
        let linker = Linker::new(
            base.join("project").join("node_modules"),
            base.join("shared"),
        );
        Installer::from_parts(registry, store, linker, &base.join("project"), 4, 4)
    }

    fn request(name: &str, version: &str) -> PackageRequest {
        PackageRequest {
            name: name.to_string(),
            version: version.to_string(),
            tarball_url: format!("https://example.com/{name}-{version}.tgz"),
        }
    }

    #[tokio::test]
    async fn test_install_all_skips_up_to_date_slots() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        let installer = offline_installer(dir.path());

        // Pre-existing markers: both slots are current, so install_all
        // finishes without touching the (unreachable) network.
        for (name, version, hash) in [("a", "1.0.0", "h-a"), ("b", "2.0.0", "h-b")] {
            installer
                .linker
                .write_marker(
                    name,
                    &IntegrityMarker {
                        name: name.to_string(),
                        version: version.to_string(),
                        hash: hash.to_string(),
                    },
                )
                .unwrap();
        }

        let report = installer
            .install_all(&[request("a", "1.0.0"), request("b", "2.0.0")])
            .await
            .unwrap();

        assert_eq!(report.packages.len(), 2);
        assert_eq!(report.skipped_count(), 2);
        // Marker hashes flow into the snapshot.
        let snapshot = report.to_snapshot();
        assert_eq!(snapshot.packages[0].integrity, "h-a");

        // The lockfile was persisted in resolver order.
        let loaded = LockfileSnapshot::load(&dir.path().join("project")).unwrap();
        assert_eq!(loaded.packages.len(), 2);
        assert_eq!(loaded.packages[0].name, "a");
        assert_eq!(loaded.packages[1].name, "b");
    }

    #[tokio::test]
    async fn test_install_all_reports_failure_after_drain() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        let installer = offline_installer(dir.path());

        // One slot is current; the other needs an unreachable download.
        installer
            .linker
            .write_marker(
                "ok",
                &IntegrityMarker {
                    name: "ok".to_string(),
                    version: "1.0.0".to_string(),
                    hash: String::new(),
                },
            )
            .unwrap();

        let mut bad = request("bad", "1.0.0");
        bad.tarball_url = "http://127.0.0.1:9/bad-1.0.0.tgz".to_string();

        let err = installer
            .install_all(&[request("ok", "1.0.0"), bad])
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Partial failure writes no lockfile.
        assert!(LockfileSnapshot::load(&dir.path().join("project")).is_err());
    }

    #[tokio::test]
    async fn test_install_one_exact_spec_skips_without_network() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        let installer = offline_installer(dir.path());

        installer
            .linker
            .write_marker(
                "left-pad",
                &IntegrityMarker {
                    name: "left-pad".to_string(),
                    version: "1.3.0".to_string(),
                    hash: "h".to_string(),
                },
            )
            .unwrap();

        // The caret strips to an exact version, the marker matches, and the
        // unreachable registry is never consulted.
        let version = installer.install_one("left-pad", "^1.3.0").await.unwrap();
        assert_eq!(version, "1.3.0");
    }

    #[tokio::test]
    async fn test_install_all_version_change_is_not_skipped() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        let installer = offline_installer(dir.path());

        installer
            .linker
            .write_marker(
                "pkg",
                &IntegrityMarker {
                    name: "pkg".to_string(),
                    version: "1.0.0".to_string(),
                    hash: String::new(),
                },
            )
            .unwrap();

        // Requesting a different version must attempt real work (which
        // fails here because the registry is unreachable).
        let mut req = request("pkg", "2.0.0");
        req.tarball_url = "http://127.0.0.1:9/pkg-2.0.0.tgz".to_string();
        assert!(installer.install_all(&[req]).await.is_err());
    }

    #[test]
    fn test_report_snapshot_order() {
        let report = InstallReport {
            packages: vec![
                InstalledPackage {
                    name: "z".to_string(),
                    version: "1.0.0".to_string(),
                    tarball_url: "https://example.com/z.tgz".to_string(),
                    hash: "zh".to_string(),
                    skipped: false,
                },
                InstalledPackage {
                    name: "a".to_string(),
                    version: "1.0.0".to_string(),
                    tarball_url: "https://example.com/a.tgz".to_string(),
                    hash: String::new(),
                    skipped: true,
                },
            ],
        };

        let snapshot = report.to_snapshot();
        // Input (resolver) order is preserved, not name order.
        assert_eq!(snapshot.packages[0].name, "z");
        assert_eq!(snapshot.packages[1].name, "a");
        assert!(snapshot.packages[0].integrity == "zh");
    }

    #[test]
    fn test_package_request_from_node() {
        let node = DepNode {
            name: "left-pad".to_string(),
            spec: "^1".to_string(),
            resolved: "1.3.0".to_string(),
            tarball_url: "https://example.com/left-pad-1.3.0.tgz".to_string(),
            raw_child_deps: std::collections::BTreeMap::new(),
            children: std::collections::BTreeSet::new(),
        };
        let request = PackageRequest::from(&node);
        assert_eq!(request.name, "left-pad");
        assert_eq!(request.version, "1.3.0");
    }
}
