//! Registry client with conditional-request caching.
//!
//! Index documents are cached on disk as two files: the JSON body and a
//! sidecar holding the validators (`ETag`, `Last-Modified`) for the next
//! conditional request. A `304 Not Modified` revalidates the disk copy; any
//! network failure falls back to it.

use crate::config::{self, EngineConfig};
use crate::error::{EngineError, Result};
use crate::paths;
use crate::resolver::normalize_version;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

/// The `dist` block of a registry version object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
}

/// One published version inside an index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dist: Dist,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    pub peer_dependencies: BTreeMap<String, String>,
}

impl VersionEntry {
    /// The child requirement map used for graph construction:
    /// `dependencies` merged with `optionalDependencies` (optional wins on
    /// collisions). Peer dependencies are ignored.
    #[must_use]
    pub fn child_specs(&self) -> BTreeMap<String, String> {
        let mut merged = self.dependencies.clone();
        for (name, spec) in &self.optional_dependencies {
            merged.insert(name.clone(), spec.clone());
        }
        merged
    }
}

/// The `dist-tags` block of an index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistTags {
    #[serde(default)]
    pub latest: String,
}

/// A per-package index document as served by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionEntry>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: DistTags,
}

/// Sidecar holding the validators for a cached index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheMeta {
    #[serde(default)]
    etag: String,
    #[serde(default, rename = "lastModified")]
    last_modified: String,
    #[serde(default, rename = "cachedAt")]
    cached_at: Option<DateTime<Utc>>,
}

/// Registry client.
///
/// Cloning is cheap; all clones share the connection pool and the request
/// semaphore.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    http: Client,
    cache_root: PathBuf,
    permits: Arc<Semaphore>,
}

impl RegistryClient {
    /// Create a new registry client.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be
    /// created.
    pub fn new(base_url: &str, cache_root: &Path) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| {
            EngineError::registry_unavailable(format!("invalid registry URL '{base_url}': {e}"))
        })?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config::REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("lambay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                EngineError::registry_unavailable(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            base_url,
            http,
            cache_root: cache_root.to_path_buf(),
            permits: Arc::new(Semaphore::new(config::MAX_HTTP_CONCURRENCY)),
        })
    }

    /// Create a client from an engine configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut client = Self::new(&config.registry_url, &config.cache_root)?;
        client.permits = Arc::new(Semaphore::new(config.http_concurrency.max(1)));
        Ok(client)
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn doc_path(&self, name: &str) -> PathBuf {
        paths::registry_cache_dir(&self.cache_root).join(format!("{name}.json"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        paths::registry_cache_dir(&self.cache_root).join(format!("{name}.meta.json"))
    }

    fn version_entry_path(&self, name: &str, version: &str) -> PathBuf {
        paths::version_cache_dir(&self.cache_root)
            .join(format!("{}@{version}.json", paths::safe_file_name(name)))
    }

    /// Fetch the index document for a package, revalidating the on-disk
    /// cache with a conditional request.
    ///
    /// # Errors
    /// - `REGISTRY_UNAVAILABLE` when the registry cannot be reached and no
    ///   usable disk copy exists.
    /// - `REGISTRY_CORRUPT` when a `304` points at a missing or unparseable
    ///   disk copy.
    pub async fn get_index(&self, name: &str) -> Result<RegistryDocument> {
        let doc_path = self.doc_path(name);
        let meta_path = self.meta_path(name);

        let meta: CacheMeta = std::fs::read(&meta_path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default();

        let url = self.index_url(name)?;
        let mut request = self.http.get(url.as_str());
        if !meta.etag.is_empty() {
            request = request.header("If-None-Match", &meta.etag);
        }
        if !meta.last_modified.is_empty() {
            request = request.header("If-Modified-Since", &meta.last_modified);
        }

        let permit = self.permits.acquire().await.map_err(|_| {
            EngineError::registry_unavailable("request limiter closed during shutdown")
        })?;
        let response = request.send().await;

        match response {
            Err(e) => {
                drop(permit);
                if let Some(doc) = read_disk_document(&doc_path) {
                    debug!(package = name, "registry unreachable, using cached index");
                    return Ok(doc);
                }
                Err(EngineError::registry_unavailable(format!(
                    "failed to fetch index for '{name}': {e}"
                )))
            }
            Ok(response) => match response.status() {
                StatusCode::NOT_MODIFIED => {
                    drop(permit);
                    debug!(package = name, "index revalidated (304)");
                    read_disk_document(&doc_path).ok_or_else(|| {
                        EngineError::registry_corrupt(format!(
                            "registry returned 304 for '{name}' but the cached document is unusable"
                        ))
                    })
                }
                StatusCode::OK => {
                    let etag = header_string(&response, "etag");
                    let last_modified = header_string(&response, "last-modified");
                    let body = response.bytes().await.map_err(|e| {
                        EngineError::registry_unavailable(format!(
                            "failed to read index body for '{name}': {e}"
                        ))
                    })?;
                    drop(permit);

                    let doc: RegistryDocument = serde_json::from_slice(&body).map_err(|e| {
                        EngineError::registry_corrupt(format!(
                            "unparseable index document for '{name}': {e}"
                        ))
                    })?;

                    self.persist_index(name, &doc_path, &meta_path, &body, etag, last_modified)?;
                    Ok(doc)
                }
                status => {
                    drop(permit);
                    if let Some(doc) = read_disk_document(&doc_path) {
                        debug!(package = name, %status, "registry error, using cached index");
                        return Ok(doc);
                    }
                    Err(EngineError::registry_unavailable(format!(
                        "registry returned status {status} for '{name}'"
                    )))
                }
            },
        }
    }

    fn index_url(&self, name: &str) -> Result<Url> {
        // URL-encode the name for scoped packages
        let encoded_name = if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        };
        self.base_url.join(&encoded_name).map_err(|e| {
            EngineError::registry_unavailable(format!("failed to build URL for '{name}': {e}"))
        })
    }

    fn persist_index(
        &self,
        name: &str,
        doc_path: &Path,
        meta_path: &Path,
        body: &[u8],
        etag: String,
        last_modified: String,
    ) -> Result<()> {
        if let Some(parent) = doc_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        lambay_util::fs::atomic_write(doc_path, body)?;

        let meta = CacheMeta {
            etag,
            last_modified,
            cached_at: Some(Utc::now()),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| EngineError::registry_corrupt(format!("sidecar encode failed: {e}")))?;
        lambay_util::fs::atomic_write(meta_path, &meta_bytes)?;
        debug!(package = name, "index document cached");
        Ok(())
    }

    /// Resolve a spec to a concrete version entry.
    ///
    /// A normalized exact version is first looked up in the per-version
    /// entry cache so that repeat runs skip parsing the full index. Version
    /// entries are immutable once published, so that cache never goes stale;
    /// every other spec shape goes through the conditionally-revalidated
    /// index.
    pub async fn get_version_entry(&self, name: &str, spec: &str) -> Result<VersionEntry> {
        let normalized = normalize_version(spec);

        if is_exact_version(&normalized) {
            if let Some(entry) = self.read_cached_entry(name, &normalized) {
                debug!(package = name, version = %normalized, "version entry cache hit");
                return Ok(entry);
            }
        }

        let doc = self.get_index(name).await?;
        let version = resolve_version(&doc, &normalized)
            .ok_or_else(|| EngineError::version_not_found(name, spec))?;

        let mut entry = doc
            .versions
            .get(&version)
            .cloned()
            .ok_or_else(|| EngineError::version_not_found(name, spec))?;
        if entry.version.is_empty() {
            entry.version = version.clone();
        }
        if entry.name.is_empty() {
            entry.name = name.to_string();
        }

        if entry.dist.tarball.is_empty() {
            return Err(EngineError::version_not_found(name, spec));
        }

        self.write_cached_entry(name, &version, &entry);
        Ok(entry)
    }

    fn read_cached_entry(&self, name: &str, version: &str) -> Option<VersionEntry> {
        let bytes = std::fs::read(self.version_entry_path(name, version)).ok()?;
        let entry: VersionEntry = serde_json::from_slice(&bytes).ok()?;
        if entry.version.is_empty() || entry.dist.tarball.is_empty() {
            return None;
        }
        Some(entry)
    }

    fn write_cached_entry(&self, name: &str, version: &str, entry: &VersionEntry) {
        let path = self.version_entry_path(name, version);
        let Some(parent) = path.parent() else { return };
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
        if let Ok(bytes) = serde_json::to_vec_pretty(entry) {
            let _ = lambay_util::fs::atomic_write(&path, &bytes);
        }
    }

    /// Open a streaming GET against a tarball URL.
    ///
    /// # Errors
    /// Returns `DOWNLOAD_FAILED` on transport errors or a non-200 status.
    pub async fn stream_tarball(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .timeout(config::DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::download_failed(format!("failed to fetch '{url}': {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(EngineError::download_failed(format!(
                "download failed with status {} for '{url}'",
                response.status()
            )));
        }

        Ok(response)
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn read_disk_document(path: &Path) -> Option<RegistryDocument> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Select a concrete version from an index document for a normalized spec.
///
/// - `latest` resolves through the `dist-tags.latest` tag.
/// - An exact key in `versions` resolves to itself.
/// - A one- or two-segment numeric prefix resolves to the numerically
///   greatest version whose leading segments match; non-numeric version
///   keys are skipped.
#[must_use]
pub fn resolve_version(doc: &RegistryDocument, spec: &str) -> Option<String> {
    if spec == "latest" {
        let latest = &doc.dist_tags.latest;
        if !latest.is_empty() && doc.versions.contains_key(latest) {
            return Some(latest.clone());
        }
        return None;
    }

    if doc.versions.contains_key(spec) {
        return Some(spec.to_string());
    }

    resolve_prefix(doc, spec)
}

fn resolve_prefix(doc: &RegistryDocument, spec: &str) -> Option<String> {
    let spec = spec
        .strip_suffix(".x")
        .or_else(|| spec.strip_suffix(".*"))
        .unwrap_or(spec);

    let segments: Vec<u64> = spec
        .split('.')
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if segments.is_empty() || segments.len() > 2 {
        return None;
    }

    let mut best: Option<(u64, u64, u64, &String)> = None;
    for key in doc.versions.keys() {
        let Some((major, minor, patch)) = parse_triplet(key) else {
            continue;
        };
        if major != segments[0] {
            continue;
        }
        if segments.len() == 2 && minor != segments[1] {
            continue;
        }
        if best.map_or(true, |(bm, bn, bp, _)| (major, minor, patch) > (bm, bn, bp)) {
            best = Some((major, minor, patch, key));
        }
    }

    best.map(|(_, _, _, key)| key.clone())
}

/// Parse a purely numeric `MAJOR[.MINOR[.PATCH]]` triple; missing segments
/// default to zero and any non-digit character disqualifies the key.
fn parse_triplet(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = [0u64; 3];
    let mut count = 0;
    for segment in version.split('.') {
        if count >= 3 || segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        parts[count] = segment.parse().ok()?;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some((parts[0], parts[1], parts[2]))
}

/// Whether a normalized spec names an exact published version
/// (`MAJOR.MINOR.PATCH` with an optional pre-release suffix).
#[must_use]
pub fn is_exact_version(spec: &str) -> bool {
    let head = spec.split('-').next().unwrap_or_default();
    let segments: Vec<&str> = head.split('.').collect();
    segments.len() == 3
        && segments
            .iter()
            .all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_doc(versions: &[&str], latest: &str) -> RegistryDocument {
        let mut doc = RegistryDocument {
            name: "test-pkg".to_string(),
            ..RegistryDocument::default()
        };
        doc.dist_tags.latest = latest.to_string();
        for v in versions {
            doc.versions.insert(
                (*v).to_string(),
                VersionEntry {
                    name: "test-pkg".to_string(),
                    version: (*v).to_string(),
                    dist: Dist {
                        tarball: format!("https://example.com/{v}.tgz"),
                    },
                    ..VersionEntry::default()
                },
            );
        }
        doc
    }

    #[test]
    fn test_resolve_latest() {
        let doc = make_doc(&["1.0.0", "2.0.0"], "2.0.0");
        assert_eq!(resolve_version(&doc, "latest").as_deref(), Some("2.0.0"));
    }

    #[test]
    fn test_resolve_latest_missing_tag() {
        let doc = make_doc(&["1.0.0"], "");
        assert_eq!(resolve_version(&doc, "latest"), None);
    }

    #[test]
    fn test_resolve_exact() {
        let doc = make_doc(&["1.0.0", "1.2.3"], "1.2.3");
        assert_eq!(resolve_version(&doc, "1.2.3").as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_resolve_exact_prerelease() {
        let doc = make_doc(&["2.0.0-rc.1", "1.0.0"], "1.0.0");
        assert_eq!(
            resolve_version(&doc, "2.0.0-rc.1").as_deref(),
            Some("2.0.0-rc.1")
        );
    }

    #[test]
    fn test_resolve_one_segment_prefix() {
        let doc = make_doc(&["1.0.0", "1.5.0", "2.0.0", "2.5.0"], "2.5.0");
        assert_eq!(resolve_version(&doc, "1").as_deref(), Some("1.5.0"));
    }

    #[test]
    fn test_resolve_two_segment_prefix() {
        let doc = make_doc(&["1.2.0", "1.2.9", "1.3.0"], "1.3.0");
        assert_eq!(resolve_version(&doc, "1.2").as_deref(), Some("1.2.9"));
    }

    #[test]
    fn test_resolve_prefix_ignores_non_numeric() {
        let doc = make_doc(&["1.2.0", "1.2.9-beta.1", "1.2.5"], "1.2.5");
        assert_eq!(resolve_version(&doc, "1.2").as_deref(), Some("1.2.5"));
    }

    #[test]
    fn test_resolve_prefix_numeric_comparison() {
        // 1.10.0 > 1.9.0 numerically even though it sorts lower as a string
        let doc = make_doc(&["1.9.0", "1.10.0"], "1.10.0");
        assert_eq!(resolve_version(&doc, "1").as_deref(), Some("1.10.0"));
    }

    #[test]
    fn test_resolve_not_found() {
        let doc = make_doc(&["1.0.0"], "1.0.0");
        assert_eq!(resolve_version(&doc, "3"), None);
        assert_eq!(resolve_version(&doc, "2.0.0"), None);
        assert_eq!(resolve_version(&doc, "not-a-version"), None);
    }

    #[test]
    fn test_is_exact_version() {
        assert!(is_exact_version("1.2.3"));
        assert!(is_exact_version("1.2.3-beta.1"));
        assert!(!is_exact_version("1.2"));
        assert!(!is_exact_version("1"));
        assert!(!is_exact_version("latest"));
        assert!(!is_exact_version("1.2.x"));
    }

    #[test]
    fn test_document_parsing() {
        let json = serde_json::json!({
            "name": "chalk",
            "dist-tags": { "latest": "4.1.2" },
            "versions": {
                "4.1.2": {
                    "name": "chalk",
                    "version": "4.1.2",
                    "dist": { "tarball": "https://registry.npmjs.org/chalk/-/chalk-4.1.2.tgz" },
                    "dependencies": { "ansi-styles": "^4.1.0" },
                    "optionalDependencies": { "fsevents": "^2.0.0" },
                    "peerDependencies": { "react": "*" },
                    "engines": { "node": ">=10" }
                }
            },
            "readme": "ignored"
        });

        let doc: RegistryDocument = serde_json::from_value(json).unwrap();
        assert_eq!(doc.dist_tags.latest, "4.1.2");
        let entry = &doc.versions["4.1.2"];
        assert_eq!(entry.dependencies["ansi-styles"], "^4.1.0");

        let children = entry.child_specs();
        assert!(children.contains_key("fsevents"));
        // peer dependencies are not graph edges
        assert!(!children.contains_key("react"));
    }

    #[test]
    fn test_child_specs_optional_wins() {
        let entry = VersionEntry {
            dependencies: [("a".to_string(), "1.0.0".to_string())].into(),
            optional_dependencies: [("a".to_string(), "2.0.0".to_string())].into(),
            ..VersionEntry::default()
        };
        assert_eq!(entry.child_specs()["a"], "2.0.0");
    }

    #[test]
    fn test_client_invalid_url() {
        let dir = tempdir().unwrap();
        assert!(RegistryClient::new("not-a-url", dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_get_index_falls_back_to_disk() {
        let dir = tempdir().unwrap();
        // Port 9 (discard) is not listening; connection is refused fast.
        let client = RegistryClient::new("http://127.0.0.1:9/", dir.path()).unwrap();

        let cache_dir = paths::registry_cache_dir(dir.path());
        std::fs::create_dir_all(&cache_dir).unwrap();
        let doc = make_doc(&["1.0.0"], "1.0.0");
        std::fs::write(
            cache_dir.join("left-pad.json"),
            serde_json::to_vec(&doc).unwrap(),
        )
        .unwrap();

        let fetched = client.get_index("left-pad").await.unwrap();
        assert!(fetched.versions.contains_key("1.0.0"));
    }

    #[tokio::test]
    async fn test_get_index_unavailable_without_cache() {
        let dir = tempdir().unwrap();
        let client = RegistryClient::new("http://127.0.0.1:9/", dir.path()).unwrap();

        let err = client.get_index("left-pad").await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::REGISTRY_UNAVAILABLE);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_version_entry_cache_skips_network() {
        let dir = tempdir().unwrap();
        let client = RegistryClient::new("http://127.0.0.1:9/", dir.path()).unwrap();

        let entry = VersionEntry {
            name: "left-pad".to_string(),
            version: "1.3.0".to_string(),
            dist: Dist {
                tarball: "https://example.com/left-pad-1.3.0.tgz".to_string(),
            },
            ..VersionEntry::default()
        };
        let path = client.version_entry_path("left-pad", "1.3.0");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&entry).unwrap()).unwrap();

        // Exact spec hits the entry cache; the unreachable registry is never needed.
        let fetched = client.get_version_entry("left-pad", "^1.3.0").await.unwrap();
        assert_eq!(fetched.version, "1.3.0");
        assert_eq!(fetched.dist.tarball, entry.dist.tarball);
    }

    #[tokio::test]
    async fn test_version_entry_missing_tarball_not_found() {
        let dir = tempdir().unwrap();
        let client = RegistryClient::new("http://127.0.0.1:9/", dir.path()).unwrap();

        // Seed a cached index whose version entry has no dist.tarball.
        let mut doc = make_doc(&[], "1.0.0");
        doc.versions.insert(
            "1.0.0".to_string(),
            VersionEntry {
                name: "broken".to_string(),
                version: "1.0.0".to_string(),
                ..VersionEntry::default()
            },
        );
        let cache_dir = paths::registry_cache_dir(dir.path());
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(
            cache_dir.join("broken.json"),
            serde_json::to_vec(&doc).unwrap(),
        )
        .unwrap();

        let err = client.get_version_entry("broken", "1.0.0").await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::VERSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_version_entry_range_needs_index() {
        let dir = tempdir().unwrap();
        let client = RegistryClient::new("http://127.0.0.1:9/", dir.path()).unwrap();

        // A range-ish spec must go through the index, which is unavailable.
        let err = client.get_version_entry("left-pad", "^1").await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::REGISTRY_UNAVAILABLE);
    }

    #[test]
    fn test_cache_meta_roundtrip() {
        let meta = CacheMeta {
            etag: "\"abc\"".to_string(),
            last_modified: "Tue, 01 Jul 2025 00:00:00 GMT".to_string(),
            cached_at: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec(&meta).unwrap();
        let parsed: CacheMeta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.etag, meta.etag);
        assert_eq!(parsed.last_modified, meta.last_modified);
    }
}
