//! Engine configuration.
//!
//! Every concurrency bound and path the engine uses is carried here so that
//! callers (and tests) can pin them; the defaults come from the environment
//! and CPU count.

use crate::paths;
use std::path::PathBuf;
use std::time::Duration;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override the registry URL.
pub const REGISTRY_ENV: &str = "LAMBAY_NPM_REGISTRY";

/// Environment variable to override the user cache root.
pub const CACHE_DIR_ENV: &str = "LAMBAY_CACHE_DIR";

/// Maximum simultaneous registry HTTP requests.
pub const MAX_HTTP_CONCURRENCY: usize = 64;

/// Per-request timeout for registry index requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-request timeout for tarball downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Registry base URL.
    pub registry_url: String,
    /// User cache root (registry cache, store, shared links live below it).
    pub cache_root: PathBuf,
    /// Registry HTTP request semaphore size.
    pub http_concurrency: usize,
    /// Resolver worker pool size.
    pub resolve_workers: usize,
    /// Fetch+extract stage worker count.
    pub dl_workers: usize,
    /// Link stage worker count.
    pub link_workers: usize,
}

impl EngineConfig {
    /// Build a configuration from the environment with auto-tuned worker
    /// counts.
    #[must_use]
    pub fn from_env() -> Self {
        let registry_url =
            std::env::var(REGISTRY_ENV).unwrap_or_else(|_| DEFAULT_REGISTRY.to_string());
        let cache_root = std::env::var(CACHE_DIR_ENV)
            .map_or_else(|_| paths::user_cache_root(), PathBuf::from);

        let workers = auto_concurrency();
        Self {
            registry_url,
            cache_root,
            http_concurrency: MAX_HTTP_CONCURRENCY,
            resolve_workers: workers,
            dl_workers: workers,
            link_workers: link_workers_for(workers),
        }
    }

    /// Override every worker pool with a single concurrency value
    /// (the CLI `--concurrency` flag). Zero keeps the auto-tuned defaults.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        if concurrency > 0 {
            self.resolve_workers = concurrency;
            self.dl_workers = concurrency;
            self.link_workers = link_workers_for(concurrency);
        }
        self
    }
}

/// Auto-tune worker counts from the CPU count: `max(64, min(256, cpu*16))`.
#[must_use]
pub fn auto_concurrency() -> usize {
    let cores = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
    (cores * 16).clamp(64, 256)
}

fn link_workers_for(dl_workers: usize) -> usize {
    (dl_workers / 2).max(8)
}
