//! IP-Range Repository
//!
//! Fresh cache first, network second. The repository never retries on its
//! own; a failed load leaves the caller on the built-in fallback list.

use crate::cache::{RangeCache, CACHE_TTL};
use crate::feed::{FeedSource, FetchError, HttpsFeed};
use crate::range::{parse_feed, IpRange};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Mainland-China IPv4 range feed
pub const CHINA_IP_LIST_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/master/chn_ip.txt";

/// Cache file name inside the config directory
pub const CACHE_FILE_NAME: &str = "china_ip_list.json";

/// Hard limit on the whole download
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Repository configuration
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub cache_path: PathBuf,
    pub feed_url: String,
    pub ttl: Duration,
    pub fetch_timeout: Duration,
}

impl RepositoryConfig {
    /// Defaults with the cache file placed in `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            cache_path: dir.as_ref().join(CACHE_FILE_NAME),
            feed_url: CHINA_IP_LIST_URL.to_string(),
            ttl: CACHE_TTL,
            fetch_timeout: FETCH_TIMEOUT,
        }
    }
}

/// Loads the range feed through a time-bounded cache
pub struct IpRangeRepository<F = HttpsFeed> {
    config: RepositoryConfig,
    source: F,
}

impl IpRangeRepository<HttpsFeed> {
    pub fn new(config: RepositoryConfig) -> Self {
        Self::with_source(config, HttpsFeed::default())
    }
}

impl<F: FeedSource> IpRangeRepository<F> {
    pub fn with_source(config: RepositoryConfig, source: F) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Ranges from the cache if it is fresh at `now`
    ///
    /// An unreadable cache file counts as absent.
    pub fn cached_ranges(&self, now: u64) -> Option<Vec<IpRange>> {
        let cache = match RangeCache::load(&self.config.cache_path) {
            Ok(Some(cache)) => cache,
            Ok(None) => return None,
            Err(e) => {
                warn!("Ignoring unreadable range cache: {}", e);
                return None;
            }
        };

        if cache.is_fresh_at(now, self.config.ttl) {
            Some(cache.ranges)
        } else {
            info!("Range cache expired (fetched at {})", cache.fetched_at);
            None
        }
    }

    /// Load ranges using the current wall clock
    pub async fn load(&self) -> Result<Vec<IpRange>, FetchError> {
        self.load_at(unix_now()).await
    }

    /// Load ranges as of `now` (seconds since the Unix epoch)
    pub async fn load_at(&self, now: u64) -> Result<Vec<IpRange>, FetchError> {
        if let Some(ranges) = self.cached_ranges(now) {
            info!("Loaded {} ranges from cache", ranges.len());
            return Ok(ranges);
        }

        info!("Downloading range feed from {}", self.config.feed_url);
        let body = tokio::time::timeout(
            self.config.fetch_timeout,
            self.source.fetch(&self.config.feed_url),
        )
        .await
        .map_err(|_| FetchError::Timeout)??;

        let parsed = parse_feed(&body);
        if parsed.ranges.is_empty() {
            return Err(FetchError::EmptyFeed);
        }

        let cache = RangeCache::new(now, parsed.ranges);
        if let Err(e) = cache.save(&self.config.cache_path) {
            warn!(
                "Failed to write range cache {}: {}",
                self.config.cache_path.display(),
                e
            );
        }

        Ok(cache.ranges)
    }

    /// [`load`](Self::load) on a private current-thread runtime
    pub fn load_blocking(&self) -> Result<Vec<IpRange>, FetchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FetchError::Runtime(e.to_string()))?;
        runtime.block_on(self.load())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
