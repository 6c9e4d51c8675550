//! On-disk range cache
//!
//! `china_ip_list.json`:
//!
//! ```json
//! { "fetched_at": 1718000000, "ranges": [[16777472, 16778239], ...] }
//! ```

use crate::range::IpRange;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How long a fetched feed stays usable
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache read/write errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Snapshot of the feed at `fetched_at` (seconds since the Unix epoch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCache {
    pub fetched_at: u64,
    pub ranges: Vec<IpRange>,
}

impl RangeCache {
    pub fn new(fetched_at: u64, ranges: Vec<IpRange>) -> Self {
        Self { fetched_at, ranges }
    }

    /// Age at `now`, or `None` if the timestamp lies in the future
    pub fn age_at(&self, now: u64) -> Option<Duration> {
        now.checked_sub(self.fetched_at).map(Duration::from_secs)
    }

    /// Fresh means strictly younger than `ttl`; a future timestamp is stale
    pub fn is_fresh_at(&self, now: u64, ttl: Duration) -> bool {
        matches!(self.age_at(now), Some(age) if age < ttl)
    }

    /// Read the cache file
    ///
    /// A missing file is `Ok(None)`; an unreadable one is an error the caller
    /// treats as absent.
    pub fn load(path: &Path) -> Result<Option<Self>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(path)?;
        let cache: RangeCache = serde_json::from_slice(&content)?;
        debug!(
            "Read {} cached ranges from {}",
            cache.ranges.len(),
            path.display()
        );
        Ok(Some(cache))
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec(self)?;
        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        debug!("Cached {} ranges ({} bytes)", self.ranges.len(), data.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RangeCache {
        RangeCache::new(
            1_000_000,
            vec![IpRange::new(16777472, 16778239).unwrap()],
        )
    }

    #[test]
    fn test_freshness_window() {
        let cache = sample();
        assert!(cache.is_fresh_at(1_000_000, CACHE_TTL));
        assert!(cache.is_fresh_at(1_000_000 + 86_399, CACHE_TTL));
        assert!(!cache.is_fresh_at(1_000_000 + 86_400, CACHE_TTL));
        assert!(!cache.is_fresh_at(1_000_000 + 86_401, CACHE_TTL));
    }

    #[test]
    fn test_future_timestamp_is_stale() {
        let cache = sample();
        assert_eq!(cache.age_at(999_999), None);
        assert!(!cache.is_fresh_at(999_999, CACHE_TTL));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("china_ip_list.json");

        assert!(RangeCache::load(&path).unwrap().is_none());

        sample().save(&path).unwrap();
        assert_eq!(RangeCache::load(&path).unwrap(), Some(sample()));
        assert!(!path.with_extension("json.tmp").exists());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"fetched_at\":1000000"));
        assert!(raw.contains("[[16777472,16778239]]"));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("china_ip_list.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(RangeCache::load(&path), Err(CacheError::Format(_))));
    }
}
