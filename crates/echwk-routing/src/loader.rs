//! Background range loading
//!
//! The feed is loaded once on a named thread. Readers never block on it:
//! until the load completes, [`SharedWildcards::snapshot`] returns `None`
//! and the builder falls back to its built-in list.

use crate::compactor::{Compactor, WildcardSet};
use crate::feed::{FeedSource, FetchError};
use crate::repository::IpRangeRepository;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Compacted wildcards shared between the loader and the proxy toggle
#[derive(Debug, Clone, Default)]
pub struct SharedWildcards {
    inner: Arc<RwLock<Option<Arc<WildcardSet>>>>,
}

impl SharedWildcards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published set
    pub fn publish(&self, set: WildcardSet) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Arc::new(set));
    }

    /// Current set, if a load has completed
    pub fn snapshot(&self) -> Option<Arc<WildcardSet>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }
}

/// How the background load ended
#[derive(Debug)]
pub enum LoadOutcome {
    /// Feed (or cache) loaded and published
    Loaded { ranges: usize, rules: usize },
    /// Nothing published; the built-in list stays in effect
    Failed(FetchError),
}

/// Load, compact and publish on a thread named `ip-range-loader`
///
/// `on_done` runs on the loader thread after publishing.
pub fn spawn_loader<F, C>(
    repository: IpRangeRepository<F>,
    compactor: Compactor,
    shared: SharedWildcards,
    on_done: C,
) -> io::Result<JoinHandle<()>>
where
    F: FeedSource + 'static,
    C: FnOnce(LoadOutcome) + Send + 'static,
{
    thread::Builder::new()
        .name("ip-range-loader".to_string())
        .spawn(move || {
            let outcome = match repository.load_blocking() {
                Ok(ranges) => {
                    let set = compactor.compact(&ranges);
                    let rules = set.len();
                    shared.publish(set);
                    info!("Published {} bypass wildcards", rules);
                    LoadOutcome::Loaded {
                        ranges: ranges.len(),
                        rules,
                    }
                }
                Err(e) => {
                    warn!("Range feed unavailable, keeping built-in list: {}", e);
                    LoadOutcome::Failed(e)
                }
            };
            on_done(outcome);
        })
}
