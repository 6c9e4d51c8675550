//! ECH-WK Routing Engine
//!
//! Turns a geographic IPv4 range feed into proxy-bypass rules.
//!
//! ```text
//! feed (HTTPS, 10s timeout)        ┌──────────────┐
//!   "1.0.1.0 1.0.3.255" ─────────▶ │  Repository  │ ◀──▶ china_ip_list.json (24h TTL)
//!                                  └──────┬───────┘
//!                                         │ Vec<IpRange>
//!                                  ┌──────▼───────┐
//!                                  │  Compactor   │  1.0.1.* 1.0.2.* 1.0.3.*
//!                                  └──────┬───────┘
//!                                         │ WildcardSet (SharedWildcards)
//!                                  ┌──────▼───────┐
//!                                  │BypassBuilder │  Windows: "localhost;127.*;...;<local>;..."
//!                                  └──────────────┘  macOS:   ["localhost", "127.*", ...]
//! ```
//!
//! Failures on the left-hand side never stop the right-hand side: a missing
//! feed means the builder uses its built-in first-octet list.

mod bypass;
mod cache;
mod compactor;
mod feed;
mod loader;
mod range;
mod repository;

pub use bypass::{
    build, BypassBuilder, BypassList, ModeUnchanged, Platform, FALLBACK_FIRST_OCTETS,
    MAINLAND_DOMAINS, WINDOWS_OVERRIDE_LIMIT,
};
pub use cache::{CacheError, RangeCache, CACHE_TTL};
pub use compactor::{Compactor, WildcardRule, WildcardSet, NEAR_TOTAL_COVERAGE_THRESHOLD};
pub use feed::{FeedClientConfig, FeedSource, FetchError, HttpsFeed};
pub use loader::{spawn_loader, LoadOutcome, SharedWildcards};
pub use range::{parse_feed, IpRange, ParseError, ParsedFeed};
pub use repository::{
    IpRangeRepository, RepositoryConfig, CACHE_FILE_NAME, CHINA_IP_LIST_URL, FETCH_TIMEOUT,
};
