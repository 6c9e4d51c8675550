//! IP Range Feed Parser
//!
//! Parses the plain-text range feed:
//! - Records: `start_ip end_ip [anything else]`
//! - Comments: lines starting with `#`
//! - Blank lines are ignored
//!
//! A bad record is skipped, never fatal; partial feeds are usable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info};

/// Errors for a single feed record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Expected start and end address, got {0:?}")]
    MissingField(String),

    #[error("Invalid IPv4 address: {0:?}")]
    InvalidAddress(String),

    #[error("Range start {start} is after end {end}")]
    Reversed { start: Ipv4Addr, end: Ipv4Addr },
}

/// Inclusive IPv4 range
///
/// Persisted as a two-element array `[start, end]` of integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u32, u32)", into = "(u32, u32)")]
pub struct IpRange {
    start: u32,
    end: u32,
}

impl IpRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: u32, end: u32) -> Result<Self, ParseError> {
        if start > end {
            return Err(ParseError::Reversed {
                start: Ipv4Addr::from(start),
                end: Ipv4Addr::from(end),
            });
        }
        Ok(Self { start, end })
    }

    pub fn from_addrs(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, ParseError> {
        Self::new(u32::from(start), u32::from(end))
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn start_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn end_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// Number of addresses covered
    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    /// A range always holds at least one address
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }

    /// Parse one feed line
    ///
    /// Returns `Ok(None)` for blank and comment lines.
    pub fn parse_line(line: &str) -> Result<Option<Self>, ParseError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let mut fields = trimmed.split_whitespace();
        let (Some(start), Some(end)) = (fields.next(), fields.next()) else {
            return Err(ParseError::MissingField(trimmed.to_string()));
        };

        let start: Ipv4Addr = start
            .parse()
            .map_err(|_| ParseError::InvalidAddress(start.to_string()))?;
        let end: Ipv4Addr = end
            .parse()
            .map_err(|_| ParseError::InvalidAddress(end.to_string()))?;

        Self::from_addrs(start, end).map(Some)
    }
}

impl TryFrom<(u32, u32)> for IpRange {
    type Error = ParseError;

    fn try_from((start, end): (u32, u32)) -> Result<Self, Self::Error> {
        Self::new(start, end)
    }
}

impl From<IpRange> for (u32, u32) {
    fn from(range: IpRange) -> Self {
        (range.start, range.end)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_addr(), self.end_addr())
    }
}

/// Result of parsing a whole feed
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    /// Valid ranges, in feed order
    pub ranges: Vec<IpRange>,
    /// Records that failed to parse
    pub skipped: usize,
}

/// Parse a complete feed body
pub fn parse_feed(content: &str) -> ParsedFeed {
    let mut parsed = ParsedFeed::default();
    let mut line_count = 0;

    for line in content.lines() {
        line_count += 1;
        match IpRange::parse_line(line) {
            Ok(Some(range)) => parsed.ranges.push(range),
            Ok(None) => {}
            Err(e) => {
                debug!("Skipping feed line {}: {}", line_count, e);
                parsed.skipped += 1;
            }
        }
    }

    info!(
        "Parsed range feed: {} lines, {} ranges, {} skipped",
        line_count,
        parsed.ranges.len(),
        parsed.skipped
    );

    parsed
}
