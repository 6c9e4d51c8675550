//! Wildcard Compactor
//!
//! Rewrites numeric ranges as octet wildcards (`A.*`, `A.B.*`, `A.B.C.*`).
//! Partial blocks are rounded up, so the rule set always covers at least the
//! input addresses. Nothing finer than a `/24` is produced.

use crate::range::IpRange;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// `A.B.*` rules needed under one `A` before they collapse into `A.*`
pub const NEAR_TOTAL_COVERAGE_THRESHOLD: usize = 250;

/// Ordered, duplicate-free rule set
pub type WildcardSet = BTreeSet<WildcardRule>;

/// Octet-granularity address pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WildcardRule {
    /// `A.*`
    Block8(u8),
    /// `A.B.*`
    Block16(u8, u8),
    /// `A.B.C.*`
    Block24(u8, u8, u8),
}

impl WildcardRule {
    pub fn first_octet(&self) -> u8 {
        match *self {
            WildcardRule::Block8(a) | WildcardRule::Block16(a, _) | WildcardRule::Block24(a, _, _) => a,
        }
    }

    pub fn is_first_octet(&self) -> bool {
        matches!(self, WildcardRule::Block8(_))
    }

    /// Addresses matched by this rule
    pub fn range(&self) -> IpRange {
        let (base, size) = match *self {
            WildcardRule::Block8(a) => (u32::from_be_bytes([a, 0, 0, 0]), 1 << 24),
            WildcardRule::Block16(a, b) => (u32::from_be_bytes([a, b, 0, 0]), 1 << 16),
            WildcardRule::Block24(a, b, c) => (u32::from_be_bytes([a, b, c, 0]), 1 << 8),
        };
        // start <= end holds for every block
        IpRange::new(base, base + (size - 1)).unwrap_or_else(|_| unreachable!())
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.range().contains(addr)
    }

    /// Whether `other` is a strictly finer rule inside this one
    pub fn covers(&self, other: &WildcardRule) -> bool {
        match (*self, *other) {
            (WildcardRule::Block8(a), WildcardRule::Block16(oa, _)) => a == oa,
            (WildcardRule::Block8(a), WildcardRule::Block24(oa, _, _)) => a == oa,
            (WildcardRule::Block16(a, b), WildcardRule::Block24(oa, ob, _)) => a == oa && b == ob,
            _ => false,
        }
    }
}

impl fmt::Display for WildcardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WildcardRule::Block8(a) => write!(f, "{}.*", a),
            WildcardRule::Block16(a, b) => write!(f, "{}.{}.*", a, b),
            WildcardRule::Block24(a, b, c) => write!(f, "{}.{}.{}.*", a, b, c),
        }
    }
}

impl FromStr for WildcardRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let head = s
            .strip_suffix(".*")
            .ok_or_else(|| format!("missing .* suffix: {:?}", s))?;
        let octets = head
            .split('.')
            .map(|part| part.parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("bad octet in {:?}: {}", s, e))?;

        match octets.as_slice() {
            [a] => Ok(WildcardRule::Block8(*a)),
            [a, b] => Ok(WildcardRule::Block16(*a, *b)),
            [a, b, c] => Ok(WildcardRule::Block24(*a, *b, *c)),
            _ => Err(format!("expected 1 to 3 octets: {:?}", s)),
        }
    }
}

/// Range-to-wildcard converter
#[derive(Debug, Clone)]
pub struct Compactor {
    merge_threshold: usize,
}

impl Default for Compactor {
    fn default() -> Self {
        Self {
            merge_threshold: NEAR_TOTAL_COVERAGE_THRESHOLD,
        }
    }
}

impl Compactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different near-total merge threshold
    pub fn with_merge_threshold(merge_threshold: usize) -> Self {
        Self { merge_threshold }
    }

    pub fn merge_threshold(&self) -> usize {
        self.merge_threshold
    }

    /// Convert ranges into a merged wildcard set
    pub fn compact(&self, ranges: &[IpRange]) -> WildcardSet {
        let mut rules = WildcardSet::new();
        for range in ranges {
            // A range spanning several first octets is split per octet
            let [first_a, ..] = range.start().to_be_bytes();
            let [last_a, ..] = range.end().to_be_bytes();
            for a in first_a..=last_a {
                let block = WildcardRule::Block8(a).range();
                compact_block8(
                    a,
                    range.start().max(block.start()),
                    range.end().min(block.end()),
                    &mut rules,
                );
            }
        }

        let before = rules.len();
        self.merge(&mut rules);
        debug!(
            "Compacted {} ranges into {} rules ({} before merge)",
            ranges.len(),
            rules.len(),
            before
        );
        rules
    }

    /// Collapse near-complete first octets and drop subsumed rules
    pub fn merge(&self, rules: &mut WildcardSet) {
        let mut per_first_octet: BTreeMap<u8, usize> = BTreeMap::new();
        for rule in rules.iter() {
            if let WildcardRule::Block16(a, _) = rule {
                *per_first_octet.entry(*a).or_default() += 1;
            }
        }

        for (a, count) in per_first_octet {
            if count >= self.merge_threshold {
                debug!("Merging {} second-octet rules into {}.*", count, a);
                rules.insert(WildcardRule::Block8(a));
            }
        }

        let coarse: Vec<WildcardRule> = rules
            .iter()
            .filter(|r| !matches!(r, WildcardRule::Block24(..)))
            .copied()
            .collect();
        rules.retain(|rule| !coarse.iter().any(|c| c.covers(rule)));
    }
}

/// Emit rules for `start..=end`, which lies inside `a.0.0.0/8`
fn compact_block8(a: u8, start: u32, end: u32, rules: &mut WildcardSet) {
    let [_, b_start, c_start, d_start] = start.to_be_bytes();
    let [_, b_end, c_end, d_end] = end.to_be_bytes();

    if (b_start, c_start, d_start) == (0, 0, 0) && (b_end, c_end, d_end) == (255, 255, 255) {
        rules.insert(WildcardRule::Block8(a));
        return;
    }

    for b in b_start..=b_end {
        let block = WildcardRule::Block16(a, b).range();
        let lo = start.max(block.start());
        let hi = end.min(block.end());

        if lo == block.start() && hi == block.end() {
            rules.insert(WildcardRule::Block16(a, b));
            continue;
        }

        let [_, _, c_lo, _] = lo.to_be_bytes();
        let [_, _, c_hi, _] = hi.to_be_bytes();
        for c in c_lo..=c_hi {
            rules.insert(WildcardRule::Block24(a, b, c));
        }
    }
}
