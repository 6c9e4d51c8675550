//! Bypass-List Builder
//!
//! Renders the hosts that skip the system proxy:
//! - Base rules: loopback, private networks, link-local names
//! - Mainland domain suffixes (curated)
//! - Mainland IP wildcards (compacted feed, or a built-in first-octet list)
//!
//! Windows stores the result in a single `ProxyOverride` string with a
//! practical length ceiling; macOS takes an argument list and is not pruned.

use crate::compactor::{WildcardRule, WildcardSet};
use echwk_profile::RoutingMode;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Longest `ProxyOverride` string we write
pub const WINDOWS_OVERRIDE_LIMIT: usize = 2000;

/// Domain suffixes that always bypass in mainland mode, in priority order
pub const MAINLAND_DOMAINS: [&str; 28] = [
    "*.cn",
    "*.com.cn",
    "*.net.cn",
    "*.org.cn",
    "*.gov.cn",
    "*.edu.cn",
    "*.baidu.com",
    "*.qq.com",
    "*.taobao.com",
    "*.tmall.com",
    "*.alipay.com",
    "*.weibo.com",
    "*.sina.com",
    "*.163.com",
    "*.126.com",
    "*.sohu.com",
    "*.youku.com",
    "*.iqiyi.com",
    "*.bilibili.com",
    "*.douyin.com",
    "*.douban.com",
    "*.zhihu.com",
    "*.jd.com",
    "*.alibaba.com",
    "*.1688.com",
    "*.tencent.com",
    "*.weixin.qq.com",
    "*.qzone.com",
];

/// Major mainland `/8` blocks, used until the feed has been loaded
pub const FALLBACK_FIRST_OCTETS: [u8; 45] = [
    1, 14, 27, 36, 39, 42, 49, 58, 59, 60, 61, 101, 103, 106, 110, 111, 112, 113, 114, 115, 116,
    117, 118, 119, 120, 121, 122, 123, 124, 125, 171, 175, 180, 182, 183, 202, 203, 210, 211, 218,
    219, 220, 221, 222, 223,
];

const LOOPBACK_AND_PRIVATE: [&str; 20] = [
    "localhost",
    "127.*",
    "10.*",
    "172.16.*",
    "172.17.*",
    "172.18.*",
    "172.19.*",
    "172.20.*",
    "172.21.*",
    "172.22.*",
    "172.23.*",
    "172.24.*",
    "172.25.*",
    "172.26.*",
    "172.27.*",
    "172.28.*",
    "172.29.*",
    "172.30.*",
    "172.31.*",
    "192.168.*",
];

const WINDOWS_LOCAL: [&str; 1] = ["<local>"];
const MACOS_LOCAL: [&str; 2] = ["*.local", "169.254.*"];

/// The routing mode leaves the system proxy alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("routing mode leaves the system proxy unchanged")]
pub struct ModeUnchanged;

/// Target proxy-setting syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOs,
}

impl Platform {
    /// Platform this binary runs on, if it has a system proxy we manage
    pub fn current() -> Option<Platform> {
        if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Platform::MacOs)
        } else {
            None
        }
    }

    fn base_rules(&self) -> impl Iterator<Item = &'static str> {
        let local: &'static [&'static str] = match self {
            Platform::Windows => &WINDOWS_LOCAL,
            Platform::MacOs => &MACOS_LOCAL,
        };
        LOOPBACK_AND_PRIVATE.iter().chain(local).copied()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "Windows"),
            Platform::MacOs => write!(f, "macOS"),
        }
    }
}

/// Rendered bypass rules for one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassList {
    platform: Platform,
    rules: Vec<String>,
    pruned: bool,
}

impl BypassList {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    /// Whether IP wildcards were dropped to fit the length ceiling
    pub fn was_pruned(&self) -> bool {
        self.pruned
    }

    /// Windows `ProxyOverride` value (`;`-joined); space-joined on macOS
    pub fn render(&self) -> String {
        match self.platform {
            Platform::Windows => self.rules.join(";"),
            Platform::MacOs => self.rules.join(" "),
        }
    }

    /// Arguments for `networksetup -setsocksfirewallproxybypassdomains`
    pub fn to_args(&self) -> Vec<String> {
        self.rules.clone()
    }
}

/// Builds [`BypassList`]s for a platform
#[derive(Debug, Clone)]
pub struct BypassBuilder {
    platform: Platform,
    limit: usize,
}

impl BypassBuilder {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            limit: WINDOWS_OVERRIDE_LIMIT,
        }
    }

    /// Override the Windows length ceiling
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Build the list for `mode`
    ///
    /// `wildcards` is the compacted feed; `None` selects the built-in
    /// first-octet list.
    pub fn build(
        &self,
        mode: RoutingMode,
        wildcards: Option<&WildcardSet>,
    ) -> Result<BypassList, ModeUnchanged> {
        let mut rules: Vec<String> = self.platform.base_rules().map(str::to_string).collect();

        match mode {
            RoutingMode::Unchanged => return Err(ModeUnchanged),
            RoutingMode::Global => {
                return Ok(BypassList {
                    platform: self.platform,
                    rules,
                    pruned: false,
                });
            }
            RoutingMode::BypassMainland => {}
        }

        rules.extend(MAINLAND_DOMAINS.iter().map(|d| d.to_string()));

        let mut ip_rules: Vec<WildcardRule> = match wildcards {
            Some(set) => set.iter().copied().collect(),
            None => {
                debug!("Range feed not loaded, using built-in first-octet list");
                FALLBACK_FIRST_OCTETS
                    .iter()
                    .map(|a| WildcardRule::Block8(*a))
                    .collect()
            }
        };
        ip_rules.sort_by_cached_key(|r| r.to_string());

        let mut pruned = false;
        if self.platform == Platform::Windows {
            pruned = self.fit_to_limit(&rules, &mut ip_rules);
        }

        rules.extend(ip_rules.iter().map(|r| r.to_string()));
        Ok(BypassList {
            platform: self.platform,
            rules,
            pruned,
        })
    }

    /// Drop IP rules until the `;`-joined string fits; returns whether any went
    fn fit_to_limit(&self, fixed: &[String], ip_rules: &mut Vec<WildcardRule>) -> bool {
        let fixed_len: usize = fixed.iter().map(String::len).sum::<usize>() + fixed.len();
        let rendered_len = |ips: &[WildcardRule]| -> usize {
            let ip_len: usize = ips.iter().map(|r| r.to_string().len() + 1).sum();
            // one separator per rule, minus the trailing one
            (fixed_len + ip_len).saturating_sub(1)
        };

        let full_len = rendered_len(ip_rules);
        if full_len <= self.limit {
            return false;
        }

        let before = ip_rules.len();
        ip_rules.retain(WildcardRule::is_first_octet);

        while rendered_len(ip_rules) > self.limit && ip_rules.pop().is_some() {}

        warn!(
            "Bypass list is {} chars (limit {}), kept {} of {} IP rules",
            full_len,
            self.limit,
            ip_rules.len(),
            before
        );
        true
    }
}

/// Build the bypass list for `mode` on `platform`
pub fn build(
    mode: RoutingMode,
    wildcards: Option<&WildcardSet>,
    platform: Platform,
) -> Result<BypassList, ModeUnchanged> {
    BypassBuilder::new(platform).build(mode, wildcards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compactor::Compactor;
    use crate::range::IpRange;

    const WINDOWS_BASE: &str = "localhost;127.*;10.*;172.16.*;172.17.*;172.18.*;172.19.*;\
172.20.*;172.21.*;172.22.*;172.23.*;172.24.*;172.25.*;172.26.*;172.27.*;172.28.*;172.29.*;\
172.30.*;172.31.*;192.168.*;<local>";

    /// Many /24 rules spread over a few first octets
    fn dense_wildcards() -> WildcardSet {
        let mut set = WildcardSet::new();
        for a in [36u8, 58, 101, 223] {
            set.insert(WildcardRule::Block8(a));
        }
        for b in 0..=255u8 {
            set.insert(WildcardRule::Block24(14, b, 7));
            set.insert(WildcardRule::Block24(27, b, 9));
        }
        set
    }

    #[test]
    fn test_unchanged_is_noop() {
        for platform in [Platform::Windows, Platform::MacOs] {
            assert_eq!(build(RoutingMode::Unchanged, None, platform), Err(ModeUnchanged));
            assert_eq!(
                build(RoutingMode::Unchanged, Some(&dense_wildcards()), platform),
                Err(ModeUnchanged)
            );
        }
    }

    #[test]
    fn test_global_is_base_only() {
        let list = build(RoutingMode::Global, Some(&dense_wildcards()), Platform::Windows).unwrap();
        assert_eq!(list.render(), WINDOWS_BASE);
        assert!(!list.was_pruned());

        let mac = build(RoutingMode::Global, None, Platform::MacOs).unwrap();
        assert_eq!(mac.rules().len(), 22);
        assert_eq!(&mac.rules()[20..], ["*.local", "169.254.*"]);
        assert!(!mac.rules().iter().any(|r| r == "<local>"));
    }

    #[test]
    fn test_fallback_list() {
        let list = build(RoutingMode::BypassMainland, None, Platform::Windows).unwrap();
        let rendered = list.render();

        assert!(rendered.starts_with(WINDOWS_BASE));
        assert!(rendered.contains(";*.cn;*.com.cn;"));
        assert!(rendered.ends_with(";*.weixin.qq.com;*.qzone.com;1.*;101.*;103.*;106.*;110.*;111.*;112.*;113.*;114.*;115.*;116.*;117.*;118.*;119.*;120.*;121.*;122.*;123.*;124.*;125.*;14.*;171.*;175.*;180.*;182.*;183.*;202.*;203.*;210.*;211.*;218.*;219.*;220.*;221.*;222.*;223.*;27.*;36.*;39.*;42.*;49.*;58.*;59.*;60.*;61.*"));
        assert_eq!(list.rules().len(), 21 + 28 + 45);
        assert!(rendered.len() <= WINDOWS_OVERRIDE_LIMIT);
        assert!(!list.was_pruned());
    }

    #[test]
    fn test_feed_wildcards_sorted() {
        let set = Compactor::new().compact(&[
            IpRange::new(0x0100_0100, 0x0100_03FF).unwrap(),
            IpRange::new(0x0E00_0000, 0x0E00_00FF).unwrap(),
        ]);
        let list = build(RoutingMode::BypassMainland, Some(&set), Platform::MacOs).unwrap();
        assert_eq!(
            &list.rules()[22 + 28..],
            ["1.0.1.*", "1.0.2.*", "1.0.3.*", "14.0.0.*"]
        );
    }

    #[test]
    fn test_windows_ceiling() {
        let wildcards = dense_wildcards();
        let list = build(RoutingMode::BypassMainland, Some(&wildcards), Platform::Windows).unwrap();
        let rendered = list.render();

        assert!(list.was_pruned());
        assert!(rendered.len() <= WINDOWS_OVERRIDE_LIMIT);
        for domain in MAINLAND_DOMAINS {
            assert!(list.rules().iter().any(|r| r == domain));
        }
        assert!(rendered.ends_with(";*.qzone.com;101.*;223.*;36.*;58.*"));
    }

    #[test]
    fn test_ceiling_drops_trailing_first_octets() {
        let builder = BypassBuilder::new(Platform::Windows).with_limit(WINDOWS_BASE.len() + 500);
        let list = builder.build(RoutingMode::BypassMainland, None).unwrap();
        let rendered = list.render();

        assert!(list.was_pruned());
        assert!(rendered.len() <= WINDOWS_BASE.len() + 500);
        assert!(rendered.contains(";*.qzone.com;1.*;"));
        assert!(!rendered.contains("61.*"));
    }

    /// `n` rules mixing all three granularities over many first octets
    fn generated_wildcards(n: usize) -> WildcardSet {
        (0..n)
            .map(|i| {
                let a = (i % 211) as u8 + 1;
                let b = (i / 211 % 256) as u8;
                match i % 7 {
                    0 => WildcardRule::Block8(a),
                    1 | 2 => WildcardRule::Block16(a, b),
                    _ => WildcardRule::Block24(a, b, (i * 31 % 256) as u8),
                }
            })
            .collect()
    }

    #[test]
    fn test_ceiling_sweep() {
        let fixed_len = WINDOWS_BASE.len() + MAINLAND_DOMAINS.iter().map(|d| d.len() + 1).sum::<usize>();

        for limit in [fixed_len, fixed_len + 1, fixed_len + 333, 1024, WINDOWS_OVERRIDE_LIMIT, 4096] {
            let builder = BypassBuilder::new(Platform::Windows).with_limit(limit);
            for n in (0..=6_000).step_by(149) {
                let wildcards = generated_wildcards(n);
                let list = builder.build(RoutingMode::BypassMainland, Some(&wildcards)).unwrap();
                let rendered = list.render();

                assert!(
                    rendered.len() <= limit,
                    "{} rules, limit {}: rendered {} chars",
                    n,
                    limit,
                    rendered.len()
                );
                assert!(rendered.starts_with(WINDOWS_BASE));
                for domain in MAINLAND_DOMAINS {
                    assert!(list.rules().iter().any(|r| r == domain));
                }

                let unpruned = BypassBuilder::new(Platform::Windows)
                    .with_limit(usize::MAX)
                    .build(RoutingMode::BypassMainland, Some(&wildcards))
                    .unwrap();
                assert_eq!(list.was_pruned(), unpruned.render().len() > limit);
            }
        }
    }

    #[test]
    fn test_macos_unpruned() {
        let wildcards = dense_wildcards();
        let list = build(RoutingMode::BypassMainland, Some(&wildcards), Platform::MacOs).unwrap();

        assert!(!list.was_pruned());
        assert_eq!(list.rules().len(), 22 + 28 + wildcards.len());
        assert_eq!(list.to_args().len(), list.rules().len());
    }
}
