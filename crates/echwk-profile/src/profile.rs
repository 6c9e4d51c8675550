//! Server profile model
//!
//! Mirrors the entries of `config.json`. Field names match the on-disk keys
//! so files written by older clients load unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// DoH server the worker binary uses when `-dns` is not passed
pub const DEFAULT_DNS: &str = "dns.alidns.com/dns-query";

/// ECH config domain the worker binary uses when `-ech` is not passed
pub const DEFAULT_ECH: &str = "cloudflare-ech.com";

/// Host assumed when a listen address is a bare port
const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Profile errors
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Invalid listen address: {0:?}")]
    InvalidListenAddr(String),

    #[error("Unknown routing mode: {0:?}")]
    UnknownRoutingMode(String),

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Profile name already exists: {0}")]
    DuplicateName(String),

    #[error("Profile name is empty")]
    EmptyName,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which destinations skip the system proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RoutingMode {
    /// Everything except local/private networks goes through the proxy
    #[serde(rename = "global")]
    Global,
    /// Mainland-China domains and address blocks bypass the proxy
    #[default]
    #[serde(rename = "bypass_cn")]
    BypassMainland,
    /// Never touch the system proxy setting
    #[serde(rename = "none")]
    Unchanged,
}

impl RoutingMode {
    /// All modes in display order
    pub fn all() -> &'static [RoutingMode] {
        &[
            RoutingMode::Global,
            RoutingMode::BypassMainland,
            RoutingMode::Unchanged,
        ]
    }

    /// Config key as stored in `config.json`
    pub fn key(&self) -> &'static str {
        match self {
            RoutingMode::Global => "global",
            RoutingMode::BypassMainland => "bypass_cn",
            RoutingMode::Unchanged => "none",
        }
    }

    /// Whether this mode is allowed to write the system proxy setting
    pub fn manages_system_proxy(&self) -> bool {
        !matches!(self, RoutingMode::Unchanged)
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Global => write!(f, "global"),
            RoutingMode::BypassMainland => write!(f, "bypass mainland"),
            RoutingMode::Unchanged => write!(f, "unchanged"),
        }
    }
}

impl FromStr for RoutingMode {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(RoutingMode::Global),
            "bypass_cn" | "bypass-cn" | "bypass_mainland" => Ok(RoutingMode::BypassMainland),
            "none" | "unchanged" => Ok(RoutingMode::Unchanged),
            _ => Err(ProfileError::UnknownRoutingMode(s.to_string())),
        }
    }
}

/// Local listen address of the worker binary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ListenAddr {
    type Err = ProfileError;

    /// Accepts `host:port` (split on the last colon) or a bare port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ProfileError::InvalidListenAddr(s.to_string());

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => (DEFAULT_LISTEN_HOST, trimmed),
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One saved server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Stable identifier (UUID v4)
    pub id: String,
    /// Display name, unique within a store
    pub name: String,
    /// Worker endpoint, passed as `-f`
    #[serde(default)]
    pub server: String,
    /// Local listen address, passed as `-l`
    #[serde(default)]
    pub listen: String,
    /// Auth token
    #[serde(default)]
    pub token: String,
    /// Preferred IP or host
    #[serde(default)]
    pub ip: String,
    /// DNS-over-HTTPS server
    #[serde(default = "default_dns")]
    pub dns: String,
    /// ECH config domain
    #[serde(default = "default_ech")]
    pub ech: String,
    /// Routing mode for the system proxy
    #[serde(default)]
    pub routing_mode: RoutingMode,
}

fn default_dns() -> String {
    DEFAULT_DNS.to_string()
}

fn default_ech() -> String {
    DEFAULT_ECH.to_string()
}

impl ServerProfile {
    /// Create a profile with a fresh id and default overrides
    pub fn new(name: impl Into<String>, server: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            server: server.into(),
            listen: listen.into(),
            token: String::new(),
            ip: String::new(),
            dns: default_dns(),
            ech: default_ech(),
            routing_mode: RoutingMode::default(),
        }
    }

    /// The profile created on first run
    pub fn default_profile() -> Self {
        Self {
            ip: "saas.sin.fan".to_string(),
            ..Self::new("Default", "example.com:443", "127.0.0.1:30000")
        }
    }

    /// Parse the listen field
    pub fn listen_addr(&self) -> Result<ListenAddr, ProfileError> {
        self.listen.parse()
    }
}
