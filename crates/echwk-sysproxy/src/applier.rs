//! System proxy appliers
//!
//! One realization per OS, chosen once at startup by [`system_applier`].

use echwk_routing::{BypassList, Platform};
use std::sync::Arc;
use thiserror::Error;

/// Errors writing the OS proxy setting
#[derive(Debug, Error)]
pub enum ProxyApplyError {
    #[error("System proxy is not supported on {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("No enabled network services found")]
    NoNetworkServices,
}

/// What the OS proxy setting should become
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    Enabled {
        host: String,
        port: u16,
        bypass: BypassList,
    },
    Disabled,
}

impl ProxySetting {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ProxySetting::Enabled { .. })
    }
}

/// Writes the system-wide proxy setting
pub trait PlatformProxyApplier: Send + Sync {
    /// Bypass syntax this applier expects, `None` if it cannot apply anything
    fn platform(&self) -> Option<Platform>;

    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyApplyError>;
}

/// Applier for platforms without a managed system proxy
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedApplier;

impl PlatformProxyApplier for UnsupportedApplier {
    fn platform(&self) -> Option<Platform> {
        None
    }

    fn apply(&self, _setting: &ProxySetting) -> Result<(), ProxyApplyError> {
        Err(ProxyApplyError::Unsupported(std::env::consts::OS))
    }
}

/// The applier for the running OS
pub fn system_applier() -> Arc<dyn PlatformProxyApplier> {
    #[cfg(windows)]
    {
        Arc::new(crate::registry::WindowsRegistryApplier::new())
    }

    #[cfg(target_os = "macos")]
    {
        Arc::new(crate::macos::MacNetworkSetupApplier::new())
    }

    #[cfg(not(any(windows, target_os = "macos")))]
    {
        Arc::new(UnsupportedApplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_applier() {
        let applier = UnsupportedApplier;
        assert!(applier.platform().is_none());
        assert!(matches!(
            applier.apply(&ProxySetting::Disabled),
            Err(ProxyApplyError::Unsupported(_))
        ));
    }

    #[test]
    fn test_system_applier_matches_platform() {
        assert_eq!(system_applier().platform(), Platform::current());
    }
}
