//! WinINet proxy via the per-user registry
//!
//! Writes `ProxyServer`, `ProxyEnable` and `ProxyOverride` under
//! `HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings`, then
//! tells running WinINet clients to reload.

use crate::applier::{PlatformProxyApplier, ProxyApplyError, ProxySetting};
use echwk_routing::Platform;
use tracing::{debug, info};
use windows::Win32::Networking::WinInet::{
    InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
};
use winreg::enums::{HKEY_CURRENT_USER, KEY_SET_VALUE};
use winreg::RegKey;

const INTERNET_SETTINGS: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsRegistryApplier;

impl WindowsRegistryApplier {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformProxyApplier for WindowsRegistryApplier {
    fn platform(&self) -> Option<Platform> {
        Some(Platform::Windows)
    }

    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyApplyError> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let key = hkcu.open_subkey_with_flags(INTERNET_SETTINGS, KEY_SET_VALUE)?;

        match setting {
            ProxySetting::Enabled { host, port, bypass } => {
                let server = format!("{}:{}", host, port);
                let overrides = bypass.render();
                key.set_value("ProxyServer", &server)?;
                key.set_value("ProxyEnable", &1u32)?;
                key.set_value("ProxyOverride", &overrides)?;
                info!(
                    "Registry proxy set to {} ({} bypass chars)",
                    server,
                    overrides.len()
                );
            }
            ProxySetting::Disabled => {
                key.set_value("ProxyEnable", &0u32)?;
                info!("Registry proxy disabled");
            }
        }

        notify_settings_changed();
        Ok(())
    }
}

/// Ask WinINet clients to pick up the new registry values
fn notify_settings_changed() {
    // SAFETY: null handle and buffer are documented for these two options
    unsafe {
        let _ = InternetSetOptionW(None, INTERNET_OPTION_SETTINGS_CHANGED, None, 0);
        let _ = InternetSetOptionW(None, INTERNET_OPTION_REFRESH, None, 0);
    }
    debug!("Sent INTERNET_OPTION_SETTINGS_CHANGED and INTERNET_OPTION_REFRESH");
}
