//! ECH-WK System Proxy
//!
//! Keeps the OS proxy setting in line with the selected routing mode.
//!
//! - **Appliers**: registry + WinINet on Windows, `networksetup` on macOS
//! - **Toggle**: the enabled/disabled state machine driving an applier

mod applier;
mod macos;
#[cfg(windows)]
mod registry;
mod toggle;

pub use applier::{
    system_applier, PlatformProxyApplier, ProxyApplyError, ProxySetting, UnsupportedApplier,
};
pub use macos::{networksetup_commands, parse_network_services, MacNetworkSetupApplier};
#[cfg(windows)]
pub use registry::WindowsRegistryApplier;
pub use toggle::{ProxyState, ProxyToggle, ToggleError};
