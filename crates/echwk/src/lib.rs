//! ECH-WK Control Plane
//!
//! Ties the profile store, mainland range loader, system proxy toggle and
//! process supervisor into one [`ControlPlane`] that emits [`ControlEvent`]s.
//! [`autostart`] registers the binary to run at login.

pub mod autostart;
mod config;
mod control;

pub use autostart::{system_autostart, AutostartError, LaunchAtLogin, AUTOSTART_FLAG};
pub use config::ControlPlaneConfig;
pub use control::{ControlError, ControlEvent, ControlPlane};
