//! ECH-WK Server Profiles
//!
//! The configuration side of the control plane. The core only ever reads a
//! [`ServerProfile`] (server endpoint, local listen address, optional
//! overrides, routing mode) and asks a [`ProfileStore`] for the active one.
//!
//! [`JsonProfileStore`] is the file-backed store used by the headless
//! binary: a `config.json` holding every saved server and the id of the
//! currently selected one.

mod profile;
mod store;

pub use profile::{
    ListenAddr, ProfileError, RoutingMode, ServerProfile, DEFAULT_DNS, DEFAULT_ECH,
};
pub use store::{default_config_dir, JsonProfileStore, ProfileStore, CONFIG_FILE_NAME};
