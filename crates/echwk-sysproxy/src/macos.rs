//! SOCKS firewall proxy via `networksetup`
//!
//! Every enabled network service gets the same host, port, bypass domains
//! and on/off state.

use crate::applier::{PlatformProxyApplier, ProxyApplyError, ProxySetting};
use echwk_routing::Platform;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info, warn};

const NETWORKSETUP: &str = "networksetup";

/// Parse `networksetup -listallnetworkservices` output
///
/// The first line is always the (localized) legend. Disabled services are
/// prefixed with `*`.
pub fn parse_network_services(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

/// `networksetup` argument lists for one service
pub fn networksetup_commands(service: &str, setting: &ProxySetting) -> Vec<Vec<String>> {
    match setting {
        ProxySetting::Enabled { host, port, bypass } => {
            let mut bypass_args = vec![
                "-setsocksfirewallproxybypassdomains".to_string(),
                service.to_string(),
            ];
            bypass_args.extend(bypass.to_args());

            vec![
                vec![
                    "-setsocksfirewallproxy".to_string(),
                    service.to_string(),
                    host.clone(),
                    port.to_string(),
                ],
                bypass_args,
                vec![
                    "-setsocksfirewallproxystate".to_string(),
                    service.to_string(),
                    "on".to_string(),
                ],
            ]
        }
        ProxySetting::Disabled => vec![vec![
            "-setsocksfirewallproxystate".to_string(),
            service.to_string(),
            "off".to_string(),
        ]],
    }
}

/// Applier that shells out to `networksetup`
#[derive(Debug, Clone)]
pub struct MacNetworkSetupApplier {
    program: PathBuf,
}

impl Default for MacNetworkSetupApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl MacNetworkSetupApplier {
    pub fn new() -> Self {
        Self::with_program(NETWORKSETUP)
    }

    /// Use a different `networksetup` binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, ProxyApplyError> {
        debug!("{} {}", self.program.display(), args.join(" "));
        let output = Command::new(&self.program).args(args).output()?;

        if !output.status.success() {
            return Err(ProxyApplyError::Command {
                command: format!("{} {}", self.program.display(), args.first().map_or("", |a| a.as_str())),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Enabled network service names
    pub fn network_services(&self) -> Result<Vec<String>, ProxyApplyError> {
        let listing = self.run(&["-listallnetworkservices".to_string()])?;
        let services = parse_network_services(&listing);
        if services.is_empty() {
            return Err(ProxyApplyError::NoNetworkServices);
        }
        Ok(services)
    }
}

impl PlatformProxyApplier for MacNetworkSetupApplier {
    fn platform(&self) -> Option<Platform> {
        Some(Platform::MacOs)
    }

    /// Applies to every service.
    ///
    /// Enabling succeeds when at least one service took the setting; services
    /// that refuse it (VPN or bridge interfaces) are logged and skipped.
    /// Disabling reports the first failure after trying every service.
    fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyApplyError> {
        let services = self.network_services()?;
        let mut applied = 0;
        let mut first_error = None;

        for service in &services {
            let result = networksetup_commands(service, setting)
                .iter()
                .try_for_each(|args| self.run(args).map(drop));
            match result {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("networksetup failed for {}: {}", service, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !setting.is_enabled() || applied == 0 => return Err(e),
            _ => {}
        }

        info!(
            "SOCKS proxy {} on {} of {} services",
            if setting.is_enabled() { "enabled" } else { "disabled" },
            applied,
            services.len()
        );
        Ok(())
    }
}
