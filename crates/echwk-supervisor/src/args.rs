//! Command line of the proxy binary.

use echwk_profile::{ServerProfile, DEFAULT_DNS, DEFAULT_ECH};

/// `-f <server> -l <listen> [-token ..] [-ip ..] [-dns ..] [-ech ..]`
///
/// Empty fields are omitted; `-dns` and `-ech` only appear when they differ
/// from the binary's own defaults.
pub fn build_args(profile: &ServerProfile) -> Vec<String> {
    let mut args = Vec::with_capacity(12);

    let mut push = |flag: &str, value: &str| {
        let value = value.trim();
        if !value.is_empty() {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    };

    push("-f", &profile.server);
    push("-l", &profile.listen);
    push("-token", &profile.token);
    push("-ip", &profile.ip);
    if profile.dns.trim() != DEFAULT_DNS {
        push("-dns", &profile.dns);
    }
    if profile.ech.trim() != DEFAULT_ECH {
        push("-ech", &profile.ech);
    }

    args
}
