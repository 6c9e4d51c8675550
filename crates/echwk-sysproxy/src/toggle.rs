//! Proxy Toggle
//!
//! Two states: `Disabled` and `Enabled(listen, mode)`. Every transition
//! (including the OS call) runs under one mutex, which also records whether
//! the supervised process is alive. `Enabled` is only reachable while it is.
//!
//! Leaving `Enabled` is fail-open: the state becomes `Disabled` even when the
//! OS refuses to clear the setting, and the error is still reported. A failed
//! enable may have written part of the setting, so it is followed by a
//! best-effort clear.

use crate::applier::{PlatformProxyApplier, ProxyApplyError, ProxySetting};
use echwk_profile::{ListenAddr, ProfileError, RoutingMode};
use echwk_routing::{build, SharedWildcards};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};

/// Toggle errors
#[derive(Debug, Error)]
pub enum ToggleError {
    #[error("Routing mode leaves the system proxy unchanged")]
    ModeUnchanged,

    #[error("Proxy process is not running")]
    ProcessNotRunning,

    #[error("Invalid listen address: {0}")]
    InvalidListen(#[from] ProfileError),

    #[error("Failed to apply system proxy: {0}")]
    Apply(#[from] ProxyApplyError),
}

/// Snapshot of what the toggle last applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyState {
    pub enabled: bool,
    pub applied_listen: Option<ListenAddr>,
    pub applied_mode: Option<RoutingMode>,
}

impl ProxyState {
    fn enabled(listen: ListenAddr, mode: RoutingMode) -> Self {
        Self {
            enabled: true,
            applied_listen: Some(listen),
            applied_mode: Some(mode),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    proxy: ProxyState,
    process_alive: bool,
}

/// System proxy state machine
pub struct ProxyToggle {
    applier: Arc<dyn PlatformProxyApplier>,
    wildcards: SharedWildcards,
    inner: Mutex<Inner>,
}

impl ProxyToggle {
    pub fn new(applier: Arc<dyn PlatformProxyApplier>, wildcards: SharedWildcards) -> Self {
        Self {
            applier,
            wildcards,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> ProxyState {
        self.lock().proxy.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().proxy.enabled
    }

    pub fn is_process_alive(&self) -> bool {
        self.lock().process_alive
    }

    /// Point the system proxy at `listen` with `mode`'s bypass rules
    ///
    /// `Unchanged` succeeds without touching the OS. Uses whatever wildcard
    /// set is published right now. Refused while no supervised process is
    /// alive.
    pub fn enable(&self, listen: &ListenAddr, mode: RoutingMode) -> Result<(), ToggleError> {
        let mut inner = self.lock();
        if !mode.manages_system_proxy() {
            info!("Routing mode is {}, leaving system proxy untouched", mode);
            return Ok(());
        }
        self.enable_locked(&mut inner, listen, mode)
    }

    /// Clear the system proxy; no-op when already disabled
    pub fn disable(&self) -> Result<(), ToggleError> {
        let mut inner = self.lock();
        self.disable_locked(&mut inner.proxy)
    }

    /// Flip the operator switch; returns whether the proxy is now enabled
    pub fn toggle(&self, listen: &ListenAddr, mode: RoutingMode) -> Result<bool, ToggleError> {
        if !mode.manages_system_proxy() {
            return Err(ToggleError::ModeUnchanged);
        }

        let mut inner = self.lock();
        if inner.proxy.enabled {
            self.disable_locked(&mut inner.proxy)?;
            Ok(false)
        } else {
            self.enable_locked(&mut inner, listen, mode)?;
            Ok(true)
        }
    }

    /// Re-apply with `mode`, or disable if it is `Unchanged`
    pub fn on_mode_changed(&self, mode: RoutingMode) -> Result<(), ToggleError> {
        let mut inner = self.lock();
        let state = &mut inner.proxy;
        if !state.enabled {
            return Ok(());
        }

        if !mode.manages_system_proxy() {
            info!("Routing mode switched to {}, disabling system proxy", mode);
            return self.disable_locked(state);
        }

        let Some(listen) = state.applied_listen.clone() else {
            return Ok(());
        };
        self.apply_enabled(&listen, mode)?;
        state.applied_mode = Some(mode);
        info!("System proxy updated for routing mode {}", mode);
        Ok(())
    }

    /// Re-apply with a new endpoint
    pub fn on_listen_changed(&self, listen: &ListenAddr) -> Result<(), ToggleError> {
        let mut inner = self.lock();
        let state = &mut inner.proxy;
        if !state.enabled || state.applied_listen.as_ref() == Some(listen) {
            return Ok(());
        }

        let Some(mode) = state.applied_mode else {
            return Ok(());
        };
        self.apply_enabled(listen, mode)?;
        state.applied_listen = Some(listen.clone());
        info!("System proxy moved to {}", listen);
        Ok(())
    }

    /// A supervised process is up; enabling is allowed again
    pub fn on_supervised_process_started(&self) {
        self.lock().process_alive = true;
    }

    /// The supervised process is gone; the proxy must not point at it
    ///
    /// Returns whether the proxy was enabled and has been cleared.
    pub fn on_supervised_process_terminated(&self) -> bool {
        let mut inner = self.lock();
        inner.process_alive = false;
        if !inner.proxy.enabled {
            return false;
        }

        warn!("Proxy process exited, clearing system proxy");
        if let Err(e) = self.disable_locked(&mut inner.proxy) {
            error!("Failed to clear system proxy after process exit: {}", e);
        }
        true
    }

    fn enable_locked(
        &self,
        inner: &mut Inner,
        listen: &ListenAddr,
        mode: RoutingMode,
    ) -> Result<(), ToggleError> {
        if !inner.process_alive {
            warn!("Refusing to enable system proxy, no proxy process is running");
            return Err(ToggleError::ProcessNotRunning);
        }

        if let Err(e) = self.apply_enabled(listen, mode) {
            let touched_os = !matches!(e, ToggleError::Apply(ProxyApplyError::Unsupported(_)));
            if touched_os && !inner.proxy.enabled {
                self.clear_partial_apply();
            }
            return Err(e);
        }
        inner.proxy = ProxyState::enabled(listen.clone(), mode);
        info!("System proxy enabled: {} ({})", listen, mode);
        Ok(())
    }

    /// Undo whatever a failed enable managed to write
    fn clear_partial_apply(&self) {
        if let Err(e) = self.applier.apply(&ProxySetting::Disabled) {
            warn!("Cleanup after failed enable also failed: {}", e);
        }
    }

    fn apply_enabled(&self, listen: &ListenAddr, mode: RoutingMode) -> Result<(), ToggleError> {
        let platform = self
            .applier
            .platform()
            .ok_or(ProxyApplyError::Unsupported(std::env::consts::OS))?;
        let snapshot = self.wildcards.snapshot();
        let bypass =
            build(mode, snapshot.as_deref(), platform).map_err(|_| ToggleError::ModeUnchanged)?;

        let setting = ProxySetting::Enabled {
            host: listen.host.clone(),
            port: listen.port,
            bypass,
        };
        self.applier.apply(&setting).map_err(|e| {
            error!("Failed to apply system proxy: {}", e);
            ToggleError::from(e)
        })
    }

    fn disable_locked(&self, state: &mut ProxyState) -> Result<(), ToggleError> {
        if !state.enabled {
            return Ok(());
        }

        let result = self.applier.apply(&ProxySetting::Disabled);
        *state = ProxyState::default();

        match result {
            Ok(()) => {
                info!("System proxy disabled");
                Ok(())
            }
            Err(e) => {
                error!("Failed to clear system proxy (state reset anyway): {}", e);
                Err(e.into())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echwk_routing::{Platform, WildcardRule, WildcardSet};

    /// Records every setting it is asked to apply
    #[derive(Default)]
    struct RecordingApplier {
        calls: Mutex<Vec<ProxySetting>>,
        fail: Mutex<bool>,
    }

    impl RecordingApplier {
        fn calls(&self) -> Vec<ProxySetting> {
            self.calls.lock().unwrap().clone()
        }

        fn clear_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|s| **s == ProxySetting::Disabled)
                .count()
        }

        fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl PlatformProxyApplier for RecordingApplier {
        fn platform(&self) -> Option<Platform> {
            Some(Platform::Windows)
        }

        fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyApplyError> {
            self.calls.lock().unwrap().push(setting.clone());
            if *self.fail.lock().unwrap() {
                return Err(ProxyApplyError::Io(std::io::Error::other("access denied")));
            }
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingApplier>, SharedWildcards, ProxyToggle) {
        let applier = Arc::new(RecordingApplier::default());
        let wildcards = SharedWildcards::new();
        let toggle = ProxyToggle::new(applier.clone(), wildcards.clone());
        toggle.on_supervised_process_started();
        (applier, wildcards, toggle)
    }

    fn listen() -> ListenAddr {
        "127.0.0.1:30000".parse().unwrap()
    }

    fn bypass_of(setting: &ProxySetting) -> String {
        match setting {
            ProxySetting::Enabled { bypass, .. } => bypass.render(),
            ProxySetting::Disabled => String::new(),
        }
    }

    #[test]
    fn test_enable_and_disable() {
        let (applier, _, toggle) = setup();

        toggle.enable(&listen(), RoutingMode::Global).unwrap();
        assert_eq!(
            toggle.state(),
            ProxyState::enabled(listen(), RoutingMode::Global)
        );

        toggle.disable().unwrap();
        assert_eq!(toggle.state(), ProxyState::default());
        assert_eq!(applier.calls().len(), 2);

        toggle.disable().unwrap();
        assert_eq!(applier.calls().len(), 2);
    }

    #[test]
    fn test_enable_unchanged_touches_nothing() {
        let (applier, _, toggle) = setup();
        toggle.enable(&listen(), RoutingMode::Unchanged).unwrap();
        assert!(!toggle.is_enabled());
        assert!(applier.calls().is_empty());
    }

    #[test]
    fn test_enable_failure_stays_disabled() {
        let (applier, _, toggle) = setup();
        applier.set_failing(true);

        assert!(matches!(
            toggle.enable(&listen(), RoutingMode::BypassMainland),
            Err(ToggleError::Apply(_))
        ));
        assert!(!toggle.is_enabled());

        // a partial write is cleared right away
        let calls = applier.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].is_enabled());
        assert_eq!(calls[1], ProxySetting::Disabled);
    }

    #[test]
    fn test_enable_refused_without_process() {
        let applier = Arc::new(RecordingApplier::default());
        let toggle = ProxyToggle::new(applier.clone(), SharedWildcards::new());

        assert!(matches!(
            toggle.enable(&listen(), RoutingMode::Global),
            Err(ToggleError::ProcessNotRunning)
        ));
        assert!(matches!(
            toggle.toggle(&listen(), RoutingMode::Global),
            Err(ToggleError::ProcessNotRunning)
        ));
        assert!(applier.calls().is_empty());

        toggle.on_supervised_process_started();
        toggle.enable(&listen(), RoutingMode::Global).unwrap();
        assert!(toggle.on_supervised_process_terminated());
        assert!(!toggle.is_process_alive());

        // the process died between a liveness check and the enable
        assert!(matches!(
            toggle.enable(&listen(), RoutingMode::Global),
            Err(ToggleError::ProcessNotRunning)
        ));
        assert!(!toggle.is_enabled());
        assert_eq!(applier.clear_calls(), 1);
    }

    #[test]
    fn test_disable_is_fail_open() {
        let (applier, _, toggle) = setup();
        toggle.enable(&listen(), RoutingMode::Global).unwrap();

        applier.set_failing(true);
        assert!(toggle.disable().is_err());
        assert!(!toggle.is_enabled());
    }

    #[test]
    fn test_mode_change_to_unchanged_disables_once() {
        let (applier, _, toggle) = setup();
        toggle.enable(&listen(), RoutingMode::Global).unwrap();
        toggle.on_mode_changed(RoutingMode::Unchanged).unwrap();

        assert!(!toggle.is_enabled());
        assert_eq!(applier.clear_calls(), 1);
    }

    #[test]
    fn test_mode_change_reapplies() {
        let (applier, _, toggle) = setup();
        toggle.enable(&listen(), RoutingMode::Global).unwrap();
        toggle.on_mode_changed(RoutingMode::BypassMainland).unwrap();

        let calls = applier.calls();
        assert_eq!(calls.len(), 2);
        assert!(!bypass_of(&calls[0]).contains("*.cn"));
        assert!(bypass_of(&calls[1]).contains("*.cn"));
        assert_eq!(toggle.state().applied_mode, Some(RoutingMode::BypassMainland));
    }

    #[test]
    fn test_mode_change_while_disabled_is_noop() {
        let (applier, _, toggle) = setup();
        toggle.on_mode_changed(RoutingMode::Unchanged).unwrap();
        toggle.on_mode_changed(RoutingMode::Global).unwrap();
        assert!(applier.calls().is_empty());
    }

    #[test]
    fn test_listen_change_reapplies() {
        let (applier, _, toggle) = setup();
        toggle.enable(&listen(), RoutingMode::Global).unwrap();

        let moved: ListenAddr = "127.0.0.1:31000".parse().unwrap();
        toggle.on_listen_changed(&moved).unwrap();
        toggle.on_listen_changed(&moved).unwrap();

        let calls = applier.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[1], ProxySetting::Enabled { port: 31000, .. }));
    }

    #[test]
    fn test_toggle() {
        let (_, _, toggle) = setup();
        assert!(toggle.toggle(&listen(), RoutingMode::Global).unwrap());
        assert!(!toggle.toggle(&listen(), RoutingMode::Global).unwrap());
        assert!(matches!(
            toggle.toggle(&listen(), RoutingMode::Unchanged),
            Err(ToggleError::ModeUnchanged)
        ));
    }

    #[test]
    fn test_process_termination_resets() {
        let (applier, _, toggle) = setup();
        assert!(!toggle.on_supervised_process_terminated());
        assert!(applier.calls().is_empty());

        toggle.on_supervised_process_started();
        toggle.enable(&listen(), RoutingMode::Global).unwrap();
        applier.set_failing(true);
        assert!(toggle.on_supervised_process_terminated());
        assert!(!toggle.is_enabled());
        assert_eq!(applier.clear_calls(), 1);
    }

    #[test]
    fn test_uses_published_wildcards() {
        let (applier, wildcards, toggle) = setup();
        toggle.enable(&listen(), RoutingMode::BypassMainland).unwrap();
        assert!(bypass_of(&applier.calls()[0]).ends_with(";61.*"));

        wildcards.publish(WildcardSet::from([WildcardRule::Block24(1, 0, 1)]));
        toggle.on_mode_changed(RoutingMode::BypassMainland).unwrap();
        assert!(bypass_of(&applier.calls()[1]).ends_with(";*.qzone.com;1.0.1.*"));
    }

    #[test]
    fn test_unsupported_platform() {
        let toggle = ProxyToggle::new(Arc::new(crate::UnsupportedApplier), SharedWildcards::new());
        toggle.on_supervised_process_started();
        assert!(matches!(
            toggle.enable(&listen(), RoutingMode::Global),
            Err(ToggleError::Apply(ProxyApplyError::Unsupported(_)))
        ));
        assert!(!toggle.is_enabled());
    }
}
