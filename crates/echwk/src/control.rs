//! Control Plane
//!
//! Wires the range loader, proxy toggle and supervisor together and turns
//! everything they report into one [`ControlEvent`] stream for a UI.
//!
//! ```text
//!  ip-range-loader ──▶ SharedWildcards ──▶ ProxyToggle ──▶ PlatformProxyApplier
//!                                             ▲
//!  Supervisor ── on_termination ──────────────┘
//!      │
//!      └── SupervisorEvent ──▶ event-relay ──▶ ControlEvent
//! ```

use crate::config::ControlPlaneConfig;
use crossbeam_channel::{unbounded, Receiver, Sender};
use echwk_profile::{ListenAddr, ProfileError, ProfileStore, RoutingMode, ServerProfile};
use echwk_routing::{
    spawn_loader, Compactor, FeedSource, IpRangeRepository, LoadOutcome, SharedWildcards,
};
use echwk_supervisor::{LogLine, Supervisor, SupervisorError, SupervisorEvent};
use echwk_sysproxy::{PlatformProxyApplier, ProxyState, ProxyToggle, ToggleError};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything a UI needs to render
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Log(LogLine),
    ProcessRunning(bool),
    ProxyEnabled(bool),
}

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("No server profile selected")]
    NoActiveProfile,

    #[error("Proxy process is not running")]
    NotRunning,

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Toggle(ToggleError),

    #[error("Failed to spawn thread: {0}")]
    Thread(#[from] io::Error),
}

impl From<ToggleError> for ControlError {
    fn from(e: ToggleError) -> Self {
        match e {
            ToggleError::ProcessNotRunning => ControlError::NotRunning,
            e => ControlError::Toggle(e),
        }
    }
}

pub struct ControlPlane {
    config: ControlPlaneConfig,
    store: Arc<dyn ProfileStore>,
    wildcards: SharedWildcards,
    toggle: Arc<ProxyToggle>,
    supervisor: Supervisor,
    events: Sender<ControlEvent>,
    _relay: JoinHandle<()>,
}

impl ControlPlane {
    /// Build the control plane; events arrive on the returned receiver
    pub fn new(
        config: ControlPlaneConfig,
        store: Arc<dyn ProfileStore>,
        applier: Arc<dyn PlatformProxyApplier>,
    ) -> Result<(Self, Receiver<ControlEvent>), ControlError> {
        let (events, events_rx) = unbounded();
        let (supervisor_tx, supervisor_rx) = unbounded();

        let wildcards = SharedWildcards::new();
        let toggle = Arc::new(ProxyToggle::new(applier, wildcards.clone()));
        let supervisor = Supervisor::new(config.locator(), supervisor_tx);

        {
            let toggle = toggle.clone();
            supervisor.on_launch(move |_| toggle.on_supervised_process_started());
        }
        {
            let toggle = toggle.clone();
            let events = events.clone();
            supervisor.on_termination(move |_| {
                if toggle.on_supervised_process_terminated() {
                    let _ = events.send(ControlEvent::ProxyEnabled(false));
                    let _ = events.send(ControlEvent::Log(LogLine::system(
                        "System proxy cleared after process exit",
                    )));
                }
            });
        }

        let relay = spawn_relay(supervisor_rx, events.clone())?;

        Ok((
            Self {
                config,
                store,
                wildcards,
                toggle,
                supervisor,
                events,
                _relay: relay,
            },
            events_rx,
        ))
    }

    /// Start the background range load from the configured feed
    pub fn load_ranges(&self) -> Result<JoinHandle<()>, ControlError> {
        self.load_ranges_with(IpRangeRepository::new(self.config.repository()))
    }

    /// Start the background range load from `repository`
    pub fn load_ranges_with<F: FeedSource + 'static>(
        &self,
        repository: IpRangeRepository<F>,
    ) -> Result<JoinHandle<()>, ControlError> {
        self.system_log("Loading mainland IP list...");
        let events = self.events.clone();
        let handle = spawn_loader(
            repository,
            Compactor::new(),
            self.wildcards.clone(),
            move |outcome| {
                let text = match outcome {
                    LoadOutcome::Loaded { ranges, rules } => {
                        format!("Loaded mainland IP list: {} ranges, {} bypass rules", ranges, rules)
                    }
                    LoadOutcome::Failed(e) => {
                        format!("Failed to load mainland IP list ({}), using built-in list", e)
                    }
                };
                let _ = events.send(ControlEvent::Log(LogLine::system(text)));
            },
        )?;
        Ok(handle)
    }

    pub fn wildcards(&self) -> &SharedWildcards {
        &self.wildcards
    }

    pub fn active_profile(&self) -> Result<ServerProfile, ControlError> {
        self.store.active_profile().ok_or(ControlError::NoActiveProfile)
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn proxy_state(&self) -> ProxyState {
        self.toggle.state()
    }

    /// Launch the proxy binary for the active profile
    pub fn start(&self) -> Result<u32, ControlError> {
        let profile = self.active_profile()?;
        let pid = self.supervisor.start(&profile).inspect_err(|e| {
            self.system_log(format!("Failed to start: {}", e));
        })?;
        self.system_log(format!("Started server profile {}", profile.name));
        Ok(pid)
    }

    /// Stop the proxy binary; the system proxy is cleared by the exit hook
    pub fn stop(&self) -> Result<(), ControlError> {
        self.supervisor.stop()?;
        Ok(())
    }

    /// Operator switch for the system proxy; returns the new state
    ///
    /// Turning it on needs a live proxy process; the toggle checks that
    /// under its own lock, so an exit racing this call cannot leave the
    /// proxy pointing at a dead listener.
    pub fn toggle_system_proxy(&self) -> Result<bool, ControlError> {
        let profile = self.active_profile()?;
        let listen = profile.listen_addr()?;
        let enabled = self.toggle.toggle(&listen, profile.routing_mode)?;
        self.proxy_changed(enabled && self.toggle.is_enabled());
        Ok(enabled)
    }

    /// Turn the system proxy on for the active profile
    pub fn enable_system_proxy(&self) -> Result<(), ControlError> {
        if self.toggle.is_enabled() {
            return Ok(());
        }

        let profile = self.active_profile()?;
        let listen = profile.listen_addr()?;
        self.toggle.enable(&listen, profile.routing_mode)?;
        if self.toggle.is_enabled() {
            self.proxy_changed(true);
        }
        Ok(())
    }

    /// Persist a new routing mode and re-apply or clear the system proxy
    pub fn set_routing_mode(&self, mode: RoutingMode) -> Result<(), ControlError> {
        let mut profile = self.active_profile()?;
        profile.routing_mode = mode;
        self.store.save(&profile)?;

        let was_enabled = self.toggle.is_enabled();
        let result = self.toggle.on_mode_changed(mode);
        if was_enabled && !self.toggle.is_enabled() {
            self.proxy_changed(false);
        } else if was_enabled && result.is_ok() {
            self.system_log(format!("Routing mode is now {}, system proxy updated", mode));
        }
        result.map_err(Into::into)
    }

    /// Persist a new listen address and move the system proxy to it
    pub fn set_listen(&self, listen: &str) -> Result<(), ControlError> {
        let addr: ListenAddr = listen.parse()?;
        let mut profile = self.active_profile()?;
        profile.listen = addr.to_string();
        self.store.save(&profile)?;

        self.toggle.on_listen_changed(&addr)?;
        Ok(())
    }

    /// Clear the system proxy and stop the proxy binary
    pub fn shutdown(&self) {
        if self.toggle.is_enabled() {
            if let Err(e) = self.toggle.disable() {
                warn!("Failed to clear system proxy on shutdown: {}", e);
            }
            self.proxy_changed(false);
        }

        if let Err(e) = self.supervisor.stop() {
            warn!("Failed to stop proxy process: {}", e);
        }
        info!("Control plane shut down");
    }

    fn proxy_changed(&self, enabled: bool) {
        let _ = self.events.send(ControlEvent::ProxyEnabled(enabled));
        self.system_log(if enabled {
            "System proxy enabled"
        } else {
            "System proxy disabled"
        });
    }

    fn system_log(&self, text: impl Into<String>) {
        let _ = self.events.send(ControlEvent::Log(LogLine::system(text)));
    }
}

/// Translate supervisor events on a thread named `event-relay`
fn spawn_relay(
    supervisor_rx: Receiver<SupervisorEvent>,
    events: Sender<ControlEvent>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("event-relay".to_string())
        .spawn(move || {
            for event in supervisor_rx {
                let forwarded = match event {
                    SupervisorEvent::Started { pid, executable } => {
                        let _ = events.send(ControlEvent::Log(LogLine::system(format!(
                            "{} running (pid {})",
                            executable.display(),
                            pid
                        ))));
                        events.send(ControlEvent::ProcessRunning(true))
                    }
                    SupervisorEvent::Log(line) => events.send(ControlEvent::Log(line)),
                    SupervisorEvent::Finished { pid, exit } => {
                        let _ = events.send(ControlEvent::Log(LogLine::system(format!(
                            "Process {} stopped ({})",
                            pid, exit
                        ))));
                        events.send(ControlEvent::ProcessRunning(false))
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
            debug!("Event relay stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use echwk_profile::JsonProfileStore;
    use echwk_routing::{FetchError, Platform, RepositoryConfig};
    use echwk_sysproxy::{ProxyApplyError, ProxySetting};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct RecordingApplier {
        calls: Mutex<Vec<ProxySetting>>,
    }

    impl RecordingApplier {
        fn calls(&self) -> Vec<ProxySetting> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PlatformProxyApplier for RecordingApplier {
        fn platform(&self) -> Option<Platform> {
            Some(Platform::MacOs)
        }

        fn apply(&self, setting: &ProxySetting) -> Result<(), ProxyApplyError> {
            self.calls.lock().unwrap().push(setting.clone());
            Ok(())
        }
    }

    struct CannedFeed;

    impl FeedSource for CannedFeed {
        fn fetch(&self, _url: &str) -> impl Future<Output = Result<String, FetchError>> + Send {
            async { Ok("1.0.1.0 1.0.3.255\n".to_string()) }
        }
    }

    struct Harness {
        dir: TempDir,
        applier: Arc<RecordingApplier>,
        plane: ControlPlane,
        events: Receiver<ControlEvent>,
    }

    /// Hands out the active profile slowly from the second call on
    struct SlowStore {
        inner: JsonProfileStore,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ProfileStore for SlowStore {
        fn active_profile(&self) -> Option<ServerProfile> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= 1 {
                std::thread::sleep(self.delay);
            }
            self.inner.active_profile()
        }

        fn save(&self, profile: &ServerProfile) -> Result<(), ProfileError> {
            self.inner.save(profile)
        }
    }

    fn harness(script: Option<&str>) -> Harness {
        harness_with(script, |store| Arc::new(store) as Arc<dyn ProfileStore>)
    }

    fn harness_with(
        script: Option<&str>,
        wrap: impl FnOnce(JsonProfileStore) -> Arc<dyn ProfileStore>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        if let Some(body) = script {
            write_script(dir.path(), body);
        }

        let config = ControlPlaneConfig {
            config_dir: dir.path().to_path_buf(),
            executable_dirs: Some(vec![dir.path().to_path_buf()]),
            ..Default::default()
        };
        let store = wrap(JsonProfileStore::open(dir.path()).unwrap());
        let applier = Arc::new(RecordingApplier::default());
        let (plane, events) = ControlPlane::new(config, store, applier.clone()).unwrap();

        Harness {
            dir,
            applier,
            plane,
            events,
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ech-workers");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(not(unix))]
    fn write_script(_dir: &std::path::Path, _body: &str) {}

    fn wait_for(events: &Receiver<ControlEvent>, pred: impl Fn(&ControlEvent) -> bool) {
        loop {
            let event = events.recv_timeout(WAIT).unwrap();
            if pred(&event) {
                return;
            }
        }
    }

    #[test]
    fn test_toggle_requires_running_process() {
        let h = harness(None);
        assert!(matches!(
            h.plane.toggle_system_proxy(),
            Err(ControlError::NotRunning)
        ));
        assert!(h.applier.calls().is_empty());
    }

    #[test]
    fn test_range_load_publishes_and_logs() {
        let h = harness(None);
        let repository =
            IpRangeRepository::with_source(RepositoryConfig::in_dir(h.dir.path()), CannedFeed);

        h.plane.load_ranges_with(repository).unwrap().join().unwrap();

        assert_eq!(h.plane.wildcards().snapshot().unwrap().len(), 3);
        wait_for(&h.events, |e| {
            matches!(e, ControlEvent::Log(line) if line.text.starts_with("Loaded mainland IP list: 1 ranges"))
        });
    }

    #[test]
    fn test_routing_mode_is_persisted() {
        let h = harness(None);
        h.plane.set_routing_mode(RoutingMode::Global).unwrap();

        let reopened = JsonProfileStore::open(h.dir.path()).unwrap();
        assert_eq!(
            reopened.active_profile().unwrap().routing_mode,
            RoutingMode::Global
        );
    }

    #[test]
    fn test_set_listen_rejects_garbage() {
        let h = harness(None);
        assert!(matches!(
            h.plane.set_listen("localhost:http"),
            Err(ControlError::Profile(_))
        ));
        h.plane.set_listen("31000").unwrap();
        assert_eq!(h.plane.active_profile().unwrap().listen, "127.0.0.1:31000");
    }

    #[cfg(unix)]
    #[test]
    fn test_process_exit_clears_proxy() {
        let h = harness(Some("echo ready\nexec sleep 30"));
        h.plane.start().unwrap();
        wait_for(&h.events, |e| matches!(e, ControlEvent::ProcessRunning(true)));

        assert!(h.plane.toggle_system_proxy().unwrap());
        assert!(h.plane.proxy_state().enabled);

        h.plane.stop().unwrap();
        wait_for(&h.events, |e| matches!(e, ControlEvent::ProxyEnabled(false)));
        wait_for(&h.events, |e| matches!(e, ControlEvent::ProcessRunning(false)));

        assert!(!h.plane.proxy_state().enabled);
        let calls = h.applier.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].is_enabled());
        assert_eq!(calls[1], ProxySetting::Disabled);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_unchanged_disables_running_proxy() {
        let h = harness(Some("exec sleep 30"));
        h.plane.start().unwrap();
        h.plane.enable_system_proxy().unwrap();
        assert!(h.plane.proxy_state().enabled);

        h.plane.set_routing_mode(RoutingMode::Unchanged).unwrap();
        assert!(!h.plane.proxy_state().enabled);
        assert!(matches!(
            h.plane.toggle_system_proxy(),
            Err(ControlError::Toggle(ToggleError::ModeUnchanged))
        ));

        h.plane.shutdown();
        assert!(!h.plane.is_running());
        assert_eq!(
            h.applier
                .calls()
                .iter()
                .filter(|s| **s == ProxySetting::Disabled)
                .count(),
            1
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_enable_after_process_exit_is_refused() {
        let h = harness_with(Some("sleep 0.2\nexit 1"), |store| {
            Arc::new(SlowStore {
                inner: store,
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(800),
            }) as Arc<dyn ProfileStore>
        });

        h.plane.start().unwrap();
        assert!(matches!(
            h.plane.enable_system_proxy(),
            Err(ControlError::NotRunning)
        ));

        wait_for(&h.events, |e| matches!(e, ControlEvent::ProcessRunning(false)));
        assert!(!h.plane.proxy_state().enabled);
        assert!(h.applier.calls().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_shutdown_clears_proxy() {
        let h = harness(Some("exec sleep 30"));
        h.plane.start().unwrap();
        h.plane.enable_system_proxy().unwrap();

        h.plane.shutdown();
        assert!(!h.plane.is_running());
        assert!(!h.plane.proxy_state().enabled);
        assert_eq!(h.applier.calls().last(), Some(&ProxySetting::Disabled));
    }
}
