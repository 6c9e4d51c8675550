//! echwk: ECH workers client
//!
//! Runs the `ech-workers` proxy for the selected profile, points the system
//! proxy at it and cleans up on Ctrl-C or when the proxy exits.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use echwk::{system_autostart, ControlEvent, ControlPlane, ControlPlaneConfig, AUTOSTART_FLAG};
use echwk_profile::{JsonProfileStore, ProfileStore, RoutingMode};
use echwk_supervisor::LogSource;
use echwk_sysproxy::system_applier;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "echwk", version, about = "ECH workers client")]
struct Cli {
    /// Directory holding config.json and the range cache
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Select a saved profile by name
    #[arg(long)]
    profile: Option<String>,

    /// Switch the routing mode (global, bypass_cn, none) and save it
    #[arg(long)]
    mode: Option<RoutingMode>,

    /// Change the listen address and save it
    #[arg(long)]
    listen: Option<String>,

    /// Run the proxy without touching the system proxy setting
    #[arg(long)]
    no_system_proxy: bool,

    /// Rename the selected profile and save it
    #[arg(long, value_name = "NAME")]
    rename: Option<String>,

    /// Directory containing the ech-workers binary
    #[arg(long)]
    exe_dir: Option<PathBuf>,

    /// Launched at login; exit quietly if the profile is incomplete
    #[arg(long)]
    autostart: bool,

    /// Register this binary to run at login, then exit
    #[arg(long, conflicts_with = "uninstall_autostart")]
    install_autostart: bool,

    /// Remove the login registration, then exit
    #[arg(long)]
    uninstall_autostart: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    if cli.install_autostart || cli.uninstall_autostart {
        return configure_autostart(&cli);
    }

    let mut config = ControlPlaneConfig::default();
    if let Some(dir) = cli.config_dir {
        config.config_dir = dir;
    }
    if let Some(dir) = cli.exe_dir {
        config.executable_dirs = Some(vec![dir]);
    }

    let store = JsonProfileStore::open(&config.config_dir)
        .with_context(|| format!("opening {}", config.config_dir.display()))?;
    if let Some(name) = &cli.profile {
        let profile = store
            .find_by_name(name)
            .with_context(|| format!("no profile named {:?}", name))?;
        store.select(&profile.id)?;
    }
    if let Some(name) = &cli.rename {
        let id = store.active_profile().context("no profile selected")?.id;
        let old = store.rename(&id, name)?;
        info!("Renamed profile {} -> {}", old, name.trim());
    }
    info!("Config: {}", store.path().display());

    if cli.autostart {
        let ready = store
            .active_profile()
            .is_some_and(|p| !p.server.trim().is_empty() && !p.listen.trim().is_empty());
        if !ready {
            info!("Launched at login without a complete profile, nothing to start");
            return Ok(());
        }
        info!("Launched at login, starting proxy");
    }

    let (plane, events) = ControlPlane::new(config, Arc::new(store), system_applier())?;

    let (exited_tx, mut exited_rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("event-log".to_string())
        .spawn(move || log_events(events, exited_tx))?;

    if let Some(mode) = cli.mode {
        plane.set_routing_mode(mode)?;
    }
    if let Some(listen) = &cli.listen {
        plane.set_listen(listen)?;
    }

    plane.load_ranges()?;
    plane.start()?;

    if !cli.no_system_proxy {
        if let Err(e) = plane.enable_system_proxy() {
            warn!("System proxy not enabled: {}", e);
        }
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, shutting down");
        }
        _ = exited_rx.recv() => {
            info!("Proxy process exited");
        }
    }

    plane.shutdown();
    Ok(())
}

/// Install or remove the login registration for this binary
fn configure_autostart(cli: &Cli) -> Result<()> {
    let autostart = system_autostart()?;

    if cli.uninstall_autostart {
        autostart.disable()?;
        info!("Launch at login disabled");
        return Ok(());
    }

    let program = std::env::current_exe().context("locating this binary")?;
    let mut args = vec![AUTOSTART_FLAG.to_string()];
    if let Some(dir) = &cli.config_dir {
        let dir = std::path::absolute(dir).context("resolving --config-dir")?;
        args.push("--config-dir".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }
    if let Some(name) = &cli.profile {
        args.push("--profile".to_string());
        args.push(name.clone());
    }

    autostart.enable(&program, &args)?;
    info!(
        "Launch at login enabled ({})",
        if autostart.is_enabled()? { "verified" } else { "not visible yet" }
    );
    Ok(())
}

/// Print control events; signals `exited` when the proxy stops
fn log_events(events: Receiver<ControlEvent>, exited: mpsc::UnboundedSender<()>) {
    for event in events {
        match event {
            ControlEvent::Log(line) => match line.source {
                LogSource::System => info!("{}", line.text),
                LogSource::Process => info!(target: "echwk::process", "{}", line.text),
            },
            ControlEvent::ProcessRunning(false) => {
                let _ = exited.send(());
            }
            ControlEvent::ProcessRunning(true) => {}
            ControlEvent::ProxyEnabled(enabled) => {
                info!("System proxy {}", if enabled { "on" } else { "off" });
            }
        }
    }
}
