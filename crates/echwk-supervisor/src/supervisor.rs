//! Process supervision
//!
//! One proxy process at a time. Each process gets three threads:
//! - `supervisor-stdout` / `supervisor-stderr`: forward output lines
//! - `supervisor-monitor`: waits for exit, runs termination callbacks,
//!   frees the slot, then sends the single `Finished` event
//!
//! `stop` asks politely first (SIGTERM / TerminateProcess) and kills after
//! the grace period. The slot stays taken until the monitor has seen the
//! exit, so `start` during a slow stop gets `AlreadyRunning`.
//!
//! Launch callbacks for a process always run before its termination
//! callbacks.

use crate::args::build_args;
use crate::event::{LogLine, ProcessExit, SupervisorEvent};
use crate::locate::ExecutableLocator;
use crossbeam_channel::{bounded, Receiver, Sender};
use echwk_profile::ServerProfile;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Grace period between terminate and kill
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the monitor polls for exit
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output readers may lag behind the exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Proxy process already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error(
        "{name} not found. Place it next to this program, in the working directory, or on PATH. Searched: {}",
        display_paths(.searched)
    )]
    ExecutableNotFound { name: String, searched: Vec<PathBuf> },

    #[error("Failed to launch {}: {source}", .path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

type LaunchCallback = Arc<dyn Fn(u32) + Send + Sync>;
type TerminationCallback = Arc<dyn Fn(&ProcessExit) + Send + Sync>;

/// Shared between the supervisor and its monitor threads
struct Shared {
    events: Sender<SupervisorEvent>,
    active: Mutex<Option<ActiveProcess>>,
    launch_callbacks: Mutex<Vec<LaunchCallback>>,
    callbacks: Mutex<Vec<TerminationCallback>>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveProcess>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launched(&self, pid: u32) {
        let callbacks = self
            .launch_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(pid);
        }
    }

    fn terminated(&self, exit: &ProcessExit) {
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(exit);
        }
    }
}

struct ActiveProcess {
    pid: u32,
    generation: u64,
    child: Arc<Mutex<Child>>,
    /// Taken by whoever is stopping the process
    monitor: Option<JoinHandle<ProcessExit>>,
}

/// Launches and watches the proxy binary
pub struct Supervisor {
    locator: ExecutableLocator,
    stop_timeout: Duration,
    generation: AtomicU64,
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Create a supervisor sending events on `events`
    pub fn new(locator: ExecutableLocator, events: Sender<SupervisorEvent>) -> Self {
        Self {
            locator,
            stop_timeout: STOP_TIMEOUT,
            generation: AtomicU64::new(0),
            shared: Arc::new(Shared {
                events,
                active: Mutex::new(None),
                launch_callbacks: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Override the terminate-to-kill grace period
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn locator(&self) -> &ExecutableLocator {
        &self.locator
    }

    /// Run `callback` with the pid of every launched process
    ///
    /// Called from `start` while the slot is held, before the process can be
    /// reported as terminated.
    pub fn on_launch(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.shared
            .launch_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Run `callback` whenever a process ends, before the slot is freed and
    /// `Finished` is sent
    pub fn on_termination(&self, callback: impl Fn(&ProcessExit) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.active().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.active().as_ref().map(|p| p.pid)
    }

    /// Launch the proxy for `profile`; returns its pid
    pub fn start(&self, profile: &ServerProfile) -> Result<u32, SupervisorError> {
        if profile.server.trim().is_empty() {
            return Err(SupervisorError::InvalidProfile(
                "server address is empty".to_string(),
            ));
        }
        if profile.listen.trim().is_empty() {
            return Err(SupervisorError::InvalidProfile(
                "listen address is empty".to_string(),
            ));
        }

        let mut active = self.shared.active();
        if let Some(running) = active.as_ref() {
            warn!("Start ignored, pid {} still running", running.pid);
            return Err(SupervisorError::AlreadyRunning { pid: running.pid });
        }

        let executable = self.locator.locate().inspect_err(|e| error!("{}", e))?;
        let args = build_args(profile);

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| {
            error!("Failed to launch {}: {}", executable.display(), source);
            SupervisorError::Launch {
                path: executable.clone(),
                source,
            }
        })?;
        let pid = child.id();
        info!("Started {} (pid {}) {}", executable.display(), pid, args.join(" "));
        let _ = self.shared.events.send(SupervisorEvent::Started { pid, executable });
        self.shared.launched(pid);

        let child = Arc::new(Mutex::new(child));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let monitor = match self.spawn_threads(pid, generation, &child) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn supervisor threads, killing pid {}", pid);
                let exit = {
                    let mut child = lock_child(&child);
                    let _ = child.kill();
                    child.wait().map(ProcessExit::from).unwrap_or(ProcessExit::Unknown)
                };
                self.shared.terminated(&exit);
                let _ = self.shared.events.send(SupervisorEvent::Finished { pid, exit });
                return Err(e.into());
            }
        };

        *active = Some(ActiveProcess {
            pid,
            generation,
            child,
            monitor: Some(monitor),
        });

        Ok(pid)
    }

    /// Output readers plus the monitor that owns the exit
    fn spawn_threads(
        &self,
        pid: u32,
        generation: u64,
        child: &Arc<Mutex<Child>>,
    ) -> io::Result<JoinHandle<ProcessExit>> {
        let (stdout, stderr) = {
            let mut child = lock_child(child);
            (child.stdout.take(), child.stderr.take())
        };

        let (done_tx, done_rx) = bounded(2);
        let mut readers = 0;
        if let Some(stdout) = stdout {
            spawn_reader("supervisor-stdout", stdout, self.shared.events.clone(), done_tx.clone())?;
            readers += 1;
        }
        if let Some(stderr) = stderr {
            spawn_reader("supervisor-stderr", stderr, self.shared.events.clone(), done_tx.clone())?;
            readers += 1;
        }
        drop(done_tx);

        let child = child.clone();
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("supervisor-monitor".to_string())
            .spawn(move || monitor(pid, generation, child, done_rx, readers, shared))
    }

    /// Terminate the running process, if any
    ///
    /// Returns how it ended. The `Finished` event is sent by the monitor
    /// before this returns.
    pub fn stop(&self) -> Result<Option<ProcessExit>, SupervisorError> {
        let (pid, generation, child, monitor) = {
            let mut active = self.shared.active();
            let Some(process) = active.as_mut() else {
                return Ok(None);
            };
            let Some(monitor) = process.monitor.take() else {
                debug!("pid {} is already being stopped", process.pid);
                return Ok(None);
            };
            (process.pid, process.generation, process.child.clone(), monitor)
        };

        info!("Stopping pid {}", pid);
        if let Err(e) = terminate(pid, &child) {
            let mut active = self.shared.active();
            if let Some(process) = active.as_mut().filter(|p| p.generation == generation) {
                process.monitor = Some(monitor);
            }
            return Err(e.into());
        }

        let deadline = Instant::now() + self.stop_timeout;
        loop {
            match lock_child(&child).try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(e) => warn!("Waiting for pid {} failed: {}", pid, e),
            }
            if Instant::now() >= deadline {
                warn!("pid {} still running after {:?}, killing", pid, self.stop_timeout);
                if let Err(e) = lock_child(&child).kill() {
                    warn!("Kill failed for pid {}: {}", pid, e);
                }
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let exit = monitor.join().unwrap_or(ProcessExit::Unknown);
        Ok(Some(exit))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop proxy process on drop: {}", e);
        }
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Graceful termination request
#[cfg(unix)]
fn terminate(pid: u32, child: &Mutex<Child>) -> io::Result<()> {
    let mut child = lock_child(child);
    // Only signal a pid we have not reaped yet
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain kill(2) on our own unreaped child
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        warn!("SIGTERM to pid {} failed: {}", pid, err);
    }
    Ok(())
}

/// Windows has no graceful signal for console-less children
#[cfg(not(unix))]
fn terminate(_pid: u32, child: &Mutex<Child>) -> io::Result<()> {
    let mut child = lock_child(child);
    if child.try_wait()?.is_none() {
        child.kill()?;
    }
    Ok(())
}

/// Forward one output stream as log lines until EOF
fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    stream: R,
    events: Sender<SupervisorEvent>,
    done: Sender<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if events.send(SupervisorEvent::Log(LogLine::process(line))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
        let _ = done.send(());
    })
}

/// Wait for exit, drain output, notify
fn monitor(
    pid: u32,
    generation: u64,
    child: Arc<Mutex<Child>>,
    readers_done: Receiver<()>,
    readers: usize,
    shared: Arc<Shared>,
) -> ProcessExit {
    let exit = loop {
        match lock_child(&child).try_wait() {
            Ok(Some(status)) => break ProcessExit::from(status),
            Ok(None) => {}
            Err(e) => {
                error!("Waiting for pid {} failed: {}", pid, e);
                break ProcessExit::Unknown;
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    for _ in 0..readers {
        if readers_done.recv_deadline(deadline).is_err() {
            debug!("Output of pid {} still open after exit", pid);
            break;
        }
    }

    if exit.is_success() {
        info!("pid {} exited normally", pid);
    } else {
        warn!("pid {} ended with {}", pid, exit);
    }

    shared.terminated(&exit);

    {
        let mut active = shared.active();
        if active.as_ref().is_some_and(|p| p.generation == generation) {
            *active = None;
        }
    }

    let _ = shared.events.send(SupervisorEvent::Finished { pid, exit });
    exit
}
