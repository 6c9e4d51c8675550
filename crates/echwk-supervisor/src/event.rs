//! Events emitted by the supervisor.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::SystemTime;

/// Who produced a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// The control plane itself
    System,
    /// stdout or stderr of the supervised process
    Process,
}

/// One timestamped line for the operator log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: SystemTime,
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(LogSource::System, text)
    }

    pub fn process(text: impl Into<String>) -> Self {
        Self::new(LogSource::Process, text)
    }

    fn new(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source,
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            LogSource::System => write!(f, "[System] {}", self.text),
            LogSource::Process => write!(f, "{}", self.text),
        }
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal (POSIX)
    Signal(i32),
    /// Status could not be determined
    Unknown,
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessExit::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessExit::Signal(signal);
            }
        }

        ProcessExit::Unknown
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signal(signal) => write!(f, "signal {}", signal),
            ProcessExit::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Messages sent from the supervisor threads to the owner.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Process spawned
    Started { pid: u32, executable: PathBuf },
    /// One line of process output
    Log(LogLine),
    /// Process is gone; sent exactly once per process
    Finished { pid: u32, exit: ProcessExit },
}
