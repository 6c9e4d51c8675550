//! ECH-WK Process Supervisor
//!
//! Finds, launches and watches the `ech-workers` proxy binary, streaming its
//! output as [`SupervisorEvent`]s over a crossbeam channel.

mod args;
mod event;
mod locate;
mod supervisor;

pub use args::build_args;
pub use event::{LogLine, LogSource, ProcessExit, SupervisorEvent};
pub use locate::{is_posix_executable_header, ExecutableLocator, EXECUTABLE_NAME};
pub use supervisor::{Supervisor, SupervisorError, STOP_TIMEOUT};
