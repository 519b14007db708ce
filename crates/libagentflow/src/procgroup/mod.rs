//! Process-group signalling for supervised runs.
//!
//! Callers depend on [`ProcessGroup`] only; the platform implementation is
//! picked by [`platform`].

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::PosixProcessGroup;
#[cfg(windows)]
pub use windows::WindowsProcess;

/// Identifies the signalling target of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHandle {
    pub pgid: u32,
    pub pid: u32,
}

impl GroupHandle {
    /// Handle for a process started as its own group leader.
    pub fn leader(pid: u32) -> Self {
        Self { pgid: pid, pid }
    }
}

pub trait ProcessGroup: Send + Sync + 'static {
    /// Arrange for `cmd` to start in a new process group.
    fn configure(&self, cmd: &mut tokio::process::Command);

    /// Ask the whole tree to stop.
    fn interrupt(&self, group: GroupHandle) -> io::Result<()>;

    /// Forcefully terminate the whole tree.
    fn kill(&self, group: GroupHandle) -> io::Result<()>;

    fn exists(&self, group: GroupHandle) -> bool;
}

pub fn platform() -> Arc<dyn ProcessGroup> {
    #[cfg(unix)]
    {
        Arc::new(PosixProcessGroup)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsProcess)
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
    /// Canonical name such as `SIGKILL` when terminated by a signal.
    pub signal: Option<String>,
}

pub fn decode_exit_status(status: ExitStatus) -> ExitOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitOutcome {
                success: false,
                code: None,
                signal: Some(unix::signal_name(sig)),
            };
        }
    }
    ExitOutcome {
        success: status.success(),
        code: Some(status.code().unwrap_or(-1)),
        signal: None,
    }
}
