use std::io;
use std::process::{Command, Stdio};

use super::{GroupHandle, ProcessGroup};

/// Signals the single launched process via `taskkill`; liveness via `tasklist`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsProcess;

impl ProcessGroup for WindowsProcess {
    fn configure(&self, _cmd: &mut tokio::process::Command) {}

    fn interrupt(&self, group: GroupHandle) -> io::Result<()> {
        taskkill(group.pid, false)
    }

    fn kill(&self, group: GroupHandle) -> io::Result<()> {
        taskkill(group.pid, true)
    }

    fn exists(&self, group: GroupHandle) -> bool {
        if group.pid == 0 {
            return false;
        }
        let filter = format!("PID eq {}", group.pid);
        let Ok(output) = Command::new("tasklist")
            .args(["/FI", &filter, "/NH", "/FO", "CSV"])
            .stdin(Stdio::null())
            .output()
        else {
            return false;
        };
        let needle = format!("\"{}\"", group.pid);
        String::from_utf8_lossy(&output.stdout).contains(&needle)
    }
}

fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    if pid == 0 {
        return Ok(());
    }
    let pid = pid.to_string();
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", &pid]);
    if force {
        cmd.arg("/F");
    }
    // Non-zero status usually means the process is already gone.
    let _ = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    Ok(())
}
