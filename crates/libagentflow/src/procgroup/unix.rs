use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::process::Command;
use tracing::debug;

use super::{GroupHandle, ProcessGroup};

/// POSIX process groups, plus a best-effort walk of the process table for
/// descendants that moved to another group.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixProcessGroup;

impl ProcessGroup for PosixProcessGroup {
    fn configure(&self, cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    fn interrupt(&self, group: GroupHandle) -> io::Result<()> {
        signal_group(group, Signal::SIGINT)
    }

    fn kill(&self, group: GroupHandle) -> io::Result<()> {
        signal_group(group, Signal::SIGKILL)
    }

    fn exists(&self, group: GroupHandle) -> bool {
        let Some(pgid) = raw_pid(group.pgid) else {
            return false;
        };
        // EPERM: the group exists but belongs to someone else.
        matches!(killpg(pgid, None), Ok(()) | Err(Errno::EPERM))
    }
}

fn raw_pid(id: u32) -> Option<Pid> {
    i32::try_from(id).ok().filter(|id| *id > 0).map(Pid::from_raw)
}

fn signal_group(group: GroupHandle, sig: Signal) -> io::Result<()> {
    if let Some(root) = raw_pid(group.pid) {
        signal_tree(root, sig)?;
    }
    if let Some(pgid) = raw_pid(group.pgid) {
        match killpg(pgid, sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Signal every descendant of `root`, deepest first, then `root` itself.
fn signal_tree(root: Pid, sig: Signal) -> io::Result<()> {
    match list_descendants(root) {
        Ok(descendants) => {
            for pid in descendants.into_iter().rev() {
                if let Err(err) = kill(pid, sig) {
                    if err != Errno::ESRCH {
                        debug!(pid = pid.as_raw(), signal = sig.as_str(), "signal failed: {err}");
                    }
                }
            }
        }
        Err(err) => debug!("process table unavailable: {err}"),
    }
    match kill(root, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn list_descendants(root: Pid) -> io::Result<Vec<Pid>> {
    let output = Command::new("ps").args(["-eo", "pid=,ppid="]).output()?;
    if !output.status.success() {
        return Err(io::Error::other("ps exited unsuccessfully"));
    }
    let table = parse_process_table(&String::from_utf8_lossy(&output.stdout));
    Ok(descendants_of(&table, root.as_raw())
        .into_iter()
        .map(Pid::from_raw)
        .collect())
}

/// Parse `pid ppid` rows into a parent -> children map.
fn parse_process_table(raw: &str) -> HashMap<i32, Vec<i32>> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid), None) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(pid), Ok(ppid)) = (pid.parse::<i32>(), ppid.parse::<i32>()) else {
            continue;
        };
        children.entry(ppid).or_default().push(pid);
    }
    children
}

/// Breadth-first descendants of `root`, nearest first.
fn descendants_of(table: &HashMap<i32, Vec<i32>>, root: i32) -> Vec<i32> {
    let mut out = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(cur) = queue.pop_front() {
        for &child in table.get(&cur).into_iter().flatten() {
            if seen.insert(child) {
                out.push(child);
                queue.push_back(child);
            }
        }
    }
    out
}

pub(super) fn signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("SIG{sig}"),
    }
}
