use agentflow_protocol::{Level, RunEvent, RunId, encode_frame, kind, step};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::config::BusConfig;

/// Archive failure kinds, each disclosed at most once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFailure {
    CleanupFailed,
    CreateFailed,
    OpenFailed,
    EncodeFailed,
    TooLarge,
    WriteFailed,
    CloseFailed,
    RenameFailed,
}

impl ArchiveFailure {
    pub fn code(self) -> &'static str {
        match self {
            ArchiveFailure::CleanupFailed => "ARCHIVE_CLEANUP_FAILED",
            ArchiveFailure::CreateFailed => "ARCHIVE_CREATE_FAILED",
            ArchiveFailure::OpenFailed => "ARCHIVE_OPEN_FAILED",
            ArchiveFailure::EncodeFailed => "ARCHIVE_ENCODE_FAILED",
            ArchiveFailure::TooLarge => "ARCHIVE_TOO_LARGE",
            ArchiveFailure::WriteFailed => "ARCHIVE_WRITE_FAILED",
            ArchiveFailure::CloseFailed => "ARCHIVE_CLOSE_FAILED",
            ArchiveFailure::RenameFailed => "ARCHIVE_RENAME_FAILED",
        }
    }

    fn message(self) -> &'static str {
        match self {
            ArchiveFailure::CleanupFailed => {
                "Failed to cleanup old run archives; continuing without blocking this run."
            }
            ArchiveFailure::CreateFailed => {
                "Failed to create archive directory; run logs will not be written to disk."
            }
            ArchiveFailure::OpenFailed => {
                "Failed to open run archive; run logs will not be written to disk."
            }
            ArchiveFailure::EncodeFailed => {
                "Failed to encode an event for archiving; further events will not be written to disk."
            }
            ArchiveFailure::TooLarge => {
                "Run archive exceeded the configured max size; further events will not be written to disk."
            }
            ArchiveFailure::WriteFailed => {
                "Failed to write run archive; further events will not be written to disk."
            }
            ArchiveFailure::CloseFailed => "Failed to close run archive; archive may be incomplete.",
            ArchiveFailure::RenameFailed => {
                "Failed to finalize run archive; archive may be left as a .tmp file."
            }
        }
    }
}

/// On-disk JSONL record of one run.
///
/// Written to `<name>.jsonl.tmp` and renamed to `<name>.jsonl` once the
/// terminal event has been archived.
#[derive(Debug)]
pub struct RunArchive {
    pub tmp_path: PathBuf,
    pub final_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    stopped: bool,
    finalized: bool,
    cleanup_attempted: bool,
    reported: HashSet<ArchiveFailure>,
}

impl RunArchive {
    fn new(dir: &Path, run_id: &str) -> Self {
        let name = sanitize_run_id(run_id).unwrap_or_else(|| "run".to_string());
        let final_path = dir.join(format!("{name}.jsonl"));
        let tmp_path = dir.join(format!("{name}.jsonl.tmp"));
        Self {
            tmp_path,
            final_path,
            file: None,
            bytes_written: 0,
            stopped: false,
            finalized: false,
            cleanup_attempted: false,
            reported: HashSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some() && !self.finalized
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Mark writing as stopped and return the failure if it was not yet reported.
    fn fail(&mut self, failure: ArchiveFailure) -> Option<ArchiveFailure> {
        if failure != ArchiveFailure::CleanupFailed
            && failure != ArchiveFailure::CloseFailed
            && failure != ArchiveFailure::RenameFailed
        {
            self.stopped = true;
        }
        self.reported.insert(failure).then_some(failure)
    }

    /// Close the temp file and move it to its final name.
    fn finalize(&mut self) -> Result<(), ArchiveFailure> {
        self.finalized = true;
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if let Err(err) = file.sync_all() {
            warn!(path = %self.tmp_path.display(), "archive sync failed: {err}");
            return Err(ArchiveFailure::CloseFailed);
        }
        drop(file);
        if let Err(err) = fs::rename(&self.tmp_path, &self.final_path) {
            warn!(path = %self.tmp_path.display(), "archive rename failed: {err}");
            return Err(ArchiveFailure::RenameFailed);
        }
        debug!(path = %self.final_path.display(), bytes = self.bytes_written, "archive finalized");
        Ok(())
    }
}

/// Owns every run archive written by one bus, plus directory retention.
#[derive(Debug)]
pub struct Archiver {
    dir: PathBuf,
    max_archive_bytes: u64,
    retention_count: usize,
    retention_bytes: u64,
    archives: HashMap<RunId, RunArchive>,
}

impl Archiver {
    pub fn new(dir: PathBuf, cfg: &BusConfig) -> Self {
        Self {
            dir,
            max_archive_bytes: cfg.max_archive_bytes,
            retention_count: cfg.archive_retention_count,
            retention_bytes: cfg.archive_retention_bytes,
            archives: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive(&self, run_id: &str) -> Option<&RunArchive> {
        self.archives.get(run_id)
    }

    /// Paths currently open for writing; never pruned.
    fn open_paths(&self) -> HashSet<PathBuf> {
        self.archives
            .values()
            .filter(|a| a.is_open())
            .flat_map(|a| [a.tmp_path.clone(), a.final_path.clone()])
            .collect()
    }

    /// Append `event` to its run's archive.
    ///
    /// Failures never propagate; they come back as synthetic `error`
    /// events, each kind at most once per run.
    pub fn record(&mut self, event: &RunEvent) -> Vec<RunEvent> {
        if event.run_id.is_empty() {
            return Vec::new();
        }

        let needs_open = self
            .archives
            .get(&event.run_id)
            .is_none_or(|a| a.file.is_none() && !a.stopped && !a.finalized);
        let protected = if needs_open {
            self.open_paths()
        } else {
            HashSet::new()
        };

        let dir = self.dir.clone();
        let max_archive_bytes = self.max_archive_bytes;
        let max_files = self.retention_count.saturating_sub(1);
        let max_bytes = self.retention_bytes.saturating_sub(max_archive_bytes);

        let arch = self
            .archives
            .entry(event.run_id.clone())
            .or_insert_with(|| RunArchive::new(&dir, &event.run_id));
        if arch.finalized {
            return Vec::new();
        }

        let mut failures = Vec::new();

        if arch.file.is_none() && !arch.stopped {
            if !arch.cleanup_attempted {
                arch.cleanup_attempted = true;
                if let Err(err) = prune_archive_dir(&dir, max_files, max_bytes, &protected) {
                    warn!(dir = %dir.display(), "archive cleanup failed: {err}");
                    failures.extend(
                        arch.fail(ArchiveFailure::CleanupFailed)
                            .map(|f| (f, Some(err.to_string()))),
                    );
                }
            }

            match open_archive_file(&dir, &arch.tmp_path) {
                Ok(file) => arch.file = Some(file),
                Err(failure) => {
                    failures.extend(arch.fail(failure).map(|f| (f, None)));
                }
            }
        }

        if arch.stopped || arch.file.is_none() {
            if event.is_terminal() {
                if let Err(failure) = arch.finalize() {
                    failures.extend(arch.fail(failure).map(|f| (f, None)));
                }
            }
            return render_failures(event, arch, max_archive_bytes, &dir, failures);
        }

        if let Err(failure) = append_line(arch, event, max_archive_bytes) {
            failures.extend(arch.fail(failure).map(|f| (f, None)));
        }
        // The temp file is renamed even when the terminal event itself did not fit.
        if event.is_terminal() {
            if let Err(failure) = arch.finalize() {
                failures.extend(arch.fail(failure).map(|f| (f, None)));
            }
        }

        render_failures(event, arch, max_archive_bytes, &dir, failures)
    }
}

fn open_archive_file(dir: &Path, tmp_path: &Path) -> Result<File, ArchiveFailure> {
    if let Err(err) = fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), "failed to create archive dir: {err}");
        return Err(ArchiveFailure::CreateFailed);
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)
        .map_err(|err| {
            warn!(path = %tmp_path.display(), "failed to open archive: {err}");
            ArchiveFailure::OpenFailed
        })
}

fn append_line(
    arch: &mut RunArchive,
    event: &RunEvent,
    max_archive_bytes: u64,
) -> Result<(), ArchiveFailure> {
    let mut line = encode_frame(event).map_err(|_| ArchiveFailure::EncodeFailed)?;
    line.push('\n');

    let len = line.len() as u64;
    if arch.bytes_written.saturating_add(len) > max_archive_bytes {
        return Err(ArchiveFailure::TooLarge);
    }

    let Some(file) = arch.file.as_mut() else {
        return Err(ArchiveFailure::WriteFailed);
    };
    if let Err(err) = file.write_all(line.as_bytes()) {
        warn!(path = %arch.tmp_path.display(), "archive write failed: {err}");
        return Err(ArchiveFailure::WriteFailed);
    }
    arch.bytes_written += len;
    Ok(())
}

fn render_failures(
    event: &RunEvent,
    arch: &RunArchive,
    max_archive_bytes: u64,
    dir: &Path,
    failures: Vec<(ArchiveFailure, Option<String>)>,
) -> Vec<RunEvent> {
    failures
        .into_iter()
        .map(|(failure, detail)| {
            let mut data = json!({
                "code": failure.code(),
                "message": failure.message(),
            });
            if let Value::Object(map) = &mut data {
                match failure {
                    ArchiveFailure::CleanupFailed | ArchiveFailure::CreateFailed => {
                        map.insert("dir".into(), json!(dir.display().to_string()));
                    }
                    ArchiveFailure::TooLarge => {
                        map.insert("maxBytes".into(), json!(max_archive_bytes));
                        map.insert("path".into(), json!(arch.final_path.display().to_string()));
                    }
                    ArchiveFailure::RenameFailed => {
                        map.insert("tmpPath".into(), json!(arch.tmp_path.display().to_string()));
                        map.insert("path".into(), json!(arch.final_path.display().to_string()));
                    }
                    ArchiveFailure::EncodeFailed => {}
                    ArchiveFailure::OpenFailed
                    | ArchiveFailure::WriteFailed
                    | ArchiveFailure::CloseFailed => {
                        map.insert("path".into(), json!(arch.tmp_path.display().to_string()));
                    }
                }
                if let Some(detail) = detail {
                    map.insert("error".into(), json!(detail));
                }
            }
            RunEvent::new(event.run_id.clone(), kind::ERROR, step::ARCHIVE, Level::Error)
                .with_data(data)
        })
        .collect()
}

struct ArchiveFileEntry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Delete the oldest files in `dir` until at most `max_files` files and
/// `max_total_bytes` bytes remain, skipping `protected` paths.
///
/// Protected files are neither deleted nor counted.
pub fn prune_archive_dir(
    dir: &Path,
    max_files: usize,
    max_total_bytes: u64,
    protected: &HashSet<PathBuf>,
) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut files = Vec::new();
    let mut total: u64 = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if protected.contains(&path) {
            continue;
        }
        // Files can disappear underneath us; skip them.
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !(meta.is_file() || meta.file_type().is_symlink()) {
            continue;
        }
        let size = meta.len();
        total = total.saturating_add(size);
        files.push(ArchiveFileEntry {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size,
        });
    }

    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let mut first_err = None;
    let mut remaining = files.len();
    for oldest in files {
        if remaining <= max_files && total <= max_total_bytes {
            break;
        }
        remaining -= 1;
        match fs::remove_file(&oldest.path) {
            Ok(()) => {
                total = total.saturating_sub(oldest.size);
                debug!(path = %oldest.path.display(), "pruned run archive");
            }
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(())
}

/// Map a run id to a safe archive file stem.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, runs of dots collapse,
/// and names that resolve to nothing, `.` or `..` are rejected.
pub fn sanitize_run_id(run_id: &str) -> Option<String> {
    let mapped: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if c == '.' && collapsed.ends_with('.') {
            continue;
        }
        collapsed.push(c);
    }

    let out = collapsed.trim_matches(|c| c == ' ' || c == '_').trim_matches('.');
    if out.is_empty() || out == "." || out == ".." {
        return None;
    }
    Some(out.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(path: &Path, bytes: usize, modified: SystemTime) {
        fs::write(path, "x".repeat(bytes)).unwrap();
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[test]
    fn sanitize_maps_and_rejects() {
        assert_eq!(sanitize_run_id("fire-abc_1.2").as_deref(), Some("fire-abc_1.2"));
        assert_eq!(sanitize_run_id("a/b c").as_deref(), Some("a_b_c"));
        assert_eq!(sanitize_run_id("x...y").as_deref(), Some("x.y"));
        assert_eq!(sanitize_run_id("../etc/passwd").as_deref(), Some("etc_passwd"));
        assert_eq!(sanitize_run_id(".."), None);
        assert_eq!(sanitize_run_id("."), None);
        assert_eq!(sanitize_run_id(""), None);
        assert_eq!(sanitize_run_id("///"), None);
    }

    #[test]
    fn prune_deletes_oldest_until_size_within_limit() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        let paths: Vec<PathBuf> = ["a.jsonl", "b.jsonl", "c.jsonl"]
            .iter()
            .map(|n| dir.path().join(n))
            .collect();
        for (i, p) in paths.iter().enumerate() {
            touch(p, 10, base + Duration::from_secs(60 * i as u64));
        }

        prune_archive_dir(dir.path(), 10, 15, &HashSet::new()).unwrap();
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
        assert!(paths[2].exists());
    }

    #[test]
    fn prune_skips_protected_paths() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        let old = dir.path().join("old.jsonl.tmp");
        let newer = dir.path().join("newer.jsonl");
        touch(&old, 5, base);
        touch(&newer, 5, base + Duration::from_secs(60));

        let protected: HashSet<PathBuf> = [old.clone()].into_iter().collect();
        prune_archive_dir(dir.path(), 0, u64::MAX, &protected).unwrap();
        assert!(old.exists());
        assert!(!newer.exists());
    }

    #[test]
    fn prune_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        prune_archive_dir(&dir.path().join("missing"), 1, 1, &HashSet::new()).unwrap();
    }

    #[test]
    fn archive_renames_on_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let mut archiver = Archiver::new(runs.clone(), &BusConfig::default());

        let mut started = RunEvent::new("r-arch", kind::RUN_STARTED, step::FIRE, Level::Info);
        started.seq = 1;
        assert!(archiver.record(&started).is_empty());
        assert!(runs.join("r-arch.jsonl.tmp").exists());
        assert!(archiver.archive("r-arch").unwrap().is_open());

        let mut finished = RunEvent::new("r-arch", kind::RUN_FINISHED, step::FIRE, Level::Info);
        finished.seq = 2;
        assert!(archiver.record(&finished).is_empty());
        assert!(!runs.join("r-arch.jsonl.tmp").exists());
        let raw = fs::read_to_string(runs.join("r-arch.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(archiver.archive("r-arch").unwrap().is_finalized());

        // Events after finalization are ignored.
        let late = RunEvent::new("r-arch", kind::PROGRESS, step::FIRE, Level::Info);
        assert!(archiver.record(&late).is_empty());
        let raw = fs::read_to_string(runs.join("r-arch.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn too_large_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BusConfig {
            max_archive_bytes: 120,
            ..BusConfig::default()
        };
        let mut archiver = Archiver::new(dir.path().to_path_buf(), &cfg);

        let mut reported = Vec::new();
        for i in 1..=5 {
            let mut event = RunEvent::new("big", kind::PROCESS_STDOUT, step::FIRE, Level::Info)
                .with_data(json!({ "text": "y".repeat(60) }));
            event.seq = i;
            reported.extend(archiver.record(&event));
        }
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].field("code"), Some(&json!("ARCHIVE_TOO_LARGE")));
        assert_eq!(reported[0].step, step::ARCHIVE);
        assert!(archiver.archive("big").unwrap().bytes_written() <= 120);
    }

    #[test]
    fn oversized_terminal_event_still_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BusConfig {
            max_archive_bytes: 150,
            ..BusConfig::default()
        };
        let mut archiver = Archiver::new(dir.path().to_path_buf(), &cfg);

        let mut started = RunEvent::new("tail", kind::RUN_STARTED, step::FIRE, Level::Info);
        started.seq = 1;
        assert!(archiver.record(&started).is_empty());

        let mut finished = RunEvent::new("tail", kind::RUN_FINISHED, step::FIRE, Level::Info)
            .with_data(json!({ "reason": "completed", "pad": "z".repeat(100) }));
        finished.seq = 2;
        let failures = archiver.record(&finished);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field("code"), Some(&json!("ARCHIVE_TOO_LARGE")));

        let arch = archiver.archive("tail").unwrap();
        assert!(arch.is_finalized());
        assert!(!arch.is_open());
        assert!(!dir.path().join("tail.jsonl.tmp").exists());
        let raw = fs::read_to_string(dir.path().join("tail.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }

    #[test]
    fn unwritable_dir_reports_create_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a dir").unwrap();
        let mut archiver = Archiver::new(blocker.join("runs"), &BusConfig::default());

        let event = RunEvent::new("r", kind::RUN_STARTED, step::FIRE, Level::Info);
        let failures = archiver.record(&event);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field("code"), Some(&json!("ARCHIVE_CREATE_FAILED")));

        // Stopped archives stay quiet until the terminal event.
        assert!(archiver.record(&event).is_empty());
        let finished = RunEvent::new("r", kind::RUN_FINISHED, step::FIRE, Level::Info);
        assert!(archiver.record(&finished).is_empty());
        assert!(archiver.archive("r").unwrap().is_finalized());
    }
}
