use agentflow_protocol::{Level, RunEvent, RunId, kind, step};
use serde_json::json;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::SupervisorConfig;
use crate::error::FireError;
use crate::markers::{MarkerClassifier, ProgressTracker};
use crate::procgroup::{self, ExitOutcome, GroupHandle, ProcessGroup, decode_exit_status};

/// External coding agents the loop script knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireTool {
    Codex,
    Claude,
}

impl FireTool {
    pub const ALL: [FireTool; 2] = [FireTool::Codex, FireTool::Claude];

    pub fn as_str(self) -> &'static str {
        match self {
            FireTool::Codex => "codex",
            FireTool::Claude => "claude",
        }
    }

    /// Case-insensitive, surrounding whitespace ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for FireTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Interrupt,
    Kill,
}

impl StopSignal {
    fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

#[derive(Debug)]
struct StopRequest {
    signal: StopSignal,
    requested_at: Instant,
}

#[derive(Debug)]
struct ActiveRun {
    run_id: RunId,
    group: GroupHandle,
    stop: Option<StopRequest>,
    /// Set once the finalizer has settled the outcome; the slot is about to be released.
    finished: bool,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub run_id: Option<RunId>,
    /// True while the process tree is still going away.
    pub stopping: bool,
}

impl StopOutcome {
    fn idle() -> Self {
        Self {
            run_id: None,
            stopping: false,
        }
    }
}

struct SupervisorInner {
    cfg: SupervisorConfig,
    root: PathBuf,
    bus: EventBus,
    classifier: MarkerClassifier,
    procs: Arc<dyn ProcessGroup>,
    active: Mutex<Option<ActiveRun>>,
}

impl SupervisorInner {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_active(&self, run_id: &str) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|run| run.run_id == run_id) {
            *active = None;
        }
    }

    /// Close the run to further stop requests and return the stop signal
    /// last issued, if any.
    fn mark_finished(&self, run_id: &str) -> Option<(StopSignal, Instant)> {
        let mut active = self.lock_active();
        let run = active.as_mut().filter(|run| run.run_id == run_id)?;
        run.finished = true;
        run.stop.as_ref().map(|stop| (stop.signal, stop.requested_at))
    }

    fn is_live(&self, run_id: &str) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|run| run.run_id == run_id && !run.finished)
    }
}

/// Owns the single active supervised run.
#[derive(Clone)]
pub struct RunSupervisor {
    inner: Arc<SupervisorInner>,
}

impl RunSupervisor {
    pub fn new(cfg: SupervisorConfig, bus: EventBus) -> Result<Self, FireError> {
        Self::with_process_group(cfg, bus, procgroup::platform())
    }

    pub fn with_process_group(
        cfg: SupervisorConfig,
        bus: EventBus,
        procs: Arc<dyn ProcessGroup>,
    ) -> Result<Self, FireError> {
        let classifier = MarkerClassifier::new(&cfg.markers)?;
        let root = std::path::absolute(&cfg.project_root)
            .map_err(|err| FireError::UnsafePath(format!("project root: {err}")))?;
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                cfg,
                root,
                bus,
                classifier,
                procs,
                active: Mutex::new(None),
            }),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn project_root(&self) -> &Path {
        &self.inner.root
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.inner.lock_active().as_ref().map(|run| run.run_id.clone())
    }

    /// Validate the request, launch the loop script and begin streaming its
    /// output onto the bus.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, tool: &str, max_iterations: i64) -> Result<RunId, FireError> {
        let inner = &self.inner;
        let tool = FireTool::parse(tool).ok_or_else(|| FireError::InvalidTool {
            allowed: FireTool::ALL.iter().map(|t| t.as_str()).collect(),
        })?;
        if !inner.cfg.max_iterations.contains(&max_iterations) {
            return Err(FireError::InvalidIterations {
                min: *inner.cfg.max_iterations.start(),
                max: *inner.cfg.max_iterations.end(),
            });
        }
        for name in &inner.cfg.required_files {
            require_regular_file(&inner.root, name)?;
        }
        let script = require_regular_file(&inner.root, &inner.cfg.script)?;

        let argv = vec![
            inner.cfg.interpreter.clone(),
            script.display().to_string(),
            "--tool".to_string(),
            tool.as_str().to_string(),
            max_iterations.to_string(),
        ];

        let run_id = format!("fire-{}", Uuid::new_v4().simple());
        let (mut child, pid, started) = {
            let mut active = inner.lock_active();
            if active.is_some() {
                return Err(FireError::AlreadyActive);
            }

            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..])
                .current_dir(&inner.root)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            inner.procs.configure(&mut cmd);

            let child = cmd.spawn().map_err(|err| {
                warn!(interpreter = %inner.cfg.interpreter, "failed to spawn run: {err}");
                if err.kind() == io::ErrorKind::NotFound {
                    FireError::InterpreterNotFound(inner.cfg.interpreter.clone())
                } else {
                    FireError::Spawn(err)
                }
            })?;
            let pid = child.id().unwrap_or_default();
            *active = Some(ActiveRun {
                run_id: run_id.clone(),
                group: GroupHandle::leader(pid),
                stop: None,
                finished: false,
            });
            (child, pid, Instant::now())
        };

        info!(run_id = %run_id, pid, tool = %tool, max_iterations, "run started");
        inner.bus.publish(
            RunEvent::new(run_id.clone(), kind::RUN_STARTED, step::FIRE, Level::Info).with_data(
                json!({
                    "op": "fire",
                    "cwd": inner.root.display().to_string(),
                    "tool": tool.as_str(),
                    "maxIterations": max_iterations,
                    "pid": pid,
                    "cmd": argv,
                }),
            ),
        );

        let tracker = Arc::new(Mutex::new(ProgressTracker::new(tool.as_str(), max_iterations)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                inner.clone(),
                run_id.clone(),
                kind::PROCESS_STDOUT,
                stdout,
                tracker.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                inner.clone(),
                run_id.clone(),
                kind::PROCESS_STDERR,
                stderr,
                tracker,
            ));
        }

        tokio::spawn(finalize(inner.clone(), run_id.clone(), child, readers, started));
        Ok(run_id)
    }

    /// Stop the active run: interrupt, wait out the grace period, then kill.
    ///
    /// Idempotent. A second call while a stop is in flight does not signal
    /// again.
    pub async fn stop(&self) -> StopOutcome {
        let inner = &self.inner;
        let (run_id, group) = {
            let mut active = inner.lock_active();
            let Some(run) = active.as_mut().filter(|run| !run.finished) else {
                return StopOutcome::idle();
            };
            if run.stop.is_some() {
                return StopOutcome {
                    run_id: Some(run.run_id.clone()),
                    stopping: true,
                };
            }
            run.stop = Some(StopRequest {
                signal: StopSignal::Interrupt,
                requested_at: Instant::now(),
            });
            // Published under the slot lock so it cannot land after run_finished.
            inner.bus.publish(stop_progress(
                &run.run_id,
                Level::Info,
                "Stop requested; sending SIGINT.",
            ));
            (run.run_id.clone(), run.group)
        };

        info!(run_id = %run_id, pgid = group.pgid, "stop requested");
        self.signal(group, StopSignal::Interrupt).await;

        let deadline = tokio::time::Instant::now() + inner.cfg.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if !inner.is_live(&run_id) || !self.group_exists(group).await {
                return StopOutcome {
                    run_id: Some(run_id),
                    stopping: false,
                };
            }
            tokio::time::sleep(inner.cfg.stop_poll_interval).await;
        }

        {
            let mut active = inner.lock_active();
            let Some(stop) = active
                .as_mut()
                .filter(|run| run.run_id == run_id && !run.finished)
                .and_then(|run| run.stop.as_mut())
            else {
                // Exited at the end of the grace window; the pgid may already be reused.
                return StopOutcome {
                    run_id: Some(run_id),
                    stopping: false,
                };
            };
            stop.signal = StopSignal::Kill;
            inner.bus.publish(stop_progress(
                &run_id,
                Level::Warn,
                "Process did not exit after SIGINT; sent SIGKILL.",
            ));
        }
        warn!(run_id = %run_id, pgid = group.pgid, "run ignored SIGINT; escalating");
        self.signal(group, StopSignal::Kill).await;

        StopOutcome {
            run_id: Some(run_id),
            stopping: true,
        }
    }

    async fn signal(&self, group: GroupHandle, signal: StopSignal) {
        let procs = self.inner.procs.clone();
        let result = tokio::task::spawn_blocking(move || match signal {
            StopSignal::Interrupt => procs.interrupt(group),
            StopSignal::Kill => procs.kill(group),
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(pgid = group.pgid, signal = signal.name(), "signal failed: {err}"),
            Err(err) => warn!(pgid = group.pgid, "signal task failed: {err}"),
        }
    }

    async fn group_exists(&self, group: GroupHandle) -> bool {
        let procs = self.inner.procs.clone();
        tokio::task::spawn_blocking(move || procs.exists(group))
            .await
            .unwrap_or(false)
    }
}

fn stop_progress(run_id: &str, level: Level, note: &str) -> RunEvent {
    RunEvent::new(run_id, kind::PROGRESS, step::FIRE, level).with_data(json!({
        "phase": "stopped",
        "note": note,
    }))
}

/// Resolve `name` under `root`, requiring a plain regular file.
fn require_regular_file(root: &Path, name: &str) -> Result<PathBuf, FireError> {
    let rel = Path::new(name);
    let mut components = rel.components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single {
        return Err(FireError::UnsafePath(name.to_string()));
    }

    let path = root.join(rel);
    let meta = match std::fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(FireError::MissingArtifact(name.to_string()));
        }
        Err(source) => {
            return Err(FireError::ArtifactStat {
                name: name.to_string(),
                source,
            });
        }
    };
    if meta.file_type().is_symlink() {
        return Err(FireError::SymlinkArtifact(name.to_string()));
    }
    if !meta.is_file() {
        return Err(FireError::NotRegularFile(name.to_string()));
    }
    Ok(path)
}

fn spawn_reader<R>(
    inner: Arc<SupervisorInner>,
    run_id: RunId,
    kind: &'static str,
    stream: R,
    tracker: Arc<Mutex<ProgressTracker>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let max = inner.cfg.max_line_bytes.max(1) as u64;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match (&mut reader).take(max).read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(run_id = %run_id, stream = kind, "output read failed: {err}");
                    inner.bus.publish(
                        RunEvent::new(run_id.clone(), kind::ERROR, step::FIRE, Level::Error)
                            .with_data(json!({
                                "message": format!("failed to read process output: {err}"),
                            })),
                    );
                    break;
                }
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&buf);
            publish_line(&inner, &run_id, kind, &line, &tracker);
        }
        debug!(run_id = %run_id, stream = kind, "output reader done");
    })
}

fn publish_line(
    inner: &SupervisorInner,
    run_id: &str,
    kind: &'static str,
    line: &str,
    tracker: &Mutex<ProgressTracker>,
) {
    let class = inner.classifier.classify(line);
    let progress = tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .observe(&class);
    let event = match progress {
        Some(data) => RunEvent::new(run_id, kind::PROGRESS, step::FIRE, Level::Info).with_data(data),
        None => RunEvent::new(run_id, kind, step::FIRE, Level::Info).with_data(json!({ "text": line })),
    };
    inner.bus.publish(event);
}

async fn finalize(
    inner: Arc<SupervisorInner>,
    run_id: RunId,
    mut child: Child,
    mut readers: Vec<JoinHandle<()>>,
    started: Instant,
) {
    let outcome = match child.wait().await {
        Ok(status) => decode_exit_status(status),
        Err(err) => {
            warn!(run_id = %run_id, "failed to wait for run: {err}");
            ExitOutcome {
                success: false,
                code: Some(-1),
                signal: None,
            }
        }
    };

    // Children that inherited the pipes can keep them open past our exit.
    let drain_deadline = tokio::time::Instant::now() + inner.cfg.output_drain_timeout;
    for reader in &mut readers {
        if tokio::time::timeout_at(drain_deadline, &mut *reader).await.is_err() {
            warn!(run_id = %run_id, "output still open after exit; abandoning reader");
            reader.abort();
        }
    }

    let (ok, reason, level, exit_code, signal) = match inner.mark_finished(&run_id) {
        Some((stop_signal, requested_at)) => {
            debug!(
                run_id = %run_id,
                since_stop_ms = requested_at.elapsed().as_millis() as u64,
                "stopped run exited"
            );
            (false, "stopped", Level::Info, None, Some(stop_signal.name().to_string()))
        }
        None if outcome.success => (true, "completed", Level::Info, outcome.code, None),
        None => (false, "error", Level::Error, outcome.code, outcome.signal),
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    info!(run_id = %run_id, reason, ?exit_code, ?signal, duration_ms, "run finished");
    inner.bus.publish(
        RunEvent::new(run_id.clone(), kind::RUN_FINISHED, step::FIRE, level).with_data(json!({
            "op": "fire",
            "ok": ok,
            "reason": reason,
            "durationMs": duration_ms,
            "exitCode": exit_code,
            "signal": signal,
        })),
    );

    inner.clear_active(&run_id);
}
