use agentflow_protocol::{Level, RunEvent, RunId, kind, now_timestamp, step};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::archive::Archiver;
use crate::config::BusConfig;
use crate::run_log::{RunLog, govern_process_output};

type SubscriberId = u64;

struct BusState {
    runs: HashMap<RunId, RunLog>,
    global: HashMap<SubscriberId, mpsc::Sender<RunEvent>>,
    per_run: HashMap<RunId, HashMap<SubscriberId, mpsc::Sender<RunEvent>>>,
    next_subscriber: SubscriberId,
    archiver: Option<Archiver>,
}

struct BusInner {
    cfg: BusConfig,
    state: Mutex<BusState>,
    /// Serialises fan-out so every subscriber observes a run in sequence
    /// order. Always taken while `state` is held, then `state` is released.
    delivery: Mutex<()>,
}

/// In-memory run event log with fan-out to live subscribers.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(cfg: BusConfig) -> Self {
        let cfg = cfg.normalized();
        let archiver = cfg
            .archive_dir
            .clone()
            .map(|dir| Archiver::new(dir, &cfg));
        Self {
            inner: Arc::new(BusInner {
                cfg,
                state: Mutex::new(BusState {
                    runs: HashMap::new(),
                    global: HashMap::new(),
                    per_run: HashMap::new(),
                    next_subscriber: 1,
                    archiver,
                }),
                delivery: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.cfg
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.inner
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `event` and deliver it, plus any synthetic events it caused.
    ///
    /// Returns the event as recorded: timestamped, sequenced and possibly
    /// truncated. Never blocks on subscribers.
    pub fn publish(&self, event: RunEvent) -> RunEvent {
        let mut state = self.lock_state();
        let batch = self.record_locked(&mut state, event);
        let primary = batch[0].clone();
        let deliveries = collect_targets(&state, batch);

        let gate = self.lock_delivery();
        drop(state);
        deliver(deliveries);
        drop(gate);

        primary
    }

    /// Returns the recorded events, primary first, then synthetic ones in
    /// the order they were produced.
    fn record_locked(&self, state: &mut BusState, event: RunEvent) -> Vec<RunEvent> {
        let limit = self.inner.cfg.max_process_text_bytes;
        let (event, truncated) = govern_process_output(event, limit);

        let mut batch = Vec::with_capacity(1);
        self.append_locked(state, event, &mut batch);

        let run_id = batch[0].run_id.clone();
        if truncated && !run_id.is_empty() {
            let first_warning = state
                .runs
                .get_mut(&run_id)
                .is_some_and(|log| !std::mem::replace(&mut log.governance_warning_emitted, true));
            if first_warning {
                self.append_locked(state, governance_warning(&run_id, limit), &mut batch);
            }
        }
        batch
    }

    fn append_locked(&self, state: &mut BusState, mut event: RunEvent, out: &mut Vec<RunEvent>) {
        if event.ts.is_empty() {
            event.ts = now_timestamp();
        }
        if event.is_global() {
            out.push(event);
            return;
        }

        let max_events = self.inner.cfg.max_events_per_run;
        let BusState { runs, archiver, .. } = state;
        let log = runs
            .entry(event.run_id.clone())
            .or_insert_with(|| RunLog::new(max_events));
        let event = log.push(event);
        out.push(event.clone());

        let Some(archiver) = archiver.as_mut() else {
            return;
        };
        for mut failure in archiver.record(&event) {
            failure.ts = now_timestamp();
            let failure = log.push(failure);
            // Failures while archiving a failure report are not reported again.
            let _ = archiver.record(&failure);
            out.push(failure);
        }
    }

    /// Subscribe to every event on the bus, global and per-run.
    pub fn subscribe_all(&self) -> Subscription {
        self.replay_and_subscribe("", 0)
    }

    /// Atomically snapshot the retained events of `run_id` with
    /// `seq > since_seq` and register a live subscriber for that run.
    ///
    /// An empty `run_id` subscribes to the global feed with no backlog.
    /// When events the caller has not seen were already evicted, the
    /// subscription reports `truncated()` and a one-time warning is
    /// published for the run.
    pub fn replay_and_subscribe(&self, run_id: &str, since_seq: u64) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.cfg.subscriber_buffer);

        let mut state = self.lock_state();
        let gate = self.lock_delivery();

        let id = state.next_subscriber;
        state.next_subscriber += 1;

        if run_id.is_empty() {
            state.global.insert(id, tx);
            drop(gate);
            drop(state);
            debug!(subscriber = id, "global subscriber registered");
            return Subscription::new(self, id, None, Vec::new(), false, rx);
        }

        let (replay, truncated, first_warning) = match state.runs.get_mut(run_id) {
            Some(log) => {
                let truncated = log.evicted_since(since_seq);
                let first_warning =
                    truncated && !std::mem::replace(&mut log.replay_truncate_emitted, true);
                (log.replay_from(since_seq), truncated, first_warning)
            }
            None => (Vec::new(), false, false),
        };
        state
            .per_run
            .entry(run_id.to_string())
            .or_default()
            .insert(id, tx);
        drop(gate);
        drop(state);

        debug!(
            subscriber = id,
            run_id = %run_id,
            since_seq,
            backlog = replay.len(),
            truncated,
            "run subscriber registered"
        );

        if first_warning {
            self.publish(replay_truncated_warning(run_id));
        }

        Subscription::new(self, id, Some(run_id.to_string()), replay, truncated, rx)
    }

    /// Highest sequence number assigned for `run_id` so far.
    pub fn last_seq(&self, run_id: &str) -> Option<u64> {
        self.lock_state().runs.get(run_id).map(RunLog::last_seq)
    }

    /// Number of events currently retained in memory for `run_id`.
    pub fn retained(&self, run_id: &str) -> usize {
        self.lock_state().runs.get(run_id).map_or(0, RunLog::len)
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.lock_state();
        state.global.len() + state.per_run.values().map(HashMap::len).sum::<usize>()
    }

    fn unsubscribe(&self, id: SubscriberId, run_id: Option<&str>) {
        let mut state = self.lock_state();
        match run_id {
            None => {
                state.global.remove(&id);
            }
            Some(run_id) => {
                if let Some(subs) = state.per_run.get_mut(run_id) {
                    subs.remove(&id);
                    if subs.is_empty() {
                        state.per_run.remove(run_id);
                    }
                }
            }
        }
        debug!(subscriber = id, "subscriber removed");
    }
}

fn collect_targets(
    state: &BusState,
    batch: Vec<RunEvent>,
) -> Vec<(RunEvent, Vec<mpsc::Sender<RunEvent>>)> {
    batch
        .into_iter()
        .map(|event| {
            let mut targets: Vec<_> = state.global.values().cloned().collect();
            if let Some(subs) = state.per_run.get(&event.run_id) {
                targets.extend(subs.values().cloned());
            }
            (event, targets)
        })
        .collect()
}

fn deliver(deliveries: Vec<(RunEvent, Vec<mpsc::Sender<RunEvent>>)>) {
    for (event, targets) in deliveries {
        for tx in targets {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event.clone()) {
                debug!(run_id = %dropped.run_id, seq = dropped.seq, "subscriber full; event dropped");
            }
        }
    }
}

fn governance_warning(run_id: &str, limit: usize) -> RunEvent {
    RunEvent::new(run_id, kind::PROGRESS, step::GOVERNANCE, Level::Warn).with_data(json!({
        "phase": "warning",
        "completeDetected": false,
        "note": format!("process output truncated to {limit} bytes per message"),
        "limitBytes": limit,
    }))
}

fn replay_truncated_warning(run_id: &str) -> RunEvent {
    RunEvent::new(run_id, kind::PROGRESS, step::STREAM, Level::Warn).with_data(json!({
        "phase": "error",
        "completeDetected": false,
        "note": "replay truncated; some events missing",
    }))
}

/// A live feed from an [`EventBus`], preceded by a replay backlog.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    replay: Vec<RunEvent>,
    truncated: bool,
    receiver: mpsc::Receiver<RunEvent>,
    bus: Weak<BusInner>,
    id: SubscriberId,
    run_id: Option<RunId>,
}

impl Subscription {
    fn new(
        bus: &EventBus,
        id: SubscriberId,
        run_id: Option<RunId>,
        replay: Vec<RunEvent>,
        truncated: bool,
        receiver: mpsc::Receiver<RunEvent>,
    ) -> Self {
        Self {
            replay,
            truncated,
            receiver,
            bus: Arc::downgrade(&bus.inner),
            id,
            run_id,
        }
    }

    /// Events with `seq > since_seq` that were retained at subscribe time.
    pub fn replay(&self) -> &[RunEvent] {
        &self.replay
    }

    pub fn take_replay(&mut self) -> Vec<RunEvent> {
        std::mem::take(&mut self.replay)
    }

    /// True when events after the requested cursor had already been evicted.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<RunEvent, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.unsubscribe(self.id, self.run_id.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::{Duration, SystemTime};

    fn stdout(run_id: &str, text: &str) -> RunEvent {
        RunEvent::new(run_id, kind::PROCESS_STDOUT, step::FIRE, Level::Info)
            .with_data(json!({ "text": text }))
    }

    fn small_bus(max_text: usize, max_events: usize) -> EventBus {
        EventBus::new(BusConfig {
            max_process_text_bytes: max_text,
            max_events_per_run: max_events,
            ..BusConfig::default()
        })
    }

    #[tokio::test]
    async fn oversized_output_truncated_with_one_warning() {
        let bus = small_bus(5, 100);
        let mut sub = bus.replay_and_subscribe("r1", 0);

        let recorded = bus.publish(stdout("r1", "hello world"));
        assert_eq!(recorded.seq, 1);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.text(), Some("hello"));
        assert_eq!(first.field("truncated"), Some(&json!(true)));
        assert_eq!(first.field("originalBytes"), Some(&json!(11)));

        let warning = sub.recv().await.unwrap();
        assert_eq!(warning.kind, kind::PROGRESS);
        assert_eq!(warning.step, step::GOVERNANCE);
        assert_eq!(warning.level, Level::Warn);
        assert_eq!(warning.field("limitBytes"), Some(&json!(5)));
        assert_eq!(warning.seq, 2);

        bus.publish(stdout("r1", "another long line"));
        let second = sub.recv().await.unwrap();
        assert_eq!(second.seq, 3);
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn eviction_reported_on_replay_with_single_warning() {
        let bus = small_bus(1024, 2);
        for i in 0..5 {
            bus.publish(stdout("r2", &format!("line {i}")));
        }

        let mut sub = bus.replay_and_subscribe("r2", 1);
        let seqs: Vec<u64> = sub.replay().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert!(sub.truncated());

        let warning = sub.recv().await.unwrap();
        assert_eq!(warning.seq, 6);
        assert_eq!(warning.step, step::STREAM);
        assert_eq!(
            warning.field("note"),
            Some(&json!("replay truncated; some events missing"))
        );

        // A second lagging client sees the truncation but no new warning.
        let mut again = bus.replay_and_subscribe("r2", 0);
        assert!(again.truncated());
        assert!(again.try_recv().is_err());
        assert!(sub.try_recv().is_err());
        assert_eq!(bus.last_seq("r2"), Some(6));
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gap_or_duplicate() {
        let bus = small_bus(1024, 100);
        for i in 0..3 {
            bus.publish(stdout("r3", &format!("{i}")));
        }
        let mut sub = bus.replay_and_subscribe("r3", 1);
        assert!(!sub.truncated());
        for i in 3..6 {
            bus.publish(stdout("r3", &format!("{i}")));
        }

        let mut seqs: Vec<u64> = sub.take_replay().into_iter().map(|e| e.seq).collect();
        while let Ok(event) = sub.try_recv() {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn global_and_run_scoped_delivery() {
        let bus = small_bus(1024, 100);
        let mut all = bus.subscribe_all();
        let mut only_a = bus.replay_and_subscribe("a", 0);

        bus.publish(stdout("a", "x"));
        bus.publish(stdout("b", "y"));
        let global = bus.publish(RunEvent::new("", "notice", "", Level::Info));
        assert_eq!(global.seq, 0);
        assert!(!global.ts.is_empty());

        let got: Vec<String> = (0..3)
            .map(|_| all.try_recv().unwrap().run_id)
            .collect();
        assert_eq!(got, vec!["a", "b", ""]);

        assert_eq!(only_a.try_recv().unwrap().run_id, "a");
        assert!(only_a.try_recv().is_err());
        assert!(bus.last_seq("").is_none());
    }

    #[tokio::test]
    async fn stalled_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(BusConfig {
            subscriber_buffer: 2,
            ..BusConfig::default()
        });
        let mut slow = bus.replay_and_subscribe("r", 0);
        for i in 0..10 {
            bus.publish(stdout("r", &format!("{i}")));
        }
        assert_eq!(slow.try_recv().unwrap().seq, 1);
        assert_eq!(slow.try_recv().unwrap().seq, 2);
        assert!(slow.try_recv().is_err());
        assert_eq!(bus.last_seq("r"), Some(10));
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let bus = small_bus(1024, 100);
        let a = bus.subscribe_all();
        let b = bus.replay_and_subscribe("r", 0);
        assert_eq!(bus.subscriber_count(), 2);
        drop(a);
        b.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(stdout("r", "still fine"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_deliver_in_sequence_order() {
        let bus = EventBus::new(BusConfig {
            subscriber_buffer: 1024,
            ..BusConfig::default()
        });
        let mut sub = bus.replay_and_subscribe("race", 0);

        let mut tasks = Vec::new();
        for t in 0..4 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    bus.publish(stdout("race", &format!("{t}-{i}")));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut expected = 1;
        while let Ok(event) = sub.try_recv() {
            assert_eq!(event.seq, expected);
            expected += 1;
        }
        assert_eq!(expected, 201);
    }

    #[tokio::test]
    async fn archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(BusConfig {
            archive_dir: Some(dir.path().to_path_buf()),
            ..BusConfig::default()
        });

        let mut recorded = vec![bus.publish(RunEvent::new(
            "fire-1",
            kind::RUN_STARTED,
            step::FIRE,
            Level::Info,
        ))];
        for line in ["one", "two\nwith newline", "three"] {
            recorded.push(bus.publish(stdout("fire-1", line)));
        }
        recorded.push(bus.publish(
            RunEvent::new("fire-1", kind::RUN_FINISHED, step::FIRE, Level::Info)
                .with_data(json!({ "ok": true, "reason": "completed" })),
        ));

        assert!(!dir.path().join("fire-1.jsonl.tmp").exists());
        let raw = std::fs::read_to_string(dir.path().join("fire-1.jsonl")).unwrap();
        let decoded: Vec<RunEvent> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(decoded, recorded);
    }

    #[tokio::test]
    async fn archive_failure_is_published_once() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let bus = EventBus::new(BusConfig {
            archive_dir: Some(blocker.join("runs")),
            ..BusConfig::default()
        });
        let mut sub = bus.replay_and_subscribe("r", 0);

        bus.publish(stdout("r", "a"));
        bus.publish(stdout("r", "b"));

        let kinds: Vec<(String, Option<Value>)> = std::iter::from_fn(|| sub.try_recv().ok())
            .map(|e| (e.kind.clone(), e.field("code").cloned()))
            .collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0].0, kind::PROCESS_STDOUT);
        assert_eq!(kinds[1].0, kind::ERROR);
        assert_eq!(kinds[1].1, Some(json!("ARCHIVE_CREATE_FAILED")));
        assert_eq!(kinds[2].0, kind::PROCESS_STDOUT);
    }

    #[tokio::test]
    async fn new_archive_keeps_directory_within_retention() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(24 * 3600);
        for i in 0..55u64 {
            let path = dir.path().join(format!("old-{i:02}.jsonl"));
            std::fs::write(&path, "{}\n").unwrap();
            let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.set_modified(base + Duration::from_secs(i)).unwrap();
        }

        let bus = EventBus::new(BusConfig {
            archive_dir: Some(dir.path().to_path_buf()),
            ..BusConfig::default()
        });
        bus.publish(stdout("fresh", "hi"));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 50);
        assert!(names.contains(&"fresh.jsonl.tmp".to_string()));
        // The six oldest went.
        for i in 0..6 {
            assert!(!names.contains(&format!("old-{i:02}.jsonl")));
        }
        assert!(names.contains(&"old-06.jsonl".to_string()));
    }
}
