//! Job sessions and their progress.
//!
//! [`ProgressStore`] is the process-wide table of sessions. The orchestrator
//! is the only writer for a given session; any number of pollers read
//! snapshots or subscribe to a [`tokio::sync::watch`] channel that carries
//! every published state (see [`crate::stream::progress_stream`]).
//!
//! One `RwLock` guards the whole table. Every mutation happens under the
//! write lock and publishes a full snapshot, so readers never see a
//! half-applied update: the result, filename, and `completed` status of a
//! finished job appear together.
//!
//! Transitions are one-way: `pending → running → completed | failed`, and
//! nothing changes a session once it is terminal. Percent never decreases;
//! it stays below 100 until the job completes.
//!
//! [`ProgressSink`] is the fire-and-forget observer contract. Implement it to
//! forward events elsewhere (a terminal bar, a log, a metrics counter).

use crate::output::JobResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines and file names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Where the orchestrator is inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobStage {
    Created,
    ReadingSource,
    Chunking,
    /// Sending chunk `done + 1` of `total`.
    Generating { done: usize, total: usize },
    /// Parsing the reply to chunk `done + 1` of `total`.
    Parsing { done: usize, total: usize },
    Reconciling,
    Materializing,
    Completed,
    Failed,
}

/// Point-in-time copy of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: SessionId,
    pub status: JobStatus,
    pub stage: JobStage,
    /// 0–100; 100 only once completed.
    pub percent: u8,
    pub message: String,
    pub error: Option<String>,
    /// Present once completed.
    #[serde(skip)]
    pub result: Option<Arc<JobResult>>,
}

impl SessionSnapshot {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            status: JobStatus::Pending,
            stage: JobStage::Created,
            percent: 0,
            message: "Queued".into(),
            error: None,
            result: None,
        }
    }

    /// Percent, with `-1` standing for failure.
    pub fn progress(&self) -> i32 {
        if self.status == JobStatus::Failed {
            -1
        } else {
            i32::from(self.percent)
        }
    }
}

/// Fire-and-forget observer of job progress. Implementations must not
/// panic and should return quickly; they run on the job's task.
pub trait ProgressSink: Send + Sync {
    /// Overall progress changed.
    fn update(&self, session: SessionId, percent: u8, message: &str);

    /// A chunk finished; `chunk` is 1-based.
    fn on_chunk_complete(&self, session: SessionId, chunk: usize, total: usize, records: usize) {
        let _ = (session, chunk, total, records);
    }

    /// A chunk failed and contributes no records; `chunk` is 1-based.
    fn on_chunk_error(&self, session: SessionId, chunk: usize, total: usize, error: &str) {
        let _ = (session, chunk, total, error);
    }
}

/// A sink that ignores everything.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn update(&self, _session: SessionId, _percent: u8, _message: &str) {}
}

struct SessionEntry {
    snapshot: SessionSnapshot,
    tx: watch::Sender<SessionSnapshot>,
    finished_at: Option<Instant>,
}

/// Process-wide session table.
#[derive(Default)]
pub struct ProgressStore {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressStore")
            .field("sessions", &self.len())
            .finish()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `pending` session.
    pub fn create(&self) -> SessionId {
        let session = SessionId::new();
        let snapshot = SessionSnapshot::new(session);
        let (tx, _rx) = watch::channel(snapshot.clone());
        self.write().insert(
            session,
            SessionEntry {
                snapshot,
                tx,
                finished_at: None,
            },
        );
        debug!("Session {} created", session.short());
        session
    }

    pub fn snapshot(&self, session: SessionId) -> Option<SessionSnapshot> {
        self.read().get(&session).map(|e| e.snapshot.clone())
    }

    /// Receiver that sees every state published from now on.
    pub fn subscribe(&self, session: SessionId) -> Option<watch::Receiver<SessionSnapshot>> {
        self.read().get(&session).map(|e| e.tx.subscribe())
    }

    /// Move a running job to `stage` with `percent` (clamped to 0–99, never
    /// lowered). Returns `false` if the session is unknown or terminal.
    pub fn advance(&self, session: SessionId, stage: JobStage, percent: u8, message: &str) -> bool {
        self.mutate(session, |s| {
            s.status = JobStatus::Running;
            s.stage = stage;
            s.percent = s.percent.max(percent.min(99));
            s.message = message.to_string();
        })
    }

    /// Publish the result, filename, 100 %, and `completed` in one step.
    pub fn complete(&self, session: SessionId, result: Arc<JobResult>) -> bool {
        let message = format!(
            "Completed: {} rows → {}",
            result.record_count(),
            result.filename
        );
        self.mutate(session, |s| {
            s.status = JobStatus::Completed;
            s.stage = JobStage::Completed;
            s.percent = 100;
            s.message = message;
            s.result = Some(result);
        })
    }

    /// Publish `failed` and the error description in one step.
    pub fn fail(&self, session: SessionId, error: &str) -> bool {
        self.mutate(session, |s| {
            s.status = JobStatus::Failed;
            s.stage = JobStage::Failed;
            s.message = format!("Error: {error}");
            s.error = Some(error.to_string());
        })
    }

    /// Remove a session, typically after its artifact was downloaded.
    /// Subscribers see their stream end.
    pub fn evict(&self, session: SessionId) -> Option<SessionSnapshot> {
        self.write().remove(&session).map(|e| e.snapshot)
    }

    /// Evict terminal sessions that finished more than `max_age` ago.
    /// Returns how many were removed.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|_, e| e.finished_at.is_none_or(|t| t.elapsed() < max_age));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate(&self, session: SessionId, apply: impl FnOnce(&mut SessionSnapshot)) -> bool {
        let mut sessions = self.write();
        let Some(entry) = sessions.get_mut(&session) else {
            return false;
        };
        if entry.snapshot.status.is_terminal() {
            return false;
        }
        apply(&mut entry.snapshot);
        if entry.snapshot.status.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
        entry.tx.send_replace(entry.snapshot.clone());
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for ProgressStore {
    /// Percent and message only; the stage is left as is.
    fn update(&self, session: SessionId, percent: u8, message: &str) {
        self.mutate(session, |s| {
            s.status = JobStatus::Running;
            s.percent = s.percent.max(percent.min(99));
            s.message = message.to_string();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{ArtifactHandle, JobKind, JobReport};

    fn result() -> JobResult {
        JobResult {
            kind: JobKind::Extraction,
            artifact: ArtifactHandle {
                path: "/tmp/x.xlsx".into(),
                rows: 0,
            },
            filename: "extraction_x.xlsx".into(),
            preview: vec![],
            pairs: vec![],
            report: JobReport::default(),
        }
    }

    #[test]
    fn percent_never_decreases() {
        let store = ProgressStore::new();
        let id = store.create();
        store.advance(id, JobStage::ReadingSource, 35, "ocr done");
        store.advance(id, JobStage::Chunking, 20, "late update");
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.percent, 35);
        assert_eq!(snap.stage, JobStage::Chunking);
        assert_eq!(snap.status, JobStatus::Running);
    }

    #[test]
    fn hundred_only_on_completion() {
        let store = ProgressStore::new();
        let id = store.create();
        store.advance(id, JobStage::Materializing, 100, "almost");
        assert_eq!(store.snapshot(id).unwrap().percent, 99);
        assert!(store.complete(id, Arc::new(result())));
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.percent, 100);
        assert_eq!(snap.status, JobStatus::Completed);
        assert!(snap.result.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let store = ProgressStore::new();
        let id = store.create();
        assert!(store.fail(id, "no content"));
        assert!(!store.advance(id, JobStage::Generating { done: 0, total: 1 }, 50, "x"));
        assert!(!store.complete(id, Arc::new(result())));
        let snap = store.snapshot(id).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.progress(), -1);
        assert_eq!(snap.error.as_deref(), Some("no content"));
    }

    #[test]
    fn evict_and_prune() {
        let store = ProgressStore::new();
        let running = store.create();
        let done = store.create();
        store.advance(running, JobStage::Chunking, 40, "x");
        store.fail(done, "boom");

        assert_eq!(store.prune_finished(Duration::from_secs(3600)), 0);
        assert_eq!(store.prune_finished(Duration::ZERO), 1);
        assert!(store.snapshot(done).is_none());
        assert!(store.evict(running).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn subscribers_see_latest_state() {
        let store = ProgressStore::new();
        let id = store.create();
        let rx = store.subscribe(id).unwrap();
        store.update(id, 12, "reading");
        assert_eq!(rx.borrow().percent, 12);
    }

    #[test]
    fn session_id_round_trips_through_text() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert_eq!(id.short().len(), 8);
    }
}
