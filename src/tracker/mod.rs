//! Worker process tracking.
//!
//! Workers are externally-owned OS processes; the engine never spawns them.
//! `register` creates a pending entry before a process necessarily exists,
//! `link` binds the pid once discoverable, and from then on the supervisor
//! (see [`supervisor`]) watches liveness and activity. Termination is
//! cooperative first: SIGTERM, a grace window, then SIGKILL.
//!
//! Lifecycle and health share one status enum. `stuck` (alive but idle past
//! the threshold) and `dead` (liveness gone) are distinct and never
//! conflated; terminal states are final, and the first terminal state wins —
//! killing an already-completed worker is a no-op, not a second record.

pub mod probe;
pub mod supervisor;

pub use probe::{ProcessProbe, UnixProbe};
pub use supervisor::Supervisor;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditRecord, actions};
use crate::errors::EngineError;
use crate::persona::Persona;
use crate::store::StateStore;

/// Default SIGTERM-to-SIGKILL grace window.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
/// Default poll while waiting out the grace window.
pub const DEFAULT_KILL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Registered, process not yet linked.
    #[default]
    Pending,
    Running,
    /// Alive but idle past the stuck threshold.
    Stuck,
    Completed,
    Errored,
    Killed,
    /// Liveness probe failed while the worker was supposed to be running.
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Running => "running",
            WorkerStatus::Stuck => "stuck",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Errored => "errored",
            WorkerStatus::Killed => "killed",
            WorkerStatus::Dead => "dead",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Completed
                | WorkerStatus::Errored
                | WorkerStatus::Killed
                | WorkerStatus::Dead
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tracked worker, as persisted in `workers.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub persona: Persona,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    /// Last successful liveness probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Last heartbeat or observed output. Liveness alone does not count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    /// A registered-but-not-yet-linked entry.
    pub fn pending(id: impl Into<String>, persona: Persona, task_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            persona,
            task_id,
            pid: None,
            status: WorkerStatus::Pending,
            created_at: Utc::now(),
            last_seen: None,
            last_activity: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The instant the stuck clock measures from.
    pub fn activity_anchor(&self) -> DateTime<Utc> {
        self.last_activity.unwrap_or(self.created_at)
    }
}

/// Lifecycle operations over the persisted worker registry.
#[derive(Clone)]
pub struct ProcessTracker {
    store: StateStore,
    probe: Arc<dyn ProcessProbe>,
    kill_grace: Duration,
    kill_poll: Duration,
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("kill_grace", &self.kill_grace)
            .field("kill_poll", &self.kill_poll)
            .finish_non_exhaustive()
    }
}

impl ProcessTracker {
    pub fn new(store: StateStore) -> Self {
        Self::with_probe(store, Arc::new(UnixProbe))
    }

    pub fn with_probe(store: StateStore, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            store,
            probe,
            kill_grace: DEFAULT_KILL_GRACE,
            kill_poll: DEFAULT_KILL_POLL,
        }
    }

    /// Tune the SIGTERM grace window and its poll cadence.
    pub fn with_kill_grace(mut self, grace: Duration, poll: Duration) -> Self {
        self.kill_grace = grace;
        self.kill_poll = poll.max(Duration::from_millis(1));
        self
    }

    pub fn workers(&self) -> Result<BTreeMap<String, WorkerRecord>, EngineError> {
        self.store.read_workers()
    }

    pub fn worker(&self, id: &str) -> Result<WorkerRecord, EngineError> {
        self.store
            .read_workers()?
            .remove(id)
            .ok_or_else(|| EngineError::not_found("worker", id))
    }

    /// Create a pending entry. A label can be reused only after its previous
    /// holder reached a terminal state.
    pub fn register(
        &self,
        id: &str,
        persona: Persona,
        task_id: Option<String>,
        actor: &str,
    ) -> Result<WorkerRecord, EngineError> {
        let workers = self.store.read_workers()?;
        if let Some(existing) = workers.get(id) {
            if !existing.is_terminal() {
                return Err(EngineError::Process {
                    worker_id: id.to_string(),
                    message: format!("already registered and {}", existing.status),
                });
            }
        }

        let record = WorkerRecord::pending(id, persona, task_id);
        let audit = AuditRecord::new(actor, actions::WORKER_REGISTERED, id)
            .with_detail("persona", persona.as_str());
        self.store.update_workers(Some(&audit), |workers| {
            workers.insert(id.to_string(), record.clone());
        })?;

        info!(worker = %id, persona = %persona, "worker registered");
        Ok(record)
    }

    /// Bind the process identity once discoverable. Relinking the same pid
    /// is a silent no-op; a different pid on a live worker is rejected.
    pub fn link(&self, id: &str, pid: u32, actor: &str) -> Result<WorkerRecord, EngineError> {
        let workers = self.store.read_workers()?;
        let existing = workers
            .get(id)
            .ok_or_else(|| EngineError::not_found("worker", id))?;
        if existing.pid == Some(pid) {
            return Ok(existing.clone());
        }
        if existing.is_terminal() {
            return Err(EngineError::Process {
                worker_id: id.to_string(),
                message: format!("cannot link a {} worker", existing.status),
            });
        }
        if let Some(current) = existing.pid {
            return Err(EngineError::Process {
                worker_id: id.to_string(),
                message: format!("already linked to pid {current}"),
            });
        }

        let now = Utc::now();
        let mut updated = existing.clone();
        updated.pid = Some(pid);
        updated.status = WorkerStatus::Running;
        updated.last_seen = Some(now);
        updated.last_activity = Some(now);

        let audit =
            AuditRecord::new(actor, actions::WORKER_LINKED, id).with_detail("pid", pid.to_string());
        self.store.update_workers(Some(&audit), |workers| {
            workers.insert(id.to_string(), updated.clone());
        })?;

        info!(worker = %id, pid, "worker linked");
        Ok(updated)
    }

    /// Liveness ping from the worker itself. Resets the stuck clock.
    pub fn heartbeat(&self, id: &str) -> Result<(), EngineError> {
        self.touch(id, true)
    }

    /// Output observed from the worker. Resets the stuck clock.
    pub fn record_activity(&self, id: &str) -> Result<(), EngineError> {
        self.touch(id, false)
    }

    fn touch(&self, id: &str, liveness: bool) -> Result<(), EngineError> {
        let now = Utc::now();
        let found = self.store.update_workers(None, |workers| match workers.get_mut(id) {
            Some(record) if !record.is_terminal() => {
                record.last_activity = Some(now);
                if liveness {
                    record.last_seen = Some(now);
                }
                if record.status == WorkerStatus::Stuck {
                    record.status = WorkerStatus::Running;
                }
                true
            }
            Some(record) => {
                debug!(worker = %id, status = %record.status, "activity after terminal state ignored");
                true
            }
            None => false,
        })?;
        if !found {
            return Err(EngineError::not_found("worker", id));
        }
        Ok(())
    }

    /// Declare natural completion. A worker already in any terminal state is
    /// left as-is with no second audit record.
    pub fn mark_completed(&self, id: &str, actor: &str) -> Result<WorkerRecord, EngineError> {
        self.finish(id, WorkerStatus::Completed, actions::WORKER_COMPLETED, actor, None)
    }

    /// Declare failure reported by the spawning side (launch failed, abnormal
    /// exit). Same first-terminal-wins idempotence as completion.
    pub fn mark_errored(
        &self,
        id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<WorkerRecord, EngineError> {
        self.finish(
            id,
            WorkerStatus::Errored,
            actions::WORKER_ERRORED,
            actor,
            Some(reason),
        )
    }

    fn finish(
        &self,
        id: &str,
        status: WorkerStatus,
        action: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<WorkerRecord, EngineError> {
        let workers = self.store.read_workers()?;
        let existing = workers
            .get(id)
            .ok_or_else(|| EngineError::not_found("worker", id))?;
        if existing.is_terminal() {
            return Ok(existing.clone());
        }

        let mut updated = existing.clone();
        updated.status = status;
        updated.completed_at = Some(Utc::now());

        let mut audit = AuditRecord::new(actor, action, id);
        if let Some(reason) = reason {
            audit = audit.with_detail("reason", reason);
        }
        self.store.update_workers(Some(&audit), |workers| {
            workers.insert(id.to_string(), updated.clone());
        })?;

        info!(worker = %id, status = %status, "worker finished");
        Ok(updated)
    }

    /// Terminate a worker: SIGTERM, wait out the grace window, SIGKILL if it
    /// would not go. Exactly one `worker_killed` audit record per worker,
    /// ever — repeat kills and kills racing natural completion are no-ops.
    pub async fn kill(&self, id: &str, actor: &str) -> Result<WorkerRecord, EngineError> {
        let workers = self.store.read_workers()?;
        let existing = workers
            .get(id)
            .ok_or_else(|| EngineError::not_found("worker", id))?;
        if existing.is_terminal() {
            debug!(worker = %id, status = %existing.status, "kill of terminal worker is a no-op");
            return Ok(existing.clone());
        }

        if let Some(pid) = existing.pid {
            self.shut_down(id, pid).await?;
        }

        let mut updated = existing.clone();
        updated.status = WorkerStatus::Killed;
        updated.completed_at = Some(Utc::now());

        let audit = AuditRecord::new(actor, actions::WORKER_KILLED, id);
        self.store.update_workers(Some(&audit), |workers| {
            workers.insert(id.to_string(), updated.clone());
        })?;

        info!(worker = %id, "worker killed");
        Ok(updated)
    }

    async fn shut_down(&self, id: &str, pid: u32) -> Result<(), EngineError> {
        if !self.probe.alive(pid).await {
            return Ok(());
        }
        if let Err(err) = self.probe.terminate(pid).await {
            // A process that vanished between probe and signal is fine.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(EngineError::Process {
                worker_id: id.to_string(),
                message: format!("SIGTERM failed: {err}"),
            });
        }

        let deadline = tokio::time::Instant::now() + self.kill_grace;
        while tokio::time::Instant::now() < deadline {
            if !self.probe.alive(pid).await {
                return Ok(());
            }
            tokio::time::sleep(self.kill_poll).await;
        }

        if self.probe.alive(pid).await {
            warn!(worker = %id, pid, "grace period expired, escalating to SIGKILL");
            if let Err(err) = self.probe.kill(pid).await {
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(EngineError::Process {
                        worker_id: id.to_string(),
                        message: format!("SIGKILL failed: {err}"),
                    });
                }
            }
        }
        Ok(())
    }
}
