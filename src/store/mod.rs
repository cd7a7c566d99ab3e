//! Durable, file-backed state.
//!
//! Layout under the project's `.crucible/` directory:
//!
//! ```text
//! .crucible/
//!   state/
//!     stage.json      current stage marker (singleton)
//!     tasks.jsonl     append-only task log, last record per id wins
//!     gates.json      per-stage gate document (singleton)
//!     workers.json    tracked worker registry (singleton)
//!   audit.jsonl       append-only audit trail
//!   checkpoints/      immutable snapshots
//!   handoffs/         compiled briefings
//! ```
//!
//! Writers take a per-resource advisory lock (sidecar `.lock` file) before
//! mutating, and append the operation's audit record inside that same locked
//! scope. Readers never block and tolerate staleness bounded by the watcher
//! poll interval. There is no cross-resource lock: writes to unrelated
//! resources never contend.

pub(crate) mod fs;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{AuditLog, AuditRecord, actions};
use crate::errors::EngineError;
use crate::gates::{Gate, default_gates};
use crate::stage::StageState;
use crate::task::Task;
use crate::tracker::WorkerRecord;

/// Default bound on lock acquisition retries.
const DEFAULT_LOCK_ATTEMPTS: u32 = 5;
/// Default pause between lock retries.
const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(20);

/// The lockable resources. Each maps to one file and one sidecar lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Stage,
    Tasks,
    Gates,
    Workers,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Stage => "stage",
            Resource::Tasks => "tasks",
            Resource::Gates => "gates",
            Resource::Workers => "workers",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            Resource::Stage => "stage.json",
            Resource::Tasks => "tasks.jsonl",
            Resource::Gates => "gates.json",
            Resource::Workers => "workers.json",
        }
    }
}

/// On-disk wrapper for `gates.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GatesDoc {
    gates: BTreeMap<crate::stage::Stage, Gate>,
}

/// On-disk wrapper for `workers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkersDoc {
    workers: BTreeMap<String, WorkerRecord>,
}

/// A point-in-time read of every live resource. Used for hub hydration and
/// as the input to checkpointing and watcher diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub stage: StageState,
    pub tasks: Vec<Task>,
    pub gates: BTreeMap<crate::stage::Stage, Gate>,
    pub workers: BTreeMap<String, WorkerRecord>,
}

/// File-backed store rooted at a project's `.crucible/` directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    lock_attempts: u32,
    lock_backoff: Duration,
    audit: AuditLog,
}

impl StateStore {
    /// Open a store rooted at `root` (the `.crucible/` directory itself).
    /// No files are touched until the first read or write.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let audit = AuditLog::new(root.join("audit.jsonl"));
        Self {
            root,
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_backoff: DEFAULT_LOCK_BACKOFF,
            audit,
        }
    }

    /// Tune the bounded lock retry (attempts, pause between attempts).
    pub fn with_lock_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.lock_attempts = attempts.max(1);
        self.lock_backoff = backoff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn resource_path(&self, resource: Resource) -> PathBuf {
        self.state_dir().join(resource.file_name())
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn handoffs_dir(&self) -> PathBuf {
        self.root.join("handoffs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Seed the on-disk layout: directories, the discovery stage marker, the
    /// default gate set, and an empty worker registry. Idempotent — existing
    /// files are left alone, and the `project_initialized` record is written
    /// only when something was actually seeded.
    pub fn init(&self, actor: &str) -> Result<bool, EngineError> {
        for dir in [
            self.state_dir(),
            self.checkpoints_dir(),
            self.handoffs_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| EngineError::WriteFailed {
                path: dir.clone(),
                source,
            })?;
        }

        let mut seeded = false;
        if !self.resource_path(Resource::Stage).exists() {
            self.replace_singleton(Resource::Stage, &StageState::default())?;
            seeded = true;
        }
        if !self.resource_path(Resource::Gates).exists() {
            let doc = GatesDoc {
                gates: default_gates(),
            };
            self.replace_singleton(Resource::Gates, &doc)?;
            seeded = true;
        }
        if !self.resource_path(Resource::Workers).exists() {
            self.replace_singleton(Resource::Workers, &WorkersDoc::default())?;
            seeded = true;
        }

        if seeded {
            self.audit.append(&AuditRecord::new(
                actor,
                actions::PROJECT_INITIALIZED,
                self.root.display().to_string(),
            ))?;
            debug!(root = %self.root.display(), "seeded project state");
        }
        Ok(seeded)
    }

    // ── stage ──

    /// Read the current stage marker; a missing file reads as the default
    /// (discovery) so fresh directories behave sensibly.
    pub fn read_stage(&self) -> Result<StageState, EngineError> {
        self.read_singleton_or_default(Resource::Stage)
    }

    /// Replace the stage marker, appending `record` in the same locked
    /// scope. Composite operations that already audited under another
    /// resource's lock (gate approval advancing the stage) pass `None`.
    pub fn write_stage(
        &self,
        state: &StageState,
        record: Option<&AuditRecord>,
    ) -> Result<(), EngineError> {
        let _lock = self.lock(Resource::Stage)?;
        self.replace_singleton(Resource::Stage, state)?;
        match record {
            Some(record) => self.audit.append(record),
            None => Ok(()),
        }
    }

    // ── tasks ──

    /// Read all tasks, folding the append-only log so the latest record per
    /// id wins. Order is first-appearance order.
    pub fn read_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let path = self.resource_path(Resource::Tasks);
        let contents =
            fs::read_to_string_or_empty(&path).map_err(|source| EngineError::ReadFailed {
                path: path.clone(),
                source,
            })?;

        let mut order: Vec<String> = Vec::new();
        let mut by_id: BTreeMap<String, Task> = BTreeMap::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Task>(line) {
                Ok(task) => {
                    if !by_id.contains_key(&task.id) {
                        order.push(task.id.clone());
                    }
                    by_id.insert(task.id.clone(), task);
                }
                Err(err) => {
                    warn!(line = number + 1, %err, "skipping unparseable task line");
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect())
    }

    pub fn read_task(&self, id: &str) -> Result<Option<Task>, EngineError> {
        Ok(self.read_tasks()?.into_iter().find(|t| t.id == id))
    }

    /// Append task records — one operation, one audit record, however many
    /// task lines it touches (derived ready/blocked flips ride along with
    /// the mutation that caused them).
    pub fn append_tasks(&self, tasks: &[Task], record: &AuditRecord) -> Result<(), EngineError> {
        let _lock = self.lock(Resource::Tasks)?;
        let path = self.resource_path(Resource::Tasks);
        for task in tasks {
            let line = serde_json::to_string(task)
                .map_err(|err| EngineError::Other(anyhow::Error::new(err)))?;
            fs::append_line(&path, &line).map_err(|source| EngineError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        }
        self.audit.append(record)
    }

    // ── gates ──

    pub fn read_gates(&self) -> Result<BTreeMap<crate::stage::Stage, Gate>, EngineError> {
        let doc: GatesDoc = self.read_singleton_or_default(Resource::Gates)?;
        Ok(doc.gates)
    }

    /// Read-modify-write the gate document under its lock, then audit.
    pub fn update_gates<T>(
        &self,
        record: &AuditRecord,
        mutate: impl FnOnce(&mut BTreeMap<crate::stage::Stage, Gate>) -> T,
    ) -> Result<T, EngineError> {
        let _lock = self.lock(Resource::Gates)?;
        let mut doc: GatesDoc = self.read_singleton_or_default(Resource::Gates)?;
        let out = mutate(&mut doc.gates);
        self.replace_singleton(Resource::Gates, &doc)?;
        self.audit.append(record)?;
        Ok(out)
    }

    // ── workers ──

    pub fn read_workers(&self) -> Result<BTreeMap<String, WorkerRecord>, EngineError> {
        let doc: WorkersDoc = self.read_singleton_or_default(Resource::Workers)?;
        Ok(doc.workers)
    }

    /// Read-modify-write the worker registry. Supervision bookkeeping
    /// (last-seen bumps, health flips) passes `None` — only caller-initiated
    /// mutations (register, link, kill, complete) carry an audit record.
    pub fn update_workers<T>(
        &self,
        record: Option<&AuditRecord>,
        mutate: impl FnOnce(&mut BTreeMap<String, WorkerRecord>) -> T,
    ) -> Result<T, EngineError> {
        let _lock = self.lock(Resource::Workers)?;
        let mut doc: WorkersDoc = self.read_singleton_or_default(Resource::Workers)?;
        let out = mutate(&mut doc.workers);
        self.replace_singleton(Resource::Workers, &doc)?;
        if let Some(record) = record {
            self.audit.append(record)?;
        }
        Ok(out)
    }

    // ── snapshot ──

    /// Read every live resource in one pass.
    pub fn snapshot(&self) -> Result<StateSnapshot, EngineError> {
        Ok(StateSnapshot {
            stage: self.read_stage()?,
            tasks: self.read_tasks()?,
            gates: self.read_gates()?,
            workers: self.read_workers()?,
        })
    }

    // ── primitives ──

    fn lock(&self, resource: Resource) -> Result<fs::ResourceLock, EngineError> {
        let lock_path = self.state_dir().join(format!("{}.lock", resource.as_str()));
        fs::acquire(&lock_path, self.lock_attempts, self.lock_backoff).map_err(|err| match err {
            fs::LockError::Contended { attempts } => EngineError::ConcurrencyConflict {
                resource: resource.as_str().to_string(),
                attempts,
            },
            fs::LockError::Io(source) => EngineError::WriteFailed {
                path: lock_path,
                source,
            },
        })
    }

    fn read_singleton_or_default<T>(&self, resource: Resource) -> Result<T, EngineError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let path = self.resource_path(resource);
        let contents =
            fs::read_to_string_or_empty(&path).map_err(|source| EngineError::ReadFailed {
                path: path.clone(),
                source,
            })?;
        if contents.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&contents).map_err(|err| EngineError::ReadFailed {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })
    }

    fn replace_singleton<T: Serialize>(
        &self,
        resource: Resource,
        value: &T,
    ) -> Result<(), EngineError> {
        let path = self.resource_path(resource);
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| EngineError::Other(anyhow::Error::new(err)))?;
        fs::atomic_replace(&path, &bytes).map_err(|source| EngineError::WriteFailed {
            path,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;
    use crate::stage::Stage;
    use crate::task::TaskStatus;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> StateStore {
        StateStore::open(dir.join(".crucible"))
    }

    #[test]
    fn init_seeds_layout_once() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(store.init("tester").unwrap());
        assert!(store.resource_path(Resource::Stage).exists());
        assert!(store.resource_path(Resource::Gates).exists());
        assert!(store.resource_path(Resource::Workers).exists());

        // Second init is a no-op and writes no second audit record.
        assert!(!store.init("tester").unwrap());
        assert_eq!(store.audit().len().unwrap(), 1);
    }

    #[test]
    fn stage_round_trips_and_audits() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init("tester").unwrap();

        let state = StageState::at(Stage::Goal);
        let record = AuditRecord::new("tester", actions::STAGE_ADVANCED, "goal");
        store.write_stage(&state, Some(&record)).unwrap();

        assert_eq!(store.read_stage().unwrap().current, Stage::Goal);
        let history = store.audit().read_all().unwrap();
        assert_eq!(history.last().unwrap().action, actions::STAGE_ADVANCED);
    }

    #[test]
    fn task_log_folds_latest_record_per_id() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init("tester").unwrap();

        let mut task = Task::new("Build parser", Stage::Implement, Some(Persona::Developer));
        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_CREATED, &task.id),
            )
            .unwrap();

        task.status = TaskStatus::Done;
        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_COMPLETED, &task.id),
            )
            .unwrap();

        let tasks = store.read_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Done);
    }

    #[test]
    fn batch_append_writes_one_audit_record() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init("tester").unwrap();
        let before = store.audit().len().unwrap();

        let a = Task::new("A", Stage::Implement, None);
        let b = Task::new("B", Stage::Implement, None);
        store
            .append_tasks(
                &[a, b],
                &AuditRecord::new("tester", actions::TASK_UPDATED, "batch"),
            )
            .unwrap();

        assert_eq!(store.read_tasks().unwrap().len(), 2);
        assert_eq!(store.audit().len().unwrap(), before + 1);
    }

    #[test]
    fn gates_update_is_read_modify_write() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init("tester").unwrap();

        let record = AuditRecord::new("tester", actions::CRITERION_SATISFIED, "discovery");
        store
            .update_gates(&record, |gates| {
                let gate = gates.get_mut(&Stage::Discovery).unwrap();
                gate.criteria[0].satisfied = true;
            })
            .unwrap();

        let gates = store.read_gates().unwrap();
        assert!(gates[&Stage::Discovery].criteria[0].satisfied);
    }

    #[test]
    fn worker_bookkeeping_without_record_skips_audit() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init("tester").unwrap();
        let before = store.audit().len().unwrap();

        store
            .update_workers(None, |workers| {
                workers.insert(
                    "w-probe".to_string(),
                    WorkerRecord::pending("w-probe", Persona::Developer, None),
                );
            })
            .unwrap();

        assert_eq!(store.audit().len().unwrap(), before);
        assert!(store.read_workers().unwrap().contains_key("w-probe"));
    }

    #[test]
    fn snapshot_reads_every_resource() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.init("tester").unwrap();

        let task = Task::new("Only task", Stage::Discovery, None);
        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_CREATED, &task.id),
            )
            .unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.stage.current, Stage::Discovery);
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.gates.len(), 10);
        assert!(snapshot.workers.is_empty());
    }

    #[test]
    fn uninitialized_store_reads_defaults() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        assert_eq!(store.read_stage().unwrap().current, Stage::Discovery);
        assert!(store.read_tasks().unwrap().is_empty());
        assert!(store.read_gates().unwrap().is_empty());
        assert!(store.read_workers().unwrap().is_empty());
    }
}
