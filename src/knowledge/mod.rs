//! Knowledge and context management.
//!
//! Everything the engine knows about *context* lives here: token accounting
//! against per-worker budgets, immutable checkpoints of engine state, deltas
//! between a checkpoint and now, compiled briefings for fresh workers, and
//! the handoff documents workers leave behind. [`KnowledgeStore`] is the
//! facade; the submodules hold the pure logic.

pub mod briefing;
pub mod checkpoint;
pub mod delta;
pub mod handoff;
pub mod tokens;

pub use briefing::{Briefing, PredecessorSummary};
pub use checkpoint::Checkpoint;
pub use delta::{Delta, GateChange, StageChange, TaskChange, compute_delta, compute_delta_between};
pub use handoff::{Handoff, HandoffStatus, MAX_SUMMARY_CHARS};
pub use tokens::{
    BUDGET_THRESHOLDS, BudgetEvent, TokenLedger, TokenSummary, TokenUsage, WorkerTokenReport,
    count_tokens,
};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::persona::Persona;
use crate::store::{StateStore, fs as store_fs};
use crate::task::TaskStatus;

/// Tunable bounds for the knowledge layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeLimits {
    /// Per-worker token budget; zero disables threshold alerts.
    pub token_budget: u64,
    /// Ceiling on a compiled briefing, measured after serialization.
    pub max_briefing_tokens: u64,
    /// Minimum handoff body length in characters.
    pub min_handoff_body: usize,
}

impl Default for KnowledgeLimits {
    fn default() -> Self {
        Self {
            token_budget: 100_000,
            max_briefing_tokens: 4_000,
            min_handoff_body: 80,
        }
    }
}

/// Facade over token accounting, checkpoints, briefings, and handoffs.
///
/// Cheap to clone; clones share one token ledger.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    store: StateStore,
    ledger: Arc<Mutex<TokenLedger>>,
    limits: KnowledgeLimits,
}

impl KnowledgeStore {
    pub fn new(store: StateStore, limits: KnowledgeLimits) -> Self {
        let ledger = Arc::new(Mutex::new(TokenLedger::new(limits.token_budget)));
        Self {
            store,
            ledger,
            limits,
        }
    }

    pub fn limits(&self) -> &KnowledgeLimits {
        &self.limits
    }

    // ── token accounting ──

    /// Record a usage sample for `worker_id`, returning any budget
    /// thresholds this sample crossed for the first time.
    pub fn track_usage(
        &self,
        worker_id: &str,
        persona: Option<Persona>,
        input: u64,
        output: u64,
    ) -> Result<Vec<BudgetEvent>, EngineError> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|e| anyhow::anyhow!("token ledger lock poisoned: {}", e))?;
        Ok(ledger.track_usage(worker_id, persona, input, output))
    }

    pub fn usage_summary(&self) -> Result<TokenSummary, EngineError> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|e| anyhow::anyhow!("token ledger lock poisoned: {}", e))?;
        Ok(ledger.summary())
    }

    /// Pin `worker_id` to its own token budget instead of the shared one.
    pub fn set_worker_budget(&self, worker_id: &str, budget: u64) -> Result<(), EngineError> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|e| anyhow::anyhow!("token ledger lock poisoned: {}", e))?;
        ledger.set_budget_override(worker_id, budget);
        Ok(())
    }

    // ── checkpoints ──

    /// Capture current state under the next sequence number. The sequence
    /// scan assumes a single engine process creates checkpoints.
    pub fn create_checkpoint(&self) -> Result<Checkpoint, EngineError> {
        let snapshot = self.store.snapshot()?;
        let seq = self.next_checkpoint_seq()?;
        let checkpoint = Checkpoint::capture(seq, &snapshot);
        let path = self.store.checkpoints_dir().join(checkpoint.file_name());
        self.persist_json(path, &checkpoint)?;
        debug!(id = %checkpoint.id, tasks = checkpoint.tasks.len(), "captured checkpoint");
        Ok(checkpoint)
    }

    /// All stored checkpoints, ordered by sequence number.
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, EngineError> {
        let dir = self.store.checkpoints_dir();
        let mut checkpoints = Vec::new();
        if dir.exists() {
            let entries =
                std::fs::read_dir(&dir).map_err(|source| EngineError::ReadFailed {
                    path: dir.clone(),
                    source,
                })?;
            for entry in entries {
                let entry = entry.map_err(|source| EngineError::ReadFailed {
                    path: dir.clone(),
                    source,
                })?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if checkpoint::parse_seq(name).is_none() {
                    continue;
                }
                checkpoints.push(self.read_checkpoint_file(entry.path())?);
            }
        }
        checkpoints.sort_by_key(|c| c.seq);
        Ok(checkpoints)
    }

    pub fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self.list_checkpoints()?.pop())
    }

    /// Load a stored checkpoint by id. Restoring is a read: the live state
    /// files are not touched, and the caller decides what to do with the
    /// returned snapshot.
    pub fn restore_checkpoint(&self, id: &str) -> Result<Checkpoint, EngineError> {
        let path = self.store.checkpoints_dir().join(format!("{id}.json"));
        if !path.exists() {
            return Err(EngineError::not_found("checkpoint", id));
        }
        self.read_checkpoint_file(path)
    }

    /// Everything that changed between a stored checkpoint and live state.
    pub fn delta_since(&self, checkpoint_id: &str) -> Result<Delta, EngineError> {
        let base = self.restore_checkpoint(checkpoint_id)?;
        let snapshot = self.store.snapshot()?;
        Ok(compute_delta(&base, &snapshot))
    }

    // ── briefings ──

    /// Compile and persist the resumption briefing for `task_id`.
    ///
    /// The base is the earliest stored checkpoint (one is captured first if
    /// none exist). The delta chain walks checkpoint to checkpoint and
    /// finishes at live state; empty hops are elided. Predecessor summaries
    /// come from the stored handoffs of the task's finished dependencies — a
    /// dependency that never handed off is skipped, not an error.
    pub fn compile_briefing(&self, task_id: &str) -> Result<Briefing, EngineError> {
        let snapshot = self.store.snapshot()?;
        let task = snapshot
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        let mut checkpoints = self.list_checkpoints()?;
        if checkpoints.is_empty() {
            checkpoints.push(self.create_checkpoint()?);
        }

        let mut deltas: Vec<Delta> = checkpoints
            .windows(2)
            .map(|pair| compute_delta_between(&pair[0], &pair[1]))
            .filter(|d| !d.is_empty())
            .collect();
        if let Some(last) = checkpoints.last() {
            let tail = compute_delta(last, &snapshot);
            if !tail.is_empty() {
                deltas.push(tail);
            }
        }
        let base = checkpoints.swap_remove(0);

        let mut predecessors = Vec::new();
        for dep_id in &task.blocked_by {
            let Some(dep) = snapshot.tasks.iter().find(|t| t.id == *dep_id) else {
                continue;
            };
            if dep.status != TaskStatus::Done {
                continue;
            }
            if let Some(handoff) = self.read_handoff(dep_id)? {
                predecessors.push(PredecessorSummary {
                    task_id: dep.id.clone(),
                    title: dep.title.clone(),
                    summary: handoff.summary,
                });
            }
        }

        let briefing = briefing::compile(
            task,
            &base,
            &deltas,
            predecessors,
            self.limits.max_briefing_tokens,
        )?;
        self.persist_json(
            self.store.handoffs_dir().join(briefing.file_name()),
            &briefing,
        )?;
        debug!(
            task = %briefing.task_id,
            tokens = briefing.token_count,
            dropped = briefing.dropped_deltas,
            "compiled briefing"
        );
        Ok(briefing)
    }

    // ── handoffs ──

    /// Two-phase validation of a raw handoff payload: schema first, then
    /// semantics against current tasks. State is untouched either way.
    pub fn validate_handoff(&self, payload: &str) -> Result<Handoff, EngineError> {
        let handoff = Handoff::parse(payload, self.limits.min_handoff_body)?;
        let tasks = self.store.read_tasks()?;
        handoff.validate(&tasks)?;
        Ok(handoff)
    }

    /// Persist an accepted handoff artifact alongside the briefings.
    pub fn record_handoff(&self, handoff: &Handoff) -> Result<(), EngineError> {
        self.persist_json(self.store.handoffs_dir().join(handoff.file_name()), handoff)
    }

    /// The stored handoff for `task_id`, if that task ever handed off.
    pub fn read_handoff(&self, task_id: &str) -> Result<Option<Handoff>, EngineError> {
        let path = self
            .store
            .handoffs_dir()
            .join(format!("{task_id}-handoff.json"));
        let contents =
            store_fs::read_to_string_or_empty(&path).map_err(|source| EngineError::ReadFailed {
                path: path.clone(),
                source,
            })?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| EngineError::ReadFailed {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            })
    }

    // ── primitives ──

    fn next_checkpoint_seq(&self) -> Result<u64, EngineError> {
        let dir = self.store.checkpoints_dir();
        let mut max = 0;
        if dir.exists() {
            let entries =
                std::fs::read_dir(&dir).map_err(|source| EngineError::ReadFailed {
                    path: dir.clone(),
                    source,
                })?;
            for entry in entries {
                let entry = entry.map_err(|source| EngineError::ReadFailed {
                    path: dir.clone(),
                    source,
                })?;
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(seq) = checkpoint::parse_seq(name) {
                        max = max.max(seq);
                    }
                }
            }
        }
        Ok(max + 1)
    }

    fn read_checkpoint_file(&self, path: PathBuf) -> Result<Checkpoint, EngineError> {
        let contents =
            store_fs::read_to_string_or_empty(&path).map_err(|source| EngineError::ReadFailed {
                path: path.clone(),
                source,
            })?;
        serde_json::from_str(&contents).map_err(|err| EngineError::ReadFailed {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })
    }

    fn persist_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| EngineError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| EngineError::Other(anyhow::Error::new(err)))?;
        store_fs::atomic_replace(&path, &bytes).map_err(|source| EngineError::WriteFailed {
            path,
            source,
        })
    }
}
