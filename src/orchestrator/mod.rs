//! The engine facade: one surface for every caller-initiated operation.
//!
//! [`Engine`] composes the stage sequencer, task graph, gate engine,
//! knowledge store, process tracker, and event hub over one shared
//! [`StateStore`]. Callers go through it rather than the components so the
//! cross-domain rules hold in one place: advancing a stage consults the gate
//! and the task set, approving a gate captures a checkpoint, an accepted
//! handoff settles its worker, and budget crossings reach the event stream.
//!
//! [`serve`](Engine::serve) turns the facade into the long-running daemon:
//! the change watcher, the worker supervisor, and the websocket hub run as
//! background tasks until one shutdown signal stops them all.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::audit::{AuditFilter, AuditRecord, actions};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::events::EngineEvent;
use crate::gates::{GateApproval, GateEngine, GateStatus};
use crate::graph::{BlockedTask, TaskGraph};
use crate::hub::{AppState, EventHub, ListenerHandle, SharedState};
use crate::knowledge::{
    Briefing, BudgetEvent, Checkpoint, Delta, Handoff, KnowledgeStore, TokenSummary,
};
use crate::persona::Persona;
use crate::stage::{OverrideDirection, Stage, StageEngine};
use crate::store::{StateSnapshot, StateStore};
use crate::task::{Task, TaskStatus};
use crate::tracker::{ProcessTracker, Supervisor, WorkerRecord};
use crate::watcher::ChangeWatcher;

/// The orchestration engine.
///
/// Cheap to clone; clones share the store, the token ledger, and the hub.
#[derive(Debug, Clone)]
pub struct Engine {
    store: StateStore,
    stages: StageEngine,
    graph: TaskGraph,
    gates: GateEngine,
    knowledge: KnowledgeStore,
    tracker: ProcessTracker,
    hub: EventHub,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: StateStore) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: StateStore, config: EngineConfig) -> Self {
        let knowledge = KnowledgeStore::new(store.clone(), config.knowledge.clone());
        let tracker = ProcessTracker::new(store.clone())
            .with_kill_grace(config.kill_grace, config.kill_poll);
        Self {
            stages: StageEngine::new(store.clone()),
            graph: TaskGraph::new(store.clone()),
            gates: GateEngine::new(store.clone()),
            knowledge,
            tracker,
            hub: EventHub::with_buffer(config.listener_buffer),
            config,
            store,
        }
    }

    /// Seed `.crucible/` with the default stage and gates. Returns `false`
    /// when the project was already initialized.
    pub fn init(&self, actor: &str) -> Result<bool, EngineError> {
        self.store.init(actor)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// In-process event stream: a listener fed by the same hub the
    /// websocket clients hang off.
    pub fn subscribe(&self) -> ListenerHandle {
        self.hub.register()
    }

    // ── stage flow ──

    pub fn current_stage(&self) -> Result<Stage, EngineError> {
        self.stages.current()
    }

    /// Advance to the immediate successor of the current stage.
    ///
    /// Two guards sit on top of the sequence check: the stage being left
    /// must have at least one task unless it is planning-flavored, and its
    /// gate must already be `Open`. The usual forward path is
    /// [`approve_gate`](Self::approve_gate), which advances as part of
    /// approval; `advance_stage` re-walks stages whose gates were approved
    /// earlier, e.g. after a backward override.
    pub fn advance_stage(&self, actor: &str) -> Result<Stage, EngineError> {
        let from = self.stages.current()?;
        let Some(to) = from.next() else {
            return Err(EngineError::InvalidTransition {
                from: from.to_string(),
                to: "past the final stage".to_string(),
            });
        };

        if !from.is_task_exempt() && !self.graph.all()?.iter().any(|t| t.stage == from) {
            return Err(EngineError::InvalidTransition {
                from: format!("{from} with no recorded tasks"),
                to: to.to_string(),
            });
        }
        let status = self.gates.check(from)?;
        if status != GateStatus::Open {
            return Err(EngineError::InvalidTransition {
                from: format!("{} with a {} gate", from, status.name()),
                to: to.to_string(),
            });
        }

        self.stages.transition(to, actor)?;
        Ok(to)
    }

    /// Forced movement to any stage, in either direction. Skips the gate
    /// and task guards but never the audit trail: the reason is required
    /// and recorded.
    pub fn override_stage(
        &self,
        to: Stage,
        direction: OverrideDirection,
        reason: &str,
        actor: &str,
    ) -> Result<(), EngineError> {
        self.stages.override_to(to, direction, reason, actor)
    }

    // ── gates ──

    pub fn check_gate(&self, stage: Stage) -> Result<GateStatus, EngineError> {
        self.gates.check(stage)
    }

    pub fn satisfy_criterion(
        &self,
        stage: Stage,
        criterion: &str,
        actor: &str,
    ) -> Result<bool, EngineError> {
        self.gates.satisfy(stage, criterion, actor)
    }

    /// Approve the current stage's gate, advance past it, and capture a
    /// checkpoint of the state being left behind.
    pub fn approve_gate(&self, stage: Stage, actor: &str) -> Result<GateApproval, EngineError> {
        let approval = self.gates.approve(stage, actor)?;
        let checkpoint = self.create_checkpoint(actor)?;
        debug!(stage = %stage, checkpoint = %checkpoint.id, "approval checkpoint captured");
        Ok(approval)
    }

    // ── tasks ──

    pub fn create_task(&self, task: Task, actor: &str) -> Result<Task, EngineError> {
        self.graph.create(task, actor)
    }

    pub fn update_task_status(
        &self,
        id: &str,
        to: TaskStatus,
        actor: &str,
    ) -> Result<Task, EngineError> {
        self.graph.update_status(id, to, actor)
    }

    pub fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        actor: &str,
    ) -> Result<bool, EngineError> {
        self.graph.add_dependency(task_id, depends_on, actor)
    }

    pub fn remove_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        actor: &str,
    ) -> Result<bool, EngineError> {
        self.graph.remove_dependency(task_id, depends_on, actor)
    }

    pub fn tasks(&self) -> Result<Vec<Task>, EngineError> {
        self.graph.all()
    }

    pub fn task(&self, id: &str) -> Result<Task, EngineError> {
        self.graph.get(id)
    }

    pub fn ready_tasks(&self) -> Result<Vec<Task>, EngineError> {
        self.graph.ready()
    }

    pub fn blocked_tasks(&self) -> Result<Vec<BlockedTask>, EngineError> {
        self.graph.blocked()
    }

    // ── workers ──

    /// Register a worker label, optionally bound to a task.
    ///
    /// The task must exist before anything is written. When its title
    /// matches a configured budget override pattern, the worker's token
    /// budget is pinned at registration time.
    pub fn register_worker(
        &self,
        id: &str,
        persona: Persona,
        task_id: Option<String>,
        actor: &str,
    ) -> Result<WorkerRecord, EngineError> {
        let budget = match &task_id {
            Some(task_id) => {
                let task = self.graph.get(task_id)?;
                self.config.personas.budget_for(&task.title)
            }
            None => None,
        };

        let record = self.tracker.register(id, persona, task_id, actor)?;
        if let Some(budget) = budget {
            self.knowledge.set_worker_budget(id, budget)?;
            debug!(worker = %id, budget, "budget override applied");
        }
        Ok(record)
    }

    pub fn link_worker(&self, id: &str, pid: u32, actor: &str) -> Result<WorkerRecord, EngineError> {
        self.tracker.link(id, pid, actor)
    }

    pub fn worker_heartbeat(&self, id: &str) -> Result<(), EngineError> {
        self.tracker.heartbeat(id)
    }

    pub fn record_worker_activity(&self, id: &str) -> Result<(), EngineError> {
        self.tracker.record_activity(id)
    }

    pub fn mark_worker_errored(
        &self,
        id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<WorkerRecord, EngineError> {
        self.tracker.mark_errored(id, reason, actor)
    }

    /// Terminate a worker: SIGTERM, grace window, then SIGKILL. Idempotent.
    pub async fn kill_worker(&self, id: &str, actor: &str) -> Result<WorkerRecord, EngineError> {
        self.tracker.kill(id, actor).await
    }

    pub fn workers(
        &self,
    ) -> Result<std::collections::BTreeMap<String, WorkerRecord>, EngineError> {
        self.tracker.workers()
    }

    pub fn worker(&self, id: &str) -> Result<WorkerRecord, EngineError> {
        self.tracker.worker(id)
    }

    // ── knowledge ──

    /// Record a token usage sample for a worker and publish any budget
    /// thresholds it crossed. Samples also count as activity: a worker
    /// burning tokens is not stuck.
    pub fn track_usage(
        &self,
        worker_id: &str,
        input: u64,
        output: u64,
    ) -> Result<Vec<BudgetEvent>, EngineError> {
        let persona = match self.tracker.worker(worker_id) {
            Ok(record) => Some(record.persona),
            Err(EngineError::NotFound { .. }) => None,
            Err(err) => return Err(err),
        };

        let events = self.knowledge.track_usage(worker_id, persona, input, output)?;
        if persona.is_some() {
            self.tracker.record_activity(worker_id)?;
        }
        for event in &events {
            info!(
                worker = %event.worker_id,
                threshold = event.threshold,
                used = event.used,
                budget = event.budget,
                "token budget threshold crossed"
            );
            self.hub.publish(EngineEvent::from(event.clone()));
        }
        Ok(events)
    }

    pub fn usage_summary(&self) -> Result<TokenSummary, EngineError> {
        self.knowledge.usage_summary()
    }

    /// Capture and record a checkpoint of the current state.
    pub fn create_checkpoint(&self, actor: &str) -> Result<Checkpoint, EngineError> {
        let checkpoint = self.knowledge.create_checkpoint()?;
        let record = AuditRecord::new(actor, actions::CHECKPOINT_CREATED, &checkpoint.id)
            .with_detail("stage", checkpoint.stage.current.as_str());
        self.store.audit().append(&record)?;
        Ok(checkpoint)
    }

    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, EngineError> {
        self.knowledge.list_checkpoints()
    }

    pub fn restore_checkpoint(&self, id: &str) -> Result<Checkpoint, EngineError> {
        self.knowledge.restore_checkpoint(id)
    }

    pub fn delta_since(&self, checkpoint_id: &str) -> Result<Delta, EngineError> {
        self.knowledge.delta_since(checkpoint_id)
    }

    pub fn compile_briefing(&self, task_id: &str) -> Result<Briefing, EngineError> {
        self.knowledge.compile_briefing(task_id)
    }

    /// Accept or reject a worker handoff.
    ///
    /// Validation runs first and touches nothing; a rejection leaves task,
    /// knowledge, and worker state exactly as they were. On acceptance the
    /// task moves to the claimed outcome, the artifact is persisted, and —
    /// since a handoff is the worker's last word before exiting — the named
    /// worker is settled as completed so its exit never trips supervision.
    pub fn submit_handoff(&self, payload: &str, actor: &str) -> Result<Handoff, EngineError> {
        let handoff = self.knowledge.validate_handoff(payload)?;

        let mut record = AuditRecord::new(actor, actions::HANDOFF_RECEIVED, &handoff.task_id)
            .with_detail("status", handoff.status.as_str());
        if let Some(worker_id) = &handoff.worker_id {
            record = record.with_detail("worker", worker_id);
        }
        self.graph.apply_validated_status(
            &handoff.task_id,
            handoff.status.target_status(),
            handoff.reason.clone(),
            handoff.worker_id.clone(),
            &record,
        )?;
        self.knowledge.record_handoff(&handoff)?;

        if let Some(worker_id) = &handoff.worker_id {
            match self.tracker.mark_completed(worker_id, actor) {
                Ok(_) => {}
                Err(EngineError::NotFound { .. }) => {
                    debug!(worker = %worker_id, "handoff names an untracked worker");
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            task = %handoff.task_id,
            status = handoff.status.as_str(),
            "handoff accepted"
        );
        Ok(handoff)
    }

    pub fn read_handoff(&self, task_id: &str) -> Result<Option<Handoff>, EngineError> {
        self.knowledge.read_handoff(task_id)
    }

    // ── queries ──

    pub fn snapshot(&self) -> Result<StateSnapshot, EngineError> {
        self.store.snapshot()
    }

    pub fn audit_trail(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, EngineError> {
        self.store.audit().query(filter)
    }

    // ── serving ──

    /// Run the daemon side of the engine until `shutdown` flips to `true`:
    /// the change watcher, the worker supervisor, and the HTTP/websocket
    /// hub, all bound to the same signal.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let state: SharedState = Arc::new(AppState {
            store: self.store.clone(),
            hub: self.hub.clone(),
        });

        let watcher = ChangeWatcher::new(self.store.clone(), self.hub.clone())
            .with_cadence(self.config.watch_interval);
        let supervisor = Supervisor::new(self.tracker.clone())
            .with_cadence(self.config.supervise_interval)
            .with_stuck_after(self.config.stuck_after)
            .with_probe_timeout(self.config.probe_timeout);

        let watcher_task = tokio::spawn(watcher.run(shutdown.clone()));
        let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

        let result = crate::hub::serve(state, &self.config.bind, shutdown).await;

        // The loops exit on the shared signal; if the server failed early
        // the signal never fired, so stop them directly.
        watcher_task.abort();
        supervisor_task.abort();
        let _ = watcher_task.await;
        let _ = supervisor_task.await;
        result
    }
}
