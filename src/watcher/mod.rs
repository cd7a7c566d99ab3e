//! Change detection over persisted state.
//!
//! The watcher re-reads every resource on a fixed cadence and diffs the
//! result against its own last-seen snapshot. It reacts to what the state
//! says, not to raw file writes: a rewrite that changes nothing semantic
//! (same task content appended again, a stage marker refreshed in place)
//! produces no event, and each real change produces exactly one.
//!
//! Everything that reaches disk flows through here — task and stage changes,
//! worker registry flips (including silent supervision writes), gate
//! readiness and approval, audit appends. The one in-memory exception is
//! budget tracking, which the engine publishes directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::events::EngineEvent;
use crate::gates::{Gate, structural_requirements};
use crate::hub::EventHub;
use crate::store::{StateSnapshot, StateStore};
use crate::task::Task;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The watcher's memory between polls.
struct Cursor {
    snapshot: StateSnapshot,
    audit_len: usize,
}

impl Cursor {
    fn seed(store: &StateStore) -> Result<Self, EngineError> {
        Ok(Self {
            snapshot: store.snapshot()?,
            audit_len: store.audit().len()?,
        })
    }
}

/// Polls the store and publishes one typed event per semantic change.
pub struct ChangeWatcher {
    store: StateStore,
    hub: EventHub,
    poll_interval: Duration,
}

impl ChangeWatcher {
    pub fn new(store: StateStore, hub: EventHub) -> Self {
        Self {
            store,
            hub,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_cadence(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(10));
        self
    }

    /// Poll until the shutdown signal flips (or its sender goes away).
    ///
    /// The cursor seeds from the state as it stands at startup, so existing
    /// state produces no replay — listeners get history from the hub's
    /// hydration snapshot instead.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cursor: Option<Cursor> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match &mut cursor {
                        None => match Cursor::seed(&self.store) {
                            Ok(seeded) => cursor = Some(seeded),
                            Err(err) => warn!(%err, "cannot seed watch cursor yet"),
                        },
                        Some(cursor) => match self.observe(cursor) {
                            Ok(events) => {
                                for event in events {
                                    self.hub.publish(event);
                                }
                            }
                            Err(err) => warn!(%err, "watch poll failed"),
                        },
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("change watcher stopped");
    }

    /// One poll: read, diff against the cursor, advance the cursor.
    fn observe(&self, cursor: &mut Cursor) -> Result<Vec<EngineEvent>, EngineError> {
        let snapshot = self.store.snapshot()?;
        let audit = self.store.audit().read_all()?;

        let mut events = diff(&cursor.snapshot, &snapshot);
        if audit.len() < cursor.audit_len {
            warn!(
                previous = cursor.audit_len,
                current = audit.len(),
                "audit log shrank; resetting the cursor"
            );
            cursor.audit_len = audit.len();
        }
        for record in audit.iter().skip(cursor.audit_len) {
            events.push(EngineEvent::AuditAppended {
                record: record.clone(),
            });
        }

        cursor.snapshot = snapshot;
        cursor.audit_len = audit.len();
        Ok(events)
    }
}

/// Structural diff between two snapshots. Tasks and workers are never
/// deleted, so only appearance and content changes are considered.
fn diff(previous: &StateSnapshot, current: &StateSnapshot) -> Vec<EngineEvent> {
    let mut events = Vec::new();

    if previous.stage.current != current.stage.current {
        events.push(EngineEvent::StageChanged {
            previous: previous.stage.current,
            current: current.stage.current,
        });
    }

    let before_tasks: HashMap<&str, &Task> = previous
        .tasks
        .iter()
        .map(|task| (task.id.as_str(), task))
        .collect();
    for task in &current.tasks {
        match before_tasks.get(task.id.as_str()) {
            None => events.push(EngineEvent::TaskCreated { task: task.clone() }),
            Some(before) if **before != *task => events.push(EngineEvent::TaskUpdated {
                task_id: task.id.clone(),
                status: task.status,
                task: task.clone(),
            }),
            Some(_) => {}
        }
    }

    for (stage, gate) in &current.gates {
        let before = previous.gates.get(stage);
        if gate.is_approved() && !before.is_some_and(Gate::is_approved) {
            events.push(EngineEvent::GateApproved { stage: *stage });
        }
        let was_ready = before.is_some_and(|g| gate_is_ready(g, &previous.tasks));
        if gate_is_ready(gate, &current.tasks) && !was_ready {
            events.push(EngineEvent::GateReady { stage: *stage });
        }
    }

    for (id, worker) in &current.workers {
        match previous.workers.get(id) {
            None => events.push(EngineEvent::WorkerSpawned {
                worker: worker.clone(),
            }),
            Some(before) if before.status != worker.status => {
                if worker.status.is_terminal() {
                    events.push(EngineEvent::WorkerCompleted {
                        worker_id: id.clone(),
                        status: worker.status,
                    });
                } else {
                    events.push(EngineEvent::WorkerStatusChanged {
                        worker_id: id.clone(),
                        from: before.status,
                        to: worker.status,
                    });
                }
            }
            Some(_) => {}
        }
    }

    events
}

/// All stored criteria met, no structural gaps, approval still outstanding.
fn gate_is_ready(gate: &Gate, tasks: &[Task]) -> bool {
    !gate.is_approved()
        && gate.unmet_criteria().is_empty()
        && structural_requirements(gate.stage, tasks).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecord, actions};
    use crate::gates::{GateEngine, default_criteria};
    use crate::persona::Persona;
    use crate::stage::{Stage, StageState};
    use crate::task::TaskStatus;
    use crate::tracker::{ProcessTracker, WorkerStatus, probe::fake::FakeProbe};
    use chrono::Utc;
    use tempfile::tempdir;

    fn watcher_in(dir: &std::path::Path) -> (ChangeWatcher, StateStore) {
        let store = StateStore::open(dir.join(".crucible"));
        store.init("tester").unwrap();
        let watcher = ChangeWatcher::new(store.clone(), EventHub::new());
        (watcher, store)
    }

    fn audit_events(events: &[EngineEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::AuditAppended { .. }))
            .count()
    }

    #[test]
    fn seeding_reports_no_existing_state() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let task = Task::new("Pre-existing", Stage::Discovery, None);
        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_CREATED, &task.id),
            )
            .unwrap();

        let mut cursor = Cursor::seed(&store).unwrap();
        assert!(watcher.observe(&mut cursor).unwrap().is_empty());
    }

    #[test]
    fn task_creation_and_update_each_emit_once() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let mut cursor = Cursor::seed(&store).unwrap();

        let task = Task::new("Ship feature", Stage::Discovery, Some(Persona::Developer));
        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_CREATED, &task.id),
            )
            .unwrap();

        let events = watcher.observe(&mut cursor).unwrap();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, EngineEvent::TaskCreated { task: t } if t.id == task.id))
        );
        assert_eq!(audit_events(&events), 1);

        let mut updated = task.clone();
        updated.status = TaskStatus::Ready;
        updated.updated_at = Utc::now();
        store
            .append_tasks(
                std::slice::from_ref(&updated),
                &AuditRecord::new("tester", actions::TASK_UPDATED, &updated.id),
            )
            .unwrap();

        let events = watcher.observe(&mut cursor).unwrap();
        let update = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::TaskUpdated {
                    task_id, status, ..
                } => Some((task_id.clone(), *status)),
                _ => None,
            })
            .unwrap();
        assert_eq!(update, (task.id.clone(), TaskStatus::Ready));
        // The same change never also surfaces as a creation.
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, EngineEvent::TaskCreated { .. }))
        );
    }

    #[test]
    fn noop_rewrites_emit_nothing() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let mut cursor = Cursor::seed(&store).unwrap();

        // Same stage value, fresh timestamp, no audit record.
        store
            .write_stage(&StageState::at(Stage::Discovery), None)
            .unwrap();
        assert!(watcher.observe(&mut cursor).unwrap().is_empty());
    }

    #[test]
    fn identical_task_reappend_is_not_an_update() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let task = Task::new("Stable task", Stage::Discovery, None);
        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_CREATED, &task.id),
            )
            .unwrap();
        let mut cursor = Cursor::seed(&store).unwrap();

        store
            .append_tasks(
                std::slice::from_ref(&task),
                &AuditRecord::new("tester", actions::TASK_UPDATED, &task.id),
            )
            .unwrap();

        let events = watcher.observe(&mut cursor).unwrap();
        // The audit append is real; the task content did not change.
        assert_eq!(audit_events(&events), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn stage_movement_emits_previous_and_current() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let mut cursor = Cursor::seed(&store).unwrap();

        store.write_stage(&StageState::at(Stage::Goal), None).unwrap();

        let events = watcher.observe(&mut cursor).unwrap();
        assert_eq!(
            events,
            vec![EngineEvent::StageChanged {
                previous: Stage::Discovery,
                current: Stage::Goal,
            }]
        );
    }

    #[test]
    fn worker_lifecycle_surfaces_spawn_flip_and_completion() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let tracker = ProcessTracker::with_probe(store.clone(), FakeProbe::running(true));
        let mut cursor = Cursor::seed(&store).unwrap();

        tracker
            .register("w-1", Persona::Developer, None, "tester")
            .unwrap();
        let events = watcher.observe(&mut cursor).unwrap();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, EngineEvent::WorkerSpawned { worker } if worker.id == "w-1"))
        );

        tracker.link("w-1", 4242, "tester").unwrap();
        let events = watcher.observe(&mut cursor).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::WorkerStatusChanged {
                from: WorkerStatus::Pending,
                to: WorkerStatus::Running,
                ..
            }
        )));

        tracker.mark_completed("w-1", "tester").unwrap();
        let events = watcher.observe(&mut cursor).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::WorkerCompleted {
                status: WorkerStatus::Completed,
                ..
            }
        )));
        // Terminal flips surface once, not as a status change as well.
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, EngineEvent::WorkerStatusChanged { .. }))
        );
    }

    #[test]
    fn supervision_flips_surface_without_audit_noise() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let tracker = ProcessTracker::with_probe(store.clone(), FakeProbe::running(true));
        tracker
            .register("w-1", Persona::Developer, None, "tester")
            .unwrap();
        tracker.link("w-1", 4242, "tester").unwrap();
        let mut cursor = Cursor::seed(&store).unwrap();

        // The supervisor writes flips with no audit record.
        store
            .update_workers(None, |workers| {
                workers.get_mut("w-1").unwrap().status = WorkerStatus::Stuck;
            })
            .unwrap();

        let events = watcher.observe(&mut cursor).unwrap();
        assert_eq!(
            events,
            vec![EngineEvent::WorkerStatusChanged {
                worker_id: "w-1".into(),
                from: WorkerStatus::Running,
                to: WorkerStatus::Stuck,
            }]
        );
    }

    #[test]
    fn heartbeats_alone_produce_no_events() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let tracker = ProcessTracker::with_probe(store.clone(), FakeProbe::running(true));
        tracker
            .register("w-1", Persona::Developer, None, "tester")
            .unwrap();
        tracker.link("w-1", 4242, "tester").unwrap();
        let mut cursor = Cursor::seed(&store).unwrap();

        tracker.heartbeat("w-1").unwrap();
        assert!(watcher.observe(&mut cursor).unwrap().is_empty());
    }

    #[test]
    fn gate_readiness_fires_once_then_approval() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let gates = GateEngine::new(store.clone());
        let mut cursor = Cursor::seed(&store).unwrap();

        for criterion in default_criteria(Stage::Discovery) {
            gates
                .satisfy(Stage::Discovery, &criterion.description, "tester")
                .unwrap();
        }
        let events = watcher.observe(&mut cursor).unwrap();
        let ready: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::GateReady { .. }))
            .collect();
        assert_eq!(ready.len(), 1);
        assert!(matches!(
            ready[0],
            EngineEvent::GateReady {
                stage: Stage::Discovery
            }
        ));

        // Stable readiness does not re-fire.
        assert!(watcher.observe(&mut cursor).unwrap().is_empty());

        gates.approve(Stage::Discovery, "king").unwrap();
        let events = watcher.observe(&mut cursor).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::GateApproved {
                stage: Stage::Discovery
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::StageChanged {
                current: Stage::Goal,
                ..
            }
        )));
        // Approval closed the window; no fresh readiness for discovery.
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, EngineEvent::GateReady { .. }))
        );
    }

    #[test]
    fn audit_appends_stream_in_order() {
        let dir = tempdir().unwrap();
        let (watcher, store) = watcher_in(dir.path());
        let mut cursor = Cursor::seed(&store).unwrap();

        store
            .audit()
            .append(&AuditRecord::new("a", actions::TASK_CREATED, "t1"))
            .unwrap();
        store
            .audit()
            .append(&AuditRecord::new("b", actions::TASK_UPDATED, "t1"))
            .unwrap();

        let events = watcher.observe(&mut cursor).unwrap();
        let actions_seen: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::AuditAppended { record } => Some(record.action.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(actions_seen, vec![actions::TASK_CREATED, actions::TASK_UPDATED]);
    }
}
