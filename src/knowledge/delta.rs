//! Structural diffs between a checkpoint and a later state.
//!
//! A delta is derived, never authored: it names the tasks that appeared,
//! the status moves, and the stage/gate movement since its base checkpoint.
//! Worker records are runtime state and stay out of the diff, matching what
//! checkpoints capture.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gates::Gate;
use crate::stage::{Stage, StageState};
use crate::store::StateSnapshot;
use crate::task::{Task, TaskStatus};

use super::checkpoint::Checkpoint;

/// A task whose status moved since the base checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskChange {
    pub id: String,
    pub title: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageChange {
    pub from: Stage,
    pub to: Stage,
}

/// Gate movement for one stage since the base checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateChange {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub newly_satisfied: Vec<String>,
    #[serde(default)]
    pub newly_approved: bool,
}

/// Everything that changed between a checkpoint and a later state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Id of the base checkpoint.
    pub since: String,
    pub computed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_change: Option<StageChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_tasks: Vec<TaskChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_changes: Vec<GateChange>,
}

impl Delta {
    /// True when the later state is structurally identical to the base.
    pub fn is_empty(&self) -> bool {
        self.stage_change.is_none()
            && self.added_tasks.is_empty()
            && self.changed_tasks.is_empty()
            && self.gate_changes.is_empty()
    }
}

/// Diff `base` against the current live state.
pub fn compute_delta(base: &Checkpoint, state: &StateSnapshot) -> Delta {
    diff(base, &state.stage, &state.tasks, &state.gates)
}

/// Diff `base` against a later checkpoint, for delta chains.
pub fn compute_delta_between(base: &Checkpoint, later: &Checkpoint) -> Delta {
    diff(base, &later.stage, &later.tasks, &later.gates)
}

fn diff(
    base: &Checkpoint,
    stage: &StageState,
    tasks: &[Task],
    gates: &BTreeMap<Stage, Gate>,
) -> Delta {
    let stage_change = (base.stage.current != stage.current).then(|| StageChange {
        from: base.stage.current,
        to: stage.current,
    });

    let before: HashMap<&str, &Task> = base.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut added_tasks = Vec::new();
    let mut changed_tasks = Vec::new();
    for task in tasks {
        match before.get(task.id.as_str()) {
            None => added_tasks.push(task.clone()),
            Some(old) if old.status != task.status => changed_tasks.push(TaskChange {
                id: task.id.clone(),
                title: task.title.clone(),
                from: old.status,
                to: task.status,
            }),
            Some(_) => {}
        }
    }

    let mut gate_changes = Vec::new();
    for (stage, gate) in gates {
        let old = base.gates.get(stage);
        let newly_satisfied: Vec<String> = gate
            .criteria
            .iter()
            .filter(|c| c.satisfied)
            .filter(|c| {
                !old.map(|g| {
                    g.criteria
                        .iter()
                        .any(|oc| oc.description == c.description && oc.satisfied)
                })
                .unwrap_or(false)
            })
            .map(|c| c.description.clone())
            .collect();
        let newly_approved = gate.is_approved() && !old.map(Gate::is_approved).unwrap_or(false);
        if !newly_satisfied.is_empty() || newly_approved {
            gate_changes.push(GateChange {
                stage: *stage,
                newly_satisfied,
                newly_approved,
            });
        }
    }

    Delta {
        since: base.id.clone(),
        computed_at: Utc::now(),
        stage_change,
        added_tasks,
        changed_tasks,
        gate_changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::default_gates;
    use crate::persona::Persona;

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            stage: StageState::at(Stage::Implement),
            tasks: vec![Task::new("Base task", Stage::Implement, None)],
            gates: default_gates(),
            workers: BTreeMap::new(),
        }
    }

    #[test]
    fn identical_state_yields_an_empty_delta() {
        let snap = snapshot();
        let cp = Checkpoint::capture(1, &snap);
        let delta = compute_delta(&cp, &snap);
        assert!(delta.is_empty());
        assert_eq!(delta.since, cp.id);
    }

    #[test]
    fn new_tasks_are_reported_as_added() {
        let snap = snapshot();
        let cp = Checkpoint::capture(1, &snap);

        let mut later = snap.clone();
        later
            .tasks
            .push(Task::new("Second task", Stage::Implement, Some(Persona::Developer)));

        let delta = compute_delta(&cp, &later);
        assert_eq!(delta.added_tasks.len(), 1);
        assert_eq!(delta.added_tasks[0].title, "Second task");
        assert!(delta.changed_tasks.is_empty());
    }

    #[test]
    fn status_moves_are_reported_with_both_ends() {
        let snap = snapshot();
        let cp = Checkpoint::capture(1, &snap);

        let mut later = snap.clone();
        later.tasks[0].status = TaskStatus::Done;

        let delta = compute_delta(&cp, &later);
        assert_eq!(delta.changed_tasks.len(), 1);
        assert_eq!(delta.changed_tasks[0].from, TaskStatus::Pending);
        assert_eq!(delta.changed_tasks[0].to, TaskStatus::Done);
        assert!(delta.added_tasks.is_empty());
    }

    #[test]
    fn unrelated_field_changes_do_not_register() {
        let snap = snapshot();
        let cp = Checkpoint::capture(1, &snap);

        let mut later = snap.clone();
        later.tasks[0].updated_at = Utc::now();

        assert!(compute_delta(&cp, &later).is_empty());
    }

    #[test]
    fn stage_movement_is_reported() {
        let snap = snapshot();
        let cp = Checkpoint::capture(1, &snap);

        let mut later = snap.clone();
        later.stage = StageState::at(Stage::Verify);

        let delta = compute_delta(&cp, &later);
        let change = delta.stage_change.expect("stage change");
        assert_eq!(change.from, Stage::Implement);
        assert_eq!(change.to, Stage::Verify);
    }

    #[test]
    fn gate_satisfaction_and_approval_are_reported() {
        let snap = snapshot();
        let cp = Checkpoint::capture(1, &snap);

        let mut later = snap.clone();
        if let Some(gate) = later.gates.get_mut(&Stage::Implement) {
            gate.criteria[0].satisfied = true;
            gate.approved_at = Some(Utc::now());
            gate.approved_by = Some("king".to_string());
        }

        let delta = compute_delta(&cp, &later);
        assert_eq!(delta.gate_changes.len(), 1);
        let change = &delta.gate_changes[0];
        assert_eq!(change.stage, Stage::Implement);
        assert_eq!(change.newly_satisfied, vec!["All tasks complete"]);
        assert!(change.newly_approved);
    }

    #[test]
    fn already_satisfied_criteria_do_not_re_report() {
        let mut snap = snapshot();
        if let Some(gate) = snap.gates.get_mut(&Stage::Discovery) {
            gate.criteria[0].satisfied = true;
        }
        let cp = Checkpoint::capture(1, &snap);

        assert!(compute_delta(&cp, &snap).is_empty());
    }

    #[test]
    fn checkpoint_chain_diffs_between_snapshots() {
        let snap = snapshot();
        let first = Checkpoint::capture(1, &snap);

        let mut later = snap.clone();
        later.tasks[0].status = TaskStatus::Done;
        let second = Checkpoint::capture(2, &later);

        let delta = compute_delta_between(&first, &second);
        assert_eq!(delta.changed_tasks.len(), 1);
        assert_eq!(delta.since, first.id);
    }
}
