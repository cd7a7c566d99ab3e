//! Stage gates: the approval boundary between stages.
//!
//! A gate's decision merges two criterion sets that are never substitutes
//! for each other:
//!
//! - **stored criteria** — the per-stage `{description, satisfied}` list in
//!   `gates.json`, ticked off via [`GateEngine::satisfy`];
//! - **structural requirements** — derived from the live task set on every
//!   check (all stage tasks done; a done integrator when implement work is
//!   parallel; a done reviewer for verify). Never cached, never persisted.
//!
//! `check` accumulates every unmet item rather than stopping at the first,
//! so a caller sees the whole distance to approval at once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditRecord, actions};
use crate::errors::EngineError;
use crate::persona::Persona;
use crate::stage::{Stage, StageState};
use crate::store::StateStore;
use crate::task::{Task, TaskStatus};

/// One human-defined condition a stage must meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCriterion {
    pub description: String,
    #[serde(default)]
    pub satisfied: bool,
}

impl GateCriterion {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            satisfied: false,
        }
    }
}

/// The per-stage gate document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub stage: Stage,
    pub criteria: Vec<GateCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

impl Gate {
    pub fn new(stage: Stage, criteria: Vec<GateCriterion>) -> Self {
        Self {
            stage,
            criteria,
            approved_at: None,
            approved_by: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approved_at.is_some()
    }

    /// Descriptions of stored criteria not yet satisfied.
    pub fn unmet_criteria(&self) -> Vec<String> {
        self.criteria
            .iter()
            .filter(|c| !c.satisfied)
            .map(|c| c.description.clone())
            .collect()
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateStatus {
    /// Everything met and approval recorded.
    Open,
    /// At least one criterion or structural requirement unmet.
    Closed { missing: Vec<String> },
    /// Everything met; waiting for a human approval.
    AwaitingApproval,
}

impl GateStatus {
    pub fn name(&self) -> &'static str {
        match self {
            GateStatus::Open => "open",
            GateStatus::Closed { .. } => "closed",
            GateStatus::AwaitingApproval => "awaiting_approval",
        }
    }
}

/// Result of a successful approval.
#[derive(Debug, Clone, PartialEq)]
pub struct GateApproval {
    pub stage: Stage,
    /// The stage the project moved to, `None` when release was approved.
    pub advanced_to: Option<Stage>,
}

/// The default criterion pair seeded for each stage at init.
pub fn default_criteria(stage: Stage) -> Vec<GateCriterion> {
    let pair: [&str; 2] = match stage {
        Stage::Discovery => ["Problem space explored", "Stakeholders identified"],
        Stage::Goal => ["Goal statement defined", "Success metrics established"],
        Stage::Requirements => ["Requirements documented", "Acceptance criteria defined"],
        Stage::Planning => ["Tasks broken down", "Dependencies mapped"],
        Stage::Design => ["Spec document complete", "Technical approach approved"],
        Stage::Implement => ["All tasks complete", "Code compiles"],
        Stage::Verify => ["Tests passing", "Review complete"],
        Stage::Validate => ["Acceptance criteria met", "Stakeholder sign-off"],
        Stage::Document => ["README updated", "API documented"],
        Stage::Release => ["Deployed successfully", "Smoke tests pass"],
    };
    pair.into_iter().map(GateCriterion::new).collect()
}

/// A full default gate set, one per stage.
pub fn default_gates() -> BTreeMap<Stage, Gate> {
    Stage::all()
        .iter()
        .map(|&stage| (stage, Gate::new(stage, default_criteria(stage))))
        .collect()
}

/// Gate decisions over the durable store.
#[derive(Debug, Clone)]
pub struct GateEngine {
    store: StateStore,
}

impl GateEngine {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Evaluate the gate for `stage` against stored criteria and the live
    /// task set. Read-only: checking writes nothing and audits nothing.
    pub fn check(&self, stage: Stage) -> Result<GateStatus, EngineError> {
        let gates = self.store.read_gates()?;
        let gate = gates
            .get(&stage)
            .ok_or_else(|| EngineError::not_found("gate", stage.as_str()))?;
        let tasks = self.store.read_tasks()?;

        let mut missing = gate.unmet_criteria();
        missing.extend(structural_requirements(stage, &tasks));

        if !missing.is_empty() {
            return Ok(GateStatus::Closed { missing });
        }
        if gate.is_approved() {
            Ok(GateStatus::Open)
        } else {
            Ok(GateStatus::AwaitingApproval)
        }
    }

    /// Mark a stored criterion satisfied. Idempotent: returns `false` (and
    /// writes nothing, audits nothing) when it already was.
    pub fn satisfy(&self, stage: Stage, criterion: &str, actor: &str) -> Result<bool, EngineError> {
        let gates = self.store.read_gates()?;
        let gate = gates
            .get(&stage)
            .ok_or_else(|| EngineError::not_found("gate", stage.as_str()))?;
        let Some(position) = gate.criteria.iter().position(|c| c.description == criterion) else {
            return Err(EngineError::not_found("criterion", criterion));
        };
        if gate.criteria[position].satisfied {
            return Ok(false);
        }

        let record = AuditRecord::new(actor, actions::CRITERION_SATISFIED, stage.as_str())
            .with_detail("criterion", criterion);
        self.store.update_gates(&record, |gates| {
            if let Some(gate) = gates.get_mut(&stage) {
                if let Some(c) = gate.criteria.get_mut(position) {
                    c.satisfied = true;
                }
            }
        })?;
        Ok(true)
    }

    /// Approve the gate for the current stage and advance past it.
    ///
    /// Valid only from `AwaitingApproval`; a closed or already-open gate is
    /// an `InvalidTransition`. The approval and the stage advance land
    /// together under one audit record.
    pub fn approve(&self, stage: Stage, actor: &str) -> Result<GateApproval, EngineError> {
        let current = self.store.read_stage()?.current;
        if current != stage {
            return Err(EngineError::InvalidTransition {
                from: current.to_string(),
                to: format!("approval of {stage}"),
            });
        }

        let status = self.check(stage)?;
        if status != GateStatus::AwaitingApproval {
            return Err(EngineError::InvalidTransition {
                from: format!("{} gate is {}", stage, status.name()),
                to: "approved".to_string(),
            });
        }

        let advanced_to = stage.next();
        let record = AuditRecord::new(actor, actions::GATE_APPROVED, stage.as_str()).with_detail(
            "advanced_to",
            advanced_to.map(|s| s.as_str()).unwrap_or("none"),
        );
        let now = Utc::now();
        let approver = actor.to_string();
        self.store.update_gates(&record, |gates| {
            if let Some(gate) = gates.get_mut(&stage) {
                gate.approved_at = Some(now);
                gate.approved_by = Some(approver);
            }
        })?;
        if let Some(next) = advanced_to {
            self.store.write_stage(&StageState::at(next), None)?;
        }

        info!(stage = %stage, ?advanced_to, approved_by = actor, "gate approved");
        Ok(GateApproval { stage, advanced_to })
    }
}

/// Compute the structural requirements `stage` is currently missing.
/// Recomputed from the live task set on every call, never cached.
pub(crate) fn structural_requirements(stage: Stage, tasks: &[Task]) -> Vec<String> {
    let mut missing = Vec::new();

    let open = tasks
        .iter()
        .filter(|t| t.stage == stage && t.status != TaskStatus::Done)
        .count();
    if open > 0 {
        let noun = if open == 1 { "task" } else { "tasks" };
        missing.push(format!("{} {} in {} not done", open, noun, stage.as_str()));
    }

    if stage == Stage::Implement {
        let implement_tasks = tasks.iter().filter(|t| t.stage == Stage::Implement).count();
        if implement_tasks > 1 {
            let has_done_integrator = tasks
                .iter()
                .any(|t| t.persona == Some(Persona::Integrator) && t.status == TaskStatus::Done);
            if !has_done_integrator {
                missing.push("multiple implement tasks require a done integrator task".to_string());
            }
        }
    }

    if stage == Stage::Verify {
        let has_done_reviewer = tasks
            .iter()
            .any(|t| t.persona == Some(Persona::Reviewer) && t.status == TaskStatus::Done);
        if !has_done_reviewer {
            missing.push("verify requires a done reviewer task".to_string());
        }
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use tempfile::tempdir;

    fn engine_in(dir: &std::path::Path) -> (GateEngine, StateStore) {
        let store = StateStore::open(dir.join(".crucible"));
        store.init("tester").unwrap();
        (GateEngine::new(store.clone()), store)
    }

    fn satisfy_all(engine: &GateEngine, stage: Stage) {
        for criterion in default_criteria(stage) {
            engine
                .satisfy(stage, &criterion.description, "tester")
                .unwrap();
        }
    }

    fn add_task(store: &StateStore, task: &Task) {
        store
            .append_tasks(
                std::slice::from_ref(task),
                &AuditRecord::new("tester", actions::TASK_CREATED, &task.id),
            )
            .unwrap();
    }

    #[test]
    fn default_gates_cover_every_stage() {
        let gates = default_gates();
        assert_eq!(gates.len(), 10);
        for stage in Stage::all() {
            assert_eq!(gates[stage].criteria.len(), 2);
            assert!(!gates[stage].is_approved());
        }
    }

    #[test]
    fn fresh_gate_is_closed_with_all_criteria_listed() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_in(dir.path());

        match engine.check(Stage::Discovery).unwrap() {
            GateStatus::Closed { missing } => {
                assert!(missing.contains(&"Problem space explored".to_string()));
                assert!(missing.contains(&"Stakeholders identified".to_string()));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn missing_accumulates_criteria_and_structural_items() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());

        let a = Task::new("Build API", Stage::Implement, Some(Persona::Developer));
        let b = Task::new("Build UI", Stage::Implement, Some(Persona::Developer));
        add_task(&store, &a);
        add_task(&store, &b);

        match engine.check(Stage::Implement).unwrap() {
            GateStatus::Closed { missing } => {
                assert!(missing.contains(&"All tasks complete".to_string()));
                assert!(missing.contains(&"Code compiles".to_string()));
                assert!(missing.contains(&"2 tasks in implement not done".to_string()));
                assert!(missing.contains(
                    &"multiple implement tasks require a done integrator task".to_string()
                ));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn integrator_requirement_clears_when_one_is_done() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());

        let mut a = Task::new("Build API", Stage::Implement, Some(Persona::Developer));
        a.status = TaskStatus::Done;
        let mut b = Task::new("Build UI", Stage::Implement, Some(Persona::Developer));
        b.status = TaskStatus::Done;
        let mut merge = Task::new("Merge branches", Stage::Implement, Some(Persona::Integrator));
        merge.status = TaskStatus::Done;
        add_task(&store, &a);
        add_task(&store, &b);
        add_task(&store, &merge);
        satisfy_all(&engine, Stage::Implement);

        assert_eq!(
            engine.check(Stage::Implement).unwrap(),
            GateStatus::AwaitingApproval
        );
    }

    #[test]
    fn single_implement_task_needs_no_integrator() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());

        let mut only = Task::new("Do it all", Stage::Implement, Some(Persona::Developer));
        only.status = TaskStatus::Done;
        add_task(&store, &only);
        satisfy_all(&engine, Stage::Implement);

        assert_eq!(
            engine.check(Stage::Implement).unwrap(),
            GateStatus::AwaitingApproval
        );
    }

    #[test]
    fn verify_requires_a_done_reviewer() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());
        satisfy_all(&engine, Stage::Verify);

        match engine.check(Stage::Verify).unwrap() {
            GateStatus::Closed { missing } => {
                assert_eq!(missing, vec!["verify requires a done reviewer task"]);
            }
            other => panic!("expected Closed, got {other:?}"),
        }

        let mut review = Task::new("Review changes", Stage::Verify, Some(Persona::Reviewer));
        review.status = TaskStatus::Done;
        add_task(&store, &review);

        assert_eq!(
            engine.check(Stage::Verify).unwrap(),
            GateStatus::AwaitingApproval
        );
    }

    #[test]
    fn structural_checks_are_recomputed_fresh() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());
        satisfy_all(&engine, Stage::Implement);

        let mut a = Task::new("Build API", Stage::Implement, Some(Persona::Developer));
        a.status = TaskStatus::Done;
        let mut b = Task::new("Build UI", Stage::Implement, Some(Persona::Developer));
        b.status = TaskStatus::Done;
        add_task(&store, &a);
        add_task(&store, &b);

        // Closed now; adding a done integrator flips the very next check
        // without any gate write in between.
        assert!(matches!(
            engine.check(Stage::Implement).unwrap(),
            GateStatus::Closed { .. }
        ));

        let mut merge = Task::new("Merge branches", Stage::Implement, Some(Persona::Integrator));
        merge.status = TaskStatus::Done;
        add_task(&store, &merge);

        assert_eq!(
            engine.check(Stage::Implement).unwrap(),
            GateStatus::AwaitingApproval
        );
    }

    #[test]
    fn satisfy_is_idempotent_and_audited_once() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());

        assert!(
            engine
                .satisfy(Stage::Discovery, "Problem space explored", "tester")
                .unwrap()
        );
        assert!(
            !engine
                .satisfy(Stage::Discovery, "Problem space explored", "tester")
                .unwrap()
        );

        let satisfied = store
            .audit()
            .query(&AuditFilter {
                action: Some(actions::CRITERION_SATISFIED.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(satisfied.len(), 1);
    }

    #[test]
    fn satisfy_unknown_criterion_is_not_found() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_in(dir.path());

        let err = engine
            .satisfy(Stage::Discovery, "No such criterion", "tester")
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotFound {
                kind: "criterion",
                ..
            }
        ));
    }

    #[test]
    fn approve_from_closed_is_invalid() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_in(dir.path());

        let err = engine.approve(Stage::Discovery, "king").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn approve_advances_stage_with_one_audit_record() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_in(dir.path());
        satisfy_all(&engine, Stage::Discovery);
        assert_eq!(
            engine.check(Stage::Discovery).unwrap(),
            GateStatus::AwaitingApproval
        );

        let before = store.audit().len().unwrap();
        let approval = engine.approve(Stage::Discovery, "king").unwrap();
        assert_eq!(approval.advanced_to, Some(Stage::Goal));
        assert_eq!(store.read_stage().unwrap().current, Stage::Goal);
        assert_eq!(store.audit().len().unwrap(), before + 1);

        // The approved gate now reads open.
        assert_eq!(engine.check(Stage::Discovery).unwrap(), GateStatus::Open);
    }

    #[test]
    fn approving_a_non_current_stage_is_invalid() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_in(dir.path());
        satisfy_all(&engine, Stage::Goal);

        let err = engine.approve(Stage::Goal, "king").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn double_approve_is_invalid_from_open() {
        let dir = tempdir().unwrap();
        let (engine, _store) = engine_in(dir.path());
        satisfy_all(&engine, Stage::Discovery);
        engine.approve(Stage::Discovery, "king").unwrap();

        let err = engine.approve(Stage::Discovery, "king").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }
}
