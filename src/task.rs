//! Task records and status lifecycle.
//!
//! A task is identified by a content-derived id (see [`crate::ids`]) so the
//! same title/stage/persona triple always maps to the same record. Tasks are
//! never deleted; `done` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::derive_id;
use crate::persona::Persona;
use crate::stage::Stage;

/// Lifecycle states of a task.
///
/// `pending` and `ready` are derived from the dependency graph (a task is
/// `ready` once every id in `blocked_by` is `done`); `in_progress`, `blocked`
/// and `done` are declared by workers via accepted handoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }

    /// True once no further transitions are legal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    /// Whether a transition to `to` is legal from this status.
    ///
    /// A same-status "transition" is treated as a legal no-op by callers and
    /// never reaches this check.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Done, _) => false,
            (Pending, Ready) | (Pending, Blocked) => true,
            (Ready, InProgress) | (Ready, Done) | (Ready, Blocked) => true,
            (InProgress, Done) | (InProgress, Blocked) => true,
            (Blocked, Pending) | (Blocked, Ready) | (Blocked, InProgress) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work owned by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub stage: Stage,
    #[serde(default)]
    pub status: TaskStatus,
    /// Ids of tasks this one blocks (forward edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    /// Ids of tasks that must be `done` before this one is ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    /// Optional file/path hints restricting where the worker may act.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    /// Bound once a worker picks the task up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Why the task is blocked, when a worker declared it so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with a content-derived id.
    pub fn new(title: impl Into<String>, stage: Stage, persona: Option<Persona>) -> Self {
        let title = title.into();
        let persona_part = persona.map(|p| p.as_str()).unwrap_or("");
        let id = derive_id(&[&title, stage.as_str(), persona_part]);
        let now = Utc::now();
        Self {
            id,
            title,
            stage,
            status: TaskStatus::Pending,
            blocks: Vec::new(),
            blocked_by: Vec::new(),
            scope_paths: Vec::new(),
            persona,
            worker_id: None,
            blocked_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style scope restriction.
    pub fn with_scope(mut self, paths: Vec<String>) -> Self {
        self.scope_paths = paths;
        self
    }

    /// True once every dependency in `blocked_by` appears in `done_ids`.
    pub fn dependencies_met(&self, done_ids: &std::collections::HashSet<String>) -> bool {
        self.blocked_by.iter().all(|id| done_ids.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_task_is_pending_with_derived_id() {
        let task = Task::new("Write parser", Stage::Implement, Some(Persona::Developer));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.id.len(), 10);
        let again = Task::new("Write parser", Stage::Implement, Some(Persona::Developer));
        assert_eq!(task.id, again.id);
    }

    #[test]
    fn persona_participates_in_identity() {
        let dev = Task::new("Review output", Stage::Verify, Some(Persona::Developer));
        let rev = Task::new("Review output", Stage::Verify, Some(Persona::Reviewer));
        assert_ne!(dev.id, rev.id);
    }

    #[test]
    fn done_is_terminal() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(InProgress));
        assert!(Ready.can_transition_to(Done));
        assert!(InProgress.can_transition_to(Done));
        assert!(InProgress.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Ready));
    }

    #[test]
    fn illegal_transitions() {
        use TaskStatus::*;
        assert!(!Pending.can_transition_to(Done));
        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Blocked.can_transition_to(Done));
    }

    #[test]
    fn dependencies_met_requires_all_done() {
        let mut task = Task::new("Integrate", Stage::Implement, Some(Persona::Integrator));
        task.blocked_by = vec!["aaaaaaaaaa".to_string(), "bbbbbbbbbb".to_string()];

        let mut done = HashSet::new();
        done.insert("aaaaaaaaaa".to_string());
        assert!(!task.dependencies_met(&done));

        done.insert("bbbbbbbbbb".to_string());
        assert!(task.dependencies_met(&done));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let back: TaskStatus = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(back, TaskStatus::Blocked);
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = Task::new("Ship it", Stage::Release, Some(Persona::Devops))
            .with_scope(vec!["deploy/**".to_string()]);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }
}
