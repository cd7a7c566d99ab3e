//! Briefing compilation: bounded resumption context for a fresh worker.
//!
//! A briefing is what a newly spawned worker gets instead of the full
//! project history: the task header, the base checkpoint reference, the
//! one-line summaries of its finished dependencies, and the delta chain
//! since the checkpoint. When the whole document would exceed the token
//! bound, whole deltas are dropped oldest-first until it fits — the header
//! and predecessor summaries always survive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::persona::Persona;
use crate::stage::Stage;
use crate::task::Task;

use super::checkpoint::Checkpoint;
use super::delta::Delta;
use super::tokens::count_tokens;

/// The one-line summary a finished dependency handed off with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredecessorSummary {
    pub task_id: String,
    pub title: String,
    pub summary: String,
}

/// Bounded resumption context compiled for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Briefing {
    pub task_id: String,
    pub title: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_paths: Vec<String>,
    pub checkpoint_id: String,
    pub compiled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predecessors: Vec<PredecessorSummary>,
    /// Retained delta chain, oldest first. Newest deltas survive truncation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<Delta>,
    /// How many oldest whole deltas were dropped to fit the bound.
    #[serde(default)]
    pub dropped_deltas: usize,
    /// Measured size of the compiled document.
    pub token_count: u64,
}

impl Briefing {
    pub fn file_name(&self) -> String {
        format!("{}-briefing.json", self.task_id)
    }
}

/// Assemble a briefing for `task` from `checkpoint` plus `deltas`, keeping
/// the measured size at or under `max_tokens`. Truncation granularity is a
/// whole delta; deltas never survive partially.
pub fn compile(
    task: &Task,
    checkpoint: &Checkpoint,
    deltas: &[Delta],
    predecessors: Vec<PredecessorSummary>,
    max_tokens: u64,
) -> Result<Briefing, EngineError> {
    let mut briefing = Briefing {
        task_id: task.id.clone(),
        title: task.title.clone(),
        stage: task.stage,
        persona: task.persona,
        scope_paths: task.scope_paths.clone(),
        checkpoint_id: checkpoint.id.clone(),
        compiled_at: Utc::now(),
        predecessors,
        deltas: deltas.to_vec(),
        dropped_deltas: 0,
        token_count: 0,
    };

    loop {
        let rendered = serde_json::to_string(&briefing)
            .map_err(|e| anyhow::anyhow!("briefing serialization: {e}"))?;
        let measured = count_tokens(&rendered);
        if measured <= max_tokens || briefing.deltas.is_empty() {
            briefing.token_count = measured;
            return Ok(briefing);
        }
        briefing.deltas.remove(0);
        briefing.dropped_deltas += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageState;
    use crate::store::StateSnapshot;
    use crate::task::TaskStatus;
    use std::collections::BTreeMap;

    fn base() -> (Task, Checkpoint) {
        let task = Task::new("Wire the hub", Stage::Implement, Some(Persona::Developer));
        let snapshot = StateSnapshot {
            stage: StageState::at(Stage::Implement),
            tasks: vec![task.clone()],
            gates: crate::gates::default_gates(),
            workers: BTreeMap::new(),
        };
        (task, Checkpoint::capture(1, &snapshot))
    }

    fn bulky_delta(n: usize, words_each: usize) -> Delta {
        // Added tasks with long titles make each delta cost real tokens.
        let title = "artifact ".repeat(words_each);
        Delta {
            since: "cp-implement-1".to_string(),
            computed_at: Utc::now(),
            stage_change: None,
            added_tasks: vec![Task::new(
                format!("{title}{n}"),
                Stage::Implement,
                None,
            )],
            changed_tasks: Vec::new(),
            gate_changes: Vec::new(),
        }
    }

    #[test]
    fn everything_kept_under_a_generous_bound() {
        let (task, cp) = base();
        let deltas = vec![bulky_delta(1, 4), bulky_delta(2, 4)];

        let briefing = compile(&task, &cp, &deltas, Vec::new(), 100_000).unwrap();
        assert_eq!(briefing.deltas.len(), 2);
        assert_eq!(briefing.dropped_deltas, 0);
        assert!(briefing.token_count <= 100_000);
        assert_eq!(briefing.checkpoint_id, cp.id);
    }

    #[test]
    fn oldest_deltas_are_dropped_first() {
        let (task, cp) = base();
        // Enough bulk that a tight bound cannot hold all three.
        let deltas = vec![bulky_delta(1, 60), bulky_delta(2, 60), bulky_delta(3, 60)];

        let unbounded = compile(&task, &cp, &deltas, Vec::new(), u64::MAX).unwrap();
        let bound = unbounded.token_count - 50;
        let briefing = compile(&task, &cp, &deltas, Vec::new(), bound).unwrap();

        assert!(briefing.dropped_deltas >= 1);
        assert!(briefing.token_count <= bound);
        // The newest delta always survives ahead of older ones.
        let last = briefing.deltas.last().expect("newest delta retained");
        assert!(last.added_tasks[0].title.ends_with('3'));
    }

    #[test]
    fn truncation_is_whole_delta_only() {
        let (task, cp) = base();
        let deltas = vec![bulky_delta(1, 60), bulky_delta(2, 60)];

        let unbounded = compile(&task, &cp, &deltas, Vec::new(), u64::MAX).unwrap();
        let briefing = compile(&task, &cp, &deltas, Vec::new(), unbounded.token_count - 10).unwrap();

        // One whole delta gone, the other intact.
        assert_eq!(briefing.dropped_deltas, 1);
        assert_eq!(briefing.deltas.len(), 1);
        assert_eq!(briefing.deltas[0].added_tasks.len(), 1);
    }

    #[test]
    fn header_survives_even_an_impossible_bound() {
        let (task, cp) = base();
        let deltas = vec![bulky_delta(1, 20)];

        let briefing = compile(&task, &cp, &deltas, Vec::new(), 1).unwrap();
        assert!(briefing.deltas.is_empty());
        assert_eq!(briefing.dropped_deltas, 1);
        assert_eq!(briefing.task_id, task.id);
        assert!(briefing.token_count > 1);
    }

    #[test]
    fn predecessor_summaries_ride_along() {
        let (task, cp) = base();
        let predecessors = vec![PredecessorSummary {
            task_id: "ab12cd34ef".to_string(),
            title: "Design the schema".to_string(),
            summary: "Schema agreed, three tables, see migrations/001".to_string(),
        }];

        let briefing = compile(&task, &cp, &[], predecessors, 100_000).unwrap();
        assert_eq!(briefing.predecessors.len(), 1);
        assert_eq!(briefing.file_name(), format!("{}-briefing.json", task.id));
    }

    #[test]
    fn status_delta_round_trips_inside_a_briefing() {
        let (task, cp) = base();
        let delta = Delta {
            since: cp.id.clone(),
            computed_at: Utc::now(),
            stage_change: None,
            added_tasks: Vec::new(),
            changed_tasks: vec![crate::knowledge::delta::TaskChange {
                id: task.id.clone(),
                title: task.title.clone(),
                from: TaskStatus::Ready,
                to: TaskStatus::Done,
            }],
            gate_changes: Vec::new(),
        };

        let briefing = compile(&task, &cp, &[delta], Vec::new(), 100_000).unwrap();
        let json = serde_json::to_string(&briefing).unwrap();
        let back: Briefing = serde_json::from_str(&json).unwrap();
        assert_eq!(back.deltas[0].changed_tasks[0].to, TaskStatus::Done);
    }
}
