//! Immutable full-state snapshots.
//!
//! A checkpoint captures stage, tasks and gates at one instant — worker
//! records are runtime state and deliberately not part of it. Files are
//! written once under `checkpoints/` and never touched again; the sequence
//! number grows monotonically across all stages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gates::Gate;
use crate::stage::{Stage, StageState};
use crate::store::StateSnapshot;
use crate::task::Task;

/// A write-once snapshot of the orchestrated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `cp-<stage>-<seq>`, e.g. `cp-implement-7`.
    pub id: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub stage: StageState,
    pub tasks: Vec<Task>,
    pub gates: BTreeMap<Stage, Gate>,
}

impl Checkpoint {
    /// Capture the durable fields of `snapshot` under sequence `seq`.
    pub fn capture(seq: u64, snapshot: &StateSnapshot) -> Self {
        let id = format!("cp-{}-{}", snapshot.stage.current.as_str(), seq);
        Self {
            id,
            seq,
            created_at: Utc::now(),
            stage: snapshot.stage,
            tasks: snapshot.tasks.clone(),
            gates: snapshot.gates.clone(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

/// Extract the sequence number from a checkpoint file name
/// (`cp-<stage>-<seq>.json`). Foreign files yield `None` and are ignored
/// by directory scans.
pub(crate) fn parse_seq(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_suffix(".json")?;
    let rest = stem.strip_prefix("cp-")?;
    let (_stage, seq) = rest.rsplit_once('-')?;
    seq.parse().ok()
}
