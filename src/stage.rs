//! The fixed stage sequence and its transition rules.
//!
//! Ten stages in a total order, advanced one step at a time by
//! [`StageEngine::transition`]. Any other movement goes through
//! [`StageEngine::override_to`], which demands a non-empty reason and is
//! audited as a forced transition. Stages are never created or destroyed at
//! runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditRecord, actions};
use crate::errors::{EngineError, SchemaError};
use crate::store::StateStore;

/// One step in the workflow sequence, ordered as declared.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Discovery,
    Goal,
    Requirements,
    Planning,
    Design,
    Implement,
    Verify,
    Validate,
    Document,
    Release,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Goal => "goal",
            Stage::Requirements => "requirements",
            Stage::Planning => "planning",
            Stage::Design => "design",
            Stage::Implement => "implement",
            Stage::Verify => "verify",
            Stage::Validate => "validate",
            Stage::Document => "document",
            Stage::Release => "release",
        }
    }

    /// Every stage in workflow order.
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Discovery,
            Stage::Goal,
            Stage::Requirements,
            Stage::Planning,
            Stage::Design,
            Stage::Implement,
            Stage::Verify,
            Stage::Validate,
            Stage::Document,
            Stage::Release,
        ]
    }

    /// Zero-based position in the sequence.
    pub fn position(&self) -> usize {
        Stage::all()
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    /// The immediate successor, or `None` for the final stage.
    pub fn next(&self) -> Option<Stage> {
        Stage::all().get(self.position() + 1).copied()
    }

    /// Stages that plan rather than produce: advancing out of them is legal
    /// even with zero tasks recorded against them.
    pub fn is_task_exempt(&self) -> bool {
        matches!(
            self,
            Stage::Goal | Stage::Requirements | Stage::Planning | Stage::Design
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::all()
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// The `stage.json` singleton: where the project currently is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub current: Stage,
    pub updated_at: DateTime<Utc>,
}

impl StageState {
    pub fn at(stage: Stage) -> Self {
        Self {
            current: stage,
            updated_at: Utc::now(),
        }
    }
}

impl Default for StageState {
    fn default() -> Self {
        StageState::at(Stage::Discovery)
    }
}

/// Direction of a forced stage movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideDirection {
    Forward,
    Backward,
}

impl OverrideDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideDirection::Forward => "forward",
            OverrideDirection::Backward => "backward",
        }
    }
}

/// Stage sequencing over the durable store.
///
/// This enforces *order* only. Cross-domain guards (the gate must be open,
/// non-exempt stages need tasks) live one level up in the engine facade,
/// which consults the gate and task views before calling [`transition`].
///
/// [`transition`]: StageEngine::transition
#[derive(Debug, Clone)]
pub struct StageEngine {
    store: StateStore,
}

impl StageEngine {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// The current stage.
    pub fn current(&self) -> Result<Stage, EngineError> {
        Ok(self.store.read_stage()?.current)
    }

    /// True when `to` is the immediate successor of the current stage.
    pub fn can_transition(&self, to: Stage) -> Result<bool, EngineError> {
        Ok(self.current()?.next() == Some(to))
    }

    /// Advance to the immediate successor. Anything else fails with
    /// `InvalidTransition`; use [`override_to`] for deliberate jumps.
    ///
    /// [`override_to`]: StageEngine::override_to
    pub fn transition(&self, to: Stage, actor: &str) -> Result<(), EngineError> {
        let from = self.current()?;
        if from.next() != Some(to) {
            return Err(EngineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let record = AuditRecord::new(actor, actions::STAGE_ADVANCED, to.as_str())
            .with_detail("from", from.as_str());
        self.store.write_stage(&StageState::at(to), Some(&record))?;
        info!(%from, %to, "stage advanced");
        Ok(())
    }

    /// Forced movement to any other stage. Requires a non-empty reason and
    /// a direction consistent with the target's position; always audited as
    /// `stage_overridden`.
    pub fn override_to(
        &self,
        to: Stage,
        direction: OverrideDirection,
        reason: &str,
        actor: &str,
    ) -> Result<(), EngineError> {
        if reason.trim().is_empty() {
            return Err(SchemaError::InvalidValue {
                field: "reason",
                reason: "override reason must not be empty".to_string(),
            }
            .into());
        }

        let from = self.current()?;
        let coherent = match direction {
            OverrideDirection::Forward => to.position() > from.position(),
            OverrideDirection::Backward => to.position() < from.position(),
        };
        if !coherent {
            return Err(EngineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let record = AuditRecord::new(actor, actions::STAGE_OVERRIDDEN, to.as_str())
            .with_detail("from", from.as_str())
            .with_detail("direction", direction.as_str())
            .with_detail("reason", reason.trim());
        self.store.write_stage(&StageState::at(to), Some(&record))?;
        info!(%from, %to, direction = direction.as_str(), reason, "stage overridden");
        Ok(())
    }
}
