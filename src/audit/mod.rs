//! Append-only audit trail.
//!
//! Every accepted mutation produces exactly one [`AuditRecord`], written in
//! the same locked scope as the state change it describes. Records are never
//! rewritten or deleted; the log is the forensic history of the project.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed action vocabulary. Free-form strings never reach the log.
pub mod actions {
    pub const PROJECT_INITIALIZED: &str = "project_initialized";
    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_UPDATED: &str = "task_updated";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const DEPENDENCY_ADDED: &str = "dependency_added";
    pub const DEPENDENCY_REMOVED: &str = "dependency_removed";
    pub const GATE_APPROVED: &str = "gate_approved";
    pub const CRITERION_SATISFIED: &str = "criterion_satisfied";
    pub const STAGE_ADVANCED: &str = "stage_advanced";
    pub const STAGE_OVERRIDDEN: &str = "stage_overridden";
    pub const WORKER_REGISTERED: &str = "worker_registered";
    pub const WORKER_LINKED: &str = "worker_linked";
    pub const WORKER_COMPLETED: &str = "worker_completed";
    pub const WORKER_ERRORED: &str = "worker_errored";
    pub const WORKER_KILLED: &str = "worker_killed";
    pub const CHECKPOINT_CREATED: &str = "checkpoint_created";
    pub const HANDOFF_RECEIVED: &str = "handoff_received";
}

/// One immutable entry in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            details: BTreeMap::new(),
        }
    }

    /// Attach one contextual detail (override reason, previous status, ...).
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Criteria for filtered reads of the log. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.action.as_ref().is_none_or(|a| record.action == *a)
            && self.actor.as_ref().is_none_or(|a| record.actor == *a)
            && self.since.is_none_or(|s| record.timestamp >= s)
    }
}

pub mod logger;
pub use logger::AuditLog;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_details() {
        let record = AuditRecord::new("king", actions::STAGE_OVERRIDDEN, "implement")
            .with_detail("reason", "hotfix window")
            .with_detail("direction", "forward");
        assert_eq!(record.details.len(), 2);
        assert_eq!(record.details["reason"], "hotfix window");
    }

    #[test]
    fn empty_details_are_not_serialized() {
        let record = AuditRecord::new("system", actions::TASK_CREATED, "ab12cd34ef");
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("details"));
    }

    #[test]
    fn filter_matches_on_action_actor_and_since() {
        let record = AuditRecord::new("alice", actions::GATE_APPROVED, "design");

        let by_action = AuditFilter {
            action: Some(actions::GATE_APPROVED.to_string()),
            ..Default::default()
        };
        assert!(by_action.matches(&record));

        let wrong_actor = AuditFilter {
            actor: Some("bob".to_string()),
            ..Default::default()
        };
        assert!(!wrong_actor.matches(&record));

        let future = AuditFilter {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(!future.matches(&record));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let record = AuditRecord::new("anyone", actions::WORKER_KILLED, "w-7");
        assert!(AuditFilter::default().matches(&record));
    }
}
