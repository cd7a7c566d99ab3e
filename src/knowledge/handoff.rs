//! Handoff parsing and two-phase validation.
//!
//! A worker finishes (or gives up on) a task by submitting a handoff
//! document: a short header of `field: value` lines, a blank line, then a
//! free-text body for the next worker. Validation happens in two phases —
//! schema first (is the artifact well-formed?), then semantics (does it
//! agree with current engine state?) — so a rejection always names which
//! layer failed.
//!
//! ```text
//! task: ab12cd34ef
//! status: complete
//! summary: Wired the hub event fanout, all topics covered
//! worker: w-7f3a
//!
//! Longer notes for whoever picks up the follow-on work...
//! ```

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::errors::{SchemaError, SemanticError};
use crate::task::{Task, TaskStatus};

/// Hard cap on the one-line summary, independent of configured limits.
pub const MAX_SUMMARY_CHARS: usize = 500;

static TASK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^task:[ \t]*(\S+)[ \t\r]*$").unwrap());

static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^status:[ \t]*(\S+)[ \t\r]*$").unwrap());

static SUMMARY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^summary:[ \t]*(.+)$").unwrap());

static REASON_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^reason:[ \t]*(.+)$").unwrap());

static WORKER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^worker:[ \t]*(\S+)[ \t\r]*$").unwrap());

// First blank line separates the header from the body.
static BODY_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r?\n[ \t]*\r?\n").unwrap());

/// Outcome a handoff claims for its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Complete,
    Blocked,
    Partial,
}

impl HandoffStatus {
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("complete") {
            Some(HandoffStatus::Complete)
        } else if value.eq_ignore_ascii_case("blocked") {
            Some(HandoffStatus::Blocked)
        } else if value.eq_ignore_ascii_case("partial") {
            Some(HandoffStatus::Partial)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Complete => "complete",
            HandoffStatus::Blocked => "blocked",
            HandoffStatus::Partial => "partial",
        }
    }

    /// Task status this handoff moves its task to when accepted.
    pub fn target_status(&self) -> TaskStatus {
        match self {
            HandoffStatus::Complete => TaskStatus::Done,
            HandoffStatus::Blocked => TaskStatus::Blocked,
            HandoffStatus::Partial => TaskStatus::InProgress,
        }
    }
}

/// A parsed handoff document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub task_id: String,
    pub status: HandoffStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl Handoff {
    /// Parse the raw payload, enforcing shape only. Header fields are read
    /// from the section before the first blank line, so a body that happens
    /// to contain `status:` lines cannot spoof the header.
    pub fn parse(payload: &str, min_body_chars: usize) -> Result<Self, SchemaError> {
        let mut sections = BODY_SPLIT.splitn(payload, 2);
        let header = sections.next().unwrap_or("");
        let body = sections.next().unwrap_or("").trim().to_string();

        let task_id = capture(&TASK_LINE, header)
            .ok_or(SchemaError::MissingField { field: "task" })?;

        let status_raw =
            capture(&STATUS_LINE, header).ok_or(SchemaError::MissingField { field: "status" })?;
        let status = HandoffStatus::parse(&status_raw).ok_or_else(|| SchemaError::InvalidValue {
            field: "status",
            reason: format!("expected complete, blocked, or partial, got '{status_raw}'"),
        })?;

        let summary = capture(&SUMMARY_LINE, header)
            .filter(|s| !s.is_empty())
            .ok_or(SchemaError::MissingField { field: "summary" })?;
        let summary_chars = summary.chars().count();
        if summary_chars > MAX_SUMMARY_CHARS {
            return Err(SchemaError::SummaryTooLong {
                max: MAX_SUMMARY_CHARS,
                got: summary_chars,
            });
        }

        let body_chars = body.chars().count();
        if body_chars < min_body_chars {
            return Err(SchemaError::BodyTooShort {
                length: body_chars,
                minimum: min_body_chars,
            });
        }

        Ok(Handoff {
            task_id,
            status,
            summary,
            reason: capture(&REASON_LINE, header),
            worker_id: capture(&WORKER_LINE, header),
            body,
            received_at: Utc::now(),
        })
    }

    /// Check this handoff against current task state. Schema must already
    /// have passed; this phase only asks whether the claim is consistent.
    pub fn validate(&self, tasks: &[Task]) -> Result<(), SemanticError> {
        let task = tasks
            .iter()
            .find(|t| t.id == self.task_id)
            .ok_or_else(|| SemanticError::UnknownTask {
                id: self.task_id.clone(),
            })?;

        if self.status == HandoffStatus::Blocked && self.reason.is_none() {
            return Err(SemanticError::MissingBlockedReason);
        }

        if self.status == HandoffStatus::Complete {
            let done: std::collections::HashSet<&str> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Done)
                .map(|t| t.id.as_str())
                .collect();
            if let Some(unmet) = task
                .blocked_by
                .iter()
                .find(|dep| !done.contains(dep.as_str()))
            {
                return Err(SemanticError::InconsistentDependency {
                    id: task.id.clone(),
                    dependency: unmet.clone(),
                });
            }
        }

        let to = self.status.target_status();
        // Redelivery of the same outcome is legal; it renews the record
        // without moving the task.
        if task.status != to && !task.status.can_transition_to(to) {
            return Err(SemanticError::IllegalStatusChange {
                id: task.id.clone(),
                from: task.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!("{}-handoff.json", self.task_id)
    }
}

fn capture(re: &Regex, header: &str) -> Option<String> {
    re.captures(header)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}
