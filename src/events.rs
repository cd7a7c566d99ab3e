//! Typed change events and the wire protocol shared with listeners.
//!
//! Every semantic state change maps to exactly one [`EngineEvent`]. On the
//! wire an event is a `{topic, type, data}` JSON object; the topic groups
//! events so listeners can subscribe to a subset. The watcher produces most
//! events by diffing persisted state; budget threshold crossings come
//! straight from the token ledger since that state never touches disk.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audit::AuditRecord;
use crate::knowledge::BudgetEvent;
use crate::stage::Stage;
use crate::task::{Task, TaskStatus};
use crate::tracker::{WorkerRecord, WorkerStatus};

/// Broadcast topics a listener can subscribe to.
///
/// `sync` is reserved for hydration frames and bypasses subscription
/// filtering; the other five are the default subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Stage,
    Tasks,
    Gates,
    Workers,
    Audit,
    Sync,
}

impl Topic {
    /// Every subscribable topic, the default set for a new listener.
    pub const ALL: [Topic; 5] = [
        Topic::Stage,
        Topic::Tasks,
        Topic::Gates,
        Topic::Workers,
        Topic::Audit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Stage => "stage",
            Topic::Tasks => "tasks",
            Topic::Gates => "gates",
            Topic::Workers => "workers",
            Topic::Audit => "audit",
            Topic::Sync => "sync",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        match name {
            "stage" => Some(Topic::Stage),
            "tasks" => Some(Topic::Tasks),
            "gates" => Some(Topic::Gates),
            "workers" => Some(Topic::Workers),
            "audit" => Some(Topic::Audit),
            "sync" => Some(Topic::Sync),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One semantic state change.
///
/// Serializes as `{"type": "...", "data": {...}}`; [`frame`](Self::frame)
/// adds the topic for the wire. A worker status flip produces either
/// `worker_completed` (when the new status is terminal) or
/// `worker_status_changed` — never both for the same flip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    StageChanged {
        previous: Stage,
        current: Stage,
    },
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task_id: String,
        status: TaskStatus,
        task: Task,
    },
    WorkerSpawned {
        worker: WorkerRecord,
    },
    WorkerCompleted {
        worker_id: String,
        status: WorkerStatus,
    },
    WorkerStatusChanged {
        worker_id: String,
        from: WorkerStatus,
        to: WorkerStatus,
    },
    GateReady {
        stage: Stage,
    },
    GateApproved {
        stage: Stage,
    },
    BudgetThreshold {
        worker_id: String,
        threshold: u8,
        used: u64,
        budget: u64,
    },
    AuditAppended {
        record: AuditRecord,
    },
}

impl EngineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            EngineEvent::StageChanged { .. } => Topic::Stage,
            EngineEvent::TaskCreated { .. } | EngineEvent::TaskUpdated { .. } => Topic::Tasks,
            EngineEvent::GateReady { .. } | EngineEvent::GateApproved { .. } => Topic::Gates,
            EngineEvent::WorkerSpawned { .. }
            | EngineEvent::WorkerCompleted { .. }
            | EngineEvent::WorkerStatusChanged { .. }
            | EngineEvent::BudgetThreshold { .. } => Topic::Workers,
            EngineEvent::AuditAppended { .. } => Topic::Audit,
        }
    }

    /// The wire shape: `{topic, type, data}`.
    pub fn frame(&self) -> Value {
        let Ok(Value::Object(mut map)) = serde_json::to_value(self) else {
            // These payloads serialize infallibly; keep the wire alive anyway.
            return json!({ "topic": self.topic().as_str(), "type": "unserializable" });
        };
        map.insert(
            "topic".to_string(),
            Value::String(self.topic().as_str().to_string()),
        );
        Value::Object(map)
    }
}

impl From<BudgetEvent> for EngineEvent {
    fn from(event: BudgetEvent) -> Self {
        EngineEvent::BudgetThreshold {
            worker_id: event.worker_id,
            threshold: event.threshold,
            used: event.used,
            budget: event.budget,
        }
    }
}

/// The hydration frame a listener receives before any live event.
pub fn sync_frame(data: Value) -> Value {
    json!({
        "topic": Topic::Sync.as_str(),
        "type": "initial_state",
        "data": data,
    })
}

/// Commands a listener may send back over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe { topics: Vec<Topic> },
    Unsubscribe { topics: Vec<Topic> },
    RequestSync,
}

impl ClientCommand {
    /// Parse a client text frame.
    ///
    /// Malformed JSON or an unknown command type is `None`; unrecognized
    /// topic names inside a known command are skipped rather than fatal.
    pub fn parse(text: &str) -> Option<ClientCommand> {
        let value: Value = serde_json::from_str(text).ok()?;
        let kind = value.get("type").and_then(|v| v.as_str())?;
        match kind {
            "subscribe" => Some(ClientCommand::Subscribe {
                topics: topics_of(&value),
            }),
            "unsubscribe" => Some(ClientCommand::Unsubscribe {
                topics: topics_of(&value),
            }),
            "request_sync" => Some(ClientCommand::RequestSync),
            _ => None,
        }
    }
}

fn topics_of(value: &Value) -> Vec<Topic> {
    value
        .get("data")
        .and_then(|data| data.get("topics"))
        .and_then(|topics| topics.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.as_str())
                .filter_map(Topic::parse)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_topic_type_and_data() {
        let event = EngineEvent::StageChanged {
            previous: Stage::Discovery,
            current: Stage::Goal,
        };
        let frame = event.frame();
        assert_eq!(frame["topic"], "stage");
        assert_eq!(frame["type"], "stage_changed");
        assert_eq!(frame["data"]["previous"], "discovery");
        assert_eq!(frame["data"]["current"], "goal");
    }

    #[test]
    fn events_route_to_their_topics() {
        let gate = EngineEvent::GateApproved {
            stage: Stage::Implement,
        };
        assert_eq!(gate.topic(), Topic::Gates);

        let budget = EngineEvent::BudgetThreshold {
            worker_id: "w-1".into(),
            threshold: 50,
            used: 500,
            budget: 1_000,
        };
        assert_eq!(budget.topic(), Topic::Workers);

        let record = AuditRecord::new("tester", "task_created", "t-1");
        assert_eq!(
            EngineEvent::AuditAppended { record }.topic(),
            Topic::Audit
        );
    }

    #[test]
    fn budget_event_converts_to_a_workers_frame() {
        let event: EngineEvent = BudgetEvent {
            worker_id: "w-1".into(),
            threshold: 75,
            used: 750,
            budget: 1_000,
        }
        .into();
        let frame = event.frame();
        assert_eq!(frame["topic"], "workers");
        assert_eq!(frame["type"], "budget_threshold");
        assert_eq!(frame["data"]["threshold"], 75);
    }

    #[test]
    fn sync_frame_is_initial_state_on_sync() {
        let frame = sync_frame(json!({"stage": "discovery"}));
        assert_eq!(frame["topic"], "sync");
        assert_eq!(frame["type"], "initial_state");
        assert_eq!(frame["data"]["stage"], "discovery");
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = EngineEvent::WorkerStatusChanged {
            worker_id: "w-1".into(),
            from: WorkerStatus::Running,
            to: WorkerStatus::Stuck,
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn parse_subscribe_with_topics() {
        let command = ClientCommand::parse(r#"{"type":"subscribe","data":{"topics":["tasks","gates"]}}"#);
        assert_eq!(
            command,
            Some(ClientCommand::Subscribe {
                topics: vec![Topic::Tasks, Topic::Gates],
            })
        );
    }

    #[test]
    fn parse_skips_unknown_topic_names() {
        let command = ClientCommand::parse(r#"{"type":"unsubscribe","data":{"topics":["audit","bogus"]}}"#);
        assert_eq!(
            command,
            Some(ClientCommand::Unsubscribe {
                topics: vec![Topic::Audit],
            })
        );
    }

    #[test]
    fn parse_request_sync_needs_no_data() {
        assert_eq!(
            ClientCommand::parse(r#"{"type":"request_sync"}"#),
            Some(ClientCommand::RequestSync)
        );
    }

    #[test]
    fn parse_rejects_garbage_and_unknown_types() {
        assert_eq!(ClientCommand::parse("not json"), None);
        assert_eq!(ClientCommand::parse(r#"{"type":"dance"}"#), None);
        assert_eq!(ClientCommand::parse(r#"{"data":{}}"#), None);
    }
}
