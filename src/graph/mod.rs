//! Task dependency graph with cycle rejection.
//!
//! Edges live on the task records themselves: `blocked_by` holds the ids a
//! task waits on, `blocks` is the maintained mirror. Every edge mutation
//! keeps both sides in step and runs a reachability check before anything is
//! committed, so the persisted graph is acyclic at all times.
//!
//! The `pending`/`ready` pair is derived here and nowhere else: a status
//! change to `done` promotes only the direct dependents of the changed task
//! (no full-graph rescan), and the promotions ride in the same append batch
//! as the change that caused them.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{AuditRecord, actions};
use crate::errors::{EngineError, SchemaError, SemanticError};
use crate::store::StateStore;
use crate::task::{Task, TaskStatus};

/// A task held back from `ready()`, with the dependency ids still unmet.
/// `unmet` is empty when the hold is a worker-declared blockage rather than
/// an unfinished dependency.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub task: Task,
    pub unmet: Vec<String>,
}

/// Task CRUD and dependency edges over the durable store.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    store: StateStore,
}

impl TaskGraph {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// All task records, one per id, in first-created order.
    pub fn all(&self) -> Result<Vec<Task>, EngineError> {
        self.store.read_tasks()
    }

    pub fn get(&self, id: &str) -> Result<Task, EngineError> {
        self.store
            .read_task(id)?
            .ok_or_else(|| EngineError::not_found("task", id))
    }

    /// Create a task, honoring any `blocked_by` ids it arrives with.
    ///
    /// Dependencies must name existing tasks; `blocks` on the incoming record
    /// is ignored (it is maintained as the mirror of other tasks' edges). The
    /// initial status is derived: `ready` when every dependency is already
    /// done (or there are none), `pending` otherwise. The new record, the
    /// mirror updates on its dependencies, and one audit record land as a
    /// single operation.
    pub fn create(&self, task: Task, actor: &str) -> Result<Task, EngineError> {
        if task.title.trim().is_empty() {
            return Err(SchemaError::MissingField { field: "title" }.into());
        }

        let tasks = self.store.read_tasks()?;
        let index = index_by_id(&tasks);
        if index.contains_key(task.id.as_str()) {
            return Err(SemanticError::DuplicateTask { id: task.id }.into());
        }

        let mut deps: Vec<String> = Vec::new();
        for dep in &task.blocked_by {
            if deps.contains(dep) {
                continue;
            }
            if *dep == task.id {
                return Err(EngineError::CycleDetected {
                    path: format!("{} -> {}", task.id, task.id),
                });
            }
            if !index.contains_key(dep.as_str()) {
                return Err(EngineError::not_found("task", dep.as_str()));
            }
            deps.push(dep.clone());
        }

        let done = done_ids(&tasks);
        let mut created = task;
        created.blocked_by = deps;
        created.blocks = Vec::new();
        created.status = if created.dependencies_met(&done) {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };

        let mut batch = Vec::new();
        for dep in &created.blocked_by {
            let mut dependency = tasks[index[dep.as_str()]].clone();
            dependency.blocks.push(created.id.clone());
            dependency.updated_at = created.updated_at;
            batch.push(dependency);
        }

        let mut record = AuditRecord::new(actor, actions::TASK_CREATED, &created.id)
            .with_detail("title", &created.title)
            .with_detail("stage", created.stage.as_str());
        if !created.blocked_by.is_empty() {
            record = record.with_detail("blocked_by", created.blocked_by.join(","));
        }
        batch.push(created.clone());
        self.store.append_tasks(&batch, &record)?;

        info!(task = %created.id, title = %created.title, stage = %created.stage, "task created");
        Ok(created)
    }

    /// Change a task's status.
    ///
    /// A same-status call is a no-op: nothing is written and nothing is
    /// audited. An illegal move per the status lifecycle is rejected before
    /// any write. Moving to `done` promotes direct dependents whose
    /// dependencies are now all met from `pending` to `ready`, in the same
    /// batch under the same audit record.
    pub fn update_status(
        &self,
        id: &str,
        to: TaskStatus,
        actor: &str,
    ) -> Result<Task, EngineError> {
        let tasks = self.store.read_tasks()?;
        let index = index_by_id(&tasks);
        let position = *index
            .get(id)
            .ok_or_else(|| EngineError::not_found("task", id))?;

        let from = tasks[position].status;
        if from == to {
            return Ok(tasks[position].clone());
        }
        if !from.can_transition_to(to) {
            return Err(SemanticError::IllegalStatusChange {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let mut updated = tasks[position].clone();
        updated.status = to;
        updated.updated_at = chrono::Utc::now();
        if to != TaskStatus::Blocked {
            updated.blocked_reason = None;
        }

        let mut batch = vec![updated.clone()];
        if to == TaskStatus::Done {
            batch.extend(promotions(&tasks, &index, &updated));
        }

        let record = if to == TaskStatus::Done {
            AuditRecord::new(actor, actions::TASK_COMPLETED, id)
                .with_detail("from", from.as_str())
        } else {
            AuditRecord::new(actor, actions::TASK_UPDATED, id)
                .with_detail("from", from.as_str())
                .with_detail("to", to.as_str())
        };
        self.store.append_tasks(&batch, &record)?;

        if batch.len() > 1 {
            debug!(task = %id, promoted = batch.len() - 1, "dependents promoted to ready");
        }
        info!(task = %id, %from, %to, "task status changed");
        Ok(updated)
    }

    /// Apply an already-validated handoff outcome to its task.
    ///
    /// Unlike [`update_status`](Self::update_status), a same-status
    /// redelivery still writes: the record is refreshed and the caller's
    /// audit record lands. Lifecycle legality is re-checked at apply time in
    /// case the task moved between validation and acceptance.
    pub(crate) fn apply_validated_status(
        &self,
        id: &str,
        to: TaskStatus,
        blocked_reason: Option<String>,
        worker_id: Option<String>,
        record: &AuditRecord,
    ) -> Result<Task, EngineError> {
        let tasks = self.store.read_tasks()?;
        let index = index_by_id(&tasks);
        let position = *index
            .get(id)
            .ok_or_else(|| EngineError::not_found("task", id))?;

        let from = tasks[position].status;
        if from != to && !from.can_transition_to(to) {
            return Err(SemanticError::IllegalStatusChange {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let mut updated = tasks[position].clone();
        updated.status = to;
        updated.updated_at = chrono::Utc::now();
        updated.blocked_reason = if to == TaskStatus::Blocked {
            blocked_reason
        } else {
            None
        };
        if worker_id.is_some() {
            updated.worker_id = worker_id;
        }

        let mut batch = vec![updated.clone()];
        if to == TaskStatus::Done {
            batch.extend(promotions(&tasks, &index, &updated));
        }
        self.store.append_tasks(&batch, record)?;

        info!(task = %id, %from, %to, "handoff outcome applied");
        Ok(updated)
    }

    /// Add the edge "`task_id` depends on `depends_on`".
    ///
    /// Runs a reachability check first: if `depends_on` already (transitively)
    /// depends on `task_id`, the edge would close a cycle and is rejected with
    /// neither side applied. Returns `false` when the edge already exists.
    pub fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        actor: &str,
    ) -> Result<bool, EngineError> {
        if task_id == depends_on {
            return Err(EngineError::CycleDetected {
                path: format!("{task_id} -> {depends_on}"),
            });
        }

        let tasks = self.store.read_tasks()?;
        let index = index_by_id(&tasks);
        let task_position = *index
            .get(task_id)
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        let dep_position = *index
            .get(depends_on)
            .ok_or_else(|| EngineError::not_found("task", depends_on))?;

        if tasks[task_position].blocked_by.iter().any(|d| d == depends_on) {
            return Ok(false);
        }

        if let Some(chain) = dependency_chain(&tasks, &index, depends_on, task_id) {
            let mut path = vec![task_id.to_string()];
            path.extend(chain);
            return Err(EngineError::CycleDetected {
                path: path.join(" -> "),
            });
        }

        let now = chrono::Utc::now();
        let mut task = tasks[task_position].clone();
        task.blocked_by.push(depends_on.to_string());
        task.updated_at = now;
        let done = done_ids(&tasks);
        if task.status == TaskStatus::Ready && !task.dependencies_met(&done) {
            task.status = TaskStatus::Pending;
        }

        let mut dependency = tasks[dep_position].clone();
        dependency.blocks.push(task_id.to_string());
        dependency.updated_at = now;

        let record = AuditRecord::new(actor, actions::DEPENDENCY_ADDED, task_id)
            .with_detail("depends_on", depends_on);
        self.store.append_tasks(&[task, dependency], &record)?;

        info!(task = %task_id, depends_on = %depends_on, "dependency added");
        Ok(true)
    }

    /// Remove the edge "`task_id` depends on `depends_on`".
    ///
    /// Returns `false` when no such edge exists. Removal may promote the
    /// task from `pending` to `ready` when it was the last unmet dependency.
    pub fn remove_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        actor: &str,
    ) -> Result<bool, EngineError> {
        let tasks = self.store.read_tasks()?;
        let index = index_by_id(&tasks);
        let task_position = *index
            .get(task_id)
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        let dep_position = *index
            .get(depends_on)
            .ok_or_else(|| EngineError::not_found("task", depends_on))?;

        if !tasks[task_position].blocked_by.iter().any(|d| d == depends_on) {
            return Ok(false);
        }

        let now = chrono::Utc::now();
        let mut task = tasks[task_position].clone();
        task.blocked_by.retain(|d| d != depends_on);
        task.updated_at = now;
        let done = done_ids(&tasks);
        if task.status == TaskStatus::Pending && task.dependencies_met(&done) {
            task.status = TaskStatus::Ready;
        }

        let mut dependency = tasks[dep_position].clone();
        dependency.blocks.retain(|d| d != task_id);
        dependency.updated_at = now;

        let record = AuditRecord::new(actor, actions::DEPENDENCY_REMOVED, task_id)
            .with_detail("depends_on", depends_on);
        self.store.append_tasks(&[task, dependency], &record)?;

        info!(task = %task_id, depends_on = %depends_on, "dependency removed");
        Ok(true)
    }

    /// Tasks that may begin: not started, not worker-blocked, and every id
    /// in `blocked_by` is `done`.
    pub fn ready(&self) -> Result<Vec<Task>, EngineError> {
        let tasks = self.store.read_tasks()?;
        let done = done_ids(&tasks);
        Ok(tasks
            .iter()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Ready)
                    && t.dependencies_met(&done)
            })
            .cloned()
            .collect())
    }

    /// The complement of [`ready`](Self::ready) among unstarted tasks, each
    /// with the specific unmet dependency ids as the reason.
    pub fn blocked(&self) -> Result<Vec<BlockedTask>, EngineError> {
        let tasks = self.store.read_tasks()?;
        let done = done_ids(&tasks);
        Ok(tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked
                )
            })
            .filter(|t| t.status == TaskStatus::Blocked || !t.dependencies_met(&done))
            .map(|t| BlockedTask {
                unmet: t
                    .blocked_by
                    .iter()
                    .filter(|id| !done.contains(*id))
                    .cloned()
                    .collect(),
                task: t.clone(),
            })
            .collect())
    }
}

fn index_by_id(tasks: &[Task]) -> HashMap<&str, usize> {
    tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect()
}

fn done_ids(tasks: &[Task]) -> HashSet<String> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.clone())
        .collect()
}

/// Direct dependents of `completed` that become ready once it counts as
/// done. Only `pending` tasks move; worker-blocked ones stay put.
fn promotions(tasks: &[Task], index: &HashMap<&str, usize>, completed: &Task) -> Vec<Task> {
    let mut done = done_ids(tasks);
    done.insert(completed.id.clone());
    let mut promoted = Vec::new();
    for dependent_id in &completed.blocks {
        let Some(&position) = index.get(dependent_id.as_str()) else {
            continue;
        };
        let dependent = &tasks[position];
        if dependent.status == TaskStatus::Pending && dependent.dependencies_met(&done) {
            let mut next = dependent.clone();
            next.status = TaskStatus::Ready;
            next.updated_at = completed.updated_at;
            promoted.push(next);
        }
    }
    promoted
}

/// Breadth-first walk along `blocked_by` edges from `from`, looking for
/// `to`. Returns the id chain `from -> ... -> to` when reachable.
fn dependency_chain(
    tasks: &[Task],
    index: &HashMap<&str, usize>,
    from: &str,
    to: &str,
) -> Option<Vec<String>> {
    let mut parents: HashMap<&str, &str> = HashMap::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(from);
    queue.push_back(from);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut chain = vec![node.to_string()];
            let mut current = node;
            while let Some(&parent) = parents.get(current) {
                chain.push(parent.to_string());
                current = parent;
            }
            chain.reverse();
            return Some(chain);
        }
        let Some(&position) = index.get(node) else {
            continue;
        };
        for dep in &tasks[position].blocked_by {
            if seen.insert(dep.as_str()) {
                parents.insert(dep.as_str(), node);
                queue.push_back(dep.as_str());
            }
        }
    }
    None
}
