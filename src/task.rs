//! Asynchronous task lifecycle management.
//!
//! Long-running analytical work is modelled as a [`Task`] with a terminal
//! state machine: `RUNNING → SUCCEEDED | FAILED`, no further transitions.
//! The task id *is* the query engine's execution id — never separately
//! generated — so the two stay in 1:1 correspondence.
//!
//! Completion is dual-tracked. The push path consumes event-bus
//! notifications of engine state transitions; the pull path re-queries the
//! engine on every result poll while the task is still running, so the
//! protocol makes forward progress even when the push path is never
//! configured. Both paths converge through one idempotent
//! [`Task::advance_to`] transition, so they race harmlessly: a late or
//! duplicate terminal notification is a no-op with no duplicate side
//! effects.
//!
//! When a deletion task succeeds, its execution id is enqueued exactly once
//! (per observed transition) onto the work queue; the consumer retrieves
//! the rewritten query's result rows and runs the physical deletion
//! primitives from [`crate::cascade`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cascade::CascadeCoordinator;
use crate::config::SiltConfig;
use crate::error::SiltError;
use crate::rewrite::{is_delete_intent, rewrite_delete_to_select};
use crate::store::{
    EngineNotification, EngineState, KeyValueStore, KvRow, QueryEngine, WorkQueue,
};

// ── Task model ─────────────────────────────────────────────────────────────

/// Task status. `Succeeded` and `Failed` are terminal and final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// What kind of work the task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Plain analytical query.
    #[serde(rename = "queryTask")]
    Query,
    /// Bulk deletion, rewritten to a read; completion feeds the work queue.
    #[serde(rename = "deletionTask")]
    Deletion,
}

/// One asynchronous unit of query-engine work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Equals the engine's execution id.
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    /// Set exactly once, at the first terminal transition.
    pub finish_time: Option<DateTime<Utc>>,
    pub owner_operation: String,
}

impl Task {
    /// Idempotently advance to a terminal state.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// task was already terminal (no fields change). Both tracking paths
    /// call this, guaranteeing identical convergence behavior.
    pub fn advance_to(&mut self, status: TaskStatus, finish_time: DateTime<Utc>) -> bool {
        debug_assert!(status.is_terminal(), "advance_to takes terminal states only");
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finish_time = Some(finish_time);
        true
    }
}

/// Work-queue message produced when a deletion task succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionMessage {
    pub execution_id: String,
}

// ── Manager ────────────────────────────────────────────────────────────────

/// Storage key of a task record.
fn task_key(config: &SiltConfig, execution_id: &str) -> String {
    format!("{}/task/{}", config.project, execution_id)
}

/// Triggers engine work and tracks task completion over both paths.
pub struct TaskManager {
    config: SiltConfig,
    kv: Arc<dyn KeyValueStore>,
    engine: Arc<dyn QueryEngine>,
    queue: Arc<dyn WorkQueue>,
}

impl TaskManager {
    pub fn new(
        config: SiltConfig,
        kv: Arc<dyn KeyValueStore>,
        engine: Arc<dyn QueryEngine>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            config,
            kv,
            engine,
            queue,
        }
    }

    /// Submit a statement and create its task record. Non-blocking; returns
    /// the engine's execution id immediately.
    ///
    /// Delete-intent statements are rewritten to their read-only selection
    /// form before submission; a malformed one fails here, before any task
    /// exists.
    pub fn trigger(&self, owner_operation: &str, statement: &str) -> Result<String, SiltError> {
        let (kind, submitted) = if is_delete_intent(statement) {
            (TaskKind::Deletion, rewrite_delete_to_select(statement)?)
        } else {
            (TaskKind::Query, statement.to_owned())
        };

        let execution_id = self.engine.submit(&submitted)?;
        let task = Task {
            task_id: execution_id.clone(),
            kind,
            status: TaskStatus::Running,
            start_time: Utc::now(),
            finish_time: None,
            owner_operation: owner_operation.to_owned(),
        };
        self.persist(&task)?;

        info!(
            execution_id = %execution_id,
            kind = ?kind,
            owner = owner_operation,
            "task triggered"
        );
        Ok(execution_id)
    }

    /// Push path: apply an event-bus notification of an engine transition.
    ///
    /// Non-terminal and duplicate notifications are no-ops.
    pub fn observe(&self, notification: &EngineNotification) -> Result<(), SiltError> {
        let status = match notification.state {
            EngineState::Running => return Ok(()),
            EngineState::Succeeded => TaskStatus::Succeeded,
            EngineState::Failed => TaskStatus::Failed,
        };
        let finish = notification.completed_at.unwrap_or_else(Utc::now);
        self.complete(&notification.execution_id, status, finish)
    }

    /// Pull path: current task state, refreshed from the engine while the
    /// task is still running.
    ///
    /// Guarantees forward progress even if the push path is never
    /// configured or is delayed. Clients may poll at any cadence.
    pub fn poll(&self, execution_id: &str) -> Result<Task, SiltError> {
        let task = self.load(execution_id)?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let status = self.engine.status(execution_id)?;
        let terminal = match status.state {
            EngineState::Running => return Ok(task),
            EngineState::Succeeded => TaskStatus::Succeeded,
            EngineState::Failed => TaskStatus::Failed,
        };
        let finish = status.completed_at.unwrap_or_else(Utc::now);
        self.complete(execution_id, terminal, finish)?;
        self.load(execution_id)
    }

    /// Result rows of a succeeded task.
    pub fn results(&self, execution_id: &str) -> Result<Vec<Vec<String>>, SiltError> {
        self.engine.results(execution_id)
    }

    /// Single idempotent convergence point for both tracking paths.
    ///
    /// The deletion-completion hook fires only on the actual transition,
    /// so a late duplicate delivery never enqueues twice.
    fn complete(
        &self,
        execution_id: &str,
        status: TaskStatus,
        finish_time: DateTime<Utc>,
    ) -> Result<(), SiltError> {
        let mut task = self.load(execution_id)?;
        if !task.advance_to(status, finish_time) {
            debug!(execution_id, "task already terminal; ignoring");
            return Ok(());
        }
        self.persist(&task)?;
        info!(execution_id, status = ?status, "task reached terminal state");

        if task.kind == TaskKind::Deletion && status == TaskStatus::Succeeded {
            let message = DeletionMessage {
                execution_id: execution_id.to_owned(),
            };
            self.queue.enqueue(serde_json::to_value(&message)?)?;
            debug!(execution_id, "deletion task enqueued for physical cleanup");
        }
        Ok(())
    }

    pub fn load(&self, execution_id: &str) -> Result<Task, SiltError> {
        let row = self
            .kv
            .get(&task_key(&self.config, execution_id))?
            .ok_or_else(|| SiltError::NotFound(format!("task {execution_id}")))?;
        Ok(serde_json::from_value(row.value)?)
    }

    fn persist(&self, task: &Task) -> Result<(), SiltError> {
        self.kv.put(KvRow {
            key: task_key(&self.config, &task.task_id),
            index_key: None,
            value: serde_json::to_value(task)?,
        })
    }

    /// Drain the deletion work queue, running physical cleanup for each
    /// message through the cascade primitives.
    ///
    /// Messages are acknowledged only after their cleanup pass ran; a
    /// failed fetch leaves the message unacked for redelivery, which is
    /// safe because the pass is idempotent. Returns the number of messages
    /// processed.
    pub fn run_deletion_consumer(&self, cascade: &CascadeCoordinator) -> Result<usize, SiltError> {
        let mut processed = 0;
        while let Some((receipt, value)) = self.queue.dequeue()? {
            let message: DeletionMessage = match serde_json::from_value(value) {
                Ok(m) => m,
                Err(e) => {
                    // Unparseable messages can never succeed; drop them.
                    warn!(error = %e, "dropping undecodable deletion message");
                    self.queue.ack(&receipt)?;
                    continue;
                }
            };

            let rows = match self.engine.results(&message.execution_id) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(
                        execution_id = %message.execution_id,
                        error = %e,
                        "result fetch failed; leaving message for redelivery"
                    );
                    continue;
                }
            };

            let pairs: Vec<(String, String)> = rows
                .into_iter()
                .filter_map(|row| {
                    let mut it = row.into_iter();
                    match (it.next(), it.next()) {
                        (Some(location), Some(rid)) => Some((location, rid)),
                        _ => None,
                    }
                })
                .collect();

            let report = cascade.remove_relation_rows(&pairs);
            if report.clean() {
                self.queue.ack(&receipt)?;
                processed += 1;
                info!(
                    execution_id = %message.execution_id,
                    relations = report.relations,
                    artifacts = report.artifacts_deleted,
                    "deletion task cleanup complete"
                );
            } else {
                warn!(
                    execution_id = %message.execution_id,
                    errors = report.errors.len(),
                    "deletion cleanup incomplete; leaving message for redelivery"
                );
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_advance_to_is_idempotent() {
        let mut task = Task {
            task_id: "exec-1".into(),
            kind: TaskKind::Query,
            status: TaskStatus::Running,
            start_time: ts(),
            finish_time: None,
            owner_operation: "searchUsers".into(),
        };

        assert!(task.advance_to(TaskStatus::Succeeded, ts()));
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.finish_time, Some(ts()));

        // Late duplicate, even with a different terminal state: no-op.
        let later = Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap();
        assert!(!task.advance_to(TaskStatus::Failed, later));
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.finish_time, Some(ts()));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task {
            task_id: "exec-9".into(),
            kind: TaskKind::Deletion,
            status: TaskStatus::Failed,
            start_time: ts(),
            finish_time: Some(ts()),
            owner_operation: "purgeFollows".into(),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"deletionTask\""));
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, TaskStatus::Failed);
        assert_eq!(back.kind, TaskKind::Deletion);
    }
}
