//! Change record classification and dispatch.
//!
//! The entry point of the pipeline: each change-feed event is inspected and
//! routed to one of four handling paths — entity write, entity delete,
//! relation-group write, relation-group delete — by exhaustive match over
//! the record's [`RecordClass`].
//!
//! Removal of relation index entries is deliberately ignored here: those
//! rows are cleaned up exclusively by the cascade coordinator, and reacting
//! to their removal events would loop the cascade back into itself.
//!
//! Classification failures are logged and the event is dropped. This is
//! non-fatal — the originating write already succeeded in the operational
//! store, and redelivering an unparseable record cannot succeed.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::cascade::{CascadeCoordinator, CascadeReport};
use crate::config::SiltConfig;
use crate::error::{RetryPolicy, RetryState, SiltError};
use crate::materialize::{ArtifactLocation, Materializer};
use crate::record::{ChangeEvent, ChangeOp, Record, RecordClass};
use crate::relation::RelationService;

/// How one event was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A columnar artifact was written.
    Materialized(ArtifactLocation),
    /// Metadata-only or self-inflicted event; nothing to do.
    Skipped,
    /// An entity's artifact was removed and its relations cascaded.
    EntityDeleted(CascadeReport),
}

/// Tally of one batch pass. Per-record failures are counted, not raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub materialized: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Routes change events to the materializer, relation service, and cascade
/// coordinator.
pub struct Classifier {
    config: SiltConfig,
    materializer: Arc<Materializer>,
    relations: Arc<RelationService>,
    cascade: Arc<CascadeCoordinator>,
    retry: RetryPolicy,
}

impl Classifier {
    pub fn new(
        config: SiltConfig,
        materializer: Arc<Materializer>,
        relations: Arc<RelationService>,
        cascade: Arc<CascadeCoordinator>,
    ) -> Self {
        Self {
            config,
            materializer,
            relations,
            cascade,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the backoff policy applied to retryable failures during
    /// batch processing.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route one change event without mutating its semantics.
    pub fn handle_event(&self, event: &ChangeEvent) -> Result<Dispatch, SiltError> {
        let record = event.image().ok_or_else(|| {
            SiltError::MissingKind(format!("{:?} event carries no record image", event.op))
        })?;
        if record.kind.is_empty() {
            return Err(SiltError::MissingKind(format!(
                "record {} has an empty kind",
                record.id
            )));
        }

        match (event.op, RecordClass::of(record, &self.config)) {
            // Entity writes materialize; updates overwrite the same artifact
            // because created_at is immutable.
            (ChangeOp::Create | ChangeOp::Update, RecordClass::Entity) => {
                let location = self.materializer.materialize(record)?;
                Ok(Dispatch::Materialized(location))
            }

            // A relation-group write re-drives the staged handoff. Already
            // consumed staging (the synchronous path won) is a skip.
            (ChangeOp::Create | ChangeOp::Update, RecordClass::RelationGroup) => {
                let rid = record.relation_id.as_deref().unwrap_or(&record.id);
                match self.relations.materialize_staged(rid)? {
                    Some(location) => Ok(Dispatch::Materialized(location)),
                    None => Ok(Dispatch::Skipped),
                }
            }

            // Task records are metadata-only; never materialized.
            (_, RecordClass::Task) => {
                debug!(id = %record.id, "task metadata event skipped");
                Ok(Dispatch::Skipped)
            }

            // Index entries are written and removed by this pipeline itself.
            // Reacting to their events would feed the cascade back into the
            // classifier indefinitely.
            (_, RecordClass::RelationIndexEntry) => Ok(Dispatch::Skipped),

            // Staging removal is the tail end of a completed handoff.
            (ChangeOp::Remove, RecordClass::RelationGroup) => Ok(Dispatch::Skipped),

            // Entity removal: drop the artifact, then cascade through the
            // relation index. Hard delete; no tombstones.
            (ChangeOp::Remove, RecordClass::Entity) => {
                self.materializer.delete_artifact(record)?;
                let report = self.cascade.on_entity_deleted(&record.kind, &record.id);
                Ok(Dispatch::EntityDeleted(report))
            }
        }
    }

    /// Process a batch, isolating per-record failures.
    ///
    /// Retryable failures (throttled or failing backing stores) are
    /// redelivered in place with backoff before the event counts as failed.
    /// One bad record never blocks the rest of the batch: each exhausted or
    /// non-retryable failure is logged with its event position and counted
    /// in the report.
    pub fn handle_batch(&self, events: &[ChangeEvent]) -> BatchReport {
        let mut report = BatchReport::default();
        for (position, event) in events.iter().enumerate() {
            match self.handle_with_retry(event) {
                Ok(Dispatch::Materialized(_)) => report.materialized += 1,
                Ok(Dispatch::Skipped) => report.skipped += 1,
                Ok(Dispatch::EntityDeleted(_)) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        position,
                        kind = e.kind().to_string(),
                        error = %e,
                        "event dropped"
                    );
                }
            }
        }
        report
    }

    /// Drive one event through the retry policy.
    ///
    /// Only retryable errors are redelivered; user and internal errors
    /// surface immediately, since redelivering them cannot succeed.
    fn handle_with_retry(&self, event: &ChangeEvent) -> Result<Dispatch, SiltError> {
        let mut state = RetryState::new();
        loop {
            match self.handle_event(event) {
                Ok(dispatch) => return Ok(dispatch),
                Err(e) if e.is_retryable() => {
                    let now_ms = Utc::now().timestamp_millis() as u64;
                    if !state.record_failure(&self.retry, now_ms) {
                        return Err(e);
                    }
                    let wait = state.next_retry_at_ms.saturating_sub(now_ms);
                    debug!(attempt = state.attempts, wait_ms = wait, error = %e, "retrying event");
                    thread::sleep(Duration::from_millis(wait));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Convenience used by tests and embedding callers to build removal events.
pub fn removal_of(record: Record) -> ChangeEvent {
    ChangeEvent {
        op: ChangeOp::Remove,
        before: Some(record),
        after: None,
    }
}

/// Convenience for entity-write events.
pub fn write_of(op: ChangeOp, record: Record) -> ChangeEvent {
    ChangeEvent {
        op,
        before: None,
        after: Some(record),
    }
}
