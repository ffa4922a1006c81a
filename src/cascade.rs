//! Cascade deletion of relation memberships.
//!
//! When an entity is deleted, every relation it participates in must go
//! with it: the materialized artifacts, the forward/reverse index entries
//! of *every* participant, and any staging record that leaked. The three
//! deletion classes are attempted independently — the artifact and index
//! stores offer no cross-object transactions, so this is deliberate
//! best-effort cleanup, not a transaction. Each step is independently
//! retryable and a failure in one class never aborts the others.
//!
//! Concurrent relation creation on the same entity is not ordered with
//! respect to a running cascade; a relation created mid-pass may be missed
//! and is swept by a later deletion pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SiltConfig;
use crate::materialize::ArtifactLocation;
use crate::relation::{participant_index_prefix, staging_key, RelationIndexEntry};
use crate::store::{KeyValueStore, ObjectStore};

/// Outcome report of one cascade pass, for monitoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeReport {
    /// Distinct relations the deleted entity participated in.
    pub relations: usize,
    pub artifacts_deleted: usize,
    pub index_entries_deleted: usize,
    pub staging_deleted: usize,
    /// Rendered errors from failed steps; the pass continued past each.
    pub errors: Vec<String>,
}

impl CascadeReport {
    /// Whether every step of the pass succeeded.
    pub fn clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Coordinates multi-hop cascade deletion across the index and object store.
pub struct CascadeCoordinator {
    config: SiltConfig,
    kv: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
}

impl CascadeCoordinator {
    pub fn new(
        config: SiltConfig,
        kv: Arc<dyn KeyValueStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            kv,
            objects,
        }
    }

    /// Remove everything reachable from the deleted entity's relation
    /// memberships. Fire-and-continue: errors are collected into the
    /// report, never propagated mid-pass.
    pub fn on_entity_deleted(&self, entity_type: &str, entity_id: &str) -> CascadeReport {
        let mut report = CascadeReport::default();

        // Step 1: forward index — every relation this entity participates in.
        let prefix = participant_index_prefix(&self.config, entity_type, entity_id);
        let own_entries = match self.kv.query_prefix(&prefix) {
            Ok(rows) => rows,
            Err(e) => {
                report.errors.push(format!("forward index lookup: {e}"));
                return report;
            }
        };
        if own_entries.is_empty() {
            debug!(entity_type, entity_id, "entity has no relation memberships");
            return report;
        }

        // Step 2: reverse index fan-out — every participant of every
        // relation, collecting index keys and deduplicated artifact
        // locations (all participants of one relation share one artifact).
        let mut relation_ids: BTreeSet<String> = BTreeSet::new();
        for row in &own_entries {
            if let Some(rid) = row.index_key.as_deref() {
                relation_ids.insert(rid.to_owned());
            }
        }
        report.relations = relation_ids.len();

        let mut index_keys: BTreeSet<String> = BTreeSet::new();
        let mut artifacts: BTreeSet<ArtifactLocation> = BTreeSet::new();
        for rid in &relation_ids {
            match self.kv.query_secondary(rid) {
                Ok(rows) => {
                    for row in rows {
                        index_keys.insert(row.key.clone());
                        match serde_json::from_value::<RelationIndexEntry>(row.value) {
                            Ok(entry) => {
                                artifacts.insert(entry.artifact_location);
                            }
                            Err(e) => report
                                .errors
                                .push(format!("index entry {} undecodable: {e}", row.key)),
                        }
                    }
                }
                Err(e) => report.errors.push(format!("reverse index {rid}: {e}")),
            }
        }

        // Step 3a: artifacts, batched to the object store's limit.
        let artifact_keys: Vec<String> = artifacts.into_iter().collect();
        for chunk in artifact_keys.chunks(self.config.object_batch_max.max(1)) {
            match self.objects.delete_batch(chunk) {
                Ok(()) => report.artifacts_deleted += chunk.len(),
                Err(e) => report.errors.push(format!("artifact batch delete: {e}")),
            }
        }

        // Step 3b: index entries, independently of artifact outcome.
        for key in &index_keys {
            match self.kv.delete(key) {
                Ok(true) => report.index_entries_deleted += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("index entry {key}: {e}")),
            }
        }

        // Step 3c: any staging record that outlived its handoff.
        for rid in &relation_ids {
            match self.kv.delete(&staging_key(&self.config, rid)) {
                Ok(true) => report.staging_deleted += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("staging record {rid}: {e}")),
            }
        }

        if report.clean() {
            debug!(
                entity_type,
                entity_id,
                relations = report.relations,
                artifacts = report.artifacts_deleted,
                index_entries = report.index_entries_deleted,
                "cascade deletion complete"
            );
        } else {
            warn!(
                entity_type,
                entity_id,
                errors = report.errors.len(),
                "cascade deletion finished with errors; remaining state is swept on a later pass"
            );
        }
        report
    }

    /// Artifact/index removal primitive for bulk deletion tasks.
    ///
    /// The deletion-task consumer hands in `(artifact_location, relation_id)`
    /// pairs produced by the rewritten read statement; this removes the
    /// artifacts, every index entry of each relation, and leaked staging
    /// records, with the same independent best-effort semantics as
    /// [`Self::on_entity_deleted`].
    pub fn remove_relation_rows(&self, rows: &[(ArtifactLocation, String)]) -> CascadeReport {
        let mut report = CascadeReport::default();

        let artifacts: BTreeSet<ArtifactLocation> =
            rows.iter().map(|(loc, _)| loc.clone()).collect();
        let relation_ids: BTreeSet<String> = rows.iter().map(|(_, rid)| rid.clone()).collect();
        report.relations = relation_ids.len();

        let artifact_keys: Vec<String> = artifacts.into_iter().collect();
        for chunk in artifact_keys.chunks(self.config.object_batch_max.max(1)) {
            match self.objects.delete_batch(chunk) {
                Ok(()) => report.artifacts_deleted += chunk.len(),
                Err(e) => report.errors.push(format!("artifact batch delete: {e}")),
            }
        }

        for rid in &relation_ids {
            match self.kv.query_secondary(rid) {
                Ok(entries) => {
                    for row in entries {
                        match self.kv.delete(&row.key) {
                            Ok(true) => report.index_entries_deleted += 1,
                            Ok(false) => {}
                            Err(e) => report.errors.push(format!("index entry {}: {e}", row.key)),
                        }
                    }
                }
                Err(e) => report.errors.push(format!("reverse index {rid}: {e}")),
            }
            match self.kv.delete(&staging_key(&self.config, rid)) {
                Ok(true) => report.staging_deleted += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("staging record {rid}: {e}")),
            }
        }

        report
    }
}
