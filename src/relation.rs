//! Relation identity and consistency service.
//!
//! A relation instance — one row of a many-to-many relation table — is
//! identified by a content-addressed id derived from the table name and the
//! unordered participant set. Creation is idempotent: retried or duplicate
//! calls with the same arguments converge on the same id, and concurrent
//! creators are arbitrated by a conditional create-if-absent write at the
//! storage layer, never by in-process locking.
//!
//! Alongside the relation, one index entry per participant is written so
//! the relation is discoverable from any participant (forward key) and the
//! full participant set is discoverable from the relation id (secondary
//! index). The staging record exists only to hand the payload to the
//! materializer and is deleted immediately after the artifact is durable.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SiltConfig;
use crate::error::SiltError;
use crate::materialize::{ArtifactLocation, Materializer};
use crate::record::{AttrValue, Participant, Record};
use crate::store::{CreateOutcome, KeyValueStore, KvRow};

// ── Identity ───────────────────────────────────────────────────────────────

/// Compute the content-addressed relation id.
///
/// `relation_id = first 32 hex chars of SHA-256(table | type:id | ...)`
/// over the lexicographically sorted participant set. Including the table
/// name prevents collisions between relation tables that share a
/// participant set; sorting makes the id participant-order invariant.
pub fn relation_id(table_name: &str, participants: &[Participant]) -> String {
    let mut sorted: Vec<&Participant> = participants.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(table_name.as_bytes());
    for p in sorted {
        hasher.update(b"|");
        hasher.update(p.canonical().as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_owned()
}

// ── Stored shapes ──────────────────────────────────────────────────────────

/// Ephemeral staging record for one relation instance.
///
/// Exists only between the conditional create and the artifact write; must
/// not outlive that handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationGroup {
    pub relation_id: String,
    pub table_name: String,
    pub participants: Vec<Participant>,
    pub payload: BTreeMap<String, AttrValue>,
    pub created_at: DateTime<Utc>,
}

/// One (relation, participant) index row.
///
/// A relation with N participants has exactly N entries, all sharing
/// `relation_id` and `artifact_location`, each forward-keyed by its own
/// participant and reverse-discoverable via the secondary index on
/// `relation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationIndexEntry {
    pub relation_id: String,
    pub participant_type: String,
    pub participant_id: String,
    pub table_name: String,
    pub artifact_location: ArtifactLocation,
}

/// Result of [`RelationService::create_relation`].
#[derive(Debug, Clone, PartialEq)]
pub struct RelationCreation {
    pub relation_id: String,
    /// Whether this call performed the creation. `false` for duplicate or
    /// race-losing calls, which are not errors.
    pub created: bool,
}

// ── Key layout ─────────────────────────────────────────────────────────────

/// Primary key of a relation staging record.
pub fn staging_key(config: &SiltConfig, relation_id: &str) -> String {
    format!("{}/relstage/{}", config.project, relation_id)
}

/// Primary key of one relation index entry.
pub fn index_entry_key(config: &SiltConfig, participant: &Participant, relation_id: &str) -> String {
    format!(
        "{}/relidx/{}/{}/{}",
        config.project, participant.entity_type, participant.entity_id, relation_id
    )
}

/// Prefix matching every index entry forward-keyed by one participant.
pub fn participant_index_prefix(config: &SiltConfig, entity_type: &str, entity_id: &str) -> String {
    format!("{}/relidx/{}/{}/", config.project, entity_type, entity_id)
}

// ── Service ────────────────────────────────────────────────────────────────

/// Idempotent relation creation over the key-value store and materializer.
pub struct RelationService {
    config: SiltConfig,
    kv: Arc<dyn KeyValueStore>,
    materializer: Arc<Materializer>,
}

impl RelationService {
    pub fn new(
        config: SiltConfig,
        kv: Arc<dyn KeyValueStore>,
        materializer: Arc<Materializer>,
    ) -> Self {
        Self {
            config,
            kv,
            materializer,
        }
    }

    /// Create a relation instance if it does not already exist.
    ///
    /// Duplicate calls with the same table and participant set (in any
    /// order) return the same id with `created: false` and perform zero
    /// additional writes. A lost conditional-write race resolves to the
    /// winner's outcome rather than an error.
    pub fn create_relation(
        &self,
        table_name: &str,
        participants: &[Participant],
        payload: BTreeMap<String, AttrValue>,
        created_at: DateTime<Utc>,
    ) -> Result<RelationCreation, SiltError> {
        if participants.is_empty() {
            return Err(SiltError::InvalidArgument(
                "a relation needs at least one participant".into(),
            ));
        }

        let rid = relation_id(table_name, participants);
        let key = staging_key(&self.config, &rid);

        // Fast path: a staging record still present means an identical
        // creation is in flight; existing index entries mean it already
        // completed. Either way the second call is a no-op with zero
        // additional writes.
        if self.kv.get(&key)?.is_some() || !self.kv.query_secondary(&rid)?.is_empty() {
            debug!(relation_id = %rid, "relation already exists; skipping");
            return Ok(RelationCreation {
                relation_id: rid,
                created: false,
            });
        }

        let mut sorted = participants.to_vec();
        sorted.sort();
        let group = RelationGroup {
            relation_id: rid.clone(),
            table_name: table_name.to_owned(),
            participants: sorted,
            payload,
            created_at,
        };
        let row = KvRow {
            key: key.clone(),
            index_key: None,
            value: serde_json::to_value(&group)?,
        };

        match self.kv.create_if_absent(row)? {
            CreateOutcome::Created => {}
            // Duplicate call or lost race: the winner's relation is the
            // relation. Never surfaced as a user-visible failure.
            CreateOutcome::AlreadyExists(_) | CreateOutcome::RaceLost(_) => {
                debug!(relation_id = %rid, "conditional create lost; returning existing");
                return Ok(RelationCreation {
                    relation_id: rid,
                    created: false,
                });
            }
        }

        self.finish_creation(&group)?;
        Ok(RelationCreation {
            relation_id: rid,
            created: true,
        })
    }

    /// Complete the handoff for a still-staged relation, if any.
    ///
    /// Used by the change-feed path: a relation-group write event re-drives
    /// index writes, materialization, and staging cleanup. Idempotent under
    /// at-least-once delivery — a staging record already consumed by the
    /// synchronous path yields `Ok(None)`.
    pub fn materialize_staged(
        &self,
        relation_id: &str,
    ) -> Result<Option<ArtifactLocation>, SiltError> {
        let key = staging_key(&self.config, relation_id);
        let Some(row) = self.kv.get(&key)? else {
            debug!(relation_id, "staging record already consumed");
            return Ok(None);
        };
        let group: RelationGroup = serde_json::from_value(row.value)?;
        let location = self.materializer.artifact_location(&group_record(&group));
        self.finish_creation(&group)?;
        Ok(Some(location))
    }

    /// Index writes, artifact handoff, and staging cleanup for a relation
    /// this caller won the conditional create for.
    fn finish_creation(&self, group: &RelationGroup) -> Result<(), SiltError> {
        let mut record = group_record(group);
        let location = self.materializer.artifact_location(&record);

        // The bulk-deletion rewrite selects artifact_location and
        // relation_id back out of the relation table, so every materialized
        // relation row must carry both columns alongside its payload.
        record.attributes.insert(
            "artifact_location".to_owned(),
            AttrValue::Text(location.clone()),
        );
        record.attributes.insert(
            "relation_id".to_owned(),
            AttrValue::Text(group.relation_id.clone()),
        );

        // One index entry per participant, all sharing the relation id and
        // artifact location.
        for participant in &group.participants {
            let entry = RelationIndexEntry {
                relation_id: group.relation_id.clone(),
                participant_type: participant.entity_type.clone(),
                participant_id: participant.entity_id.clone(),
                table_name: group.table_name.clone(),
                artifact_location: location.clone(),
            };
            self.kv.put(KvRow {
                key: index_entry_key(&self.config, participant, &group.relation_id),
                index_key: Some(group.relation_id.clone()),
                value: serde_json::to_value(&entry)?,
            })?;
        }

        self.materializer.materialize(&record)?;

        // The artifact is durable; the staging marker has served its
        // purpose. Its deletion is idempotent and a failure only leaks a
        // transient marker, so log and continue.
        let key = staging_key(&self.config, &group.relation_id);
        if let Err(e) = self.kv.delete(&key) {
            warn!(relation_id = %group.relation_id, error = %e, "staging record cleanup failed");
        }
        Ok(())
    }
}

/// Lower a staged relation group to the record the materializer consumes.
fn group_record(group: &RelationGroup) -> Record {
    Record {
        kind: group.table_name.clone(),
        id: group.relation_id.clone(),
        attributes: group.payload.clone(),
        created_at: group.created_at,
        relation_id: Some(group.relation_id.clone()),
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
    fn test_relation_id_order_invariant() {
        let a = vec![Participant::new("user", "u1"), Participant::new("user", "u2")];
        let b = vec![Participant::new("user", "u2"), Participant::new("user", "u1")];
        assert_eq!(relation_id("follows", &a), relation_id("follows", &b));
    }

    #[test]
    fn test_relation_id_table_scoped() {
        let p = vec![Participant::new("user", "u1"), Participant::new("user", "u2")];
        assert_ne!(relation_id("follows", &p), relation_id("blocks", &p));
    }

    #[test]
    fn test_relation_id_length_and_charset() {
        let p = vec![Participant::new("user", "u1")];
        let id = relation_id("follows", &p);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_participants_rejected() {
        let kv = Arc::new(crate::memory::MemoryKv::new());
        let m = Arc::new(Materializer::new(
            SiltConfig::default(),
            Arc::new(crate::memory::MemoryCatalog::new()),
            Arc::new(crate::memory::MemoryObjectStore::new()),
        ));
        let svc = RelationService::new(SiltConfig::default(), kv, m);
        let err = svc
            .create_relation("follows", &[], BTreeMap::new(), ts())
            .unwrap_err();
        assert!(matches!(err, SiltError::InvalidArgument(_)));
    }
}
