//! Change feed data model.
//!
//! The upstream operational store emits an ordered-per-key sequence of
//! [`ChangeEvent`]s with at-least-once delivery. Each event carries the
//! operation tag plus before/after images of one [`Record`].
//!
//! Records are semi-structured key/value documents. At runtime a record
//! stands in for one of four shapes — a plain entity, a relation staging
//! record, a relation index entry, or a task metadata record — which the
//! classifier distinguishes via [`RecordClass`], an exhaustive sum type
//! keyed on reserved `kind` names.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SiltConfig;

/// Operation tag delivered by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Create,
    Update,
    Remove,
}

/// One change feed event: operation plus before/after record images.
///
/// `CREATE` carries only `after`, `REMOVE` only `before`, `UPDATE` both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Record>,
}

impl ChangeEvent {
    /// The record image relevant to this operation: `before` for removals,
    /// `after` otherwise.
    pub fn image(&self) -> Option<&Record> {
        match self.op {
            ChangeOp::Remove => self.before.as_ref(),
            ChangeOp::Create | ChangeOp::Update => self.after.as_ref(),
        }
    }
}

/// A scalar attribute value.
///
/// The operational store is schemaless; values arrive as JSON scalars and
/// keep their JSON representation until the materializer infers a physical
/// column type for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_owned())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

/// One logical record version from the operational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Entity-type name, relation-table name, or a reserved silt kind.
    pub kind: String,
    /// Primary identifier within `kind`.
    pub id: String,
    /// Attribute values. `BTreeMap` keeps column order deterministic.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    /// Immutable after first materialization; always selects the storage
    /// partition, even on update, so one entity's history stays in one
    /// partition.
    pub created_at: DateTime<Utc>,
    /// Set only on relation staging records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_id: Option<String>,
}

impl Record {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            attributes: BTreeMap::new(),
            created_at,
            relation_id: None,
        }
    }

    /// Builder-style attribute insertion, used heavily in tests.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Runtime classification of a record into one of the four shapes the
/// pipeline handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// A plain application entity.
    Entity,
    /// Ephemeral staging record for one relation instance.
    RelationGroup,
    /// One (relation, participant) index row.
    RelationIndexEntry,
    /// Task metadata — never materialized into the columnar store.
    Task,
}

impl RecordClass {
    /// Classify a record by its reserved kind names under the configured
    /// project namespace. Anything unreserved is a plain entity.
    pub fn of(record: &Record, config: &SiltConfig) -> RecordClass {
        if record.kind == config.relation_kind() {
            RecordClass::RelationGroup
        } else if record.kind == config.relation_index_kind() {
            RecordClass::RelationIndexEntry
        } else if record.kind == config.task_kind() {
            RecordClass::Task
        } else {
            RecordClass::Entity
        }
    }
}

/// One participant of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Participant {
    pub entity_type: String,
    pub entity_id: String,
}

impl Participant {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Canonical `type:id` form used for hashing and index keys.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> SiltConfig {
        SiltConfig::default()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_classify_entity_vs_reserved_kinds() {
        let c = cfg();
        let entity = Record::new("user", "u1", ts());
        assert_eq!(RecordClass::of(&entity, &c), RecordClass::Entity);

        let rel = Record::new("silt.relation", "abc", ts());
        assert_eq!(RecordClass::of(&rel, &c), RecordClass::RelationGroup);

        let idx = Record::new("silt.relation_index", "abc", ts());
        assert_eq!(RecordClass::of(&idx, &c), RecordClass::RelationIndexEntry);

        let task = Record::new("silt.task", "exec-1", ts());
        assert_eq!(RecordClass::of(&task, &c), RecordClass::Task);
    }

    #[test]
    fn test_event_image_selection() {
        let before = Record::new("user", "u1", ts());
        let after = Record::new("user", "u1", ts()).with_attr("name", "bob");

        let ev = ChangeEvent {
            op: ChangeOp::Update,
            before: Some(before.clone()),
            after: Some(after.clone()),
        };
        assert_eq!(ev.image().unwrap().attributes.len(), 1);

        let ev = ChangeEvent {
            op: ChangeOp::Remove,
            before: Some(before),
            after: None,
        };
        assert!(ev.image().unwrap().attributes.is_empty());
    }

    #[test]
    fn test_attr_value_serde_untagged() {
        let rec = Record::new("user", "u1", ts())
            .with_attr("age", 41)
            .with_attr("score", 0.5)
            .with_attr("name", "ada");
        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attributes["age"], AttrValue::Int(41));
        assert_eq!(back.attributes["score"], AttrValue::Float(0.5));
        assert_eq!(back.attributes["name"], AttrValue::Text("ada".into()));
    }

    #[test]
    fn test_participant_canonical_form() {
        let p = Participant::new("user", "u1");
        assert_eq!(p.canonical(), "user:u1");
    }
}
