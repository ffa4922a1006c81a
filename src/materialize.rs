//! Columnar materialization of operational records.
//!
//! Each change event produces exactly one object write: the record's
//! attributes are lowered to a compact single-row columnar segment with
//! inferred, minimized physical types and written to a date-partitioned
//! key in the object store. The write path is a stateless transformation
//! with no cross-event memory or buffering.
//!
//! # Partitioning
//!
//! Partition key = `prefix/kind/year=YYYY/month=MM/day=DD/<stem>.json`,
//! where the stem is the entity id (or the relation id for relation
//! groups). `created_at` is immutable, so updates to one logical entity
//! always land on (and overwrite) the same artifact, and two relation
//! creations with identical participants collide on the same filename.
//!
//! # Type inference
//!
//! Strict RFC 3339 strings become native timestamps; integers narrow to
//! the smallest width covering the observed magnitude; floats are stored
//! single precision; everything else is a string. Storage efficiency is
//! favored over schema-evolution flexibility: records are single-row
//! writes and the catalog is created lazily from the first write.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SiltConfig;
use crate::error::SiltError;
use crate::record::{AttrValue, Record};
use crate::store::{CatalogOutcome, ColumnDef, ObjectStore, SchemaCatalog, TableDef};

/// Object key of one materialized columnar artifact.
pub type ArtifactLocation = String;

// ── Physical types ─────────────────────────────────────────────────────────

/// Minimal physical column type inferred from an observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Timestamp,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Text,
}

impl ColumnType {
    /// Type name as declared in the analytical catalog.
    pub fn physical_name(&self) -> &'static str {
        match self {
            ColumnType::Timestamp => "timestamp",
            ColumnType::Int8 => "tinyint",
            ColumnType::Int16 => "smallint",
            ColumnType::Int32 => "int",
            ColumnType::Int64 => "bigint",
            ColumnType::Float32 => "float",
            ColumnType::Text => "string",
        }
    }
}

/// Infer the minimal physical type for one attribute value.
///
/// Narrowing never loses the original integer value since the width is
/// chosen from the value's magnitude.
pub fn infer_column_type(value: &AttrValue) -> ColumnType {
    match value {
        AttrValue::Int(v) => {
            if i8::try_from(*v).is_ok() {
                ColumnType::Int8
            } else if i16::try_from(*v).is_ok() {
                ColumnType::Int16
            } else if i32::try_from(*v).is_ok() {
                ColumnType::Int32
            } else {
                ColumnType::Int64
            }
        }
        AttrValue::Float(_) => ColumnType::Float32,
        AttrValue::Text(s) => {
            if DateTime::parse_from_rfc3339(s).is_ok() {
                ColumnType::Timestamp
            } else {
                ColumnType::Text
            }
        }
        // Booleans and nulls have no narrower representation here.
        AttrValue::Bool(_) | AttrValue::Null => ColumnType::Text,
    }
}

// ── Segment format ─────────────────────────────────────────────────────────

/// One stored column value, typed per the inferred [`ColumnType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnValue {
    Timestamp(DateTime<Utc>),
    Int(i64),
    /// Stored single precision; float32 rounding of the source value is
    /// accepted.
    Float(f32),
    Text(String),
    Null,
}

/// Self-describing single-row columnar segment.
///
/// Columns and values are parallel vectors in deterministic (attribute
/// name) order, so a rewrite of the same record is byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub table: String,
    pub columns: Vec<SegmentColumn>,
    pub values: Vec<ColumnValue>,
}

/// Column descriptor inside a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentColumn {
    pub name: String,
    pub ctype: ColumnType,
}

impl Segment {
    /// Lower a record's attributes into a typed segment.
    pub fn from_record(record: &Record) -> Self {
        let mut columns = Vec::with_capacity(record.attributes.len());
        let mut values = Vec::with_capacity(record.attributes.len());
        for (name, value) in &record.attributes {
            let ctype = infer_column_type(value);
            columns.push(SegmentColumn {
                name: name.clone(),
                ctype,
            });
            values.push(lower_value(value, ctype));
        }
        Segment {
            table: record.kind.clone(),
            columns,
            values,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SiltError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SiltError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn lower_value(value: &AttrValue, ctype: ColumnType) -> ColumnValue {
    match (value, ctype) {
        (AttrValue::Text(s), ColumnType::Timestamp) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => ColumnValue::Timestamp(ts.with_timezone(&Utc)),
            Err(_) => ColumnValue::Text(s.clone()),
        },
        (AttrValue::Int(v), _) => ColumnValue::Int(*v),
        (AttrValue::Float(v), _) => ColumnValue::Float(*v as f32),
        (AttrValue::Text(s), _) => ColumnValue::Text(s.clone()),
        (AttrValue::Bool(b), _) => ColumnValue::Text(b.to_string()),
        (AttrValue::Null, _) => ColumnValue::Null,
    }
}

// ── Materializer ───────────────────────────────────────────────────────────

/// Converts records into columnar artifacts and maintains the lazy catalog.
pub struct Materializer {
    config: SiltConfig,
    catalog: Arc<dyn SchemaCatalog>,
    objects: Arc<dyn ObjectStore>,
}

impl Materializer {
    pub fn new(
        config: SiltConfig,
        catalog: Arc<dyn SchemaCatalog>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            catalog,
            objects,
        }
    }

    /// Materialize one record and return its artifact location.
    ///
    /// The write is immediately durable; a failure propagates to the caller
    /// and never advances any task or relation cleanup step.
    pub fn materialize(&self, record: &Record) -> Result<ArtifactLocation, SiltError> {
        let segment = Segment::from_record(record);
        let location = self.artifact_location(record);

        self.ensure_catalog(record, &segment)?;
        self.objects.put(&location, segment.encode()?)?;

        debug!(
            table = %record.kind,
            location = %location,
            columns = segment.columns.len(),
            "materialized record"
        );
        Ok(location)
    }

    /// Delete the artifact an entity record would have been written to.
    ///
    /// A missing artifact is a successful deletion — absence already holds.
    pub fn delete_artifact(&self, record: &Record) -> Result<(), SiltError> {
        let location = self.artifact_location(record);
        self.objects.delete(&location)?;
        debug!(location = %location, "deleted artifact");
        Ok(())
    }

    /// Partition key for a record: `prefix/kind/year=Y/month=M/day=D/<stem>.json`.
    ///
    /// `created_at` chooses the partition on every write, including updates,
    /// keeping a logical entity's history in one partition.
    pub fn artifact_location(&self, record: &Record) -> ArtifactLocation {
        let stem = record.relation_id.as_deref().unwrap_or(&record.id);
        let ts = record.created_at;
        format!(
            "{}/{}/year={:04}/month={:02}/day={:02}/{}.json",
            self.config.object_prefix,
            record.kind,
            ts.year(),
            ts.month(),
            ts.day(),
            stem
        )
    }

    /// Create the catalog entry for the record's table if none exists yet.
    ///
    /// An existing entry is left untouched; schema drift across writes is
    /// not reconciled, only logged.
    fn ensure_catalog(&self, record: &Record, segment: &Segment) -> Result<(), SiltError> {
        let database = &self.config.catalog_database;
        if let Some(existing) = self.catalog.get_table(database, &record.kind)? {
            let inferred = catalog_columns(segment);
            if existing.columns != inferred {
                warn!(
                    table = %record.kind,
                    catalog = ?existing.columns,
                    inferred = ?inferred,
                    "inferred columns diverge from first-seen catalog schema; keeping catalog"
                );
            }
            return Ok(());
        }

        let table = TableDef {
            database: database.clone(),
            name: record.kind.clone(),
            columns: catalog_columns(segment),
            partition_keys: vec!["year".into(), "month".into(), "day".into()],
            location: format!("{}/{}", self.config.object_prefix, record.kind),
        };
        match self.catalog.create_table(table)? {
            CatalogOutcome::Created => {}
            // A concurrent writer registered the table between our check and
            // the create; first-seen wins either way.
            CatalogOutcome::AlreadyExists => {
                debug!(table = %record.kind, "catalog table created concurrently");
            }
        }
        Ok(())
    }
}

fn catalog_columns(segment: &Segment) -> Vec<ColumnDef> {
    segment
        .columns
        .iter()
        .map(|c| ColumnDef {
            name: c.name.clone(),
            physical_type: c.ctype.physical_name().to_owned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_integer_narrowing() {
        assert_eq!(infer_column_type(&AttrValue::Int(0)), ColumnType::Int8);
        assert_eq!(infer_column_type(&AttrValue::Int(127)), ColumnType::Int8);
        assert_eq!(infer_column_type(&AttrValue::Int(128)), ColumnType::Int16);
        assert_eq!(infer_column_type(&AttrValue::Int(-129)), ColumnType::Int16);
        assert_eq!(infer_column_type(&AttrValue::Int(40_000)), ColumnType::Int32);
        assert_eq!(
            infer_column_type(&AttrValue::Int(3_000_000_000)),
            ColumnType::Int64
        );
    }

    #[test]
    fn test_timestamp_vs_text_inference() {
        assert_eq!(
            infer_column_type(&AttrValue::Text("2024-03-15T12:00:00Z".into())),
            ColumnType::Timestamp
        );
        // Date without time is not strict RFC 3339.
        assert_eq!(
            infer_column_type(&AttrValue::Text("2024-03-15".into())),
            ColumnType::Text
        );
        assert_eq!(
            infer_column_type(&AttrValue::Text("hello".into())),
            ColumnType::Text
        );
    }

    #[test]
    fn test_float_and_bool_inference() {
        assert_eq!(infer_column_type(&AttrValue::Float(0.25)), ColumnType::Float32);
        assert_eq!(infer_column_type(&AttrValue::Bool(true)), ColumnType::Text);
        assert_eq!(infer_column_type(&AttrValue::Null), ColumnType::Text);
    }

    #[test]
    fn test_segment_round_trip() {
        let record = Record::new("user", "u1", ts())
            .with_attr("age", 41)
            .with_attr("score", 0.5)
            .with_attr("joined", "2024-01-02T03:04:05Z")
            .with_attr("name", "ada");

        let segment = Segment::from_record(&record);
        let decoded = Segment::decode(&segment.encode().unwrap()).unwrap();
        assert_eq!(decoded, segment);

        // BTreeMap order: age, joined, name, score
        assert_eq!(decoded.columns[0].ctype, ColumnType::Int8);
        assert_eq!(decoded.values[0], ColumnValue::Int(41));
        assert_eq!(decoded.columns[1].ctype, ColumnType::Timestamp);
        assert_eq!(decoded.columns[2].ctype, ColumnType::Text);
        assert_eq!(decoded.columns[3].ctype, ColumnType::Float32);
        assert_eq!(decoded.values[3], ColumnValue::Float(0.5));
    }

    #[test]
    fn test_artifact_location_partitions_by_created_at() {
        let m = Materializer::new(
            SiltConfig::default(),
            Arc::new(crate::memory::MemoryCatalog::new()),
            Arc::new(crate::memory::MemoryObjectStore::new()),
        );
        let record = Record::new("user", "u1", ts());
        assert_eq!(
            m.artifact_location(&record),
            "lake/user/year=2024/month=03/day=15/u1.json"
        );

        // Relation groups are named by relation id, not record id.
        let mut rel = Record::new("follows", "stage-1", ts());
        rel.relation_id = Some("cafe0123".into());
        assert_eq!(
            m.artifact_location(&rel),
            "lake/follows/year=2024/month=03/day=15/cafe0123.json"
        );
    }

    #[test]
    fn test_catalog_created_once_and_kept() {
        let catalog = Arc::new(crate::memory::MemoryCatalog::new());
        let objects = Arc::new(crate::memory::MemoryObjectStore::new());
        let m = Materializer::new(SiltConfig::default(), catalog.clone(), objects);

        let first = Record::new("user", "u1", ts()).with_attr("age", 41);
        m.materialize(&first).unwrap();
        let cols = catalog.columns("silt_analytics", "user").unwrap();
        assert_eq!(cols[0].physical_type, "tinyint");

        // A later write with a wider type leaves the catalog untouched.
        let second = Record::new("user", "u2", ts()).with_attr("age", 3_000_000_000i64);
        m.materialize(&second).unwrap();
        let cols = catalog.columns("silt_analytics", "user").unwrap();
        assert_eq!(cols[0].physical_type, "tinyint");
    }

    #[test]
    fn test_losing_catalog_create_race_is_not_an_error() {
        // A writer in another process registers the table between our
        // existence check and our create call.
        struct RacingCatalog;
        impl SchemaCatalog for RacingCatalog {
            fn get_table(&self, _: &str, _: &str) -> Result<Option<TableDef>, SiltError> {
                Ok(None)
            }
            fn create_table(&self, _: TableDef) -> Result<CatalogOutcome, SiltError> {
                Ok(CatalogOutcome::AlreadyExists)
            }
        }

        let m = Materializer::new(
            SiltConfig::default(),
            Arc::new(RacingCatalog),
            Arc::new(crate::memory::MemoryObjectStore::new()),
        );
        let record = Record::new("user", "u1", ts()).with_attr("name", "ada");
        m.materialize(&record).unwrap();
    }

    #[test]
    fn test_update_overwrites_same_artifact() {
        let objects = Arc::new(crate::memory::MemoryObjectStore::new());
        let m = Materializer::new(
            SiltConfig::default(),
            Arc::new(crate::memory::MemoryCatalog::new()),
            objects.clone(),
        );

        let v1 = Record::new("user", "u1", ts()).with_attr("name", "ada");
        let loc1 = m.materialize(&v1).unwrap();
        let v2 = Record::new("user", "u1", ts()).with_attr("name", "grace");
        let loc2 = m.materialize(&v2).unwrap();

        assert_eq!(loc1, loc2);
        assert_eq!(objects.len(), 1);
        let segment = Segment::decode(&objects.get(&loc2).unwrap().unwrap()).unwrap();
        assert_eq!(segment.values[0], ColumnValue::Text("grace".into()));
    }
}
