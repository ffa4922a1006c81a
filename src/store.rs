//! External-collaborator interfaces.
//!
//! The pipeline talks to five backing systems, each specified only at its
//! interface boundary: a key-value store with one secondary index, an
//! object store with bulk delete, a lazy schema catalog, an asynchronous
//! query engine, and an at-least-once work queue. Production deployments
//! bind these traits to managed services; [`crate::memory`] provides
//! in-process implementations for tests and embedded use.
//!
//! All traits are object-safe and `Send + Sync` so implementations can be
//! shared across concurrently processed change events behind `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SiltError;

// ── Key-value store ────────────────────────────────────────────────────────

/// A stored key-value row: primary key, optional secondary index key, and
/// a JSON document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvRow {
    pub key: String,
    /// Exact-match secondary index key, when the row participates in the
    /// secondary index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_key: Option<String>,
    pub value: serde_json::Value,
}

/// Outcome of a conditional create-if-absent write.
///
/// Conditional writes are the pipeline's only mutual-exclusion primitive;
/// creators run in separate, unsynchronized processes, so in-process locks
/// cannot arbitrate them.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// This caller created the row.
    Created,
    /// The row already existed before this call.
    AlreadyExists(KvRow),
    /// A concurrent writer won the race; the winner's row is returned and
    /// the loss is not an error.
    RaceLost(KvRow),
}

impl CreateOutcome {
    /// Whether this caller performed the write.
    pub fn created(&self) -> bool {
        matches!(self, CreateOutcome::Created)
    }
}

/// Point read/write/delete by primary key, range query by key prefix, and
/// exact-match lookup through the secondary index.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<KvRow>, SiltError>;

    /// Unconditional upsert.
    fn put(&self, row: KvRow) -> Result<(), SiltError>;

    /// Idempotent delete. Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool, SiltError>;

    /// Conditional create: succeeds only if `row.key` is absent.
    fn create_if_absent(&self, row: KvRow) -> Result<CreateOutcome, SiltError>;

    /// All rows whose primary key starts with `prefix`, in key order.
    fn query_prefix(&self, prefix: &str) -> Result<Vec<KvRow>, SiltError>;

    /// All rows whose secondary index key equals `index_key`.
    fn query_secondary(&self, index_key: &str) -> Result<Vec<KvRow>, SiltError>;
}

// ── Object store ───────────────────────────────────────────────────────────

/// Hierarchically keyed object storage (`table/partition.../file`).
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), SiltError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SiltError>;

    /// Idempotent delete. Deleting a missing key is a success — the desired
    /// end state, absence, already holds.
    fn delete(&self, key: &str) -> Result<(), SiltError>;

    /// Delete up to the store's batch limit of keys in one call. Callers
    /// chunk larger sets; see [`crate::cascade`].
    fn delete_batch(&self, keys: &[String]) -> Result<(), SiltError>;
}

// ── Schema catalog ─────────────────────────────────────────────────────────

/// One column of a catalog table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Physical type name as understood by the analytical engine.
    pub physical_type: String,
}

/// A catalog table: name, columns, and the date-partition scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub database: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Partition column names, outermost first (`year`, `month`, `day`).
    pub partition_keys: Vec<String>,
    /// Object-store location prefix the table's data lives under.
    pub location: String,
}

/// Outcome of a catalog table creation.
///
/// Concurrent writers race to register a table on its first
/// materialization; losing that race is a normal outcome, mirroring
/// [`CreateOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogOutcome {
    /// This caller registered the table.
    Created,
    /// The table was already registered; the existing definition stands.
    AlreadyExists,
}

/// Lazy analytical-schema catalog.
///
/// `get_table` returning `None` is a normal, expected response — tables are
/// created on first materialization. Implementations must re-check the
/// external catalog on every call rather than caching process-locally,
/// since multiple writer processes run concurrently.
pub trait SchemaCatalog: Send + Sync {
    fn get_table(&self, database: &str, name: &str) -> Result<Option<TableDef>, SiltError>;

    /// Register a table definition. An existing table of the same name must
    /// be reported as [`CatalogOutcome::AlreadyExists`], never as an error,
    /// and must be left untouched.
    fn create_table(&self, table: TableDef) -> Result<CatalogOutcome, SiltError>;
}

// ── Query engine ───────────────────────────────────────────────────────────

/// Terminal-or-running execution state reported by the query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineState {
    Running,
    Succeeded,
    Failed,
}

/// Status of one engine execution.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Set once the execution reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Asynchronous, read-only analytical query engine.
pub trait QueryEngine: Send + Sync {
    /// Submit a statement; returns the engine's own execution identifier.
    fn submit(&self, statement: &str) -> Result<String, SiltError>;

    fn status(&self, execution_id: &str) -> Result<EngineStatus, SiltError>;

    /// Tabular result rows of a succeeded execution.
    fn results(&self, execution_id: &str) -> Result<Vec<Vec<String>>, SiltError>;
}

/// Event-bus notification of a query-engine state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineNotification {
    pub execution_id: String,
    pub state: EngineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Work queue ─────────────────────────────────────────────────────────────

/// Opaque redelivery receipt for one dequeued message.
pub type QueueReceipt = String;

/// At-least-once delivery of small JSON messages. Unacknowledged messages
/// are redelivered, so consumers must be idempotent.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, message: serde_json::Value) -> Result<(), SiltError>;

    fn dequeue(&self) -> Result<Option<(QueueReceipt, serde_json::Value)>, SiltError>;

    fn ack(&self, receipt: &QueueReceipt) -> Result<(), SiltError>;
}
