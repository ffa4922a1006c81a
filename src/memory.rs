//! In-memory implementations of the [`crate::store`] traits.
//!
//! These back the integration tests and double as an embedded single-process
//! mode. All types use interior mutability (`Mutex`) and are shared behind
//! `Arc`, matching how production bindings are shared across concurrently
//! processed change events.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::SiltError;
use crate::store::{
    CatalogOutcome, ColumnDef, CreateOutcome, EngineState, EngineStatus, KeyValueStore, KvRow,
    ObjectStore, QueryEngine, QueueReceipt, SchemaCatalog, TableDef, WorkQueue,
};

// ── Key-value store ────────────────────────────────────────────────────────

/// In-memory [`KeyValueStore`] with an exact-match secondary index.
#[derive(Debug, Default)]
pub struct MemoryKv {
    rows: Mutex<BTreeMap<String, KvRow>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows, for test assertions.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<KvRow>, SiltError> {
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    fn put(&self, row: KvRow) -> Result<(), SiltError> {
        self.rows.lock().unwrap().insert(row.key.clone(), row);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, SiltError> {
        Ok(self.rows.lock().unwrap().remove(key).is_some())
    }

    fn create_if_absent(&self, row: KvRow) -> Result<CreateOutcome, SiltError> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get(&row.key) {
            Some(existing) => Ok(CreateOutcome::AlreadyExists(existing.clone())),
            None => {
                rows.insert(row.key.clone(), row);
                Ok(CreateOutcome::Created)
            }
        }
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<KvRow>, SiltError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn query_secondary(&self, index_key: &str) -> Result<Vec<KvRow>, SiltError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|r| r.index_key.as_deref() == Some(index_key))
            .cloned()
            .collect())
    }
}

// ── Object store ───────────────────────────────────────────────────────────

/// In-memory [`ObjectStore`].
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    throttled_puts: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a throttle error, so tests can
    /// exercise the retry path.
    pub fn throttle_next_puts(&self, n: u64) {
        self.throttled_puts.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored keys, for test assertions.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), SiltError> {
        if self.throttled_puts.load(Ordering::SeqCst) > 0 {
            self.throttled_puts.fetch_sub(1, Ordering::SeqCst);
            return Err(SiltError::Throttled("object store throttled".into()));
        }
        self.objects.lock().unwrap().insert(key.to_owned(), bytes);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SiltError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), SiltError> {
        if self.objects.lock().unwrap().remove(key).is_none() {
            tracing::warn!(key, "delete of missing object; treating as success");
        }
        Ok(())
    }

    fn delete_batch(&self, keys: &[String]) -> Result<(), SiltError> {
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}

// ── Schema catalog ─────────────────────────────────────────────────────────

/// In-memory [`SchemaCatalog`].
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: Mutex<HashMap<(String, String), TableDef>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column definitions of a table, for test assertions.
    pub fn columns(&self, database: &str, name: &str) -> Option<Vec<ColumnDef>> {
        self.tables
            .lock()
            .unwrap()
            .get(&(database.to_owned(), name.to_owned()))
            .map(|t| t.columns.clone())
    }
}

impl SchemaCatalog for MemoryCatalog {
    fn get_table(&self, database: &str, name: &str) -> Result<Option<TableDef>, SiltError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(&(database.to_owned(), name.to_owned()))
            .cloned())
    }

    fn create_table(&self, table: TableDef) -> Result<CatalogOutcome, SiltError> {
        let mut tables = self.tables.lock().unwrap();
        let key = (table.database.clone(), table.name.clone());
        if tables.contains_key(&key) {
            return Ok(CatalogOutcome::AlreadyExists);
        }
        tables.insert(key, table);
        Ok(CatalogOutcome::Created)
    }
}

// ── Query engine ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Execution {
    statement: String,
    state: EngineState,
    completed_at: Option<DateTime<Utc>>,
    results: Vec<Vec<String>>,
}

/// Scriptable in-memory [`QueryEngine`].
///
/// Submissions start `Running`; tests drive them to a terminal state with
/// [`MemoryEngine::finish`] and preload result rows with
/// [`MemoryEngine::set_results`]. Submitted statement text is recorded so
/// tests can assert on delete-intent rewrites.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    executions: Mutex<HashMap<String, Execution>>,
    next_id: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The statement text submitted under `execution_id`.
    pub fn statement(&self, execution_id: &str) -> Option<String> {
        self.executions
            .lock()
            .unwrap()
            .get(execution_id)
            .map(|e| e.statement.clone())
    }

    /// Drive an execution to a terminal state.
    pub fn finish(&self, execution_id: &str, state: EngineState, completed_at: DateTime<Utc>) {
        let mut executions = self.executions.lock().unwrap();
        if let Some(exec) = executions.get_mut(execution_id) {
            exec.state = state;
            exec.completed_at = Some(completed_at);
        }
    }

    /// Preload the result rows returned for `execution_id`.
    pub fn set_results(&self, execution_id: &str, rows: Vec<Vec<String>>) {
        let mut executions = self.executions.lock().unwrap();
        if let Some(exec) = executions.get_mut(execution_id) {
            exec.results = rows;
        }
    }
}

impl QueryEngine for MemoryEngine {
    fn submit(&self, statement: &str) -> Result<String, SiltError> {
        let id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.executions.lock().unwrap().insert(
            id.clone(),
            Execution {
                statement: statement.to_owned(),
                state: EngineState::Running,
                completed_at: None,
                results: Vec::new(),
            },
        );
        Ok(id)
    }

    fn status(&self, execution_id: &str) -> Result<EngineStatus, SiltError> {
        let executions = self.executions.lock().unwrap();
        let exec = executions
            .get(execution_id)
            .ok_or_else(|| SiltError::Engine(format!("unknown execution {execution_id}")))?;
        Ok(EngineStatus {
            state: exec.state,
            completed_at: exec.completed_at,
        })
    }

    fn results(&self, execution_id: &str) -> Result<Vec<Vec<String>>, SiltError> {
        let executions = self.executions.lock().unwrap();
        let exec = executions
            .get(execution_id)
            .ok_or_else(|| SiltError::Engine(format!("unknown execution {execution_id}")))?;
        Ok(exec.results.clone())
    }
}

// ── Work queue ─────────────────────────────────────────────────────────────

/// In-memory at-least-once [`WorkQueue`].
///
/// Dequeued messages move to an in-flight map and are re-queued by
/// [`MemoryQueue::redeliver_unacked`], mimicking visibility-timeout
/// redelivery.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    ready: Mutex<VecDeque<(QueueReceipt, serde_json::Value)>>,
    in_flight: Mutex<HashMap<QueueReceipt, serde_json::Value>>,
    next_receipt: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for delivery.
    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    /// Number of delivered-but-unacknowledged messages.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Move all unacknowledged messages back onto the ready queue.
    pub fn redeliver_unacked(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let mut ready = self.ready.lock().unwrap();
        for (receipt, message) in in_flight.drain() {
            ready.push_back((receipt, message));
        }
    }
}

impl WorkQueue for MemoryQueue {
    fn enqueue(&self, message: serde_json::Value) -> Result<(), SiltError> {
        let receipt = format!("rcpt-{}", self.next_receipt.fetch_add(1, Ordering::SeqCst) + 1);
        self.ready.lock().unwrap().push_back((receipt, message));
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<(QueueReceipt, serde_json::Value)>, SiltError> {
        let next = self.ready.lock().unwrap().pop_front();
        if let Some((receipt, message)) = next {
            self.in_flight
                .lock()
                .unwrap()
                .insert(receipt.clone(), message.clone());
            Ok(Some((receipt, message)))
        } else {
            Ok(None)
        }
    }

    fn ack(&self, receipt: &QueueReceipt) -> Result<(), SiltError> {
        self.in_flight.lock().unwrap().remove(receipt);
        Ok(())
    }
}
