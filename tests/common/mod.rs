//! Shared test harness: the full pipeline wired over in-memory stores.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use silt::classify::Classifier;
use silt::memory::{MemoryCatalog, MemoryEngine, MemoryKv, MemoryObjectStore, MemoryQueue};
use silt::record::{AttrValue, Participant};
use silt::{CascadeCoordinator, Materializer, RelationService, SiltConfig, TaskManager};

/// A complete pipeline over in-memory backing stores, with the raw stores
/// exposed for assertions.
pub struct Pipeline {
    pub config: SiltConfig,
    pub kv: Arc<MemoryKv>,
    pub objects: Arc<MemoryObjectStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub engine: Arc<MemoryEngine>,
    pub queue: Arc<MemoryQueue>,
    pub materializer: Arc<Materializer>,
    pub relations: Arc<RelationService>,
    pub cascade: Arc<CascadeCoordinator>,
    pub classifier: Classifier,
    pub tasks: TaskManager,
}

impl Pipeline {
    pub fn new() -> Self {
        let config = SiltConfig::default();
        let kv = Arc::new(MemoryKv::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let engine = Arc::new(MemoryEngine::new());
        let queue = Arc::new(MemoryQueue::new());

        let materializer = Arc::new(Materializer::new(
            config.clone(),
            catalog.clone(),
            objects.clone(),
        ));
        let relations = Arc::new(RelationService::new(
            config.clone(),
            kv.clone(),
            materializer.clone(),
        ));
        let cascade = Arc::new(CascadeCoordinator::new(
            config.clone(),
            kv.clone(),
            objects.clone(),
        ));
        let classifier = Classifier::new(
            config.clone(),
            materializer.clone(),
            relations.clone(),
            cascade.clone(),
        );
        let tasks = TaskManager::new(config.clone(), kv.clone(), engine.clone(), queue.clone());

        Pipeline {
            config,
            kv,
            objects,
            catalog,
            engine,
            queue,
            materializer,
            relations,
            cascade,
            classifier,
            tasks,
        }
    }

    /// Fixed timestamp used across tests so partition keys are predictable.
    pub fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }
}

/// Two-participant helper for relation tests.
pub fn pair(a: (&str, &str), b: (&str, &str)) -> Vec<Participant> {
    vec![Participant::new(a.0, a.1), Participant::new(b.0, b.1)]
}

/// Payload helper.
pub fn payload(entries: &[(&str, AttrValue)]) -> BTreeMap<String, AttrValue> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}
