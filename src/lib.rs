//! silt — change-feed materialization into a partitioned columnar store.
//!
//! The pipeline ingests an ordered stream of mutation events from an
//! operational record store and materializes them into date-partitioned
//! columnar artifacts, while maintaining referential consistency for
//! many-to-many relationships and tracking long-running analytical queries
//! through an asynchronous trigger/poll protocol.
//!
//! # Architecture
//!
//! - [`classify`] — dispatch entry point; routes each change event to one of
//!   four handling paths with per-record error isolation.
//! - [`materialize`] — lowers records to single-row columnar segments with
//!   inferred minimal types and maintains the lazy schema catalog.
//! - [`relation`] — content-addressed relation identity and idempotent
//!   create-if-absent with forward/reverse index entries.
//! - [`cascade`] — best-effort multi-hop cleanup when an entity is deleted.
//! - [`task`] — terminal-state task machine with dual push/poll tracking and
//!   the deletion-completion work queue.
//! - [`rewrite`] — delete-intent statements rewritten to read-only selects.
//! - [`store`] — trait boundary to the backing key-value store, object
//!   store, schema catalog, query engine, and work queue; [`memory`] holds
//!   in-process implementations.
//!
//! # Delivery semantics
//!
//! The change feed is at-least-once and ordered only per key; every handler
//! here is idempotent, and nothing orders events across different entities.
//! Relation creation is the single path needing mutual exclusion, provided
//! by conditional writes at the storage layer.

pub mod cascade;
pub mod classify;
pub mod config;
pub mod error;
pub mod materialize;
pub mod memory;
pub mod record;
pub mod relation;
pub mod rewrite;
pub mod store;
pub mod task;

pub use cascade::{CascadeCoordinator, CascadeReport};
pub use classify::{BatchReport, Classifier, Dispatch};
pub use config::SiltConfig;
pub use error::{SiltError, SiltErrorKind};
pub use materialize::{ArtifactLocation, Materializer};
pub use record::{AttrValue, ChangeEvent, ChangeOp, Participant, Record, RecordClass};
pub use relation::{RelationCreation, RelationService};
pub use task::{Task, TaskKind, TaskManager, TaskStatus};
