//! tacview Core - Tactical Entity Lifecycle & Query Engine
//!
//! Keeps a canonical in-memory model of "who is where, and how stale" from
//! an unordered, possibly duplicated stream of position reports, and answers
//! interactive multi-criteria queries fast enough to drive a live map:
//! 1. **Ingestion**: validation, validity repair, merge-on-update, bounded history
//! 2. **Lifecycle**: `Active -> Stale -> deleted` sweeps and capacity eviction
//! 3. **Queries**: filtering, distance/bearing enrichment, deterministic sort, statistics

pub mod classification;
pub mod config;
pub mod diagnostics;
pub mod engine_runtime;
pub mod entity;
pub mod error;
pub mod events;
pub mod inbound;
pub mod tacview_geo;
pub mod tacview_query;
pub mod tacview_store;

// Re-export key types for convenience
pub use classification::{Affiliation, Category, Classification};
pub use config::{EngineConfig, HistoryLimits};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot, QueueCounters};
pub use engine_runtime::TacticalEngine;
pub use entity::{EntityState, EventRecord, HistorySample, Motion, Position, TacticalEntity};
pub use error::{ConfigError, IgnoreReason, RejectReason};
pub use events::{EntityEvent, RemovalReason};
pub use inbound::{InboundQueue, PushOutcome};
pub use tacview_geo::{BoundingBox, Cardinal, GeoPoint};
pub use tacview_query::{
    FilterSpec, QueryConfig, QueryEngine, QueryResult, QueryStatistics, SortDirection, SortKey, ValueRange,
};
pub use tacview_store::{BatchSummary, EntityStore, IngestOutcome, SweepReport};
