//! # sluice-engine
//!
//! Adaptive orchestration of database work: a priority scheduler that
//! deduplicates and batches queries ahead of an opaque executor, and a schema
//! discovery engine that introspects sources under a load-aware strategy.

pub mod backend;
pub mod cache;
pub mod discovery;
pub mod executor;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;

pub use backend::{Backend, CatalogBackend};
pub use cache::{CacheStats, IntelligentCache};
pub use discovery::{AbortHandle, DiscoveryEngine, DiscoveryResult, Strategy, StrategyProfile};
pub use executor::{BackendExecutor, QueryExecutor, QueryParams, ResultSet};
pub use monitor::{ResourceLevel, ResourceMonitor};
pub use orchestrator::Orchestrator;
pub use scheduler::{
    CompletionEvent, PendingResult, Priority, QueryKind, QueryResult, QueryScheduler,
    SchedulerStatus,
};
