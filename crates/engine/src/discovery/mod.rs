//! Adaptive schema discovery.
//!
//! A run picks a [`StrategyProfile`] from the current resource level, builds
//! a pool sized for it, and walks schemas, tables and views. Tables are read
//! in batches of two statements each (stats, then columns), with a pause
//! between batches that doubles while the database is strained.

mod engine;
mod models;
mod strategy;

pub use engine::{cache_key, DiscoveryCache, DiscoveryEngine};
pub use models::{
    ColumnInfo, DatabaseInfo, DiscoveryMetrics, DiscoveryResult, SchemaInfo, TableInfo, ViewInfo,
};
pub use strategy::{AbortHandle, Strategy, StrategyProfile};
