//! # Error Contexts
//!
//! Structured metadata attached to errors so callers can react programmatically.

use serde::{Deserialize, Serialize};

/// Structured context for machine-readable errors.
///
/// Each variant provides specific fields relevant to that error type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for SLUICE-1001 (SourceNotFound)
    SourceNotFound {
        source_id: String,
        available_sources: Vec<String>,
    },

    /// Context for connection errors (SLUICE-1002, 1003, 1004)
    Connection {
        source_id: String,
        dialect: String,
        attempts: u32,
    },

    /// Context for a failed scheduled query
    Query {
        query_id: String,
        priority: String,
        batched: bool,
    },

    /// Context for SLUICE-6002 (BatchFailed)
    TableBatch {
        source_id: String,
        schema: String,
        tables: Vec<String>,
        attempts: u32,
    },

    /// Context for SLUICE-3001/3002 (config errors)
    Config {
        file_path: Option<String>,
        field: Option<String>,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}
