use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_common::Dialect;

use super::Strategy;
use crate::backend::{ColumnRow, TableStats};

/// Everything one discovery run learned about a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub source_id: String,
    pub dialect: Dialect,
    pub databases: Vec<DatabaseInfo>,
    #[serde(rename = "discoveryMetrics")]
    pub metrics: DiscoveryMetrics,
}

impl DiscoveryResult {
    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.schemas().flat_map(|s| s.tables.iter())
    }

    pub fn views(&self) -> impl Iterator<Item = &ViewInfo> {
        self.schemas().flat_map(|s| s.views.iter())
    }

    pub fn schemas(&self) -> impl Iterator<Item = &SchemaInfo> {
        self.databases.iter().flat_map(|d| d.schemas.iter())
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<&TableInfo> {
        self.tables().find(|t| t.schema == schema && t.name == name)
    }

    /// A copy of a cached result carrying metrics for the lookup that served it.
    pub(crate) fn served_from_cache(&self, mut metrics: DiscoveryMetrics) -> Self {
        metrics.schemas_discovered = self.metrics.schemas_discovered;
        metrics.tables_discovered = self.metrics.tables_discovered;
        metrics.views_discovered = self.metrics.views_discovered;
        metrics.cache_hits = 1;
        Self {
            source_id: self.source_id.clone(),
            dialect: self.dialect,
            databases: self.databases.clone(),
            metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub schemas: Vec<SchemaInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    pub tables: Vec<TableInfo>,
    pub views: Vec<ViewInfo>,
    /// Set when the table or view listing itself could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SchemaInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
            views: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub row_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub comment: Option<String>,
    pub columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableInfo {
    pub(crate) fn assemble(
        schema: &str,
        name: &str,
        stats: Option<&TableStats>,
        columns: Vec<ColumnInfo>,
    ) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            row_count: stats.and_then(|s| s.row_count),
            size_bytes: stats.and_then(|s| s.size_bytes),
            comment: stats.and_then(|s| s.comment.clone()),
            columns,
            error: None,
        }
    }

    pub(crate) fn failed(schema: &str, name: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::assemble(schema, name, None, Vec::new())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub ordinal_position: i32,
    pub is_primary_key: bool,
    pub comment: Option<String>,
}

impl From<ColumnRow> for ColumnInfo {
    fn from(row: ColumnRow) -> Self {
        Self {
            name: row.name,
            data_type: row.data_type,
            nullable: row.nullable,
            default: row.default,
            ordinal_position: row.ordinal_position,
            is_primary_key: row.is_primary_key,
            comment: row.comment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters for a single discovery run. Read-only once the run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMetrics {
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub schemas_discovered: usize,
    pub tables_discovered: usize,
    pub views_discovered: usize,
    /// Statements issued against the database, retries included.
    pub queries_executed: u64,
    pub connection_errors: u64,
    pub retries: u64,
    pub batches_processed: usize,
    pub failed_batches: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
}

impl DiscoveryMetrics {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            schemas_discovered: 0,
            tables_discovered: 0,
            views_discovered: 0,
            queries_executed: 0,
            connection_errors: 0,
            retries: 0,
            batches_processed: 0,
            failed_batches: 0,
            cache_hits: 0,
            cache_misses: 0,
            cache_hit_ratio: 0.0,
        }
    }

    pub(crate) fn finish(&mut self, elapsed: std::time::Duration) {
        self.finished_at = Some(Utc::now());
        self.duration_ms = elapsed.as_millis() as u64;
        let lookups = self.cache_hits + self.cache_misses;
        self.cache_hit_ratio = if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_hit_ratio() {
        let mut metrics = DiscoveryMetrics::new(Strategy::Balanced);
        metrics.cache_hits = 1;
        metrics.cache_misses = 3;
        metrics.finish(std::time::Duration::from_millis(12));
        assert_eq!(metrics.cache_hit_ratio, 0.25);
        assert_eq!(metrics.duration_ms, 12);
        assert!(metrics.finished_at.is_some());
    }

    #[test]
    fn test_result_serializes_metrics_key() {
        let result = DiscoveryResult {
            source_id: "lite".into(),
            dialect: Dialect::Sqlite,
            databases: vec![DatabaseInfo {
                name: "app".into(),
                schemas: vec![SchemaInfo::new("main")],
            }],
            metrics: DiscoveryMetrics::new(Strategy::Aggressive),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["discoveryMetrics"]["strategy"], "aggressive");
        assert!(json["databases"][0]["schemas"][0].get("error").is_none());
    }
}
