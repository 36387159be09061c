use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{Backend, CatalogBackend};
use crate::scheduler::Priority;

/// Named query parameters. Ordered so that equal maps serialize identically.
pub type QueryParams = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows changed by a write statement; zero for reads.
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Look up a column by name in the given row.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// The capability that actually runs a query against a database.
///
/// The scheduler calls this once per member query, from worker tasks only.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute_query(
        &self,
        query: &str,
        params: &QueryParams,
        priority: Priority,
    ) -> Result<ResultSet>;
}

/// Runs scheduled queries directly on one backend.
pub struct BackendExecutor {
    backend: Arc<Backend>,
}

impl BackendExecutor {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

#[async_trait]
impl QueryExecutor for BackendExecutor {
    async fn execute_query(
        &self,
        query: &str,
        params: &QueryParams,
        priority: Priority,
    ) -> Result<ResultSet> {
        tracing::trace!(%priority, "Executing on backend");
        self.backend.execute(query, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_lookup_by_column() {
        let rs = ResultSet {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![json!(1), json!("ada")]],
            rows_affected: 0,
        };
        assert_eq!(rs.value(0, "name"), Some(&json!("ada")));
        assert_eq!(rs.value(0, "missing"), None);
        assert_eq!(rs.value(3, "id"), None);
        assert_eq!(rs.row_count(), 1);
    }
}
