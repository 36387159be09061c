//! Database backends.
//!
//! [`Backend`] is a closed set of supported dialects. Every variant exposes
//! the same [`CatalogBackend`] capability: plain execution for the scheduler
//! and the catalog round-trips the discovery engine is built from. Each
//! catalog method issues exactly one statement against the database.

mod pg_value;
mod postgres;
mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sluice_common::config::StrategySettings;
use sluice_common::{Dialect, SourceConfig};
use sluice_error::{ErrorCode, Result, SluiceError};
use std::time::Duration;

use crate::executor::{QueryParams, ResultSet};

/// Sizing and timeouts for one backend's connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 4,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&StrategySettings> for PoolSettings {
    fn from(strategy: &StrategySettings) -> Self {
        Self {
            max_size: (strategy.pool_size + strategy.max_overflow).max(1),
            idle_timeout: Duration::from_secs(strategy.idle_timeout_secs),
            connect_timeout: Duration::from_secs(strategy.connect_timeout_secs),
        }
    }
}

/// Database name plus the schemas it contains, read in one round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaListing {
    pub database: String,
    pub schemas: Vec<String>,
}

/// Size metadata of one table, as returned by a batched stats query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub table: String,
    pub row_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub comment: Option<String>,
}

/// One column definition, tagged with the relation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRow {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub ordinal_position: i32,
    pub is_primary_key: bool,
    pub comment: Option<String>,
}

#[async_trait]
pub trait CatalogBackend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Statements issued against the database so far.
    fn round_trips(&self) -> u64;

    async fn execute(&self, query: &str, params: &QueryParams) -> Result<ResultSet>;

    async fn test_connection(&self) -> Result<()>;

    /// Release every pooled connection. The backend is unusable afterwards.
    async fn close(&self);

    async fn list_schemas(&self) -> Result<SchemaListing>;

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Row counts, sizes and comments for all `tables` in one statement.
    async fn table_stats(&self, schema: &str, tables: &[String]) -> Result<Vec<TableStats>>;

    /// Column definitions for all `tables` in one statement.
    async fn table_columns(&self, schema: &str, tables: &[String]) -> Result<Vec<ColumnRow>>;

    async fn list_views(&self, schema: &str) -> Result<Vec<String>>;

    async fn view_columns(&self, schema: &str, view: &str) -> Result<Vec<ColumnRow>>;
}

pub enum Backend {
    Postgres(PostgresBackend),
    Sqlite(SqliteBackend),
}

impl Backend {
    /// Build a pool for `source`. No connection is opened until first use.
    pub fn connect(source: &SourceConfig, pool: PoolSettings) -> Result<Self> {
        match source.dialect {
            Dialect::Postgres => Ok(Backend::Postgres(PostgresBackend::new(
                &source.id,
                source.connection_string(),
                pool,
            )?)),
            Dialect::Sqlite => Ok(Backend::Sqlite(SqliteBackend::new(
                &source.id,
                source.connection_string(),
                pool,
            )?)),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Backend::Postgres(b) => b.source_id(),
            Backend::Sqlite(b) => b.source_id(),
        }
    }

    fn inner(&self) -> &dyn CatalogBackend {
        match self {
            Backend::Postgres(b) => b,
            Backend::Sqlite(b) => b,
        }
    }
}

#[async_trait]
impl CatalogBackend for Backend {
    fn dialect(&self) -> Dialect {
        self.inner().dialect()
    }

    fn round_trips(&self) -> u64 {
        self.inner().round_trips()
    }

    async fn execute(&self, query: &str, params: &QueryParams) -> Result<ResultSet> {
        self.inner().execute(query, params).await
    }

    async fn test_connection(&self) -> Result<()> {
        self.inner().test_connection().await
    }

    async fn close(&self) {
        self.inner().close().await
    }

    async fn list_schemas(&self) -> Result<SchemaListing> {
        self.inner().list_schemas().await
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        self.inner().list_tables(schema).await
    }

    async fn table_stats(&self, schema: &str, tables: &[String]) -> Result<Vec<TableStats>> {
        self.inner().table_stats(schema, tables).await
    }

    async fn table_columns(&self, schema: &str, tables: &[String]) -> Result<Vec<ColumnRow>> {
        self.inner().table_columns(schema, tables).await
    }

    async fn list_views(&self, schema: &str) -> Result<Vec<String>> {
        self.inner().list_views(schema).await
    }

    async fn view_columns(&self, schema: &str, view: &str) -> Result<Vec<ColumnRow>> {
        self.inner().view_columns(schema, view).await
    }
}

/// Errors raised while binding named parameters, before any round-trip.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("Parameter ':{0}' is referenced by the query but was not supplied")]
    Missing(String),
    #[error("Parameter ':{name}' cannot be bound as {expected}: {value}")]
    TypeMismatch {
        name: String,
        expected: String,
        value: String,
    },
}

impl From<ParamError> for SluiceError {
    fn from(err: ParamError) -> Self {
        SluiceError::new(ErrorCode::InvalidParameter, err.to_string())
    }
}

/// Quote an identifier for interpolation into catalog SQL.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
