use async_trait::async_trait;
use deadpool_sqlite::{Config, Object, Pool, Runtime};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::Value;
use sluice_common::Dialect;
use sluice_error::{ErrorCode, ErrorContext, Result, SluiceError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{quote_ident, CatalogBackend, ColumnRow, PoolSettings, SchemaListing, TableStats};
use crate::executor::{QueryParams, ResultSet};

/// SQLite source behind a deadpool connection pool. Statements run on the
/// blocking thread pool via `interact`.
pub struct SqliteBackend {
    source_id: String,
    path: String,
    pool: Pool,
    idle_timeout: Duration,
    busy_timeout: Duration,
    round_trips: AtomicU64,
}

impl SqliteBackend {
    pub fn new(source_id: &str, connection: &str, settings: PoolSettings) -> Result<Self> {
        let path = connection
            .strip_prefix("sqlite://")
            .or_else(|| connection.strip_prefix("sqlite:"))
            .unwrap_or(connection)
            .trim();
        if path.is_empty() {
            return Err(SluiceError::new(
                ErrorCode::InvalidConnectionString,
                "SQLite connection string is empty",
            )
            .with_hint("Use a file path or sqlite://path"));
        }

        let pool = Config::new(open_uri(path))
            .builder(Runtime::Tokio1)
            .map_err(|e| {
                SluiceError::new(
                    ErrorCode::InvalidConfig,
                    format!("Invalid SQLite pool configuration: {}", e),
                )
            })?
            .max_size(settings.max_size.max(1))
            .wait_timeout(Some(settings.connect_timeout))
            .create_timeout(Some(settings.connect_timeout))
            .recycle_timeout(Some(settings.connect_timeout))
            .build()
            .map_err(|e| {
                SluiceError::new(
                    ErrorCode::InvalidConfig,
                    format!("Failed to create SQLite connection pool: {}", e),
                )
            })?;

        Ok(Self {
            source_id: source_id.to_string(),
            path: path.to_string(),
            pool,
            idle_timeout: settings.idle_timeout,
            busy_timeout: settings.connect_timeout,
            round_trips: AtomicU64::new(0),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn connection_error(&self, err: SluiceError) -> SluiceError {
        err.with_context(ErrorContext::Connection {
            source_id: self.source_id.clone(),
            dialect: Dialect::Sqlite.to_string(),
            attempts: 1,
        })
    }

    async fn conn(&self) -> Result<Object> {
        let idle = self.idle_timeout;
        self.pool.retain(|_, metrics| metrics.last_used() < idle);
        self.pool
            .get()
            .await
            .map_err(|e| self.connection_error(SluiceError::from(e)))
    }

    /// Run `f` on a pooled connection, counting one round-trip.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn().await?;
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let busy_timeout = self.busy_timeout;

        let outcome = conn
            .interact(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                f(conn)
            })
            .await?;

        outcome.map_err(|e| {
            if e.code == ErrorCode::ConnectionFailed {
                self.connection_error(e)
            } else {
                e
            }
        })
    }
}

/// Read-write URI for `path`, so a missing database file fails to open
/// instead of being created empty.
fn open_uri(path: &str) -> String {
    if path.starts_with("file:") || path == ":memory:" {
        return path.to_string();
    }
    let escaped = path
        .replace('%', "%25")
        .replace('?', "%3f")
        .replace('#', "%23");
    format!("file:{}?mode=rw", escaped)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

fn column_rows(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ColumnRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |r| {
        let not_null: i64 = r.get(3)?;
        let cid: i64 = r.get(5)?;
        let pk: i64 = r.get(6)?;
        Ok(ColumnRow {
            table: r.get(0)?,
            name: r.get(1)?,
            data_type: r.get(2)?,
            nullable: not_null == 0,
            default: r.get(4)?,
            ordinal_position: cid as i32 + 1,
            is_primary_key: pk > 0,
            comment: None,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl CatalogBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    async fn execute(&self, query: &str, params: &QueryParams) -> Result<ResultSet> {
        let query = query.to_string();
        let params = params.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&query)?;
            // Parameters the statement does not reference are ignored.
            for (name, value) in &params {
                if let Some(idx) = stmt.parameter_index(&format!(":{}", name))? {
                    stmt.raw_bind_parameter(idx, to_sql_value(value))?;
                }
            }

            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            if columns.is_empty() {
                let affected = stmt.raw_execute()?;
                return Ok(ResultSet::affected(affected as u64));
            }

            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns.len());
                for idx in 0..columns.len() {
                    values.push(to_json(row.get_ref(idx)?));
                }
                out.push(values);
            }
            Ok(ResultSet {
                columns,
                rows: out,
                rows_affected: 0,
            })
        })
        .await
    }

    async fn test_connection(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        let dropped = self.pool.status().size;
        self.pool.close();
        debug!(source_id = %self.source_id, dropped, "Closed SQLite pool");
    }

    async fn list_schemas(&self) -> Result<SchemaListing> {
        let database = Path::new(&self.path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone());
        let schemas = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("PRAGMA database_list")?;
                let names = stmt
                    .query_map([], |r| r.get::<_, String>(1))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(names.into_iter().filter(|n| n != "temp").collect())
            })
            .await?;
        Ok(SchemaListing { database, schemas })
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_ident(schema)
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn table_stats(&self, schema: &str, tables: &[String]) -> Result<Vec<TableStats>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let sql = tables
            .iter()
            .enumerate()
            .map(|(i, t)| {
                format!(
                    "SELECT ?{} AS name, COUNT(*) AS row_count FROM {}.{}",
                    i + 1,
                    quote_ident(schema),
                    quote_ident(t)
                )
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let tables = tables.to_vec();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let stats = stmt
                .query_map(rusqlite::params_from_iter(tables.iter()), |r| {
                    Ok(TableStats {
                        table: r.get(0)?,
                        row_count: Some(r.get(1)?),
                        size_bytes: None,
                        comment: None,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(stats)
        })
        .await
    }

    async fn table_columns(&self, schema: &str, tables: &[String]) -> Result<Vec<ColumnRow>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        // One pragma call per listed table; other relations in the schema,
        // broken views included, are never compiled.
        let sql = (0..tables.len())
            .map(|i| {
                format!(
                    "SELECT ?{n} AS tbl, name, type, \"notnull\", dflt_value, cid, pk \
                     FROM pragma_table_info(?{n}, ?1)",
                    n = i + 2
                )
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
            + " ORDER BY 1, 6";
        let schema = schema.to_string();
        let tables = tables.to_vec();

        self.with_conn(move |conn| {
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(tables.len() + 1);
            params.push(&schema);
            for t in &tables {
                params.push(t);
            }
            column_rows(conn, &sql, &params)
        })
        .await
    }

    async fn list_views(&self, schema: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'view' ORDER BY name",
            quote_ident(schema)
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn view_columns(&self, schema: &str, view: &str) -> Result<Vec<ColumnRow>> {
        let select_all = format!("SELECT * FROM {}.{}", quote_ident(schema), quote_ident(view));
        let schema = schema.to_string();
        let view = view.to_string();

        self.with_conn(move |conn| {
            // Compiling the view surfaces broken definitions (dropped base
            // tables, renamed columns) as an error instead of empty columns.
            conn.prepare(&select_all)?;
            column_rows(
                conn,
                "SELECT ?1, name, type, \"notnull\", dflt_value, cid, pk \
                 FROM pragma_table_info(?1, ?2) ORDER BY cid",
                &[&view as &dyn rusqlite::ToSql, &schema],
            )
        })
        .await
    }
}
