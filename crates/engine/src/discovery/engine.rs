use dashmap::DashMap;
use sluice_common::config::DiscoverySettings;
use sluice_common::retry::retry_async;
use sluice_common::SourceConfig;
use sluice_error::{ErrorCode, ErrorContext, Result, SluiceError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use super::models::{
    ColumnInfo, DatabaseInfo, DiscoveryMetrics, DiscoveryResult, SchemaInfo, TableInfo, ViewInfo,
};
use super::strategy::{AbortHandle, StrategyProfile};
use crate::backend::{Backend, CatalogBackend, ColumnRow, TableStats};
use crate::cache::IntelligentCache;
use crate::monitor::ResourceMonitor;

pub type DiscoveryCache = IntelligentCache<Arc<DiscoveryResult>>;

pub fn cache_key(source_id: &str) -> String {
    format!("schemas_{}", source_id)
}

/// Introspects configured sources under a load-aware strategy.
///
/// Runs against one source are serialized; a caller arriving while a run is
/// in flight waits for it and is then served from the cache.
pub struct DiscoveryEngine {
    sources: HashMap<String, SourceConfig>,
    settings: DiscoverySettings,
    monitor: Arc<ResourceMonitor>,
    cache: Arc<DiscoveryCache>,
    guards: DashMap<String, Arc<Mutex<()>>>,
}

impl DiscoveryEngine {
    pub fn new(
        sources: Vec<SourceConfig>,
        settings: DiscoverySettings,
        monitor: Arc<ResourceMonitor>,
        cache: Arc<DiscoveryCache>,
    ) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.id.clone(), s)).collect(),
            settings,
            monitor,
            cache,
            guards: DashMap::new(),
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }

    /// Drop cached results for one source, or for every source.
    pub fn invalidate(&self, source_id: Option<&str>) -> usize {
        match source_id {
            Some(id) => usize::from(self.cache.remove(&cache_key(id))),
            None => self.cache.invalidate(Some("schemas_")),
        }
    }

    pub async fn discover_schemas(&self, source_id: &str) -> Result<DiscoveryResult> {
        self.discover_schemas_with_abort(source_id, &AbortHandle::new())
            .await
    }

    pub async fn discover_schemas_with_abort(
        &self,
        source_id: &str,
        abort: &AbortHandle,
    ) -> Result<DiscoveryResult> {
        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| SluiceError::source_not_found(source_id, self.source_ids()))?;

        let span = info_span!("discovery", source_id, strategy = field::Empty);
        self.discover_source(source, abort).instrument(span).await
    }

    fn guard(&self, source_id: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn discover_source(
        &self,
        source: &SourceConfig,
        abort: &AbortHandle,
    ) -> Result<DiscoveryResult> {
        let guard = self.guard(&source.id);
        let _running = guard.lock().await;

        // Load may have shifted while waiting behind another run.
        let profile = self.monitor.optimal_profile(&self.settings);
        Span::current().record("strategy", field::display(profile.strategy));

        let started = Instant::now();
        let key = cache_key(&source.id);
        let mut metrics = DiscoveryMetrics::new(profile.strategy);

        if let Some(cached) = self.cache.get(&key) {
            metrics.finish(started.elapsed());
            let result = cached.served_from_cache(metrics);
            info!(target: "discovery", "Served discovery from cache");
            return Ok(result);
        }
        metrics.cache_misses = 1;

        let backend = Backend::connect(source, profile.pool_settings())?;
        self.monitor.record_connection(&source.id);
        let outcome =
            discover_with(&source.id, &backend, &self.monitor, profile, abort, metrics).await;
        // Pools never outlive the run, on the failure path included.
        backend.close().await;

        let (databases, mut metrics) = outcome?;
        metrics.finish(started.elapsed());
        info!(
            target: "discovery",
            schemas = metrics.schemas_discovered,
            tables = metrics.tables_discovered,
            views = metrics.views_discovered,
            queries = metrics.queries_executed,
            failed_batches = metrics.failed_batches,
            duration_ms = metrics.duration_ms,
            "Discovery complete"
        );

        let result = DiscoveryResult {
            source_id: source.id.clone(),
            dialect: source.dialect,
            databases,
            metrics,
        };
        self.cache.set(key, Arc::new(result.clone()));
        Ok(result)
    }
}

/// Run discovery over an already constructed backend. The caller owns the
/// backend's lifetime and closes it afterwards.
pub(crate) async fn discover_with(
    source_id: &str,
    backend: &dyn CatalogBackend,
    monitor: &ResourceMonitor,
    profile: StrategyProfile,
    abort: &AbortHandle,
    metrics: DiscoveryMetrics,
) -> Result<(Vec<DatabaseInfo>, DiscoveryMetrics)> {
    let baseline = backend.round_trips();
    let mut run = Run {
        source_id,
        backend,
        monitor,
        profile,
        abort,
        metrics,
    };
    let outcome = run.databases().await;
    let mut metrics = run.metrics;
    metrics.queries_executed = backend.round_trips() - baseline;
    outcome.map(|databases| (databases, metrics))
}

struct Run<'a> {
    source_id: &'a str,
    backend: &'a dyn CatalogBackend,
    monitor: &'a ResourceMonitor,
    profile: StrategyProfile,
    abort: &'a AbortHandle,
    metrics: DiscoveryMetrics,
}

impl Run<'_> {
    fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() {
            warn!(target: "discovery", "Discovery aborted");
            return Err(SluiceError::new(
                ErrorCode::DiscoveryAborted,
                "Discovery run was aborted",
            ));
        }
        Ok(())
    }

    /// Retry transient failures under the profile's backoff, returning the
    /// outcome and the number of attempts made.
    async fn retry<T, F, Fut>(&mut self, name: &str, op: F) -> (Result<T>, u32)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let transient = AtomicU32::new(0);
        let (attempts_ref, transient_ref, op_ref) = (&attempts, &transient, &op);

        let outcome = retry_async(
            name,
            self.profile.retry_settings(),
            SluiceError::is_transient,
            move || async move {
                attempts_ref.fetch_add(1, Ordering::Relaxed);
                let result = op_ref().await;
                if matches!(&result, Err(e) if e.is_transient()) {
                    transient_ref.fetch_add(1, Ordering::Relaxed);
                }
                result
            },
        )
        .await;

        let attempts = attempts.into_inner();
        let transient = transient.into_inner();
        self.metrics.retries += u64::from(attempts.saturating_sub(1));
        self.metrics.connection_errors += u64::from(transient);
        for _ in 0..transient {
            self.monitor.record_error("discovery_connection");
        }
        (outcome, attempts)
    }

    async fn databases(&mut self) -> Result<Vec<DatabaseInfo>> {
        let backend = self.backend;

        let (connected, attempts) = self.retry("test_connection", || backend.test_connection()).await;
        if let Err(err) = connected {
            error!(target: "discovery", attempts, error = %err, "Could not connect for discovery");
            return Err(err
                .with_context(ErrorContext::Connection {
                    source_id: self.source_id.to_string(),
                    dialect: backend.dialect().to_string(),
                    attempts,
                })
                .with_hint("Check that the database is reachable and accepts connections"));
        }

        let (listing, _) = self.retry("list_schemas", || backend.list_schemas()).await;
        let listing = listing?;
        debug!(target: "discovery", database = %listing.database, schemas = listing.schemas.len(), "Listed schemas");

        let mut database = DatabaseInfo {
            name: listing.database,
            schemas: Vec::with_capacity(listing.schemas.len()),
        };
        for schema in &listing.schemas {
            let info = self.schema(schema).await?;
            self.metrics.schemas_discovered += 1;
            database.schemas.push(info);
        }
        Ok(vec![database])
    }

    async fn schema(&mut self, name: &str) -> Result<SchemaInfo> {
        self.check_abort()?;
        let backend = self.backend;
        let mut schema = SchemaInfo::new(name);

        let (listed, _) = self.retry("list_tables", || backend.list_tables(name)).await;
        match listed {
            Ok(tables) => {
                for batch in tables.chunks(self.profile.batch_size()) {
                    self.check_abort()?;
                    let infos = self.table_batch(name, batch).await;
                    self.metrics.tables_discovered += infos.len();
                    schema.tables.extend(infos);

                    let delay = self
                        .profile
                        .batch_delay(self.monitor.resource_level().is_strained());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            Err(err) => {
                warn!(target: "discovery", schema = name, error = %err, "Could not list tables");
                schema.error = Some(err.to_string());
            }
        }

        self.check_abort()?;
        let (views, error) = self.views(name).await;
        self.metrics.views_discovered += views.len();
        schema.views = views;
        if schema.error.is_none() {
            schema.error = error;
        }
        Ok(schema)
    }

    /// Metadata for one batch in exactly two statements. An exhausted batch
    /// yields its tables with empty columns and the captured error.
    async fn table_batch(&mut self, schema: &str, batch: &[String]) -> Vec<TableInfo> {
        let backend = self.backend;
        self.metrics.batches_processed += 1;

        let (stats, mut attempts) = self
            .retry("table_stats", || backend.table_stats(schema, batch))
            .await;
        let outcome = match stats {
            Ok(stats) => {
                let (columns, column_attempts) = self
                    .retry("table_columns", || backend.table_columns(schema, batch))
                    .await;
                attempts = attempts.max(column_attempts);
                columns.map(|columns| (stats, columns))
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok((stats, columns)) => {
                debug!(target: "discovery", schema, batch = ?batch, "Table batch discovered");
                assemble(schema, batch, &stats, columns)
            }
            Err(err) => {
                self.metrics.failed_batches += 1;
                let err = SluiceError::new(
                    ErrorCode::BatchFailed,
                    format!("Table batch failed: {}", err.message),
                )
                .with_context(ErrorContext::TableBatch {
                    source_id: self.source_id.to_string(),
                    schema: schema.to_string(),
                    tables: batch.to_vec(),
                    attempts,
                });
                warn!(target: "discovery", schema, batch = ?batch, attempts, error = %err, "Table batch failed");
                let message = err.to_string();
                batch
                    .iter()
                    .map(|t| TableInfo::failed(schema, t, message.clone()))
                    .collect()
            }
        }
    }

    async fn views(&mut self, schema: &str) -> (Vec<ViewInfo>, Option<String>) {
        let backend = self.backend;
        let (names, _) = self.retry("list_views", || backend.list_views(schema)).await;
        let names = match names {
            Ok(names) => names,
            Err(err) => {
                warn!(target: "discovery", schema, error = %err, "Could not list views");
                return (Vec::new(), Some(err.to_string()));
            }
        };

        let mut views = Vec::with_capacity(names.len());
        for name in names {
            let (columns, _) = self
                .retry("view_columns", || backend.view_columns(schema, &name))
                .await;
            let view = match columns {
                Ok(columns) => ViewInfo {
                    schema: schema.to_string(),
                    name,
                    columns: columns.into_iter().map(ColumnInfo::from).collect(),
                    error: None,
                },
                Err(err) => {
                    let err = SluiceError::new(
                        ErrorCode::ViewIntrospectionFailed,
                        format!("View {}.{}: {}", schema, name, err.message),
                    );
                    warn!(target: "discovery", schema, view = %name, error = %err, "View introspection failed");
                    ViewInfo {
                        schema: schema.to_string(),
                        name,
                        columns: Vec::new(),
                        error: Some(err.to_string()),
                    }
                }
            };
            views.push(view);
        }
        (views, None)
    }
}

fn assemble(
    schema: &str,
    batch: &[String],
    stats: &[TableStats],
    columns: Vec<ColumnRow>,
) -> Vec<TableInfo> {
    let stats: HashMap<&str, &TableStats> = stats.iter().map(|s| (s.table.as_str(), s)).collect();
    let mut grouped: HashMap<String, Vec<ColumnInfo>> = HashMap::new();
    for row in columns {
        grouped.entry(row.table.clone()).or_default().push(row.into());
    }

    batch
        .iter()
        .map(|table| {
            TableInfo::assemble(
                schema,
                table,
                stats.get(table.as_str()).copied(),
                grouped.remove(table).unwrap_or_default(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SchemaListing;
    use crate::discovery::Strategy;
    use crate::executor::{QueryParams, ResultSet};
    use async_trait::async_trait;
    use sluice_common::config::{DiscoverySettings, MonitorSettings, StrategySettings};
    use sluice_common::Dialect;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;

    /// In-memory catalog whose metadata statements fail for chosen tables.
    struct FakeCatalog {
        tables: Vec<String>,
        failing: HashSet<String>,
        broken_views: HashSet<String>,
        unreachable: bool,
        calls: AtomicU64,
    }

    impl FakeCatalog {
        fn new(tables: &[&str]) -> Self {
            Self {
                tables: tables.iter().map(|t| t.to_string()).collect(),
                failing: HashSet::new(),
                broken_views: HashSet::new(),
                unreachable: false,
                calls: AtomicU64::new(0),
            }
        }

        fn tick(&self) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }

        fn transient() -> SluiceError {
            SluiceError::new(ErrorCode::ConnectionFailed, "connection reset")
        }
    }

    #[async_trait]
    impl CatalogBackend for FakeCatalog {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn round_trips(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }

        async fn execute(&self, _query: &str, _params: &QueryParams) -> Result<ResultSet> {
            self.tick();
            Ok(ResultSet::affected(0))
        }

        async fn test_connection(&self) -> Result<()> {
            self.tick();
            if self.unreachable {
                return Err(Self::transient());
            }
            Ok(())
        }

        async fn close(&self) {}

        async fn list_schemas(&self) -> Result<SchemaListing> {
            self.tick();
            Ok(SchemaListing {
                database: "warehouse".into(),
                schemas: vec!["public".into()],
            })
        }

        async fn list_tables(&self, _schema: &str) -> Result<Vec<String>> {
            self.tick();
            Ok(self.tables.clone())
        }

        async fn table_stats(&self, _schema: &str, tables: &[String]) -> Result<Vec<TableStats>> {
            self.tick();
            if tables.iter().any(|t| self.failing.contains(t)) {
                return Err(Self::transient());
            }
            Ok(tables
                .iter()
                .map(|t| TableStats {
                    table: t.clone(),
                    row_count: Some(10),
                    size_bytes: Some(8192),
                    comment: None,
                })
                .collect())
        }

        async fn table_columns(&self, _schema: &str, tables: &[String]) -> Result<Vec<ColumnRow>> {
            self.tick();
            Ok(tables
                .iter()
                .map(|t| ColumnRow {
                    table: t.clone(),
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                    default: None,
                    ordinal_position: 1,
                    is_primary_key: true,
                    comment: None,
                })
                .collect())
        }

        async fn list_views(&self, _schema: &str) -> Result<Vec<String>> {
            self.tick();
            Ok(vec!["active".into(), "stale".into()])
        }

        async fn view_columns(&self, _schema: &str, view: &str) -> Result<Vec<ColumnRow>> {
            self.tick();
            if self.broken_views.contains(view) {
                return Err(SluiceError::new(ErrorCode::QueryFailed, "relation does not exist"));
            }
            Ok(Vec::new())
        }
    }

    fn profile(batch_size: usize) -> StrategyProfile {
        StrategyProfile {
            strategy: Strategy::Balanced,
            settings: StrategySettings {
                batch_size,
                batch_delay_ms: 0,
                max_retries: 2,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                ..StrategySettings::balanced()
            },
        }
    }

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(MonitorSettings::default())
    }

    async fn run(
        catalog: &FakeCatalog,
        batch_size: usize,
    ) -> Result<(Vec<DatabaseInfo>, DiscoveryMetrics)> {
        discover_with(
            "fake",
            catalog,
            &monitor(),
            profile(batch_size),
            &AbortHandle::new(),
            DiscoveryMetrics::new(Strategy::Balanced),
        )
        .await
    }

    #[tokio::test]
    async fn test_round_trips_scale_with_batch_count() {
        for (batch_size, batches) in [(1, 3), (2, 2), (3, 1)] {
            let catalog = FakeCatalog::new(&["a", "b", "c"]);
            let (databases, metrics) = run(&catalog, batch_size).await.unwrap();
            // connect + schemas + tables + views + 2 view columns, plus
            // stats and columns for every batch
            assert_eq!(metrics.queries_executed, 6 + 2 * batches, "batch size {}", batch_size);
            assert_eq!(metrics.batches_processed, batches as usize);
            assert_eq!(databases[0].schemas[0].tables.len(), 3);
        }
    }

    async fn timed_run(monitor: &ResourceMonitor) -> std::time::Duration {
        let catalog = FakeCatalog::new(&["a", "b", "c"]);
        let mut paced = profile(1);
        paced.settings.batch_delay_ms = 100;
        let started = Instant::now();
        discover_with(
            "fake",
            &catalog,
            monitor,
            paced,
            &AbortHandle::new(),
            DiscoveryMetrics::new(Strategy::Balanced),
        )
        .await
        .unwrap();
        started.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_delay_doubles_under_strain() {
        let delay = std::time::Duration::from_millis(100);

        let calm = timed_run(&monitor()).await;
        assert!(calm >= delay * 3 && calm < delay * 4, "{:?}", calm);

        let strained = monitor();
        for _ in 0..=MonitorSettings::default().critical_error_count {
            strained.record_error("connection");
        }
        assert!(strained.resource_level().is_strained());
        let slow = timed_run(&strained).await;
        assert!(slow >= delay * 6 && slow < delay * 7, "{:?}", slow);
    }

    #[tokio::test]
    async fn test_profile_chosen_after_waiting_for_running_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE a (id INTEGER); CREATE TABLE b (id INTEGER);")
            .unwrap();

        let mut settings = DiscoverySettings::default();
        for strategy in [
            &mut settings.conservative,
            &mut settings.balanced,
            &mut settings.aggressive,
        ] {
            strategy.batch_delay_ms = 0;
        }
        let monitor = Arc::new(monitor());
        let engine = Arc::new(DiscoveryEngine::new(
            vec![SourceConfig::new("shop", Dialect::Sqlite, path.display().to_string())],
            settings,
            Arc::clone(&monitor),
            Arc::new(DiscoveryCache::new(4, std::time::Duration::from_secs(60))),
        ));

        let guard = engine.guard("shop");
        let held = guard.lock().await;
        let waiting = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.discover_schemas("shop").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        for _ in 0..=MonitorSettings::default().critical_error_count {
            monitor.record_error("connection");
        }
        drop(held);

        let result = waiting.await.unwrap().unwrap();
        assert_eq!(result.metrics.strategy, Strategy::Conservative);
    }

    #[tokio::test]
    async fn test_two_round_trips_per_batch() {
        let catalog = FakeCatalog::new(&["a", "b", "c"]);
        let (databases, metrics) = run(&catalog, 3).await.unwrap();

        // connect + schemas + tables + (stats + columns) + views + 2 view columns
        assert_eq!(metrics.queries_executed, 8);
        assert_eq!(metrics.batches_processed, 1);
        assert_eq!(metrics.tables_discovered, 3);
        assert_eq!(metrics.views_discovered, 2);

        let table = &databases[0].schemas[0].tables[1];
        assert_eq!(table.name, "b");
        assert_eq!(table.row_count, Some(10));
        assert_eq!(table.columns.len(), 1);
        assert!(table.columns[0].is_primary_key);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_others() {
        let mut catalog = FakeCatalog::new(&["a", "b", "c"]);
        catalog.failing.insert("b".into());
        let (databases, metrics) = run(&catalog, 1).await.unwrap();

        let tables = &databases[0].schemas[0].tables;
        assert_eq!(tables.len(), 3);
        assert!(tables[0].error.is_none());
        assert!(tables[1].columns.is_empty());
        assert!(tables[1].error.as_deref().unwrap().contains("SLUICE-6002"));
        assert_eq!(tables[2].columns.len(), 1);

        assert_eq!(metrics.failed_batches, 1);
        assert_eq!(metrics.batches_processed, 3);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.connection_errors, 3);
    }

    #[tokio::test]
    async fn test_broken_view_is_recorded() {
        let mut catalog = FakeCatalog::new(&["a"]);
        catalog.broken_views.insert("stale".into());
        let (databases, _) = run(&catalog, 2).await.unwrap();

        let views = &databases[0].schemas[0].views;
        assert!(views[0].error.is_none());
        assert!(views[1].error.as_deref().unwrap().contains("SLUICE-6003"));
    }

    #[tokio::test]
    async fn test_unreachable_database_is_fatal() {
        let mut catalog = FakeCatalog::new(&["a"]);
        catalog.unreachable = true;
        let err = run(&catalog, 1).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        match err.context {
            Some(ErrorContext::Connection { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected context: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_before_first_batch() {
        let catalog = FakeCatalog::new(&["a", "b"]);
        let abort = AbortHandle::new();
        abort.abort();
        let err = discover_with(
            "fake",
            &catalog,
            &monitor(),
            profile(1),
            &abort,
            DiscoveryMetrics::new(Strategy::Balanced),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::DiscoveryAborted);
    }
}
