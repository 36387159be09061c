use sluice_common::config::AppConfig;
use sluice_error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::discovery::{DiscoveryCache, DiscoveryEngine, DiscoveryResult};
use crate::executor::{QueryExecutor, QueryParams};
use crate::monitor::ResourceMonitor;
use crate::scheduler::{
    CompletionCallback, PendingResult, Priority, QueryScheduler, SchedulerStatus, UsageSampler,
};

/// Composition root of the engine.
///
/// Owns one resource monitor shared by the scheduler and the discovery
/// engine, plus the metadata cache discovery results live in.
pub struct Orchestrator {
    monitor: Arc<ResourceMonitor>,
    cache: Arc<DiscoveryCache>,
    scheduler: QueryScheduler,
    discovery: DiscoveryEngine,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        let scheduler =
            QueryScheduler::new(config.scheduler.clone(), executor, Arc::clone(&monitor));
        Self::assemble(config, monitor, scheduler)
    }

    /// Like [`Orchestrator::new`] with an injected host usage source.
    pub fn with_sampler(
        config: &AppConfig,
        executor: Arc<dyn QueryExecutor>,
        sampler: Arc<dyn UsageSampler>,
    ) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        let scheduler = QueryScheduler::with_sampler(
            config.scheduler.clone(),
            executor,
            Arc::clone(&monitor),
            sampler,
        );
        Self::assemble(config, monitor, scheduler)
    }

    fn assemble(
        config: &AppConfig,
        monitor: Arc<ResourceMonitor>,
        scheduler: QueryScheduler,
    ) -> Self {
        let cache = Arc::new(DiscoveryCache::new(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        let discovery = DiscoveryEngine::new(
            config.sources.clone(),
            config.discovery.clone(),
            Arc::clone(&monitor),
            Arc::clone(&cache),
        );
        Self {
            monitor,
            cache,
            scheduler,
            discovery,
        }
    }

    pub fn start(&self) {
        self.scheduler.start();
        info!(sources = ?self.discovery.source_ids(), "Orchestrator started");
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        info!("Orchestrator stopped");
    }

    pub fn schedule(
        &self,
        query: impl Into<String>,
        params: QueryParams,
        priority: Priority,
        callback: Option<CompletionCallback>,
    ) -> PendingResult {
        self.scheduler.schedule(query, params, priority, callback)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub async fn discover_schemas(&self, source_id: &str) -> Result<DiscoveryResult> {
        self.discovery.discover_schemas(source_id).await
    }

    pub fn scheduler(&self) -> &QueryScheduler {
        &self.scheduler
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }
}
