//! Priority query scheduler.
//!
//! Callers submit queries through [`QueryScheduler::schedule`] and get a
//! [`PendingResult`] back immediately. Behind that handle:
//!
//! 1. **Classification**: kind, cost, batch eligibility and fingerprints.
//! 2. **Deduplication**: a query identical to one still pending is chained
//!    onto it and never reaches a queue.
//! 3. **Queueing**: one FIFO queue per priority.
//! 4. **Dispatch**: every batch window a single loop visits the priorities
//!    highest first, checks admission and hands work to a bounded worker
//!    pool, grouping batch-eligible requests into one unit of work.
//! 5. **Completion**: workers run each member query, fan the result out to
//!    every waiting caller, then clear the deduplication entry.
//!
//! Queues, the deduplication table and the active set each sit behind their
//! own lock. The dispatch loop never awaits database work.

mod batch;
mod dedup;
mod pending;
mod request;
mod status;
mod usage;

pub use pending::{CompletionCallback, PendingResult, QueryResult};
pub use request::{
    normalize_sql, Classification, Priority, QueryId, QueryKind, QueryRequest, ResourceCost,
};
pub use status::{
    ActiveQueryInfo, CompletionEvent, QueueDepths, ResourceUsage, SchedulerStatus, Throughput,
};
pub use usage::{HostUsage, StaticUsageSampler, SysinfoSampler, UsageSampler};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use sluice_common::config::SchedulerSettings;
use sluice_common::scrubber::{scrub_sql, truncate_for_log};
use sluice_error::{ErrorCode, ErrorContext, SluiceError};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::IntelligentCache;
use crate::executor::{QueryExecutor, QueryParams};
use crate::monitor::ResourceMonitor;
use batch::QueryBatch;
use dedup::{DedupTable, Registration};
use pending::Completion;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Execution history for one query hash.
#[derive(Debug, Clone, Copy, Default)]
struct QueryStats {
    executions: u32,
    total: Duration,
}

impl QueryStats {
    fn mean(&self) -> Duration {
        self.total / self.executions.max(1)
    }
}

#[derive(Debug, Clone)]
struct ActiveQuery {
    priority: Priority,
    kind: QueryKind,
    started_at: Instant,
    batch: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    requeued: AtomicU64,
}

struct Shared {
    settings: SchedulerSettings,
    executor: Arc<dyn QueryExecutor>,
    monitor: Arc<ResourceMonitor>,
    sampler: Arc<dyn UsageSampler>,
    queues: [Mutex<VecDeque<QueryRequest>>; 4],
    dedup: Mutex<DedupTable>,
    active: Mutex<HashMap<QueryId, ActiveQuery>>,
    active_batches: AtomicUsize,
    workers: Arc<Semaphore>,
    stats: IntelligentCache<QueryStats>,
    counters: Counters,
    events: broadcast::Sender<CompletionEvent>,
    host_usage: RwLock<HostUsage>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

/// Handle to the background dispatch loop.
#[derive(Debug)]
struct DispatcherHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            warn!(target: "scheduler", "Scheduler dropped without calling stop(). Aborting dispatch loop.");
            task.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl DispatcherHandle {
    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!(target: "scheduler", "Dispatch loop already exited");
            }
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(target: "scheduler", error = %e, "Dispatch loop failed during shutdown");
            }
        }
    }
}

pub struct QueryScheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl QueryScheduler {
    /// Scheduler sampling host usage with `sysinfo`.
    pub fn new(
        settings: SchedulerSettings,
        executor: Arc<dyn QueryExecutor>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        let sampler = Arc::new(SysinfoSampler::new(Duration::from_millis(
            settings.host_sample_interval_ms,
        )));
        Self::with_sampler(settings, executor, monitor, sampler)
    }

    pub fn with_sampler(
        settings: SchedulerSettings,
        executor: Arc<dyn QueryExecutor>,
        monitor: Arc<ResourceMonitor>,
        sampler: Arc<dyn UsageSampler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let workers = Arc::new(Semaphore::new(settings.max_concurrent_queries.max(1)));
        let stats = IntelligentCache::new(
            settings.stats_capacity,
            Duration::from_secs(settings.stats_ttl_secs),
        );

        Self {
            shared: Arc::new(Shared {
                settings,
                executor,
                monitor,
                sampler,
                queues: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
                dedup: Mutex::new(DedupTable::default()),
                active: Mutex::new(HashMap::new()),
                active_batches: AtomicUsize::new(0),
                workers,
                stats,
                counters: Counters::default(),
                events,
                host_usage: RwLock::new(HostUsage::default()),
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Submit a query. Never blocks and never fails; the outcome, including
    /// any error, arrives on the returned handle.
    pub fn schedule(
        &self,
        query: impl Into<String>,
        params: QueryParams,
        priority: Priority,
        callback: Option<CompletionCallback>,
    ) -> PendingResult {
        let shared = &self.shared;
        let query = query.into();
        let classification = Classification::of(&query, &params);
        let estimate = shared.estimate(&classification);
        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let mut dedup = shared.dedup.lock();
        let deduplicated = dedup.contains(&classification.dedup_key);
        let (completion, pending) = Completion::channel(QueryId::new(), callback, deduplicated);

        match dedup.register(&classification.dedup_key, completion) {
            Registration::Follower => {
                shared.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(target: "scheduler", query_id = %pending.id(), %priority, "Coalesced with pending query");
            }
            Registration::Authoritative(completion) => {
                let request = QueryRequest::new(
                    query,
                    params,
                    priority,
                    classification,
                    estimate,
                    completion,
                );
                debug!(
                    target: "scheduler",
                    query_id = %request.id,
                    %priority,
                    kind = ?request.kind,
                    batch_eligible = request.batch_eligible,
                    "Queued query"
                );
                // Pushed while the dedup lock is held so followers can never
                // observe an entry whose request is missing from the queues.
                shared.queue(priority).lock().push_back(request);
            }
        }
        pending
    }

    /// Start the dispatch loop. Requires a Tokio runtime; a second call is a no-op.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            debug!(target: "scheduler", "Scheduler already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::SeqCst);
        shared.started_at.lock().get_or_insert_with(Instant::now);

        let task = tokio::spawn(
            dispatch_loop(Arc::clone(&shared), shutdown_rx).instrument(info_span!("dispatcher")),
        );
        *dispatcher = Some(DispatcherHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        });

        info!(
            target: "scheduler",
            max_concurrent = shared.settings.max_concurrent_queries,
            batch_window_ms = shared.settings.batch_window_ms,
            "Query scheduler started"
        );
    }

    /// Stop dispatching and fail everything still queued with
    /// `SchedulerStopped`. Work already handed to a worker runs to completion.
    pub async fn stop(&self) {
        let handle = self.dispatcher.lock().take();
        let Some(handle) = handle else {
            return;
        };
        handle.shutdown().await;
        self.shared.running.store(false, Ordering::SeqCst);

        let failed = self.shared.fail_queued();
        info!(target: "scheduler", failed, "Query scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Completion events for every execution, including failures.
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.shared.events.subscribe()
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.shared.monitor
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    pub fn active_queries(&self) -> Vec<ActiveQueryInfo> {
        let active = self.shared.active.lock();
        let mut list: Vec<ActiveQueryInfo> = active
            .iter()
            .map(|(id, q)| ActiveQueryInfo {
                query_id: *id,
                priority: q.priority,
                kind: q.kind,
                running_ms: q.started_at.elapsed().as_millis() as u64,
                batch_id: q.batch,
            })
            .collect();
        list.sort_by(|a, b| b.running_ms.cmp(&a.running_ms));
        list
    }

    /// Point-in-time snapshot. Only takes short-lived locks and never
    /// samples the host, so it cannot stall dispatch.
    pub fn status(&self) -> SchedulerStatus {
        let shared = &self.shared;
        let mut queue_depths = QueueDepths::default();
        for priority in Priority::DESCENDING {
            queue_depths.set(priority, shared.queue(priority).lock().len());
        }
        let host = *shared.host_usage.read();
        let executed = shared.counters.executed.load(Ordering::Relaxed);
        let uptime = shared
            .started_at
            .lock()
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let (dedup_entries, dedup_waiting) = {
            let dedup = shared.dedup.lock();
            (dedup.len(), dedup.waiting())
        };

        SchedulerStatus {
            running: self.is_running(),
            queued_total: queue_depths.total(),
            queue_depths,
            active_queries: shared.active.lock().len(),
            active_batches: shared.active_batches.load(Ordering::Relaxed),
            dedup_entries,
            dedup_waiting,
            resource_usage: ResourceUsage {
                cpu: host.cpu,
                memory: host.memory,
                connection_utilization: shared.connection_utilization(),
                level: shared.monitor.resource_level(),
            },
            throughput: Throughput {
                submitted: shared.counters.submitted.load(Ordering::Relaxed),
                deduplicated: shared.counters.deduplicated.load(Ordering::Relaxed),
                executed,
                failed: shared.counters.failed.load(Ordering::Relaxed),
                batches: shared.counters.batches.load(Ordering::Relaxed),
                requeued: shared.counters.requeued.load(Ordering::Relaxed),
                queries_per_sec: if uptime > 0.0 {
                    executed as f64 / uptime
                } else {
                    0.0
                },
            },
            configuration: shared.settings.clone(),
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut shutdown_rx: oneshot::Receiver<()>) {
    let window = Duration::from_millis(shared.settings.batch_window_ms.max(1));
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!(target: "scheduler", "Shutdown signal received by dispatch loop");
                return;
            }
            _ = ticker.tick() => shared.dispatch_tick(),
        }
    }
}

impl Shared {
    fn queue(&self, priority: Priority) -> &Mutex<VecDeque<QueryRequest>> {
        &self.queues[priority.index()]
    }

    fn estimate(&self, classification: &Classification) -> Duration {
        self.stats
            .get(&classification.query_hash)
            .map(|s| s.mean())
            .unwrap_or_else(|| classification.default_estimate())
    }

    fn record_duration(&self, query_hash: &str, elapsed: Duration) {
        let mut stats = self.stats.get(query_hash).unwrap_or_default();
        stats.executions = stats.executions.saturating_add(1);
        stats.total += elapsed;
        self.stats.set(query_hash, stats);
    }

    fn connection_utilization(&self) -> f64 {
        let max = self.settings.max_concurrent_queries.max(1);
        let busy = max.saturating_sub(self.workers.available_permits());
        busy as f64 / max as f64
    }

    /// Spare CPU, memory and worker headroom, each strictly under its threshold.
    fn admits(&self) -> bool {
        let limits = &self.settings.admission;
        let host = *self.host_usage.read();
        host.cpu < limits.cpu
            && host.memory < limits.memory
            && self.connection_utilization() < limits.connections
    }

    fn dispatch_tick(self: &Arc<Self>) {
        *self.host_usage.write() = self.sampler.sample();

        for priority in Priority::DESCENDING {
            if self.queue(priority).lock().is_empty() {
                continue;
            }
            if !self.admits() {
                debug!(target: "scheduler", %priority, "Admission deferred");
                continue;
            }

            let pulled: Vec<QueryRequest> = {
                let mut queue = self.queue(priority).lock();
                let n = queue.len().min(self.settings.dispatch_pull_limit.max(1));
                queue.drain(..n).collect()
            };
            self.dispatch(priority, pulled);
        }
    }

    fn dispatch(self: &Arc<Self>, priority: Priority, pulled: Vec<QueryRequest>) {
        let mut slots: Vec<Option<QueryRequest>> = pulled.into_iter().map(Some).collect();

        let candidates: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|r| r.batch_eligible))
            .map(|(i, _)| i)
            .take(self.settings.max_batch_size)
            .collect();

        if candidates.len() >= 2 {
            if let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() {
                let members: Vec<QueryRequest> =
                    candidates.iter().filter_map(|&i| slots[i].take()).collect();
                self.spawn_batch(priority, members, permit);
            }
        }

        // Remaining requests go one by one, in order. The first rejection
        // stops the walk so nothing behind it overtakes it.
        for slot in slots.iter_mut() {
            let Some(request) = slot.take() else {
                continue;
            };
            match Arc::clone(&self.workers).try_acquire_owned() {
                Ok(permit) => self.spawn_single(request, permit),
                Err(_) => {
                    *slot = Some(request);
                    break;
                }
            }
        }

        let leftover: Vec<QueryRequest> = slots.into_iter().flatten().collect();
        if !leftover.is_empty() {
            self.counters
                .requeued
                .fetch_add(leftover.len() as u64, Ordering::Relaxed);
            debug!(target: "scheduler", %priority, count = leftover.len(), "Worker pool saturated, requeued at front");
            let mut queue = self.queue(priority).lock();
            for request in leftover.into_iter().rev() {
                queue.push_front(request);
            }
        }
    }

    fn mark_active(&self, request: &QueryRequest, batch: Option<Uuid>) {
        self.active.lock().insert(
            request.id,
            ActiveQuery {
                priority: request.priority,
                kind: request.kind,
                started_at: Instant::now(),
                batch,
            },
        );
    }

    fn spawn_single(self: &Arc<Self>, request: QueryRequest, permit: OwnedSemaphorePermit) {
        self.mark_active(&request, None);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            shared.execute(request, None).await;
        });
    }

    fn spawn_batch(
        self: &Arc<Self>,
        priority: Priority,
        requests: Vec<QueryRequest>,
        permit: OwnedSemaphorePermit,
    ) {
        let batch = QueryBatch::new(priority, requests, self.settings.batching_efficiency);
        for request in &batch.requests {
            self.mark_active(request, Some(batch.id));
        }
        self.active_batches.fetch_add(1, Ordering::SeqCst);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "scheduler",
            batch = %batch.id,
            priority = %batch.priority,
            size = batch.len(),
            estimated_ms = batch.estimated_duration.as_millis() as u64,
            "Dispatching batch"
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let batch_id = batch.id;
            for request in batch.requests {
                shared.execute(request, Some(batch_id)).await;
            }
            shared.active_batches.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn execute(&self, request: QueryRequest, batch: Option<Uuid>) {
        let QueryRequest {
            id,
            query,
            params,
            priority,
            kind,
            dedup_key,
            query_hash,
            completion,
            ..
        } = request;

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.executor.execute_query(&query, &params, priority))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let result: QueryResult = match outcome {
            Ok(Ok(rows)) => Ok(Arc::new(rows)),
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(SluiceError::panicked("Query executor", panic.as_ref())
                .with_context(ErrorContext::Query {
                    query_id: id.to_string(),
                    priority: priority.to_string(),
                    batched: batch.is_some(),
                })),
        };

        self.monitor.record_query_time(elapsed);
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        self.record_duration(&query_hash, elapsed);
        if let Err(e) = &result {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.monitor.record_error(&e.code.to_string());
            warn!(
                target: "scheduler",
                query_id = %id,
                %priority,
                error = %e,
                query = %truncate_for_log(&scrub_sql(&query), 200),
                "Query failed"
            );
        }

        self.active.lock().remove(&id);
        let followers = self.dedup.lock().complete(&dedup_key);
        let delivered_to = followers.len() + 1;

        completion.resolve(&result);
        for follower in followers {
            follower.resolve(&result);
        }

        let _ = self.events.send(CompletionEvent {
            query_id: id,
            query_hash,
            priority,
            kind,
            success: result.is_ok(),
            duration_ms: elapsed.as_millis() as u64,
            batched: batch.is_some(),
            delivered_to,
        });
    }

    /// Resolve every queued request and its followers with `SchedulerStopped`.
    fn fail_queued(&self) -> usize {
        let mut failed = 0;
        for priority in Priority::DESCENDING {
            let drained: Vec<QueryRequest> = self.queue(priority).lock().drain(..).collect();
            for request in drained {
                let err: QueryResult = Err(SluiceError::new(
                    ErrorCode::SchedulerStopped,
                    "Scheduler stopped before the query was dispatched",
                )
                .with_context(ErrorContext::Query {
                    query_id: request.id.to_string(),
                    priority: priority.to_string(),
                    batched: false,
                }));
                let followers = self.dedup.lock().complete(&request.dedup_key);
                failed += 1 + followers.len();
                request.completion.resolve(&err);
                for follower in followers {
                    follower.resolve(&err);
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ResultSet;
    use async_trait::async_trait;
    use sluice_common::config::MonitorSettings;
    use sluice_error::Result;

    struct Echo;

    #[async_trait]
    impl QueryExecutor for Echo {
        async fn execute_query(
            &self,
            query: &str,
            _params: &QueryParams,
            _priority: Priority,
        ) -> Result<ResultSet> {
            Ok(ResultSet {
                columns: vec!["query".into()],
                rows: vec![vec![serde_json::Value::String(query.to_string())]],
                rows_affected: 0,
            })
        }
    }

    fn scheduler(sampler: Arc<StaticUsageSampler>) -> QueryScheduler {
        QueryScheduler::with_sampler(
            SchedulerSettings {
                batch_window_ms: 5,
                ..Default::default()
            },
            Arc::new(Echo),
            Arc::new(ResourceMonitor::new(MonitorSettings::default())),
            sampler,
        )
    }

    #[tokio::test]
    async fn test_schedule_while_stopped_queues_until_start() {
        let s = scheduler(Arc::new(StaticUsageSampler::new(0.1, 0.1)));
        let pending = s.schedule("SELECT 1", QueryParams::new(), Priority::Normal, None);
        assert_eq!(s.status().queue_depths.normal, 1);
        assert!(!s.is_running());

        s.start();
        let rows = pending.await.unwrap();
        assert_eq!(rows.value(0, "query"), Some(&serde_json::json!("SELECT 1")));
        s.stop().await;
    }

    #[tokio::test]
    async fn test_host_pressure_defers_admission() {
        let sampler = Arc::new(StaticUsageSampler::new(0.95, 0.1));
        let s = scheduler(Arc::clone(&sampler));
        s.start();
        let pending = s.schedule("SELECT 1", QueryParams::new(), Priority::High, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.status().queue_depths.high, 1);

        sampler.set(0.2, 0.1);
        assert!(pending.await.is_ok());
        s.stop().await;
    }

    #[tokio::test]
    async fn test_status_reports_configuration_and_counts() {
        let s = scheduler(Arc::new(StaticUsageSampler::new(0.1, 0.1)));
        s.start();
        let a = s.schedule("SELECT 1", QueryParams::new(), Priority::Low, None);
        let b = s.schedule("select   1", QueryParams::new(), Priority::Low, None);
        assert!(b.is_deduplicated());
        a.await.unwrap();
        b.await.unwrap();

        let status = s.status();
        assert!(status.running);
        assert_eq!(status.throughput.submitted, 2);
        assert_eq!(status.throughput.deduplicated, 1);
        assert_eq!(status.throughput.executed, 1);
        assert_eq!(status.dedup_entries, 0);
        assert_eq!(status.configuration.max_concurrent_queries, 10);
        serde_json::to_string(&status).unwrap();
        s.stop().await;
    }
}
