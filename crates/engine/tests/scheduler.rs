use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sluice_common::config::{MonitorSettings, SchedulerSettings};
use sluice_engine::scheduler::{CompletionCallback, StaticUsageSampler};
use sluice_engine::{
    Priority, QueryExecutor, QueryParams, QueryResult, QueryScheduler, ResourceMonitor, ResultSet,
};
use sluice_error::{ErrorCode, Result, SluiceError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executor that records the order queries start in and how often each ran.
struct Recorder {
    delay: Duration,
    started: Mutex<Vec<String>>,
    runs: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Recorder {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: Mutex::new(Vec::new()),
            runs: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    fn executions(&self) -> usize {
        self.runs.lock().values().sum()
    }

    /// Most executions observed running at the same moment.
    fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl QueryExecutor for Recorder {
    async fn execute_query(
        &self,
        query: &str,
        params: &QueryParams,
        _priority: Priority,
    ) -> Result<ResultSet> {
        self.started.lock().push(query.to_string());
        *self.runs.lock().entry(query.to_string()).or_insert(0) += 1;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if query.contains("fail") {
            return Err(SluiceError::new(ErrorCode::QueryFailed, "relation is locked"));
        }
        if query.contains("panic") {
            panic!("driver state corrupted");
        }
        Ok(ResultSet {
            columns: vec!["query".into(), "params".into()],
            rows: vec![vec![json!(query), json!(params)]],
            rows_affected: 0,
        })
    }
}

fn settings(max_concurrent_queries: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_queries,
        batch_window_ms: 5,
        ..Default::default()
    }
}

fn scheduler_with(
    settings: SchedulerSettings,
    executor: Arc<Recorder>,
    sampler: Arc<StaticUsageSampler>,
) -> QueryScheduler {
    QueryScheduler::with_sampler(
        settings,
        executor,
        Arc::new(ResourceMonitor::new(MonitorSettings::default())),
        sampler,
    )
}

fn idle_host() -> Arc<StaticUsageSampler> {
    Arc::new(StaticUsageSampler::new(0.1, 0.2))
}

#[tokio::test]
async fn identical_submissions_execute_once() -> anyhow::Result<()> {
    let recorder = Recorder::new(Duration::from_millis(30));
    let scheduler = scheduler_with(settings(5), Arc::clone(&recorder), idle_host());
    scheduler.start();

    let mut params = QueryParams::new();
    params.insert("region".into(), json!("emea"));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            scheduler.schedule(
                "SELECT * FROM orders WHERE region = :region",
                params.clone(),
                Priority::Normal,
                None,
            )
        })
        .collect();
    assert!(!handles[0].is_deduplicated());
    assert!(handles[1..].iter().all(|h| h.is_deduplicated()));

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await?);
    }
    assert_eq!(recorder.executions(), 1);
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));

    let status = scheduler.status();
    assert_eq!(status.throughput.deduplicated, 19);
    assert_eq!(status.dedup_entries, 0);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn different_parameters_are_not_coalesced() -> anyhow::Result<()> {
    let recorder = Recorder::new(Duration::from_millis(5));
    let scheduler = scheduler_with(settings(5), Arc::clone(&recorder), idle_host());
    scheduler.start();

    let mut first = QueryParams::new();
    first.insert("id".into(), json!(1));
    let mut second = QueryParams::new();
    second.insert("id".into(), json!(2));

    let a = scheduler.schedule("SELECT * FROM t WHERE id = :id", first, Priority::Low, None);
    let b = scheduler.schedule("SELECT * FROM t WHERE id = :id", second, Priority::Low, None);
    assert!(!b.is_deduplicated());
    a.await?;
    b.await?;
    assert_eq!(recorder.executions(), 2);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn dollar_quoted_literals_are_not_coalesced() -> anyhow::Result<()> {
    let recorder = Recorder::new(Duration::from_millis(20));
    let scheduler = scheduler_with(settings(5), Arc::clone(&recorder), idle_host());
    scheduler.start();

    let upper = scheduler.schedule("SELECT $$Alpha$$", QueryParams::new(), Priority::Normal, None);
    let lower = scheduler.schedule("SELECT $$alpha$$", QueryParams::new(), Priority::Normal, None);
    assert!(!lower.is_deduplicated());

    let upper = upper.await?;
    let lower = lower.await?;
    assert_eq!(upper.value(0, "query"), Some(&json!("SELECT $$Alpha$$")));
    assert_eq!(lower.value(0, "query"), Some(&json!("SELECT $$alpha$$")));
    assert_eq!(recorder.executions(), 2);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn higher_priority_starts_first() -> anyhow::Result<()> {
    let recorder = Recorder::new(Duration::from_millis(10));
    let scheduler = scheduler_with(settings(1), Arc::clone(&recorder), idle_host());

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(scheduler.schedule(
            format!("SELECT {} AS low", i),
            QueryParams::new(),
            Priority::Low,
            None,
        ));
    }
    for i in 0..3 {
        handles.push(scheduler.schedule(
            format!("SELECT {} AS high", i),
            QueryParams::new(),
            Priority::High,
            None,
        ));
    }

    scheduler.start();
    for handle in handles {
        handle.await?;
    }

    let started = recorder.started();
    assert_eq!(started.len(), 6);
    assert!(started[..3].iter().all(|q| q.ends_with("high")));
    assert!(started[3..].iter().all(|q| q.ends_with("low")));
    assert_eq!(scheduler.status().throughput.batches, 2);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn saturated_pool_requeues_at_front() -> anyhow::Result<()> {
    let recorder = Recorder::new(Duration::from_millis(30));
    let scheduler = scheduler_with(settings(2), Arc::clone(&recorder), idle_host());

    // DDL is never batched, so each statement needs its own worker.
    let mut handles: Vec<_> = (1..=5)
        .map(|i| {
            scheduler.schedule(
                format!("CREATE TABLE t{} (id int)", i),
                QueryParams::new(),
                Priority::Normal,
                None,
            )
        })
        .collect();
    scheduler.start();

    tokio::time::sleep(Duration::from_millis(15)).await;
    handles.push(scheduler.schedule(
        "CREATE TABLE t6 (id int)",
        QueryParams::new(),
        Priority::Normal,
        None,
    ));

    for handle in handles {
        handle.await?;
    }

    let expected: Vec<String> = (1..=6).map(|i| format!("CREATE TABLE t{} (id int)", i)).collect();
    assert_eq!(recorder.started(), expected);
    assert!(scheduler.status().throughput.requeued > 0);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn fifty_requests_ten_executions() -> anyhow::Result<()> {
    let delay = Duration::from_millis(50);
    let recorder = Recorder::new(delay);
    let scheduler = scheduler_with(settings(5), Arc::clone(&recorder), idle_host());
    scheduler.start();

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        for bucket in 0..10 {
            handles.push((
                bucket,
                scheduler.schedule(
                    format!("SELECT * FROM items WHERE bucket = {}", bucket),
                    QueryParams::new(),
                    Priority::Normal,
                    None,
                ),
            ));
        }
    }

    let mut resolved = 0;
    for (bucket, handle) in handles {
        let rows = handle.await?;
        assert_eq!(
            rows.value(0, "query"),
            Some(&json!(format!("SELECT * FROM items WHERE bucket = {}", bucket)))
        );
        resolved += 1;
    }

    assert_eq!(resolved, 50);
    assert_eq!(recorder.executions(), 10);
    // Serialized time is 10 x 50ms. Five workers must cut that to within a
    // small multiple of a fifth of it.
    let elapsed = started.elapsed();
    assert!(elapsed < delay * 10 / 5 * 4, "took {:?}", elapsed);
    assert!(recorder.peak_in_flight() >= 2);
    assert!(recorder.peak_in_flight() <= 5);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn failures_and_panics_reach_the_caller() {
    let recorder = Recorder::new(Duration::from_millis(1));
    let scheduler = scheduler_with(settings(4), Arc::clone(&recorder), idle_host());
    scheduler.start();

    let ok = scheduler.schedule("SELECT 'ok'", QueryParams::new(), Priority::Normal, None);
    let failed = scheduler.schedule("SELECT 'fail'", QueryParams::new(), Priority::Normal, None);
    let panicked = scheduler.schedule("SELECT 'panic'", QueryParams::new(), Priority::Normal, None);

    assert!(ok.await.is_ok());
    assert_eq!(failed.await.unwrap_err().code, ErrorCode::QueryFailed);
    let err = panicked.await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InternalPanic);
    assert!(err.message.contains("driver state corrupted"));

    // The scheduler keeps serving after a panic.
    let after = scheduler.schedule("SELECT 'after'", QueryParams::new(), Priority::Normal, None);
    assert!(after.await.is_ok());
    assert_eq!(scheduler.status().throughput.failed, 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn callbacks_and_events_fire_for_every_caller() -> anyhow::Result<()> {
    let recorder = Recorder::new(Duration::from_millis(20));
    let scheduler = scheduler_with(settings(2), Arc::clone(&recorder), idle_host());
    let mut events = scheduler.subscribe();
    scheduler.start();

    let calls = Arc::new(AtomicUsize::new(0));
    let callback = |calls: &Arc<AtomicUsize>| -> Option<CompletionCallback> {
        let calls = Arc::clone(calls);
        Some(Box::new(move |result: &QueryResult| {
            assert!(result.is_ok());
            calls.fetch_add(1, Ordering::SeqCst);
        }))
    };

    let handles: Vec<_> = (0..3)
        .map(|_| {
            scheduler.schedule(
                "UPDATE counters SET n = n + 1",
                QueryParams::new(),
                Priority::Critical,
                callback(&calls),
            )
        })
        .collect();
    for handle in handles {
        handle.await?;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let event = events.recv().await?;
    assert!(event.success);
    assert_eq!(event.priority, Priority::Critical);
    assert_eq!(event.delivered_to, 3);
    assert!(!event.batched);
    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_fails_queued_requests() {
    let recorder = Recorder::new(Duration::from_millis(1));
    let host = Arc::new(StaticUsageSampler::new(0.99, 0.2));
    let scheduler = scheduler_with(settings(2), Arc::clone(&recorder), host);
    scheduler.start();

    let first = scheduler.schedule("SELECT 1", QueryParams::new(), Priority::Normal, None);
    let second = scheduler.schedule("SELECT 1", QueryParams::new(), Priority::Normal, None);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(scheduler.status().queued_total, 1);

    scheduler.stop().await;
    assert_eq!(first.await.unwrap_err().code, ErrorCode::SchedulerStopped);
    assert_eq!(second.await.unwrap_err().code, ErrorCode::SchedulerStopped);
    assert_eq!(recorder.executions(), 0);
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn waiting_can_time_out_without_cancelling() {
    let recorder = Recorder::new(Duration::from_millis(100));
    let scheduler = scheduler_with(settings(2), Arc::clone(&recorder), idle_host());
    scheduler.start();

    let slow = scheduler.schedule("SELECT pg_sleep(1)", QueryParams::new(), Priority::Normal, None);
    let err = slow
        .wait_timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::QueryTimeout);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.executions(), 1);
    scheduler.stop().await;
}
