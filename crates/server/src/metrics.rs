use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use sluice_engine::SchedulerStatus;
use std::time::Duration;

pub const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Prometheus view of the scheduler and discovery engine.
///
/// Counters track monotonic totals from [`SchedulerStatus`] snapshots, so
/// observing the same snapshot twice is a no-op.
pub struct ServerMetrics {
    registry: Registry,
    queued: IntGauge,
    active_queries: IntGauge,
    active_batches: IntGauge,
    executed: IntCounter,
    failed: IntCounter,
    deduplicated: IntCounter,
    discovery_runs: IntCounter,
    discovery_failures: IntCounter,
}

impl ServerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            queued: gauge(&registry, "sluice_queued_queries", "Requests waiting in the priority queues")?,
            active_queries: gauge(&registry, "sluice_active_queries", "Queries currently executing")?,
            active_batches: gauge(&registry, "sluice_active_batches", "Batches currently executing")?,
            executed: counter(&registry, "sluice_queries_executed_total", "Executions run against a database")?,
            failed: counter(&registry, "sluice_queries_failed_total", "Executions that failed or panicked")?,
            deduplicated: counter(
                &registry,
                "sluice_queries_deduplicated_total",
                "Submissions coalesced onto an in-flight execution",
            )?,
            discovery_runs: counter(&registry, "sluice_discovery_runs_total", "Schema discovery requests")?,
            discovery_failures: counter(
                &registry,
                "sluice_discovery_failures_total",
                "Schema discovery requests that returned an error",
            )?,
            registry,
        })
    }

    pub fn observe(&self, status: &SchedulerStatus) {
        self.queued.set(status.queued_total as i64);
        self.active_queries.set(status.active_queries as i64);
        self.active_batches.set(status.active_batches as i64);
        advance(&self.executed, status.throughput.executed);
        advance(&self.failed, status.throughput.failed);
        advance(&self.deduplicated, status.throughput.deduplicated);
    }

    pub fn record_discovery(&self, succeeded: bool) {
        self.discovery_runs.inc();
        if !succeeded {
            self.discovery_failures.inc();
        }
    }

    /// Text exposition format plus its content type.
    pub fn encode(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn advance(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}
