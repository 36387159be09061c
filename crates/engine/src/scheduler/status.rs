use serde::Serialize;
use sluice_common::config::SchedulerSettings;
use uuid::Uuid;

use super::request::{Priority, QueryId, QueryKind};
use crate::monitor::ResourceLevel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub(crate) fn set(&mut self, priority: Priority, depth: usize) {
        match priority {
            Priority::Critical => self.critical = depth,
            Priority::High => self.high = depth,
            Priority::Normal => self.normal = depth,
            Priority::Low => self.low = depth,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    /// Busy workers over the configured maximum.
    pub connection_utilization: f64,
    pub level: ResourceLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub submitted: u64,
    pub deduplicated: u64,
    pub executed: u64,
    pub failed: u64,
    pub batches: u64,
    pub requeued: u64,
    pub queries_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub queue_depths: QueueDepths,
    pub queued_total: usize,
    pub active_queries: usize,
    pub active_batches: usize,
    pub dedup_entries: usize,
    /// Callers chained onto a pending identical query.
    pub dedup_waiting: usize,
    pub resource_usage: ResourceUsage,
    pub throughput: Throughput,
    pub configuration: SchedulerSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveQueryInfo {
    pub query_id: QueryId,
    pub priority: Priority,
    pub kind: QueryKind,
    pub running_ms: u64,
    pub batch_id: Option<Uuid>,
}

/// Broadcast to subscribers after each execution resolves its callers.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub query_id: QueryId,
    pub query_hash: String,
    pub priority: Priority,
    pub kind: QueryKind,
    pub success: bool,
    pub duration_ms: u64,
    pub batched: bool,
    /// Callers served by this execution, including deduplicated followers.
    pub delivered_to: usize,
}
