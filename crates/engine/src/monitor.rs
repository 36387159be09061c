use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sluice_common::config::{DiscoverySettings, MonitorSettings};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::discovery::{Strategy, StrategyProfile};

/// Coarse classification of current database load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ResourceLevel {
    pub fn is_strained(&self) -> bool {
        matches!(self, ResourceLevel::High | ResourceLevel::Critical)
    }
}

impl fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceLevel::Low => "low",
            ResourceLevel::Medium => "medium",
            ResourceLevel::High => "high",
            ResourceLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub level: ResourceLevel,
    pub strategy: Strategy,
    pub latency_samples: usize,
    pub mean_latency_ms: f64,
    pub recent_errors: usize,
    pub connections: Vec<(String, u64)>,
}

/// Rolling window of query latencies and error events.
///
/// Each structure is guarded on its own; readers compute the level from
/// whatever the windows hold at the time of the call.
pub struct ResourceMonitor {
    settings: MonitorSettings,
    latencies: Mutex<VecDeque<Duration>>,
    errors: Mutex<VecDeque<(Instant, String)>>,
    connections: DashMap<String, u64>,
}

impl ResourceMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        let window = settings.window_size.max(1);
        Self {
            settings,
            latencies: Mutex::new(VecDeque::with_capacity(window)),
            errors: Mutex::new(VecDeque::new()),
            connections: DashMap::new(),
        }
    }

    pub fn record_query_time(&self, duration: Duration) {
        let window = self.settings.window_size.max(1);
        let mut latencies = self.latencies.lock();
        while latencies.len() >= window {
            latencies.pop_front();
        }
        latencies.push_back(duration);
    }

    pub fn record_error(&self, kind: &str) {
        let now = Instant::now();
        let mut errors = self.errors.lock();
        errors.push_back((now, kind.to_string()));
        self.prune_errors(&mut errors, now);
        debug!(target: "monitor", kind, recent = errors.len(), "Recorded error");
    }

    pub fn record_connection(&self, source_id: &str) {
        *self.connections.entry(source_id.to_string()).or_insert(0) += 1;
    }

    pub fn connection_count(&self, source_id: &str) -> u64 {
        self.connections.get(source_id).map(|c| *c).unwrap_or(0)
    }

    fn prune_errors(&self, errors: &mut VecDeque<(Instant, String)>, now: Instant) {
        let window = Duration::from_secs(self.settings.error_window_secs);
        while let Some((at, _)) = errors.front() {
            if now.saturating_duration_since(*at) > window {
                errors.pop_front();
            } else {
                break;
            }
        }
    }

    fn recent_error_count(&self) -> usize {
        let mut errors = self.errors.lock();
        self.prune_errors(&mut errors, Instant::now());
        errors.len()
    }

    fn mean_latency(&self) -> Option<Duration> {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return None;
        }
        let total: Duration = latencies.iter().sum();
        Some(total / latencies.len() as u32)
    }

    pub fn resource_level(&self) -> ResourceLevel {
        if self.recent_error_count() > self.settings.critical_error_count {
            return ResourceLevel::Critical;
        }
        let mean = self.mean_latency().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        if mean > self.settings.high_latency_secs {
            ResourceLevel::High
        } else if mean > self.settings.medium_latency_secs {
            ResourceLevel::Medium
        } else {
            ResourceLevel::Low
        }
    }

    pub fn optimal_strategy(&self) -> Strategy {
        let level = self.resource_level();
        let strategy = Strategy::for_level(level);
        if level.is_strained() {
            warn!(target: "monitor", %level, %strategy, "Database under pressure");
        }
        strategy
    }

    /// The profile for the current strategy, drawn from configured settings.
    pub fn optimal_profile(&self, settings: &DiscoverySettings) -> StrategyProfile {
        StrategyProfile::from_settings(self.optimal_strategy(), settings)
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let level = self.resource_level();
        let (samples, mean) = {
            let latencies = self.latencies.lock();
            let n = latencies.len();
            let total: Duration = latencies.iter().sum();
            let mean = if n == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / n as f64
            };
            (n, mean)
        };
        let mut connections: Vec<(String, u64)> = self
            .connections
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        connections.sort();

        MonitorSnapshot {
            level,
            strategy: Strategy::for_level(level),
            latency_samples: samples,
            mean_latency_ms: mean,
            recent_errors: self.recent_error_count(),
            connections,
        }
    }
}
