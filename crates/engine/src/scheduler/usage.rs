use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use sysinfo::System;

/// Host utilization as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostUsage {
    pub cpu: f64,
    pub memory: f64,
}

/// Source of host CPU and memory utilization for admission control.
pub trait UsageSampler: Send + Sync {
    fn sample(&self) -> HostUsage;
}

/// Samples the local host with `sysinfo`, refreshing at most once per interval.
pub struct SysinfoSampler {
    state: Mutex<SamplerState>,
    interval: Duration,
}

struct SamplerState {
    system: System,
    last_refresh: Option<Instant>,
    last: HostUsage,
}

impl SysinfoSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(SamplerState {
                system: System::new(),
                last_refresh: None,
                last: HostUsage::default(),
            }),
            interval,
        }
    }
}

impl UsageSampler for SysinfoSampler {
    fn sample(&self) -> HostUsage {
        let mut state = self.state.lock();
        let stale = state
            .last_refresh
            .map_or(true, |at| at.elapsed() >= self.interval);
        if !stale {
            return state.last;
        }

        state.system.refresh_cpu_usage();
        state.system.refresh_memory();

        let cpu = f64::from(state.system.global_cpu_usage()) / 100.0;
        let total = state.system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            state.system.used_memory() as f64 / total as f64
        };

        state.last = HostUsage {
            cpu: cpu.clamp(0.0, 1.0),
            memory: memory.clamp(0.0, 1.0),
        };
        state.last_refresh = Some(Instant::now());
        state.last
    }
}

/// Fixed usage, adjustable at runtime. Useful for tests and for hosts where
/// sampling is not wanted.
#[derive(Debug, Default)]
pub struct StaticUsageSampler {
    usage: Mutex<HostUsage>,
}

impl StaticUsageSampler {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            usage: Mutex::new(HostUsage { cpu, memory }),
        }
    }

    pub fn set(&self, cpu: f64, memory: f64) {
        *self.usage.lock() = HostUsage { cpu, memory };
    }
}

impl UsageSampler for StaticUsageSampler {
    fn sample(&self) -> HostUsage {
        *self.usage.lock()
    }
}

impl<T: UsageSampler + ?Sized> UsageSampler for std::sync::Arc<T> {
    fn sample(&self) -> HostUsage {
        (**self).sample()
    }
}
