use serde::{Deserialize, Serialize};
use sluice_common::config::{DiscoverySettings, StrategySettings};
use sluice_common::retry::RetrySettings;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::PoolSettings;
use crate::monitor::ResourceLevel;

/// How aggressively discovery may load a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl Strategy {
    pub fn for_level(level: ResourceLevel) -> Self {
        match level {
            ResourceLevel::Critical | ResourceLevel::High => Strategy::Conservative,
            ResourceLevel::Medium => Strategy::Balanced,
            ResourceLevel::Low => Strategy::Aggressive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Conservative => "conservative",
            Strategy::Balanced => "balanced",
            Strategy::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy bound to its configured parameters.
///
/// Profiles are values: switching strategy means building another profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyProfile {
    pub strategy: Strategy,
    pub settings: StrategySettings,
}

impl StrategyProfile {
    pub fn from_settings(strategy: Strategy, settings: &DiscoverySettings) -> Self {
        let settings = match strategy {
            Strategy::Conservative => settings.conservative,
            Strategy::Balanced => settings.balanced,
            Strategy::Aggressive => settings.aggressive,
        };
        Self { strategy, settings }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings::from(&self.settings)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            max_attempts: self.settings.max_retries + 1,
            base_delay_ms: self.settings.base_backoff_ms,
            max_delay_ms: self.settings.max_backoff_ms,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size.max(1)
    }

    /// Pause after a table batch, doubled while the database is strained.
    pub fn batch_delay(&self, strained: bool) -> Duration {
        let base = Duration::from_millis(self.settings.batch_delay_ms);
        if strained {
            base * 2
        } else {
            base
        }
    }
}

/// Cooperative cancellation for a discovery run, observed between batches.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_to_strategy() {
        assert_eq!(Strategy::for_level(ResourceLevel::Critical), Strategy::Conservative);
        assert_eq!(Strategy::for_level(ResourceLevel::High), Strategy::Conservative);
        assert_eq!(Strategy::for_level(ResourceLevel::Medium), Strategy::Balanced);
        assert_eq!(Strategy::for_level(ResourceLevel::Low), Strategy::Aggressive);
    }

    #[test]
    fn test_conservative_profile() {
        let profile =
            StrategyProfile::from_settings(Strategy::Conservative, &DiscoverySettings::default());
        assert_eq!(profile.batch_size(), 1);
        assert_eq!(profile.pool_settings().max_size, 1);
        assert_eq!(profile.retry_settings().max_attempts, 6);
        assert_eq!(profile.batch_delay(false), Duration::from_millis(500));
        assert_eq!(profile.batch_delay(true), Duration::from_secs(1));
    }

    #[test]
    fn test_abort_handle_is_shared_between_clones() {
        let handle = AbortHandle::new();
        let observer = handle.clone();
        assert!(!observer.is_aborted());
        handle.abort();
        assert!(observer.is_aborted());
    }
}
