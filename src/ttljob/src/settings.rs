//! Cluster-wide TTL switch consulted between select batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::config::TtlConfig;

use crate::error::TtlError;

/// Shared, live-toggleable TTL settings.
///
/// Clones observe the same flag, so operators can flip it while workers run.
#[derive(Debug, Clone)]
pub struct TtlSettings {
    enabled: Arc<AtomicBool>,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TtlSettings {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn from_config(config: &TtlConfig) -> Self {
        Self::new(config.enabled)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Fail with [`TtlError::Disabled`] when TTL work is switched off.
    pub fn check_enabled(&self) -> Result<(), TtlError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(TtlError::Disabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_is_visible_through_clones() {
        let settings = TtlSettings::default();
        let shared = settings.clone();
        assert!(shared.check_enabled().is_ok());

        settings.set_enabled(false);
        assert!(matches!(shared.check_enabled(), Err(TtlError::Disabled)));
    }

    #[test]
    fn test_from_config() {
        let config = TtlConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!TtlSettings::from_config(&config).is_enabled());
    }
}
