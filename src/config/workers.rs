//! Background worker and ledger processing configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Worker schedules and processor retry budget
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Run the reconciliation worker
    #[serde(default = "default_true")]
    pub reconciliation_enabled: bool,

    /// Seconds between reconciliation passes
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_secs: u64,

    /// Rows read per reconciliation page
    #[serde(default = "default_reconciliation_batch")]
    pub reconciliation_batch_size: usize,

    /// Store calls in flight during a reconciliation pass
    #[serde(default = "default_reconciliation_concurrency")]
    pub reconciliation_concurrency: usize,

    /// Run the expiration sweep
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,

    /// Seconds between sweep passes
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Rows read per sweep page
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: usize,

    /// Attempts for one ledger unit when it aborts
    #[serde(default = "default_processor_attempts")]
    pub processor_max_attempts: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            reconciliation_enabled: true,
            reconciliation_interval_secs: default_reconciliation_interval(),
            reconciliation_batch_size: default_reconciliation_batch(),
            reconciliation_concurrency: default_reconciliation_concurrency(),
            sweep_enabled: true,
            sweep_interval_secs: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
            processor_max_attempts: default_processor_attempts(),
        }
    }
}

impl WorkersConfig {
    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate worker configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.reconciliation_interval_secs < 60 {
            return Err(ValidationError::InvalidWorkerSetting("RECONCILIATION_INTERVAL_SECS"));
        }
        if self.sweep_interval_secs < 60 {
            return Err(ValidationError::InvalidWorkerSetting("SWEEP_INTERVAL_SECS"));
        }
        if self.reconciliation_batch_size == 0 || self.sweep_batch_size == 0 {
            return Err(ValidationError::InvalidWorkerSetting("BATCH_SIZE"));
        }
        if self.reconciliation_concurrency == 0 || self.reconciliation_concurrency > 64 {
            return Err(ValidationError::InvalidWorkerSetting("RECONCILIATION_CONCURRENCY"));
        }
        if self.processor_max_attempts == 0 {
            return Err(ValidationError::InvalidWorkerSetting("PROCESSOR_MAX_ATTEMPTS"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_reconciliation_interval() -> u64 {
    24 * 60 * 60
}

fn default_reconciliation_batch() -> usize {
    100
}

fn default_reconciliation_concurrency() -> usize {
    8
}

fn default_sweep_interval() -> u64 {
    4 * 60 * 60
}

fn default_sweep_batch() -> usize {
    500
}

fn default_processor_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkersConfig::default();
        assert!(config.reconciliation_enabled);
        assert!(config.sweep_enabled);
        assert_eq!(config.reconciliation_interval(), Duration::from_secs(86_400));
        assert_eq!(config.sweep_interval(), Duration::from_secs(14_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_too_short() {
        let config = WorkersConfig {
            sweep_interval_secs: 5,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidWorkerSetting("SWEEP_INTERVAL_SECS"))
        );
    }

    #[test]
    fn test_zero_concurrency() {
        let config = WorkersConfig {
            reconciliation_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
