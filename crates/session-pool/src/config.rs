//! Pool tuning knobs

use std::time::Duration;

use crate::error::{Error, Result};

/// Pool configuration. `Default` matches what a single Gmail account
/// tolerates comfortably.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft cap on open sessions per account. A Push admission may exceed it
    /// by one when nothing idle can be evicted.
    pub max_slots_per_account: usize,
    /// How long a Transient acquisition waits on a saturated account before
    /// falling back to eviction.
    pub wait_timeout: Duration,
    /// Idle slots released longer ago than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// Slots older than this are closed when idle and never reused.
    pub max_session_age: Duration,
    /// Push slots younger than this are never reaped.
    pub push_grace_period: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots_per_account: 5,
            wait_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_session_age: Duration::from_secs(1800),
            push_grace_period: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_slots_per_account == 0 {
            return Err(Error::InvalidConfig(
                "max_slots_per_account must be greater than 0".into(),
            ));
        }
        if self.wait_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "wait_timeout must be greater than 0".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "reap_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = PoolConfig {
            max_slots_per_account: 0,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_slots_per_account"), "got: {err}");
    }

    #[test]
    fn zero_wait_timeout_rejected() {
        let config = PoolConfig {
            wait_timeout: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_reap_interval_rejected() {
        let config = PoolConfig {
            reap_interval: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
