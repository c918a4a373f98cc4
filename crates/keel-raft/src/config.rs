//! Protocol configuration (timeouts and replication tuning).

use std::time::Duration;

use crate::error::{RaftError, Result};

/// Tuning parameters for the consensus core.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Base election timeout `T`.
    ///
    /// Followers and candidates arm their election timers with a value
    /// drawn uniformly from `[T, 2T)` to keep elections from colliding.
    ///
    /// Default: 750ms
    pub election_timeout: Duration,

    /// Leader heartbeat interval.
    ///
    /// Must stay well below the election timeout or followers will keep
    /// starting spurious elections.
    ///
    /// Default: `election_timeout / 4`
    pub heartbeat_interval: Duration,

    /// Maximum payload bytes carried by a single AppendRequest.
    ///
    /// Default: 64 KiB
    pub max_batch_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let election_timeout = Duration::from_millis(750);
        Self {
            election_timeout,
            heartbeat_interval: election_timeout / 4,
            max_batch_size: 64 * 1024,
        }
    }
}

impl ProtocolConfig {
    /// Build a config from an election timeout, deriving the heartbeat
    /// interval as a quarter of it.
    pub fn with_election_timeout(election_timeout: Duration) -> Self {
        Self {
            election_timeout,
            heartbeat_interval: election_timeout / 4,
            max_batch_size: Self::default().max_batch_size,
        }
    }

    /// Ensure the invariants between the timing parameters hold.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout.is_zero() {
            return Err(RaftError::Config {
                reason: "election_timeout must be non-zero".to_string(),
            });
        }
        if self.heartbeat_interval * 2 >= self.election_timeout {
            return Err(RaftError::Config {
                reason: format!(
                    "heartbeat_interval ({:?}) must be < election_timeout / 2 ({:?})",
                    self.heartbeat_interval, self.election_timeout
                ),
            });
        }
        if self.max_batch_size == 0 {
            return Err(RaftError::Config {
                reason: "max_batch_size must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Draw a randomized election timeout from `[T, 2T)`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let base_ms = self.election_timeout.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..base_ms.max(1));
        Duration::from_millis(base_ms + jitter_ms)
    }

    /// How long a quorum acknowledgment keeps lease reads valid: 90% of
    /// the election timeout, so the window closes before any new leader
    /// could have been elected, with margin for clock skew.
    pub fn lease_duration(&self) -> Duration {
        self.election_timeout.mul_f32(0.9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        assert!(ProtocolConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_too_long_rejected() {
        let mut config = ProtocolConfig::default();
        config.heartbeat_interval = config.election_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_heartbeat_is_quarter() {
        let config = ProtocolConfig::with_election_timeout(Duration::from_millis(800));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
    }

    #[test]
    fn random_timeout_in_range() {
        let config = ProtocolConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout);
            assert!(timeout < config.election_timeout * 2);
        }
    }

    #[test]
    fn lease_stays_below_election_timeout() {
        let config = ProtocolConfig::default();
        assert_eq!(config.lease_duration(), config.election_timeout.mul_f32(0.9));
        assert!(config.lease_duration() < config.election_timeout);
    }
}
