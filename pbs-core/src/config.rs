//! Core-level configuration: the handful of tunables the state-machine
//! and persistence layers need that are independent of network
//! transport (which lives in `pbs-server`'s own config).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// How old a failover lockfile's mtime may get before a standby is
    /// permitted to treat the primary as dead and take over.
    #[serde(with = "humantime_serde_duration")]
    pub failover_staleness_threshold: Duration,
    /// Minimum interval between alien-node cache refreshes against a
    /// given peer server.
    #[serde(with = "humantime_serde_duration")]
    pub alien_cache_min_refresh: Duration,
    /// Path to the failover lockfile.
    pub failover_lock_path: String,
    /// How long a rerun waits for the Mom's kill acknowledgment before the
    /// watchdog gives up on it and clears the pending substate.
    #[serde(with = "humantime_serde_duration")]
    pub job_requeue_timeout: Duration,
    /// Initial backoff between reservation confirm retries.
    #[serde(with = "humantime_serde_duration")]
    pub reserve_retry_init: Duration,
    /// Total window after which a reservation that never confirms is
    /// given up on and deleted rather than retried again.
    #[serde(with = "humantime_serde_duration")]
    pub reserve_retry_cutoff: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            failover_staleness_threshold: Duration::from_secs(30),
            alien_cache_min_refresh: Duration::from_secs(60),
            failover_lock_path: "/var/spool/pbs/server_priv/server.lock".to_owned(),
            job_requeue_timeout: Duration::from_secs(300),
            reserve_retry_init: Duration::from_secs(30),
            reserve_retry_cutoff: Duration::from_secs(600),
        }
    }
}

/// `serde_with`-style helper module so `Duration` fields serialize as
/// plain seconds in the config file instead of a nested struct, without
/// pulling in the full `serde_with` crate for one field shape.
mod humantime_serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let cfg = CoreConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.failover_lock_path, cfg.failover_lock_path);
        assert_eq!(back.failover_staleness_threshold, cfg.failover_staleness_threshold);
    }
}
