//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// Settings for one [`Engine`](crate::Engine).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Maximum simultaneously open connections.
    #[serde(default = "NetConfig::default_max_connections")]
    pub max_connections: usize,

    /// Size of the target table.
    #[serde(default = "NetConfig::default_max_targets")]
    pub max_targets: usize,

    /// Buckets in the target lookup hash.
    #[serde(default = "NetConfig::default_target_hash_buckets")]
    pub target_hash_buckets: usize,

    /// Salt mixed into target lookup hashes. Random when unset.
    #[serde(default)]
    pub hash_salt: Option<u64>,

    /// Listen backlog.
    #[serde(default = "NetConfig::default_backlog")]
    pub backlog: u32,

    /// Size hint for buffers allocated by socket reads.
    #[serde(default = "NetConfig::default_read_hint")]
    pub read_hint: usize,

    /// Upper bound for the reconnect backoff, in milliseconds.
    #[serde(default = "NetConfig::default_max_reconnect_interval_ms")]
    pub max_reconnect_interval_ms: u64,

    /// Rate `k` of the idle-close probability `1 - e^(-k * dt)`, per second.
    #[serde(default = "NetConfig::default_idle_close_rate")]
    pub idle_close_rate: f64,

    /// Interval between idle-connection sweeps of inactive targets.
    #[serde(default = "NetConfig::default_idle_sweep_interval_ms")]
    pub idle_sweep_interval_ms: u64,

    /// Output rate limit per connection in bytes per second. Zero disables.
    #[serde(default)]
    pub rate_limit_bytes_per_sec: u64,

    /// Maximum bytes written per write call when rate limited.
    #[serde(default = "NetConfig::default_rate_limit_burst")]
    pub rate_limit_burst: usize,

    /// Longest the event loop sleeps when no timer is due.
    #[serde(default = "NetConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            max_targets: Self::default_max_targets(),
            target_hash_buckets: Self::default_target_hash_buckets(),
            hash_salt: None,
            backlog: Self::default_backlog(),
            read_hint: Self::default_read_hint(),
            max_reconnect_interval_ms: Self::default_max_reconnect_interval_ms(),
            idle_close_rate: Self::default_idle_close_rate(),
            idle_sweep_interval_ms: Self::default_idle_sweep_interval_ms(),
            rate_limit_bytes_per_sec: 0,
            rate_limit_burst: Self::default_rate_limit_burst(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
        }
    }
}

impl NetConfig {
    fn default_max_connections() -> usize {
        4096
    }

    fn default_max_targets() -> usize {
        1024
    }

    fn default_target_hash_buckets() -> usize {
        997
    }

    fn default_backlog() -> u32 {
        1024
    }

    fn default_read_hint() -> usize {
        16384
    }

    fn default_max_reconnect_interval_ms() -> u64 {
        20_000
    }

    fn default_idle_close_rate() -> f64 {
        0.1
    }

    fn default_idle_sweep_interval_ms() -> u64 {
        1000
    }

    fn default_rate_limit_burst() -> usize {
        65536
    }

    fn default_poll_timeout_ms() -> u64 {
        100
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_defaults() {
        let config: NetConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_connections, 4096);
        assert_eq!(config.max_reconnect_interval(), Duration::from_secs(20));
        assert!(config.hash_salt.is_none());
    }

    #[test]
    fn overrides() {
        let config: NetConfig = toml::from_str(
            r#"
            max_connections = 10
            hash_salt = 42
            rate_limit_bytes_per_sec = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.hash_salt, Some(42));
        assert_eq!(config.rate_limit_bytes_per_sec, 1000);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<NetConfig>("bogus = 1").is_err());
    }
}
