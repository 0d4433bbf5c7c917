//! Server configuration.
//!
//! Loaded from a TOML file. Every section is optional.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use io_net::{Endpoint, NetConfig, TargetSpec};
use protocol_tcp_rpc::RpcConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub buffers: BuffersConfig,

    /// Engine tuning.
    #[serde(default)]
    pub net: NetConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    /// Outbound targets kept connected and pinged.
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.endpoints.is_empty() && self.targets.is_empty() {
            return Err(ConfigError::Invalid(
                "nothing to do: no listen endpoints and no targets".into(),
            ));
        }
        for t in &self.targets {
            if t.min_connections > t.max_connections {
                return Err(ConfigError::Invalid(format!(
                    "target {}: min_connections ({}) exceeds max_connections ({})",
                    t.endpoint, t.min_connections, t.max_connections
                )));
            }
        }
        Ok(())
    }

    /// Address advertised in this process's identity: the first TCP listen
    /// address, with unspecified addresses replaced by loopback.
    pub fn identity_addr(&self) -> (Ipv4Addr, u16) {
        self.listen
            .endpoints
            .iter()
            .find_map(|e| match e {
                Endpoint::Tcp(addr) => Some(addr),
                Endpoint::Unix(_) => None,
            })
            .map(|addr| {
                let ip = match addr.ip() {
                    IpAddr::V4(ip) if !ip.is_unspecified() => ip,
                    _ => Ipv4Addr::LOCALHOST,
                };
                (ip, addr.port())
            })
            .unwrap_or((Ipv4Addr::LOCALHOST, 0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// `host:port` or `unix:/path` endpoints.
    #[serde(default = "ListenConfig::default_endpoints")]
    pub endpoints: Vec<Endpoint>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            endpoints: Self::default_endpoints(),
        }
    }
}

impl ListenConfig {
    fn default_endpoints() -> Vec<Endpoint> {
        vec![Endpoint::Tcp(([0, 0, 0, 0], 8888).into())]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuffersConfig {
    /// Total bytes all message buffers may occupy (e.g. "256MB").
    #[serde(
        default = "BuffersConfig::default_budget",
        deserialize_with = "deserialize_size"
    )]
    pub budget: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            budget: Self::default_budget(),
        }
    }
}

impl BuffersConfig {
    fn default_budget() -> usize {
        256 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub endpoint: Endpoint,

    #[serde(default = "TargetConfig::default_connections")]
    pub min_connections: usize,

    #[serde(default = "TargetConfig::default_connections")]
    pub max_connections: usize,

    /// First reconnect delay after a failure.
    #[serde(default = "TargetConfig::default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,
}

impl TargetConfig {
    fn default_connections() -> usize {
        1
    }

    fn default_reconnect_timeout_ms() -> u64 {
        100
    }

    pub fn spec(&self) -> TargetSpec {
        TargetSpec {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
            ..TargetSpec::new(self.endpoint.clone())
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level. `RUST_LOG` takes precedence.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "LoggingConfig::default_timestamps")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: Self::default_timestamps(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_timestamps() -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB" or "1GiB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num_str}"))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {suffix}")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

/// Commented configuration printed by `--print-config`. Parses to the
/// defaults.
pub const DEFAULT_CONFIG: &str = r#"# RPC server configuration

[listen]
# "host:port" or "unix:/path/to/socket"
endpoints = ["0.0.0.0:8888"]

[buffers]
# Memory all message buffers may use together
budget = "256MB"

[net]
max_connections = 4096
# Upper bound for the reconnect backoff
max_reconnect_interval_ms = 20000
# Rate k of the idle-close probability 1 - e^(-k * dt), per second
idle_close_rate = 0.1
# Output limit per connection in bytes per second, 0 disables
rate_limit_bytes_per_sec = 0

[rpc]
# "none", "aes" or "none_or_aes"
crypto = "none_or_aes"
# Shared AES secret; without it only plaintext is possible
# secret = "change me"
prefer_crc32c = true
# Largest clock difference accepted in an AES nonce
max_clock_skew_secs = 30
# Ping outbound connections, 0 disables
ping_interval_ms = 0
ping_timeout_ms = 5000

# Identity peers must present; unset fields match anything
# [rpc.peer]
# ip = "10.0.0.1"
# port = 8888

# Outbound targets, repeat the table for more
# [[target]]
# endpoint = "10.0.0.2:8888"
# min_connections = 1
# max_connections = 2
# reconnect_timeout_ms = 100

[logging]
# "error", "warn", "info", "debug" or "trace"; RUST_LOG overrides
level = "info"
# "pretty", "compact" or "json"
format = "pretty"
timestamps = true
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_tcp_rpc::CryptoSchema;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn default_config_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.listen.endpoints, ListenConfig::default().endpoints);
        assert_eq!(config.buffers.budget, BuffersConfig::default().budget);
        assert_eq!(config.rpc.crypto, CryptoSchema::NoneOrAes);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.targets.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn targets() {
        let config: Config = toml::from_str(
            r#"
            [listen]
            endpoints = ["127.0.0.1:9000", "unix:/tmp/rpc.sock"]

            [[target]]
            endpoint = "127.0.0.1:9001"
            max_connections = 3

            [[target]]
            endpoint = "unix:/tmp/other.sock"
            "#,
        )
        .unwrap();
        assert_eq!(config.targets.len(), 2);
        let spec = config.targets[0].spec();
        assert_eq!((spec.min_connections, spec.max_connections), (1, 3));
        assert_eq!(spec.reconnect_timeout, Duration::from_millis(100));
        assert_eq!(config.identity_addr(), (Ipv4Addr::new(127, 0, 0, 1), 9000));
    }

    #[test]
    fn invalid_target_bounds() {
        let config: Config = toml::from_str(
            r#"
            [[target]]
            endpoint = "127.0.0.1:9001"
            min_connections = 4
            max_connections = 2
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unspecified_listen_address_advertises_loopback() {
        let config = Config::default();
        assert_eq!(config.identity_addr(), (Ipv4Addr::LOCALHOST, 8888));
    }

    #[test]
    fn unknown_section_rejected() {
        assert!(toml::from_str::<Config>("[bogus]\nx = 1").is_err());
    }
}
