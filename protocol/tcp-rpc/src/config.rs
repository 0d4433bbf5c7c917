//! RPC session configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use io_net::ProcessId;
use serde::Deserialize;

use crate::handshake::{CryptoSchema, HandshakeFlags};
use crate::packet::DEFAULT_MAX_PACKET_LEN;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    /// Encryption this side offers as initiator and accepts as responder.
    /// `none_or_aes` explicitly permits plaintext when no key is shared.
    #[serde(default)]
    pub crypto: CryptoSchema,

    /// Shared secret for AES sessions. Without one only plaintext is possible.
    #[serde(default)]
    pub secret: Option<String>,

    /// Request CRC32C packet checksums.
    #[serde(default = "RpcConfig::default_prefer_crc32c")]
    pub prefer_crc32c: bool,

    /// Accept application packets out of sequence.
    #[serde(default)]
    pub unordered: bool,

    #[serde(default)]
    pub quick_ack: bool,

    /// Identity the peer must present. Zero fields match anything.
    #[serde(default)]
    pub peer: PeerPattern,

    /// Largest packet accepted, in bytes.
    #[serde(default = "RpcConfig::default_max_packet_len")]
    pub max_packet_len: u32,

    /// Largest accepted difference between the peer's nonce timestamp and
    /// the local clock.
    #[serde(default = "RpcConfig::default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u32,

    /// Interval between pings on outbound connections. Zero disables.
    #[serde(default)]
    pub ping_interval_ms: u64,

    /// A ping not answered within this time fails the connection.
    #[serde(default = "RpcConfig::default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            crypto: CryptoSchema::default(),
            secret: None,
            prefer_crc32c: Self::default_prefer_crc32c(),
            unordered: false,
            quick_ack: false,
            peer: PeerPattern::default(),
            max_packet_len: Self::default_max_packet_len(),
            max_clock_skew_secs: Self::default_max_clock_skew_secs(),
            ping_interval_ms: 0,
            ping_timeout_ms: Self::default_ping_timeout_ms(),
        }
    }
}

impl RpcConfig {
    fn default_prefer_crc32c() -> bool {
        true
    }

    fn default_max_packet_len() -> u32 {
        DEFAULT_MAX_PACKET_LEN
    }

    fn default_max_clock_skew_secs() -> u32 {
        30
    }

    fn default_ping_timeout_ms() -> u64 {
        5000
    }

    pub fn secret_bytes(&self) -> &[u8] {
        self.secret.as_deref().map(str::as_bytes).unwrap_or_default()
    }

    /// Capabilities this side is willing to negotiate.
    pub fn supported_flags(&self) -> HandshakeFlags {
        let mut flags = HandshakeFlags::empty();
        flags.set(HandshakeFlags::CRC32C, self.prefer_crc32c);
        flags.set(HandshakeFlags::UNORDERED, self.unordered);
        flags.set(HandshakeFlags::QUICK_ACK, self.quick_ack);
        flags
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Partial process identity. Unset fields are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerPattern {
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
    pub pid: u16,
    pub utime: i32,
}

impl PeerPattern {
    pub fn to_pid(&self) -> ProcessId {
        ProcessId {
            ip: self.ip.map(u32::from).unwrap_or(0),
            port: self.port as i16,
            pid: self.pid as i16,
            utime: self.utime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: RpcConfig = toml::from_str("").unwrap();
        assert_eq!(config.crypto, CryptoSchema::NoneOrAes);
        assert!(config.secret_bytes().is_empty());
        assert_eq!(config.supported_flags(), HandshakeFlags::CRC32C);
        assert_eq!(config.ping_interval(), None);
        assert_eq!(config.max_clock_skew_secs, 30);
        assert!(config.peer.to_pid().is_unset());
    }

    #[test]
    fn full_table() {
        let config: RpcConfig = toml::from_str(
            r#"
            crypto = "aes"
            secret = "hunter2"
            prefer_crc32c = false
            unordered = true
            ping_interval_ms = 250

            [peer]
            ip = "10.0.0.1"
            port = 8888
            "#,
        )
        .unwrap();
        assert_eq!(config.crypto, CryptoSchema::Aes);
        assert_eq!(config.secret_bytes(), b"hunter2");
        assert_eq!(config.supported_flags(), HandshakeFlags::UNORDERED);
        assert_eq!(config.ping_interval(), Some(Duration::from_millis(250)));

        let pid = config.peer.to_pid();
        assert_eq!(pid.ip, 0x0a00_0001);
        assert_eq!(pid.port, 8888);
        assert_eq!(pid.pid, 0);
    }
}
