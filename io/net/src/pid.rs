//! Process identity exchanged during the RPC handshake.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoded size of a [`ProcessId`].
pub const PROCESS_ID_LEN: usize = 12;

/// Identity of a process endpoint: address, port, pid and start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessId {
    pub ip: u32,
    pub port: i16,
    pub pid: i16,
    pub utime: i32,
}

impl ProcessId {
    /// Identity of the running process, listening on `ip:port`.
    pub fn current(ip: Ipv4Addr, port: u16) -> Self {
        let utime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i32)
            .unwrap_or_default();
        Self {
            ip: u32::from(ip),
            port: port as i16,
            pid: std::process::id() as i16,
            utime,
        }
    }

    /// All fields zero: matches anything when used as a pattern.
    #[inline]
    pub fn is_unset(&self) -> bool {
        *self == Self::default()
    }

    /// True if every non-zero field of `pattern` equals the field of `self`.
    pub fn matches(&self, pattern: &ProcessId) -> bool {
        (pattern.ip == 0 || pattern.ip == self.ip)
            && (pattern.port == 0 || pattern.port == self.port)
            && (pattern.pid == 0 || pattern.pid == self.pid)
            && (pattern.utime == 0 || pattern.utime == self.utime)
    }

    pub fn encode(&self, out: &mut [u8; PROCESS_ID_LEN]) {
        out[0..4].copy_from_slice(&self.ip.to_le_bytes());
        out[4..6].copy_from_slice(&self.port.to_le_bytes());
        out[6..8].copy_from_slice(&self.pid.to_le_bytes());
        out[8..12].copy_from_slice(&self.utime.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; PROCESS_ID_LEN] {
        let mut out = [0u8; PROCESS_ID_LEN];
        self.encode(&mut out);
        out
    }

    pub fn decode(data: &[u8; PROCESS_ID_LEN]) -> Self {
        Self {
            ip: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            port: i16::from_le_bytes([data[4], data[5]]),
            pid: i16::from_le_bytes([data[6], data[7]]),
            utime: i32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        }
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}:{}:{}:{}]",
            Ipv4Addr::from(self.ip),
            self.port as u16,
            self.pid as u16,
            self.utime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ProcessId {
        ProcessId {
            ip: 0x7f00_0001,
            port: 8080,
            pid: 1234,
            utime: 1_700_000_000,
        }
    }

    #[test]
    fn layout_is_little_endian() {
        let bytes = pid().to_bytes();
        assert_eq!(&bytes[0..4], &[0x01, 0x00, 0x00, 0x7f]);
        assert_eq!(ProcessId::decode(&bytes), pid());
    }

    #[test]
    fn zero_fields_are_wildcards() {
        let p = pid();
        assert!(p.matches(&ProcessId::default()));
        assert!(p.matches(&ProcessId {
            port: 8080,
            ..Default::default()
        }));
        assert!(!p.matches(&ProcessId {
            pid: 99,
            ..Default::default()
        }));
        assert!(p.matches(&p));
    }
}
