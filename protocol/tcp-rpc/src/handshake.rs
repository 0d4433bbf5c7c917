//! Payloads of the packets exchanged before application traffic.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use io_net::{NONCE_LEN, PROCESS_ID_LEN, ProcessId};
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Encryption offered in or selected by a nonce packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoSchema {
    /// Plaintext only.
    None,
    /// AES only.
    Aes,
    /// AES when both sides share a key, plaintext otherwise.
    #[default]
    NoneOrAes,
}

impl CryptoSchema {
    pub fn to_wire(self) -> u32 {
        match self {
            CryptoSchema::None => 0,
            CryptoSchema::Aes => 1,
            CryptoSchema::NoneOrAes => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(CryptoSchema::None),
            1 => Some(CryptoSchema::Aes),
            2 => Some(CryptoSchema::NoneOrAes),
            _ => None,
        }
    }

    #[inline]
    pub fn allows_plaintext(self) -> bool {
        matches!(self, CryptoSchema::None | CryptoSchema::NoneOrAes)
    }

    #[inline]
    pub fn allows_aes(self) -> bool {
        matches!(self, CryptoSchema::Aes | CryptoSchema::NoneOrAes)
    }
}

impl std::fmt::Display for CryptoSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CryptoSchema::None => "none",
            CryptoSchema::Aes => "aes",
            CryptoSchema::NoneOrAes => "none_or_aes",
        })
    }
}

bitflags! {
    /// Capabilities negotiated by the handshake. The responder answers with
    /// the subset of the initiator's flags it supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandshakeFlags: u32 {
        /// Application packets may arrive out of sequence.
        const UNORDERED = 0x0000_0100;
        /// Peer acknowledges packets as soon as they are parsed.
        const QUICK_ACK = 0x0000_0200;
        /// Packet checksums use CRC32C instead of CRC32.
        const CRC32C    = 0x0000_0800;
    }
}

/// `NONCE` payload: `schema | key_select | crypto_ts | nonce[16]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoncePacket {
    pub key_select: u32,
    pub schema: CryptoSchema,
    pub crypto_ts: u32,
    pub nonce: [u8; NONCE_LEN],
}

impl NoncePacket {
    pub const LEN: usize = 12 + NONCE_LEN;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32_le(self.schema.to_wire());
        buf.put_u32_le(self.key_select);
        buf.put_u32_le(self.crypto_ts);
        buf.put_slice(&self.nonce);
        buf
    }

    /// Longer payloads are accepted and the excess ignored.
    pub fn decode(mut data: &[u8]) -> Result<Self, RpcError> {
        if data.len() < Self::LEN {
            return Err(RpcError::Malformed("nonce"));
        }
        let schema =
            CryptoSchema::from_wire(data.get_u32_le()).ok_or(RpcError::Malformed("nonce"))?;
        let key_select = data.get_u32_le();
        let crypto_ts = data.get_u32_le();
        let mut nonce = [0u8; NONCE_LEN];
        data.copy_to_slice(&mut nonce);
        Ok(Self {
            key_select,
            schema,
            crypto_ts,
            nonce,
        })
    }
}

/// `HANDSHAKE` payload: `flags | sender_pid | peer_pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePacket {
    pub flags: HandshakeFlags,
    pub sender_pid: ProcessId,
    pub peer_pid: ProcessId,
}

impl HandshakePacket {
    pub const LEN: usize = 4 + 2 * PROCESS_ID_LEN;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32_le(self.flags.bits());
        buf.put_slice(&self.sender_pid.to_bytes());
        buf.put_slice(&self.peer_pid.to_bytes());
        buf
    }

    /// Unknown flag bits are dropped.
    pub fn decode(mut data: &[u8]) -> Result<Self, RpcError> {
        if data.len() < Self::LEN {
            return Err(RpcError::Malformed("handshake"));
        }
        let flags = HandshakeFlags::from_bits_truncate(data.get_u32_le());
        let sender_pid = get_pid(&mut data);
        let peer_pid = get_pid(&mut data);
        Ok(Self {
            flags,
            sender_pid,
            peer_pid,
        })
    }
}

/// `HANDSHAKE_ERROR` payload: `error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeErrorPacket {
    pub error_code: i32,
}

impl HandshakeErrorPacket {
    pub const LEN: usize = 4;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_i32_le(self.error_code);
        buf
    }

    /// Longer payloads are accepted and the excess ignored.
    pub fn decode(mut data: &[u8]) -> Result<Self, RpcError> {
        if data.len() < Self::LEN {
            return Err(RpcError::Malformed("handshake error"));
        }
        Ok(Self {
            error_code: data.get_i32_le(),
        })
    }
}

fn get_pid(data: &mut &[u8]) -> ProcessId {
    let mut raw = [0u8; PROCESS_ID_LEN];
    data.copy_to_slice(&mut raw);
    ProcessId::decode(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(port: i16) -> ProcessId {
        ProcessId {
            ip: 0x7f00_0001,
            port,
            pid: 42,
            utime: 1_700_000_000,
        }
    }

    #[test]
    fn nonce_layout() {
        let nonce = NoncePacket {
            key_select: 0xaabb_ccdd,
            schema: CryptoSchema::Aes,
            crypto_ts: 100,
            nonce: [7; NONCE_LEN],
        };
        let bytes = nonce.encode();
        assert_eq!(bytes.len(), NoncePacket::LEN);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0xaabb_ccddu32.to_le_bytes());
        assert_eq!(&bytes[8..12], &100u32.to_le_bytes());
        assert_eq!(NoncePacket::decode(&bytes).unwrap(), nonce);
    }

    #[test]
    fn unknown_schema_is_malformed() {
        let mut bytes = NoncePacket {
            key_select: 0,
            schema: CryptoSchema::None,
            crypto_ts: 0,
            nonce: [0; NONCE_LEN],
        }
        .encode();
        bytes[0] = 9;
        assert!(matches!(
            NoncePacket::decode(&bytes),
            Err(RpcError::Malformed("nonce"))
        ));
        assert!(NoncePacket::decode(&bytes[..20]).is_err());
    }

    #[test]
    fn handshake_layout() {
        let hs = HandshakePacket {
            flags: HandshakeFlags::CRC32C | HandshakeFlags::UNORDERED,
            sender_pid: pid(1),
            peer_pid: pid(2),
        };
        let bytes = hs.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &0x900u32.to_le_bytes());
        assert_eq!(&bytes[4..16], &pid(1).to_bytes());
        assert_eq!(HandshakePacket::decode(&bytes).unwrap(), hs);
    }

    #[test]
    fn handshake_drops_unknown_flags() {
        let mut bytes = HandshakePacket {
            flags: HandshakeFlags::CRC32C,
            sender_pid: pid(1),
            peer_pid: ProcessId::default(),
        }
        .encode();
        bytes[3] = 0x80;
        let hs = HandshakePacket::decode(&bytes).unwrap();
        assert_eq!(hs.flags, HandshakeFlags::CRC32C);
    }

    #[test]
    fn handshake_error_layout() {
        let err = HandshakeErrorPacket { error_code: -108 };
        let bytes = err.encode();
        assert_eq!(bytes.len(), 4);
        assert_eq!(&bytes[..], &(-108i32).to_le_bytes());
        assert_eq!(HandshakeErrorPacket::decode(&bytes).unwrap(), err);
        assert!(HandshakeErrorPacket::decode(&bytes[..3]).is_err());
    }

    #[test]
    fn schema_names() {
        #[derive(Deserialize)]
        struct T {
            schema: CryptoSchema,
        }
        let t: T = toml::from_str("schema = \"none_or_aes\"").unwrap();
        assert_eq!(t.schema, CryptoSchema::NoneOrAes);
        assert_eq!(t.schema.to_string(), "none_or_aes");
        assert!(CryptoSchema::None.allows_plaintext());
        assert!(!CryptoSchema::Aes.allows_plaintext());
    }
}
