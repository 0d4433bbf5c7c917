//! Session encryption collaborators.
//!
//! The engine only needs a block cipher that transforms whole blocks in
//! place, in two directions, with chaining state carried across calls.
//! Key derivation is a separate trait so deployments can plug in their own.

use std::net::SocketAddr;

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::error::NetError;

pub const AES_BLOCK: usize = 16;
pub const NONCE_LEN: usize = 16;

/// Per-connection cipher state for both directions.
pub trait SessionCipher {
    fn block_size(&self) -> usize;

    /// Encrypt whole blocks of outgoing data in place.
    fn encrypt(&mut self, data: &mut [u8]);

    /// Decrypt whole blocks of incoming data in place.
    fn decrypt(&mut self, data: &mut [u8]);

    /// Bytes to append so `len` becomes block aligned.
    fn padding_for(&self, len: usize) -> usize {
        let bs = self.block_size();
        (bs - len % bs) % bs
    }
}

/// Keys and IVs for one session, from this side's point of view.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub read_key: [u8; 32],
    pub read_iv: [u8; 16],
    pub write_key: [u8; 32],
    pub write_iv: [u8; 16],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Inputs to key derivation. Both peers build the same exchange, differing
/// only in `is_client`.
#[derive(Debug, Clone, Copy)]
pub struct KeyExchange<'a> {
    pub secret: &'a [u8],
    pub client_nonce: [u8; NONCE_LEN],
    pub server_nonce: [u8; NONCE_LEN],
    pub timestamp: u32,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    pub is_client: bool,
}

pub trait KeyDerivation {
    fn derive(&self, exchange: &KeyExchange<'_>) -> SessionKeys;
}

/// Derives each direction's key as SHA-256 over both nonces, the timestamp,
/// the secret, both addresses and a direction tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Kdf;

fn put_addr(hasher: &mut Sha256, addr: Option<SocketAddr>) {
    match addr {
        Some(SocketAddr::V4(v4)) => {
            hasher.update(v4.ip().octets());
            hasher.update(v4.port().to_le_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            hasher.update(v6.ip().octets());
            hasher.update(v6.port().to_le_bytes());
        }
        None => hasher.update([0u8; 6]),
    }
}

impl Sha256Kdf {
    fn direction(ex: &KeyExchange<'_>, tag: &[u8]) -> ([u8; 32], [u8; 16]) {
        let mut base = Sha256::new();
        base.update(ex.server_nonce);
        base.update(ex.client_nonce);
        base.update(ex.timestamp.to_le_bytes());
        base.update(ex.secret);
        put_addr(&mut base, ex.client_addr);
        put_addr(&mut base, ex.server_addr);
        base.update(tag);

        let mut key = [0u8; 32];
        let mut h = base.clone();
        h.update(b"key");
        key.copy_from_slice(&h.finalize());

        let mut iv = [0u8; 16];
        base.update(b"iv");
        iv.copy_from_slice(&base.finalize()[..16]);
        (key, iv)
    }
}

impl KeyDerivation for Sha256Kdf {
    fn derive(&self, ex: &KeyExchange<'_>) -> SessionKeys {
        let c2s = Self::direction(ex, b"client->server");
        let s2c = Self::direction(ex, b"server->client");
        let ((read_key, read_iv), (write_key, write_iv)) =
            if ex.is_client { (s2c, c2s) } else { (c2s, s2c) };
        SessionKeys {
            read_key,
            read_iv,
            write_key,
            write_iv,
        }
    }
}

/// Key selector advertised in the nonce: the first four bytes of the
/// secret's SHA-256, little endian.
pub fn key_id(secret: &[u8]) -> u32 {
    let digest = Sha256::digest(secret);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// AES-256 in CBC mode, chaining across calls.
pub struct AesCbcSession {
    enc: cbc::Encryptor<Aes256>,
    dec: cbc::Decryptor<Aes256>,
}

impl AesCbcSession {
    pub fn new(keys: &SessionKeys) -> Result<Self, NetError> {
        let enc = cbc::Encryptor::<Aes256>::new_from_slices(&keys.write_key, &keys.write_iv)
            .map_err(|_| NetError::Crypto("invalid write key length"))?;
        let dec = cbc::Decryptor::<Aes256>::new_from_slices(&keys.read_key, &keys.read_iv)
            .map_err(|_| NetError::Crypto("invalid read key length"))?;
        Ok(Self { enc, dec })
    }
}

impl SessionCipher for AesCbcSession {
    fn block_size(&self) -> usize {
        AES_BLOCK
    }

    fn encrypt(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % AES_BLOCK, 0);
        for block in data.chunks_exact_mut(AES_BLOCK) {
            self.enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % AES_BLOCK, 0);
        for block in data.chunks_exact_mut(AES_BLOCK) {
            self.dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(is_client: bool) -> KeyExchange<'static> {
        KeyExchange {
            secret: b"shared secret",
            client_nonce: [1; 16],
            server_nonce: [2; 16],
            timestamp: 1_700_000_000,
            client_addr: Some("127.0.0.1:40000".parse().unwrap()),
            server_addr: Some("127.0.0.1:8888".parse().unwrap()),
            is_client,
        }
    }

    #[test]
    fn peers_derive_mirrored_keys() {
        let client = Sha256Kdf.derive(&exchange(true));
        let server = Sha256Kdf.derive(&exchange(false));
        assert_eq!(client.write_key, server.read_key);
        assert_eq!(client.write_iv, server.read_iv);
        assert_eq!(client.read_key, server.write_key);
        assert_ne!(client.read_key, client.write_key);
    }

    #[test]
    fn cbc_roundtrip_across_calls() {
        let client_keys = Sha256Kdf.derive(&exchange(true));
        let server_keys = Sha256Kdf.derive(&exchange(false));
        let mut client = AesCbcSession::new(&client_keys).unwrap();
        let mut server = AesCbcSession::new(&server_keys).unwrap();

        let plain: Vec<u8> = (0..64u8).collect();
        let mut data = plain.clone();
        client.encrypt(&mut data[..32]);
        client.encrypt(&mut data[32..]);
        assert_ne!(data, plain);

        server.decrypt(&mut data[..48]);
        server.decrypt(&mut data[48..]);
        assert_eq!(data, plain);
    }

    #[test]
    fn padding() {
        let keys = Sha256Kdf.derive(&exchange(true));
        let session = AesCbcSession::new(&keys).unwrap();
        assert_eq!(session.padding_for(32), 0);
        assert_eq!(session.padding_for(20), 12);
        assert_eq!(session.padding_for(1), 15);
    }

    #[test]
    fn key_id_is_stable() {
        assert_eq!(key_id(b"abc"), key_id(b"abc"));
        assert_ne!(key_id(b"abc"), key_id(b"abd"));
    }
}
