//! Packet framing.
//!
//! ```text
//! +--------+--------+--------+-----------------+--------+
//! | len:u32| seq:i32| ty:u32 | payload         | crc:u32|
//! +--------+--------+--------+-----------------+--------+
//! ```
//!
//! All fields are little endian and the whole packet is a multiple of four
//! bytes. `len` covers the entire packet including the checksum, which is
//! computed over everything before it. A lone `len == 4` word is a keepalive
//! and `0x04040404` words pad encrypted output to the cipher block size;
//! both are skipped by the decoder.

use bytes::{Buf, BufMut, BytesMut};
use io_msgbuf::{ChecksumKind, RawMessage};
use io_net::Connection;

use crate::error::RpcError;
use crate::metrics::{RPC_CHECKSUM_ERRORS, RPC_PADDING_BYTES};

pub const HEADER_LEN: usize = 12;
pub const TRAILER_LEN: usize = 4;
pub const MIN_PACKET_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Length word of a keepalive.
pub const KEEPALIVE_LEN: u32 = 4;

/// Filler word appended after a packet to reach a cipher block boundary.
pub const PADDING_WORD: u32 = 0x0404_0404;

pub const DEFAULT_MAX_PACKET_LEN: u32 = 16 << 20;

/// Sequence number of the nonce packet.
pub const SEQ_NONCE: i32 = -2;
/// Sequence number of the handshake packet.
pub const SEQ_HANDSHAKE: i32 = -1;

pub const NONCE: u32 = 0x7acb_87aa;
pub const HANDSHAKE: u32 = 0x7682_eef5;
pub const HANDSHAKE_ERROR: u32 = 0x6a27_beda;
pub const PING: u32 = 0x5730_a2df;
pub const PONG: u32 = 0x8430_eaa7;

/// A decoded packet. The payload shares the input buffers.
#[derive(Debug)]
pub struct Packet {
    pub seq: i32,
    pub ty: u32,
    pub payload: RawMessage,
}

/// Outcome of one [`decode`] step.
#[derive(Debug)]
pub enum Frame {
    Packet(Packet),
    /// A keepalive or padding word was consumed.
    Filler,
    /// At least this many more bytes are needed.
    Need(usize),
}

/// Take one frame off the front of `input`.
///
/// Nothing is consumed on `Need`. On error the input is left in an
/// unspecified state; the connection is expected to be failed.
pub fn decode(
    input: &mut RawMessage,
    checksum: ChecksumKind,
    max_len: u32,
) -> Result<Frame, RpcError> {
    let mut word = [0u8; 4];
    if input.fetch_lookup(&mut word) < word.len() {
        return Ok(Frame::Need(word.len() - input.len()));
    }

    let len = u32::from_le_bytes(word);
    if len == KEEPALIVE_LEN || len == PADDING_WORD {
        input.skip(word.len());
        return Ok(Frame::Filler);
    }
    if (len as usize) < MIN_PACKET_LEN || len % 4 != 0 || len > max_len {
        return Err(RpcError::BadLength(len));
    }

    let len = len as usize;
    if input.len() < len {
        return Ok(Frame::Need(len - input.len()));
    }

    let mut frame = input.split_to(len)?;
    let computed = frame.checksum(checksum, len - TRAILER_LEN);
    let mut trailer = [0u8; TRAILER_LEN];
    frame.fetch_data_back(&mut trailer);
    let received = u32::from_le_bytes(trailer);
    if computed != received {
        RPC_CHECKSUM_ERRORS.increment();
        return Err(RpcError::BadChecksum { computed, received });
    }

    let mut header = [0u8; HEADER_LEN];
    frame.fetch_data(&mut header);
    let mut fields = &header[4..];
    let seq = fields.get_i32_le();
    let ty = fields.get_u32_le();

    Ok(Frame::Packet(Packet {
        seq,
        ty,
        payload: frame,
    }))
}

/// Wrap `payload` into a packet. The header is prepended in place and the
/// checksum appended, so the payload bytes are not copied.
pub fn encode(
    seq: i32,
    ty: u32,
    mut payload: RawMessage,
    checksum: ChecksumKind,
) -> Result<RawMessage, RpcError> {
    if payload.len() % 4 != 0 {
        return Err(RpcError::Unaligned(payload.len()));
    }
    let len = MIN_PACKET_LEN + payload.len();
    let len_word = u32::try_from(len).map_err(|_| RpcError::BadLength(u32::MAX))?;

    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_u32_le(len_word);
    header.put_i32_le(seq);
    header.put_u32_le(ty);
    payload.push_data_front(&header)?;

    let crc = payload.checksum(checksum, len - TRAILER_LEN);
    payload.push_data(&crc.to_le_bytes())?;
    Ok(payload)
}

/// Queue padding words until the connection's output reaches a cipher block
/// boundary. Does nothing on plaintext connections.
pub fn pad_output(conn: &mut Connection) -> Result<(), RpcError> {
    let needed = conn.needed_output_bytes();
    debug_assert_eq!(needed % 4, 0);
    if needed == 0 {
        return Ok(());
    }
    let mut fill = BytesMut::with_capacity(needed);
    for _ in 0..needed / 4 {
        fill.put_u32_le(PADDING_WORD);
    }
    conn.write(&fill)?;
    RPC_PADDING_BYTES.add(needed as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use io_msgbuf::BufferAllocator;

    fn alloc() -> BufferAllocator {
        BufferAllocator::with_limit(1 << 20)
    }

    fn packet(alloc: &BufferAllocator, seq: i32, ty: u32, body: &[u8]) -> RawMessage {
        let payload = RawMessage::from_slice(alloc, body).unwrap();
        encode(seq, ty, payload, ChecksumKind::Crc32).unwrap()
    }

    fn expect_packet(frame: Frame) -> Packet {
        match frame {
            Frame::Packet(p) => p,
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    #[test]
    fn layout() {
        let alloc = alloc();
        let bytes = packet(&alloc, 7, 0x1122_3344, b"abcd").to_vec();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], &20u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&bytes[12..16], b"abcd");
        let crc = ChecksumKind::Crc32.compute(&bytes[..16]);
        assert_eq!(&bytes[16..20], &crc.to_le_bytes());
    }

    #[test]
    fn decode_what_was_encoded() {
        let alloc = alloc();
        for kind in [ChecksumKind::Crc32, ChecksumKind::Crc32c] {
            let payload = RawMessage::from_slice(&alloc, b"hello world!").unwrap();
            let mut input = encode(-2, NONCE, payload, kind).unwrap();
            let p = expect_packet(decode(&mut input, kind, DEFAULT_MAX_PACKET_LEN).unwrap());
            assert_eq!((p.seq, p.ty), (-2, NONCE));
            assert_eq!(p.payload.to_vec(), b"hello world!");
            assert!(input.is_empty());
        }
    }

    #[test]
    fn flipped_payload_bit_fails_checksum() {
        let alloc = alloc();
        let bytes = packet(&alloc, 0, PING, &[0u8; 8]).to_vec();
        for bit in 0..64 {
            let mut bad = bytes.clone();
            bad[HEADER_LEN + bit / 8] ^= 1 << (bit % 8);
            let mut input = RawMessage::from_slice(&alloc, &bad).unwrap();
            let err = decode(&mut input, ChecksumKind::Crc32, DEFAULT_MAX_PACKET_LEN).unwrap_err();
            assert!(matches!(err, RpcError::BadChecksum { .. }), "bit {bit}");
        }
    }

    #[test]
    fn wrong_checksum_kind_is_rejected() {
        let alloc = alloc();
        let mut input = packet(&alloc, 0, PING, &[1u8; 8]);
        assert!(decode(&mut input, ChecksumKind::Crc32c, DEFAULT_MAX_PACKET_LEN).is_err());
    }

    #[test]
    fn partial_input_needs_more() {
        let alloc = alloc();
        let bytes = packet(&alloc, 0, PING, &[9u8; 8]).to_vec();

        let mut input = RawMessage::from_slice(&alloc, &bytes[..2]).unwrap();
        assert!(matches!(
            decode(&mut input, ChecksumKind::Crc32, DEFAULT_MAX_PACKET_LEN).unwrap(),
            Frame::Need(2)
        ));

        let mut input = RawMessage::from_slice(&alloc, &bytes[..10]).unwrap();
        assert!(matches!(
            decode(&mut input, ChecksumKind::Crc32, DEFAULT_MAX_PACKET_LEN).unwrap(),
            Frame::Need(14)
        ));
        assert_eq!(input.len(), 10);
    }

    #[test]
    fn keepalive_and_padding_are_skipped() {
        let alloc = alloc();
        let mut input = RawMessage::new(&alloc);
        input.push_data(&KEEPALIVE_LEN.to_le_bytes()).unwrap();
        input.append(packet(&alloc, 3, PONG, b"12345678")).unwrap();
        input.push_data(&PADDING_WORD.to_le_bytes()).unwrap();
        input.push_data(&PADDING_WORD.to_le_bytes()).unwrap();

        let max = DEFAULT_MAX_PACKET_LEN;
        assert!(matches!(decode(&mut input, ChecksumKind::Crc32, max).unwrap(), Frame::Filler));
        let p = expect_packet(decode(&mut input, ChecksumKind::Crc32, max).unwrap());
        assert_eq!(p.seq, 3);
        assert!(matches!(decode(&mut input, ChecksumKind::Crc32, max).unwrap(), Frame::Filler));
        assert!(matches!(decode(&mut input, ChecksumKind::Crc32, max).unwrap(), Frame::Filler));
        assert!(input.is_empty());
    }

    #[test]
    fn short_and_misaligned_lengths_are_violations() {
        let alloc = alloc();
        for len in (5u32..16).chain([18, 30]) {
            let mut input = RawMessage::from_slice(&alloc, &len.to_le_bytes()).unwrap();
            assert!(
                matches!(
                    decode(&mut input, ChecksumKind::Crc32, DEFAULT_MAX_PACKET_LEN),
                    Err(RpcError::BadLength(l)) if l == len
                ),
                "len {len}"
            );
        }
    }

    #[test]
    fn oversized_length_is_a_violation() {
        let alloc = alloc();
        let mut input = RawMessage::from_slice(&alloc, &1024u32.to_le_bytes()).unwrap();
        assert!(matches!(
            decode(&mut input, ChecksumKind::Crc32, 512),
            Err(RpcError::BadLength(1024))
        ));
    }

    #[test]
    fn unaligned_payload_is_refused() {
        let alloc = alloc();
        let payload = RawMessage::from_slice(&alloc, b"abc").unwrap();
        assert!(matches!(
            encode(0, PING, payload, ChecksumKind::Crc32),
            Err(RpcError::Unaligned(3))
        ));
    }

    #[test]
    fn encode_does_not_disturb_shared_payload() {
        let alloc = alloc();
        let original = RawMessage::from_slice(&alloc, b"shared!!").unwrap();
        let copy = original.clone();
        let framed = encode(1, PONG, copy, ChecksumKind::Crc32c).unwrap();
        assert_eq!(original.to_vec(), b"shared!!");
        assert_eq!(framed.len(), 24);
    }
}
