//! Framing laws under random packet streams and arbitrary input.

use io_msgbuf::{BufferAllocator, ChecksumKind, RawMessage};
use proptest::prelude::*;
use protocol_tcp_rpc::packet::{self, Frame, PADDING_WORD};

const MAX_LEN: u32 = 1 << 16;

fn alloc() -> BufferAllocator {
    BufferAllocator::with_limit(64 * 1024 * 1024)
}

#[derive(Debug, Clone)]
struct Sent {
    seq: i32,
    ty: u32,
    payload: Vec<u8>,
    /// Padding words written after the packet.
    padding: usize,
}

fn sent() -> impl Strategy<Value = Sent> {
    (
        any::<i32>(),
        any::<u32>(),
        proptest::collection::vec(any::<u8>(), 0..200),
        0usize..4,
    )
        .prop_map(|(seq, ty, mut payload, padding)| {
            payload.truncate(payload.len() / 4 * 4);
            Sent {
                seq,
                ty,
                payload,
                padding,
            }
        })
}

fn checksum() -> impl Strategy<Value = ChecksumKind> {
    prop_oneof![Just(ChecksumKind::Crc32), Just(ChecksumKind::Crc32c)]
}

proptest! {
    #[test]
    fn packets_survive_any_chunking(
        packets in proptest::collection::vec(sent(), 1..8),
        chunk in 1usize..64,
        kind in checksum(),
    ) {
        let alloc = alloc();
        let mut wire = Vec::new();
        for p in &packets {
            let payload = RawMessage::from_slice(&alloc, &p.payload).unwrap();
            wire.extend(packet::encode(p.seq, p.ty, payload, kind).unwrap().to_vec());
            for _ in 0..p.padding {
                wire.extend(PADDING_WORD.to_le_bytes());
            }
        }

        let mut input = RawMessage::new(&alloc);
        let mut got = Vec::new();
        for piece in wire.chunks(chunk) {
            input.push_data(piece).unwrap();
            loop {
                let before = input.len();
                match packet::decode(&mut input, kind, MAX_LEN).unwrap() {
                    Frame::Packet(p) => got.push((p.seq, p.ty, p.payload.to_vec())),
                    Frame::Filler => {}
                    Frame::Need(n) => {
                        prop_assert!(n > 0);
                        prop_assert_eq!(input.len(), before);
                        break;
                    }
                }
            }
        }

        prop_assert!(input.is_empty());
        let expected: Vec<_> = packets
            .iter()
            .map(|p| (p.seq, p.ty, p.payload.clone()))
            .collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn arbitrary_input_never_panics(
        bytes in proptest::collection::vec(any::<u8>(), 0..256),
        kind in checksum(),
    ) {
        let alloc = alloc();
        let mut input = RawMessage::from_slice(&alloc, &bytes).unwrap();
        for _ in 0..bytes.len() + 1 {
            let before = input.len();
            match packet::decode(&mut input, kind, MAX_LEN) {
                Ok(Frame::Need(_)) => {
                    prop_assert_eq!(input.len(), before);
                    break;
                }
                Ok(_) => prop_assert!(input.len() < before),
                Err(_) => break,
            }
        }
    }
}
