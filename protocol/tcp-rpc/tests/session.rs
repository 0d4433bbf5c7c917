//! End-to-end sessions between two engines over localhost.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use io_msgbuf::{BufferAllocator, ChecksumKind, RawMessage};
use io_net::{ConnId, Connection, Context, Endpoint, Engine, NetConfig, ProcessId, TargetSpec};
use protocol_tcp_rpc::packet::{self, Frame, HANDSHAKE, HANDSHAKE_ERROR, NONCE};
use protocol_tcp_rpc::{
    CryptoSchema, ERR_BAD_LENGTH, ERR_HANDSHAKE_REJECTED, ERR_PEER_HANDSHAKE,
    HandshakeErrorPacket, HandshakeFlags, HandshakePacket, NoncePacket, Packet, RpcConfig,
    RpcError, RpcHandler, RpcSession, TcpRpc,
};

const APP: u32 = 0x1234_5678;

#[derive(Default)]
struct Recorder {
    echo: bool,
    ready: Vec<ConnId>,
    packets: Vec<(ConnId, i32, u32, Vec<u8>)>,
    pongs: Vec<u64>,
    closed: Vec<(ConnId, i32)>,
}

impl RpcHandler for Recorder {
    type Completion = ();

    fn ready(&mut self, conn: &mut Connection, _session: &mut RpcSession, _cx: &mut Context<()>) {
        self.ready.push(conn.id());
    }

    fn packet(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        _cx: &mut Context<()>,
    ) -> Result<(), RpcError> {
        self.packets
            .push((conn.id(), packet.seq, packet.ty, packet.payload.to_vec()));
        if self.echo {
            session.send(conn, packet.ty, packet.payload)?;
        }
        Ok(())
    }

    fn pong(&mut self, _conn: &mut Connection, _session: &mut RpcSession, id: u64) {
        self.pongs.push(id);
    }

    fn closed(&mut self, conn: &Connection, _session: &RpcSession) {
        self.closed.push((conn.id(), conn.error()));
    }
}

type Rpc = Engine<TcpRpc<Recorder>>;

fn identity(pid: i16) -> ProcessId {
    ProcessId {
        ip: u32::from(std::net::Ipv4Addr::LOCALHOST),
        port: 0,
        pid,
        utime: 1_700_000_000,
    }
}

fn engine(pid: i16, echo: bool, rpc: &str) -> Rpc {
    let config: RpcConfig = toml::from_str(rpc).unwrap();
    let proto = TcpRpc::new(
        Recorder {
            echo,
            ..Default::default()
        },
        config,
    )
    .unwrap();
    Engine::new(
        proto,
        NetConfig {
            poll_timeout_ms: 2,
            max_reconnect_interval_ms: 200,
            ..Default::default()
        },
        BufferAllocator::with_limit(64 * 1024 * 1024),
        identity(pid),
    )
    .unwrap()
}

fn listen(engine: &mut Rpc) -> SocketAddr {
    let id = engine
        .listen(&Endpoint::Tcp("127.0.0.1:0".parse().unwrap()))
        .unwrap();
    engine.listener_addr(id).unwrap()
}

fn drive(a: &mut Rpc, b: &mut Rpc, mut done: impl FnMut(&Rpc, &Rpc) -> bool) -> bool {
    for _ in 0..500 {
        a.run_once().unwrap();
        b.run_once().unwrap();
        if done(a, b) {
            return true;
        }
    }
    false
}

fn handler(engine: &Rpc) -> &Recorder {
    engine.protocol().handler()
}

#[test]
fn aes_session_round_trips_application_packets() {
    let rpc = "crypto = \"aes\"\nsecret = \"correct horse\"";
    let mut server = engine(1, true, rpc);
    let mut client = engine(2, false, rpc);
    let addr = listen(&mut server);

    let (tid, _) = client
        .create_target(&TargetSpec::new(Endpoint::Tcp(addr)))
        .unwrap();
    assert!(drive(&mut server, &mut client, |_, c| {
        c.target(tid).unwrap().active_outbound_connections() == 1
    }));

    let out = client.ready_connection(tid).unwrap();
    client
        .with_connection(out, |_, conn, session, _| {
            assert!(conn.is_encrypted());
            assert_eq!(session.schema(), CryptoSchema::Aes);
            assert_eq!(session.checksum(), ChecksumKind::Crc32c);
            assert_eq!(session.peer().pid, 1);
            session.send_bytes(conn, APP, b"hello, rpc!!").unwrap();
            session.send_bytes(conn, APP, b"again...").unwrap();
        })
        .unwrap();

    assert!(drive(&mut server, &mut client, |_, c| handler(c).packets.len() == 2));

    let got = &handler(&client).packets;
    assert_eq!(got[0], (out, 0, APP, b"hello, rpc!!".to_vec()));
    assert_eq!(got[1], (out, 1, APP, b"again...".to_vec()));
    assert_eq!(handler(&server).packets.len(), 2);
    assert_eq!(handler(&server).ready.len(), 1);
}

#[test]
fn mismatched_peer_pid_gets_handshake_error() {
    let mut server = engine(1, true, "crypto = \"none\"");
    let mut client = engine(2, false, "crypto = \"none\"\n[peer]\npid = 999");
    let addr = listen(&mut server);

    client
        .create_target(&TargetSpec {
            reconnect_timeout: Duration::from_secs(5),
            ..TargetSpec::new(Endpoint::Tcp(addr))
        })
        .unwrap();

    assert!(drive(&mut server, &mut client, |s, c| {
        !handler(s).closed.is_empty() && !handler(c).closed.is_empty()
    }));

    assert_eq!(handler(&server).closed[0].1, ERR_HANDSHAKE_REJECTED);
    assert_eq!(handler(&client).closed[0].1, ERR_PEER_HANDSHAKE);
    assert!(handler(&client).ready.is_empty());
    assert!(handler(&server).ready.is_empty());
}

#[test]
fn unshared_key_falls_back_to_plaintext_when_allowed() {
    let mut server = engine(1, true, "crypto = \"none_or_aes\"\nsecret = \"one\"");
    let mut client = engine(2, false, "crypto = \"none_or_aes\"\nsecret = \"two\"");
    let addr = listen(&mut server);

    let (tid, _) = client
        .create_target(&TargetSpec::new(Endpoint::Tcp(addr)))
        .unwrap();
    assert!(drive(&mut server, &mut client, |_, c| {
        c.ready_connection(tid).is_some()
    }));

    let out = client.ready_connection(tid).unwrap();
    client
        .with_connection(out, |_, conn, session, _| {
            assert!(!conn.is_encrypted());
            assert_eq!(session.schema(), CryptoSchema::None);
        })
        .unwrap();
}

#[test]
fn pings_are_answered() {
    let mut server = engine(1, false, "crypto = \"none\"");
    let mut client = engine(2, false, "crypto = \"none\"\nping_interval_ms = 5");
    let addr = listen(&mut server);

    client
        .create_target(&TargetSpec::new(Endpoint::Tcp(addr)))
        .unwrap();
    assert!(drive(&mut server, &mut client, |_, c| handler(c).pongs.len() >= 2));

    assert_eq!(&handler(&client).pongs[..2], &[0, 1]);
    // Pings never reach the application.
    assert!(handler(&server).packets.is_empty());
    assert!(client.query_count() <= 1);
}

/// Read one frame from a blocking socket.
fn read_frame(stream: &mut TcpStream, checksum: ChecksumKind, alloc: &BufferAllocator) -> Packet {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let mut rest = vec![0u8; u32::from_le_bytes(len) as usize - 4];
    stream.read_exact(&mut rest).unwrap();

    let mut input = RawMessage::from_slice(alloc, &len).unwrap();
    input.push_data(&rest).unwrap();
    match packet::decode(&mut input, checksum, 1 << 20).unwrap() {
        Frame::Packet(p) => p,
        other => panic!("expected a packet, got {other:?}"),
    }
}

fn write_frame(
    stream: &mut TcpStream,
    alloc: &BufferAllocator,
    seq: i32,
    ty: u32,
    payload: &[u8],
    checksum: ChecksumKind,
) {
    let payload = RawMessage::from_slice(alloc, payload).unwrap();
    let frame = packet::encode(seq, ty, payload, checksum).unwrap();
    stream.write_all(&frame.to_vec()).unwrap();
}

#[test]
fn plaintext_wire_exchange_switches_to_crc32c() {
    let mut server = engine(1, true, "crypto = \"none\"");
    let addr = listen(&mut server);

    let worker = std::thread::spawn(move || {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let nonce = NoncePacket {
            key_select: 0,
            schema: CryptoSchema::None,
            crypto_ts: 0,
            nonce: [5; 16],
        };
        write_frame(&mut stream, &alloc, -2, NONCE, &nonce.encode(), ChecksumKind::Crc32);
        let reply = read_frame(&mut stream, ChecksumKind::Crc32, &alloc);
        assert_eq!((reply.seq, reply.ty), (-2, NONCE));
        let reply = NoncePacket::decode(&reply.payload.to_vec()).unwrap();
        assert_eq!(reply.schema, CryptoSchema::None);

        let hs = HandshakePacket {
            flags: HandshakeFlags::CRC32C | HandshakeFlags::QUICK_ACK,
            sender_pid: identity(7),
            peer_pid: ProcessId::default(),
        };
        write_frame(&mut stream, &alloc, -1, HANDSHAKE, &hs.encode(), ChecksumKind::Crc32);
        let reply = read_frame(&mut stream, ChecksumKind::Crc32, &alloc);
        assert_eq!((reply.seq, reply.ty), (-1, HANDSHAKE));
        let reply = HandshakePacket::decode(&reply.payload.to_vec()).unwrap();
        assert_eq!(reply.flags, HandshakeFlags::CRC32C);
        assert_eq!(reply.sender_pid.pid, 1);
        assert_eq!(reply.peer_pid, identity(7));

        stream.write_all(&4u32.to_le_bytes()).unwrap();
        write_frame(&mut stream, &alloc, 0, APP, b"echo", ChecksumKind::Crc32c);
        let echoed = read_frame(&mut stream, ChecksumKind::Crc32c, &alloc);
        assert_eq!((echoed.seq, echoed.ty), (0, APP));
        assert_eq!(echoed.payload.to_vec(), b"echo");
    });

    for _ in 0..2000 {
        server.run_once().unwrap();
        if worker.is_finished() {
            break;
        }
    }
    worker.join().unwrap();
    assert_eq!(handler(&server).packets.len(), 1);
}

#[test]
fn rejected_handshake_is_answered_with_error_code_only() {
    let mut server = engine(1, false, "crypto = \"none\"\n[peer]\npid = 999");
    let addr = listen(&mut server);

    let worker = std::thread::spawn(move || {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let nonce = NoncePacket {
            key_select: 0,
            schema: CryptoSchema::None,
            crypto_ts: 0,
            nonce: [9; 16],
        };
        write_frame(&mut stream, &alloc, -2, NONCE, &nonce.encode(), ChecksumKind::Crc32);
        let reply = read_frame(&mut stream, ChecksumKind::Crc32, &alloc);
        assert_eq!((reply.seq, reply.ty), (-2, NONCE));

        let hs = HandshakePacket {
            flags: HandshakeFlags::empty(),
            sender_pid: identity(7),
            peer_pid: ProcessId::default(),
        };
        write_frame(&mut stream, &alloc, -1, HANDSHAKE, &hs.encode(), ChecksumKind::Crc32);
        let reply = read_frame(&mut stream, ChecksumKind::Crc32, &alloc);
        assert_eq!((reply.seq, reply.ty), (-1, HANDSHAKE_ERROR));
        let payload = reply.payload.to_vec();
        assert_eq!(payload, ERR_HANDSHAKE_REJECTED.to_le_bytes());
        assert_eq!(
            HandshakeErrorPacket::decode(&payload).unwrap().error_code,
            ERR_HANDSHAKE_REJECTED
        );
    });

    for _ in 0..2000 {
        server.run_once().unwrap();
        if worker.is_finished() {
            break;
        }
    }
    worker.join().unwrap();
    assert!(handler(&server).ready.is_empty());
}

#[test]
fn short_length_word_fails_the_connection() {
    let mut server = engine(1, false, "crypto = \"none\"");
    let addr = listen(&mut server);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&8u32.to_le_bytes()).unwrap();
    stream.write_all(&[0u8; 4]).unwrap();

    for _ in 0..500 {
        server.run_once().unwrap();
        if !handler(&server).closed.is_empty() {
            break;
        }
    }
    assert_eq!(handler(&server).closed.len(), 1);
    assert_eq!(handler(&server).closed[0].1, ERR_BAD_LENGTH);
}
