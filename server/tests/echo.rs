//! Integration tests for the echo server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use io_msgbuf::BufferAllocator;
use io_net::{Connection, Context, Endpoint, Engine, NetConfig, ProcessId, TargetSpec};
use protocol_tcp_rpc::{Packet, RpcConfig, RpcError, RpcHandler, RpcSession, TcpRpc};
use server::{Config, Server};

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[derive(Default)]
struct Client {
    replies: Vec<(u32, Vec<u8>)>,
}

impl RpcHandler for Client {
    type Completion = ();

    fn packet(
        &mut self,
        _conn: &mut Connection,
        _session: &mut RpcSession,
        packet: Packet,
        _cx: &mut Context<()>,
    ) -> Result<(), RpcError> {
        self.replies.push((packet.ty, packet.payload.to_vec()));
        Ok(())
    }
}

fn client(rpc: &str) -> Engine<TcpRpc<Client>> {
    let config: RpcConfig = toml::from_str(rpc).unwrap();
    Engine::new(
        TcpRpc::new(Client::default(), config).unwrap(),
        NetConfig {
            poll_timeout_ms: 2,
            ..Default::default()
        },
        BufferAllocator::with_limit(16 * 1024 * 1024),
        ProcessId::current(std::net::Ipv4Addr::LOCALHOST, 0),
    )
    .unwrap()
}

fn server_config(extra: &str) -> Config {
    toml::from_str(&format!(
        r#"
        [listen]
        endpoints = ["127.0.0.1:0"]

        [buffers]
        budget = "16MB"

        [net]
        poll_timeout_ms = 2

        {extra}
        "#
    ))
    .unwrap()
}

#[test]
fn echoes_over_aes() {
    let port = get_available_port();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = thread::spawn(move || {
        let config: Config = toml::from_str(&format!(
            r#"
            [listen]
            endpoints = ["127.0.0.1:{port}"]

            [net]
            poll_timeout_ms = 2

            [rpc]
            crypto = "aes"
            secret = "integration"
            "#
        ))
        .unwrap();
        server::run(config, &flag).unwrap();
    });

    let mut client = client("crypto = \"aes\"\nsecret = \"integration\"");
    let endpoint = Endpoint::Tcp(([127, 0, 0, 1], port).into());
    let (tid, _) = client.create_target(&TargetSpec::new(endpoint)).unwrap();

    let mut sent = false;
    for _ in 0..2000 {
        client.run_once().unwrap();
        if !sent && let Some(id) = client.ready_connection(tid) {
            client
                .with_connection(id, |_, conn, session, _| {
                    assert!(conn.is_encrypted());
                    session.send_bytes(conn, 0x0bad_cafe, b"ping me back").unwrap();
                })
                .unwrap();
            sent = true;
        }
        if !client.protocol().handler().replies.is_empty() {
            break;
        }
        // Give the server thread time to bind before the first attempt.
        thread::sleep(Duration::from_millis(1));
    }

    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap();

    let replies = &client.protocol().handler().replies;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0], (0x0bad_cafe, b"ping me back".to_vec()));
}

#[test]
fn outbound_targets_are_pinged() {
    let mut upstream = Server::new(&server_config("")).unwrap();
    let Endpoint::Tcp(addr) = upstream.listeners()[0].clone() else {
        panic!("expected a tcp listener");
    };

    let mut downstream = Server::new(&server_config(&format!(
        r#"
        [rpc]
        ping_interval_ms = 5

        [[target]]
        endpoint = "{addr}"
        "#
    )))
    .unwrap();
    assert_eq!(downstream.targets().len(), 1);

    for _ in 0..1000 {
        upstream.engine_mut().run_once().unwrap();
        downstream.engine_mut().run_once().unwrap();
        if downstream.engine().protocol().handler().pongs() >= 2 {
            break;
        }
    }
    assert!(downstream.engine().protocol().handler().pongs() >= 2);
    // Pings are answered by the protocol layer, not echoed.
    assert_eq!(upstream.engine().protocol().handler().pongs(), 0);
}

#[test]
fn listen_port_zero_reports_bound_port() {
    let server = Server::new(&server_config("")).unwrap();
    match &server.listeners()[0] {
        Endpoint::Tcp(addr) => assert_ne!(addr.port(), 0),
        other => panic!("unexpected listener {other}"),
    }
}

#[test]
fn aes_without_secret_is_rejected() {
    let err = Server::new(&server_config("[rpc]\ncrypto = \"aes\"")).err().unwrap();
    assert!(matches!(err, server::ServerError::Rpc(RpcError::Config(_))));
}
