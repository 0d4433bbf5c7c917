//! RPC server.
//!
//! Accepts framed RPC connections and echoes application packets back,
//! while keeping configured outbound targets connected and pinged.

pub mod banner;
pub mod config;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod signal;

use std::sync::atomic::AtomicBool;

use io_msgbuf::BufferAllocator;
use io_net::{Endpoint, Engine, NetError, ProcessId, TargetId};
use protocol_tcp_rpc::{RpcError, TcpRpc};

use crate::banner::{BannerConfig, print_banner};
pub use crate::config::Config;
pub use crate::handler::Echo;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
    #[error("network: {0}")]
    Net(#[from] NetError),
}

/// A configured engine with its listeners bound and targets registered.
pub struct Server {
    engine: Engine<TcpRpc<Echo>>,
    listeners: Vec<Endpoint>,
    targets: Vec<TargetId>,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;
        let (ip, port) = config.identity_addr();
        let identity = ProcessId::current(ip, port);
        let alloc = BufferAllocator::with_limit(config.buffers.budget);
        let proto = TcpRpc::new(Echo::default(), config.rpc.clone())?;
        let mut engine = Engine::new(proto, config.net.clone(), alloc, identity)?;

        let mut listeners = Vec::with_capacity(config.listen.endpoints.len());
        for endpoint in &config.listen.endpoints {
            let id = engine.listen(endpoint)?;
            // Report the bound port when the config asked for port 0.
            let bound = engine
                .listener_addr(id)
                .map(Endpoint::Tcp)
                .unwrap_or_else(|| endpoint.clone());
            tracing::info!(endpoint = %bound, "listening");
            listeners.push(bound);
        }

        let mut targets = Vec::with_capacity(config.targets.len());
        for target in &config.targets {
            let (id, _) = engine.create_target(&target.spec())?;
            tracing::info!(endpoint = %target.endpoint, "target registered");
            targets.push(id);
        }

        Ok(Self {
            engine,
            listeners,
            targets,
        })
    }

    /// Bound listen addresses, in configuration order.
    pub fn listeners(&self) -> &[Endpoint] {
        &self.listeners
    }

    pub fn targets(&self) -> &[TargetId] {
        &self.targets
    }

    pub fn engine(&self) -> &Engine<TcpRpc<Echo>> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<TcpRpc<Echo>> {
        &mut self.engine
    }

    /// Run the event loop until `shutdown` is set.
    pub fn run(mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        self.engine.run(shutdown)?;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Build a server from `config`, print the banner and run it until
/// `shutdown` is set.
pub fn run(config: Config, shutdown: &AtomicBool) -> Result<(), ServerError> {
    let server = Server::new(&config)?;

    print_banner(&BannerConfig {
        version: env!("CARGO_PKG_VERSION"),
        identity: server.engine().identity(),
        listeners: server.listeners(),
        targets: &config.targets,
        crypto: config.rpc.crypto,
        budget: config.buffers.budget,
    });

    server.run(shutdown)
}
