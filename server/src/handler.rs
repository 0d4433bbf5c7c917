//! Application behaviour of the server.

use io_net::{Connection, Context};
use protocol_tcp_rpc::{Packet, RpcError, RpcHandler, RpcSession};

use crate::metrics::{REPLIES, REQUESTS, SESSIONS, SESSIONS_ACTIVE};

/// Echoes every application packet received on an accepted connection
/// back with the same type. Outbound connections only keep their sessions
/// alive with pings.
#[derive(Debug, Default)]
pub struct Echo {
    pongs: u64,
}

impl Echo {
    /// Pongs received on outbound connections.
    pub fn pongs(&self) -> u64 {
        self.pongs
    }
}

impl RpcHandler for Echo {
    type Completion = ();

    fn ready(&mut self, conn: &mut Connection, session: &mut RpcSession, _cx: &mut Context<()>) {
        SESSIONS.increment();
        SESSIONS_ACTIVE.increment();
        tracing::debug!(
            conn = %conn.id(),
            peer = %session.peer(),
            outbound = conn.is_outbound(),
            flags = ?session.flags(),
            "session ready"
        );
    }

    fn packet(
        &mut self,
        conn: &mut Connection,
        session: &mut RpcSession,
        packet: Packet,
        _cx: &mut Context<()>,
    ) -> Result<(), RpcError> {
        REQUESTS.increment();
        if conn.is_outbound() {
            tracing::trace!(conn = %conn.id(), ty = packet.ty, "ignoring packet from target");
            return Ok(());
        }
        session.send(conn, packet.ty, packet.payload)?;
        REPLIES.increment();
        Ok(())
    }

    fn pong(&mut self, conn: &mut Connection, _session: &mut RpcSession, id: u64) {
        self.pongs += 1;
        tracing::trace!(conn = %conn.id(), id, "pong");
    }

    fn closed(&mut self, _conn: &Connection, session: &RpcSession) {
        if session.is_ready() {
            SESSIONS_ACTIVE.decrement();
        }
    }
}
