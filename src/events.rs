// Host-facing event surface.
//
// The engine never calls into the host. Events are typed values pushed onto
// an unbounded channel from the engine side (non-blocking) and drained by
// the host at its own pace. Delivery is FIFO: for any one connection,
// `Connection` precedes every `Message`, `Drain` follows the
// `Backpressure` it clears, and `ClientClosed` comes last.

use bytes::Bytes;

use crate::handshake::HandshakeInfo;

/// Identity of a connected peer, carried on every connection-scoped event.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub id: String,
    pub remote_address: String,
    /// 0 when the peer port could not be resolved.
    pub remote_port: u16,
    /// Present once a required handshake has completed.
    pub handshake: Option<HandshakeInfo>,
}

/// Events emitted by a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The listener is bound; `port` reflects the OS-assigned port when the
    /// server was configured with port 0.
    Listening {
        address: String,
        port: u16,
        family: String,
    },
    /// A peer completed adoption (and its handshake, when one is required).
    Connection { client: ClientInfo },
    /// One reassembled inbound frame (or one raw read in unframed mode).
    Message { client: ClientInfo, data: Bytes },
    /// The peer's outbound queue reached the configured threshold.
    Backpressure {
        client: ClientInfo,
        queued_bytes: usize,
        threshold: usize,
    },
    /// The peer's outbound queue drained back to empty.
    Drain { client: ClientInfo },
    /// The peer is gone; terminal for this connection.
    ClientClosed { client: ClientInfo, had_error: bool },
    /// A connection-scoped failure; the offending connection is closed.
    Error { message: String },
    /// The engine shut down.
    Closed,
}

/// Receiving half of the server's event channel.
pub type EventReceiver = crossbeam_channel::Receiver<ServerEvent>;
