//! Length-framed TCP messaging endpoints.
//!
//! A [`Server`] multiplexes many connections on one engine thread:
//! 4-byte big-endian length-prefixed frames, optional TLS, an optional
//! first-frame handshake (plain or ed25519-attested), bounded outbound
//! queues with backpressure/drain signaling, and typed [`ServerEvent`]s
//! delivered over a channel the host drains. The matching [`Client`] is a
//! raw byte pipe with the same worker-thread model.

mod canonical;
mod client;
mod config;
mod connection;
mod events;
pub mod frame;
pub mod handshake;
mod server;
mod tls;

pub use canonical::to_canonical_json;
pub use client::{Client, ClientError};
pub use config::{
    ClientOptions, ServerOptions, TlsOptions, DEFAULT_MAX_BACKPRESSURE_BYTES,
    DEFAULT_MAX_FRAME_LENGTH,
};
pub use events::{ClientInfo, EventReceiver, ServerEvent};
pub use frame::{encode_frame, FrameDecoder, FrameError};
pub use handshake::{n_index, neg_hash, verify_handshake, HandshakeError, HandshakeInfo};
pub use server::{ListenAddr, Server, ServerError};
pub use tls::TlsSetupError;
