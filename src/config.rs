// Endpoint configuration.
//
// Options are plain structs, immutable once `listen`/`connect` has been
// called. Supplying certificate material implies TLS even when the
// `enabled` flag was left unset, matching the facade contract.

pub use crate::frame::DEFAULT_MAX_FRAME_LENGTH;

/// Default outbound-queue threshold before `backpressure` fires: 5 MiB.
pub const DEFAULT_MAX_BACKPRESSURE_BYTES: usize = 5 * 1024 * 1024;

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// Transport security settings shared by server and client endpoints.
/// All materials are in-memory PEM blobs.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub enabled: bool,
    /// Server side: require a valid client certificate (validated against
    /// `ca`).
    pub request_cert: bool,
    /// Client side: verify the server certificate chain. Disabling this
    /// accepts any certificate.
    pub reject_unauthorized: bool,
    /// ALPN protocols, advertised in the order given.
    pub alpn_protocols: Vec<String>,
    /// Unlocks a passphrase-encrypted PKCS#8 private key.
    pub passphrase: Option<String>,
    pub ca: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            request_cert: false,
            reject_unauthorized: true,
            alpn_protocols: Vec::new(),
            passphrase: None,
            ca: None,
            cert: None,
            key: None,
        }
    }
}

impl TlsOptions {
    /// TLS is in effect when explicitly enabled or when key material was
    /// provided.
    pub fn is_active(&self) -> bool {
        self.enabled || self.cert.is_some() || self.key.is_some()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interface to bind; empty binds all interfaces.
    pub host: String,
    /// 0 lets the OS pick; the assigned port surfaces in the `listening`
    /// event.
    pub port: u16,
    pub tls: TlsOptions,
    /// When false the endpoint is a raw byte pipe: reads are delivered
    /// as-is and no handshake gating applies.
    pub length_prefixed: bool,
    /// Maximum inbound frame length in bytes; 0 means the 4 MiB default.
    pub max_frame_length: usize,
    /// Outbound queue threshold that latches `backpressure`.
    pub max_backpressure_bytes: usize,
    /// Non-empty requires the first frame of every connection to be a
    /// handshake announcing a compatible version.
    pub protocol_version: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            tls: TlsOptions::default(),
            length_prefixed: true,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_backpressure_bytes: DEFAULT_MAX_BACKPRESSURE_BYTES,
            protocol_version: String::new(),
        }
    }
}

impl ServerOptions {
    pub(crate) fn effective_max_frame_length(&self) -> usize {
        if self.max_frame_length == 0 {
            DEFAULT_MAX_FRAME_LENGTH
        } else {
            self.max_frame_length
        }
    }

    pub(crate) fn handshake_required(&self) -> bool {
        !self.protocol_version.is_empty() && self.length_prefixed
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub tls: TlsOptions,
    /// Overrides the SNI name (defaults to `host`).
    pub tls_server_name: Option<String>,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: TlsOptions::default(),
            tls_server_name: None,
        }
    }
}
