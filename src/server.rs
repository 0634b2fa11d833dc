// Length-framed TCP server engine.
//
// All socket state lives on one dedicated engine thread running a
// current-thread runtime: the accept loop and every per-connection
// reader/writer task are scheduled on that single thread. Facade methods
// called from arbitrary threads touch only the registry behind the engine
// mutex (push onto a send queue, flip a flag, wake a writer) and never
// block on I/O.
//
// Inbound pipeline: read -> frame reassembly -> handshake gate (first frame
// when a protocol version is configured) -> `Message` events.
// Outbound pipeline: facade enqueues framed blobs under the mutex and
// notifies the writer task, which pops one blob at a time; backpressure
// latches at the configured threshold and `drain` fires when the queue
// empties.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerOptions;
use crate::connection::ConnectionEntry;
use crate::events::{ClientInfo, EventReceiver, ServerEvent};
use crate::frame::{encode_frame, FrameDecoder};
use crate::handshake::verify_handshake;
use crate::tls::{self, TlsSetupError};

/// Idle tick of the engine loop.
const SERVICE_TICK: Duration = Duration::from_millis(50);

/// Per-read scratch buffer size.
const READ_CHUNK: usize = 16 * 1024;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ServerError {
    AlreadyListening,
    Bind(io::Error),
    Tls(TlsSetupError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyListening => write!(f, "server already listening"),
            Self::Bind(e) => write!(f, "failed to bind listener: {e}"),
            Self::Tls(e) => write!(f, "TLS setup failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<TlsSetupError> for ServerError {
    fn from(e: TlsSetupError) -> Self {
        Self::Tls(e)
    }
}

// ---------------------------------------------------------------------------
// Listen metadata
// ---------------------------------------------------------------------------

/// Resolved listener address reported by [`Server::listen`] and the
/// `listening` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub address: String,
    pub port: u16,
    pub family: String,
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    connections: HashMap<String, ConnectionEntry>,
    next_id: u64,
}

struct EngineShared {
    options: ServerOptions,
    /// The engine mutex: connection table + every per-connection send
    /// queue. Held only for brief mutations, never across an await.
    registry: Mutex<Registry>,
    events: Sender<ServerEvent>,
    shutdown: CancellationToken,
    acceptor: Option<TlsAcceptor>,
    closing: AtomicBool,
}

impl EngineShared {
    fn send_event(&self, event: ServerEvent) {
        // Unbounded channel: never blocks the engine. A dropped receiver
        // just discards events.
        let _ = self.events.send(event);
    }
}

struct EngineHandle {
    shared: Arc<EngineShared>,
    worker: thread::JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Server facade
// ---------------------------------------------------------------------------

/// A length-framed TCP messaging server.
///
/// Construct with [`Server::new`], subscribe to [`Server::events`], then
/// [`Server::listen`]. All methods are callable from any thread.
pub struct Server {
    options: ServerOptions,
    event_tx: Sender<ServerEvent>,
    event_rx: EventReceiver,
    engine: Option<EngineHandle>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        Self {
            options,
            event_tx,
            event_rx,
            engine: None,
        }
    }

    /// The event stream. Clones share one queue; take the receiver once and
    /// drain it from a single place to preserve ordering.
    pub fn events(&self) -> EventReceiver {
        self.event_rx.clone()
    }

    /// Bind the listener and start the engine thread. Configuration and
    /// bind failures are synchronous. Emits `listening` with the resolved
    /// address; a requested port of 0 reports the OS-assigned port.
    pub fn listen(&mut self) -> Result<ListenAddr, ServerError> {
        if self.engine.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let addr = resolve_bind_addr(&self.options.host, self.options.port)
            .map_err(ServerError::Bind)?;
        let listener = std::net::TcpListener::bind(addr).map_err(ServerError::Bind)?;
        listener.set_nonblocking(true).map_err(ServerError::Bind)?;
        let local = listener.local_addr().map_err(ServerError::Bind)?;

        let acceptor = if self.options.tls.is_active() {
            Some(tls::build_acceptor(&self.options.tls)?)
        } else {
            None
        };

        let shared = Arc::new(EngineShared {
            options: self.options.clone(),
            registry: Mutex::new(Registry::default()),
            events: self.event_tx.clone(),
            shutdown: CancellationToken::new(),
            acceptor,
            closing: AtomicBool::new(false),
        });

        let engine_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("framewire-engine".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("failed to build engine runtime: {e}");
                        return;
                    }
                };
                rt.block_on(engine_main(listener, engine_shared));
            })
            .map_err(|e| ServerError::Bind(io::Error::new(io::ErrorKind::Other, e)))?;

        self.engine = Some(EngineHandle { shared, worker });

        let listen_addr = ListenAddr {
            address: local.ip().to_string(),
            port: local.port(),
            family: if local.is_ipv4() { "IPv4" } else { "IPv6" }.to_string(),
        };
        log::info!("listening on {}:{}", listen_addr.address, listen_addr.port);
        let _ = self.event_tx.send(ServerEvent::Listening {
            address: listen_addr.address.clone(),
            port: listen_addr.port,
            family: listen_addr.family.clone(),
        });
        Ok(listen_addr)
    }

    /// Frame the payload once and append it to every connection's send
    /// queue, latching per-connection backpressure where the threshold is
    /// crossed. A server that is not listening (or has no connections) is
    /// a no-op.
    pub fn broadcast(&self, data: &[u8]) {
        let Some(handle) = &self.engine else { return };
        let shared = &handle.shared;
        let frame = if shared.options.length_prefixed {
            encode_frame(data)
        } else {
            Bytes::copy_from_slice(data)
        };
        let threshold = shared.options.max_backpressure_bytes;

        let mut registry = shared.registry.lock().unwrap();
        for entry in registry.connections.values_mut() {
            if entry.queue.is_closing() {
                continue;
            }
            if entry.queue.push(frame.clone(), threshold) {
                // Emitted under the engine mutex so the writer cannot
                // interleave a drain ahead of this.
                shared.send_event(ServerEvent::Backpressure {
                    client: entry.info.clone(),
                    queued_bytes: entry.queue.queued_bytes(),
                    threshold,
                });
            }
            entry.writable.notify_one();
        }
    }

    /// Broadcast a JSON value rendered with `serde_json`.
    pub fn broadcast_json(&self, value: &serde_json::Value) {
        self.broadcast(value.to_string().as_bytes());
    }

    /// Snapshot of a connection's identity, or `None` when unknown.
    pub fn connection(&self, id: &str) -> Option<ClientInfo> {
        let handle = self.engine.as_ref()?;
        let registry = handle.shared.registry.lock().unwrap();
        registry.connections.get(id).map(|e| e.info.clone())
    }

    pub fn connection_count(&self) -> usize {
        match &self.engine {
            Some(handle) => handle.shared.registry.lock().unwrap().connections.len(),
            None => 0,
        }
    }

    /// Mark a connection for teardown and wake its writer so the engine
    /// closes the socket. Returns false when the id is unknown.
    pub fn close_connection(&self, id: &str) -> bool {
        let Some(handle) = &self.engine else {
            return false;
        };
        let mut registry = handle.shared.registry.lock().unwrap();
        match registry.connections.get_mut(id) {
            Some(entry) => {
                entry.queue.mark_closing();
                entry.writable.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stop the engine: break the loop, join the thread, drop every
    /// connection (queued outbound frames included), emit `close`.
    pub fn close(&mut self) {
        let Some(handle) = self.engine.take() else {
            return;
        };
        handle.shared.closing.store(true, Ordering::SeqCst);
        handle.shared.shutdown.cancel();
        if handle.worker.join().is_err() {
            log::error!("engine thread panicked during shutdown");
        }
        handle.shared.registry.lock().unwrap().connections.clear();
        let _ = self.event_tx.send(ServerEvent::Closed);
        log::info!("server closed");
    }

    /// Accepted for API compatibility; teardown is immediate regardless of
    /// the deadline (graceful draining is out of contract).
    pub fn shutdown(&mut self, _graceful_ms: u64) {
        self.close();
    }

    /// True while the engine thread is alive. A spontaneous engine exit
    /// (listener failure) reads as not listening.
    pub fn is_listening(&self) -> bool {
        self.engine
            .as_ref()
            .map_or(false, |handle| !handle.worker.is_finished())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Engine loop
// ---------------------------------------------------------------------------

async fn engine_main(listener: std::net::TcpListener, shared: Arc<EngineShared>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to adopt listener: {e}");
            shared.send_event(ServerEvent::Error {
                message: format!("listener setup failed: {e}"),
            });
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let keepalive = TcpKeepalive::new()
                        .with_time(Duration::from_secs(10))
                        .with_interval(Duration::from_secs(5));
                    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

                    let conn_shared = shared.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, conn_shared).await;
                    });
                }
                Err(e) => {
                    if shared.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = tokio::time::sleep(SERVICE_TICK) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection pipeline
// ---------------------------------------------------------------------------

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<EngineShared>) {
    let (reader, writer): (BoxRead, BoxWrite) = match &shared.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r) as BoxRead, Box::new(w) as BoxWrite)
            }
            Err(e) => {
                // Never adopted: no events for a failed TLS handshake.
                log::warn!("TLS accept failed for {addr}: {e}");
                return;
            }
        },
        None => {
            let (r, w) = stream.into_split();
            (Box::new(r) as BoxRead, Box::new(w) as BoxWrite)
        }
    };

    let handshake_required = shared.options.handshake_required();
    let writable = Arc::new(Notify::new());
    let cancel = shared.shutdown.child_token();

    let mut client = ClientInfo {
        id: String::new(),
        remote_address: addr.ip().to_string(),
        remote_port: addr.port(),
        handshake: None,
    };
    {
        let mut registry = shared.registry.lock().unwrap();
        registry.next_id += 1;
        client.id = generate_id(registry.next_id);
        registry.connections.insert(
            client.id.clone(),
            ConnectionEntry::new(client.clone(), writable.clone()),
        );
    }
    log::debug!("adopted {} from {addr}", client.id);

    if !handshake_required {
        shared.send_event(ServerEvent::Connection {
            client: client.clone(),
        });
    }

    let write_task = tokio::spawn(write_loop(
        writer,
        client.id.clone(),
        shared.clone(),
        cancel.clone(),
        writable,
    ));
    read_loop(reader, &mut client, handshake_required, &shared, &cancel).await;

    cancel.cancel();
    let _ = write_task.await;

    let removed = {
        let mut registry = shared.registry.lock().unwrap();
        registry.connections.remove(&client.id)
    };
    if let Some(entry) = removed {
        log::debug!("closed {}", entry.info.id);
        shared.send_event(ServerEvent::ClientClosed {
            client: entry.info,
            had_error: false,
        });
    }
}

async fn read_loop(
    mut reader: BoxRead,
    client: &mut ClientInfo,
    handshake_required: bool,
    shared: &Arc<EngineShared>,
    cancel: &CancellationToken,
) {
    let mut decoder = FrameDecoder::new(shared.options.effective_max_frame_length());
    let mut handshake_complete = !handshake_required;
    let mut buf = vec![0u8; READ_CHUNK];

    'outer: loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log::debug!("read error on {}: {e}", client.id);
                    break;
                }
            }
        };

        if !shared.options.length_prefixed {
            shared.send_event(ServerEvent::Message {
                client: client.clone(),
                data: Bytes::copy_from_slice(&buf[..n]),
            });
            continue;
        }

        let mut frames = Vec::new();
        let feed_result = decoder.feed(&buf[..n], &mut frames);

        for frame in frames {
            if !handshake_complete {
                let value: serde_json::Value = match serde_json::from_slice(&frame) {
                    Ok(v) => v,
                    Err(e) => {
                        shared.send_event(ServerEvent::Error {
                            message: format!("invalid handshake JSON: {e}"),
                        });
                        break 'outer;
                    }
                };
                let info = match verify_handshake(
                    &value,
                    Some(shared.options.protocol_version.as_str()),
                ) {
                    Ok(info) => info,
                    Err(e) => {
                        shared.send_event(ServerEvent::Error {
                            message: e.to_string(),
                        });
                        break 'outer;
                    }
                };
                handshake_complete = true;
                client.handshake = Some(info);
                {
                    let mut registry = shared.registry.lock().unwrap();
                    if let Some(entry) = registry.connections.get_mut(&client.id) {
                        entry.info.handshake = client.handshake.clone();
                    }
                }
                log::debug!("handshake complete on {}", client.id);
                shared.send_event(ServerEvent::Connection {
                    client: client.clone(),
                });
            } else {
                shared.send_event(ServerEvent::Message {
                    client: client.clone(),
                    data: frame,
                });
            }
        }

        // Frames decoded ahead of a bad length prefix were delivered above;
        // the protocol error itself is fatal for the connection.
        if let Err(e) = feed_result {
            shared.send_event(ServerEvent::Error {
                message: e.to_string(),
            });
            break;
        }
    }
}

enum WriteStep {
    Frame(Bytes),
    Closing,
    Idle,
}

async fn write_loop(
    mut writer: BoxWrite,
    id: String,
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    writable: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = writable.notified() => {}
            _ = cancel.cancelled() => break,
        }

        loop {
            let step = {
                let mut registry = shared.registry.lock().unwrap();
                match registry.connections.get_mut(&id) {
                    None => return,
                    Some(entry) => {
                        if entry.queue.is_closing() {
                            WriteStep::Closing
                        } else {
                            match entry.queue.pop() {
                                Some(frame) => WriteStep::Frame(frame),
                                None => WriteStep::Idle,
                            }
                        }
                    }
                }
            };

            match step {
                WriteStep::Idle => break,
                WriteStep::Closing => {
                    let _ = writer.shutdown().await;
                    cancel.cancel();
                    return;
                }
                WriteStep::Frame(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        // Failed writes close the connection silently; the
                        // read side observes the teardown.
                        cancel.cancel();
                        return;
                    }
                    let drained = {
                        let mut registry = shared.registry.lock().unwrap();
                        match registry.connections.get_mut(&id) {
                            None => return,
                            Some(entry) => {
                                if entry.queue.check_drained() {
                                    Some(entry.info.clone())
                                } else {
                                    None
                                }
                            }
                        }
                    };
                    if let Some(client) = drained {
                        shared.send_event(ServerEvent::Drain { client });
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Connection ids combine a monotone counter, a wall-clock timestamp, and a
/// random suffix, staying unique across engine restarts within a session.
fn generate_id(seq: u64) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("conn-{seq}-{millis}-{}", &suffix[..8])
}

fn resolve_bind_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve '{host}'")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
