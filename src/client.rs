// Raw-byte TCP/TLS client endpoint.
//
// The client is a byte pipe: `send` enqueues bytes and wakes the writer,
// `recv` polls a queue of received chunks. Framing is the caller's concern
// (see the `frame` module). One worker thread per client runs a
// current-thread runtime that owns the socket.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::connection::SendQueue;
use crate::tls::{self, TlsSetupError};

const READ_CHUNK: usize = 16 * 1024;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ClientError {
    Connect(io::Error),
    Tls(TlsSetupError),
    /// The TLS server name (SNI) is not a valid DNS name or IP address.
    BadServerName(String),
    NotConnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Tls(e) => write!(f, "TLS setup failed: {e}"),
            Self::BadServerName(name) => write!(f, "invalid TLS server name '{name}'"),
            Self::NotConnected => write!(f, "client is not connected"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TlsSetupError> for ClientError {
    fn from(e: TlsSetupError) -> Self {
        Self::Tls(e)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ClientShared {
    send: Mutex<SendQueue>,
    recv: Mutex<VecDeque<Vec<u8>>>,
    recv_cv: Condvar,
    writable: Notify,
    connected: AtomicBool,
    closing: AtomicBool,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A connected client endpoint. `connect` blocks until the TCP (and TLS,
/// when configured) handshake completes; `send`/`recv` never block on I/O.
pub struct Client {
    shared: Arc<ClientShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Client {
    pub fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let addr = resolve_addr(&options.host, options.port).map_err(ClientError::Connect)?;

        let connector = if options.tls.is_active() {
            let name = options
                .tls_server_name
                .clone()
                .unwrap_or_else(|| options.host.clone());
            let server_name = ServerName::try_from(name.clone())
                .map_err(|_| ClientError::BadServerName(name))?;
            Some((tls::build_connector(&options.tls)?, server_name))
        } else {
            None
        };

        let shared = Arc::new(ClientShared {
            send: Mutex::new(SendQueue::new()),
            recv: Mutex::new(VecDeque::new()),
            recv_cv: Condvar::new(),
            writable: Notify::new(),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), ClientError>>(1);
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("framewire-client".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ClientError::Connect(io::Error::new(
                            io::ErrorKind::Other,
                            e,
                        ))));
                        return;
                    }
                };
                rt.block_on(client_main(addr, connector, worker_shared, ready_tx));
            })
            .map_err(|e| ClientError::Connect(io::Error::new(io::ErrorKind::Other, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(ClientError::Connect(io::Error::new(
                    io::ErrorKind::Other,
                    "client worker exited before connecting",
                )))
            }
        }
    }

    /// Queue bytes for transmission and wake the writer. Empty payloads are
    /// a no-op.
    pub fn send(&self, data: &[u8]) -> Result<(), ClientError> {
        if self.shared.closing.load(Ordering::SeqCst)
            || !self.shared.connected.load(Ordering::SeqCst)
        {
            return Err(ClientError::NotConnected);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.shared
            .send
            .lock()
            .unwrap()
            .push(Bytes::copy_from_slice(data), usize::MAX);
        self.shared.writable.notify_one();
        Ok(())
    }

    /// Pop the oldest received chunk without blocking. Returns an empty
    /// buffer when nothing is pending. A non-zero `limit` truncates the
    /// returned chunk.
    pub fn recv(&self, limit: usize) -> Vec<u8> {
        let mut queue = self.shared.recv.lock().unwrap();
        match queue.pop_front() {
            Some(mut chunk) => {
                if limit > 0 && chunk.len() > limit {
                    chunk.truncate(limit);
                }
                chunk
            }
            None => Vec::new(),
        }
    }

    /// Like [`recv`](Self::recv) but waits up to `timeout` for data.
    pub fn recv_timeout(&self, limit: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.shared.recv.lock().unwrap();
        loop {
            if let Some(mut chunk) = queue.pop_front() {
                if limit > 0 && chunk.len() > limit {
                    chunk.truncate(limit);
                }
                return Some(chunk);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .shared
                .recv_cv
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Immediate teardown: abandons queued sends, drops buffered receives,
    /// joins the worker.
    pub fn close(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.recv.lock().unwrap().clear();
        while self.shared.send.lock().unwrap().pop().is_some() {}
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn client_main(
    addr: SocketAddr,
    connector: Option<(TlsConnector, ServerName<'static>)>,
    shared: Arc<ClientShared>,
    ready_tx: std::sync::mpsc::SyncSender<Result<(), ClientError>>,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(ClientError::Connect(e)));
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let (mut reader, writer): (BoxRead, BoxWrite) = match connector {
        Some((connector, server_name)) => match connector.connect(server_name, stream).await {
            Ok(tls_stream) => {
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r) as BoxRead, Box::new(w) as BoxWrite)
            }
            Err(e) => {
                let _ = ready_tx.send(Err(ClientError::Connect(e)));
                return;
            }
        },
        None => {
            let (r, w) = stream.into_split();
            (Box::new(r) as BoxRead, Box::new(w) as BoxWrite)
        }
    };

    shared.connected.store(true, Ordering::SeqCst);
    let _ = ready_tx.send(Ok(()));

    let write_task = tokio::spawn(client_write_loop(writer, shared.clone()));

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log::debug!("client read error: {e}");
                    break;
                }
            }
        };
        shared.recv.lock().unwrap().push_back(buf[..n].to_vec());
        shared.recv_cv.notify_all();
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.cancel.cancel();
    let _ = write_task.await;
}

async fn client_write_loop(mut writer: BoxWrite, shared: Arc<ClientShared>) {
    loop {
        tokio::select! {
            _ = shared.writable.notified() => {}
            _ = shared.cancel.cancelled() => break,
        }
        loop {
            let chunk = { shared.send.lock().unwrap().pop() };
            let Some(chunk) = chunk else { break };
            if writer.write_all(&chunk).await.is_err() {
                shared.cancel.cancel();
                return;
            }
        }
    }
}

fn resolve_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("cannot resolve '{host}'"),
        )
    })
}
