//! Listening endpoint and the connections it yields.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use crate::activity::{CommandGuard, CommandTracker};
use crate::error::{io_err, DaemonError};
use crate::protocol::DaemonResponse;

const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Binds an endpoint and yields client connections.
pub trait Connector: Send + Sync {
    /// Acquire the endpoint. Called once, before any `accept`.
    fn bind(&self) -> Result<SocketAddr, DaemonError>;

    /// Block until a client connects. Returns `Ok(None)` once closed.
    fn accept(&self) -> Result<Option<Connection>, DaemonError>;

    /// Stop accepting and unblock a pending `accept`. Connections already
    /// handed out stop receiving new requests; replies can still be written.
    /// Idempotent.
    fn close(&self);
}

/// One accepted client connection, speaking line-delimited JSON.
pub struct Connection {
    peer: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    tracker: Option<Arc<CommandTracker>>,
    _open: Option<OpenStream>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self, DaemonError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| io_err("daemon connection", e))?;
        let writer = stream
            .try_clone()
            .map_err(|e| io_err(peer.to_string(), e))?;
        Ok(Self {
            peer,
            reader: BufReader::new(stream),
            writer,
            tracker: None,
            _open: None,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Count commands run on this connection against `tracker`.
    pub fn track_commands(&mut self, tracker: Arc<CommandTracker>) {
        self.tracker = Some(tracker);
    }

    /// Mark a command as executing until the returned guard is dropped.
    /// `None` when the connection is not tracked.
    pub fn begin_command(&self) -> Option<CommandGuard> {
        self.tracker.as_ref().map(CommandTracker::begin)
    }

    /// Next non-empty line, `None` when the client hung up.
    pub fn read_line(&mut self) -> Result<Option<String>, DaemonError> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| io_err(self.peer.to_string(), e))?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    pub fn write_response(&mut self, response: &DaemonResponse) -> Result<(), DaemonError> {
        let payload = serde_json::to_string(response)?;
        let peer = self.peer.to_string();
        self.writer
            .write_all(payload.as_bytes())
            .map_err(|e| io_err(&peer, e))?;
        self.writer.write_all(b"\n").map_err(|e| io_err(&peer, e))?;
        self.writer.flush().map_err(|e| io_err(&peer, e))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// Read halves of the connections a connector has handed out, so `close`
/// can end their request loops.
#[derive(Debug, Default)]
struct OpenStreams {
    next_id: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl OpenStreams {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deregisters a connection's stream when the connection is dropped.
struct OpenStream {
    streams: Arc<OpenStreams>,
    id: u64,
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.streams.lock().remove(&self.id);
    }
}

/// TCP connector. `close` wakes a blocked `accept` by connecting to itself
/// and shuts down the read side of every open connection.
#[derive(Debug)]
pub struct TcpConnector {
    requested: SocketAddr,
    listener: OnceLock<TcpListener>,
    bound: OnceLock<SocketAddr>,
    closed: AtomicBool,
    open: Arc<OpenStreams>,
}

impl TcpConnector {
    pub fn new(requested: SocketAddr) -> Self {
        Self {
            requested,
            listener: OnceLock::new(),
            bound: OnceLock::new(),
            closed: AtomicBool::new(false),
            open: Arc::new(OpenStreams::default()),
        }
    }

    /// Number of handed-out connections that are still alive.
    pub fn open_connections(&self) -> usize {
        self.open.lock().len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connector for TcpConnector {
    fn bind(&self) -> Result<SocketAddr, DaemonError> {
        if let Some(address) = self.bound.get() {
            return Ok(*address);
        }
        let bind_err = |source| DaemonError::Bind {
            address: self.requested.to_string(),
            source,
        };
        let listener = TcpListener::bind(self.requested).map_err(bind_err)?;
        let address = listener.local_addr().map_err(bind_err)?;
        let _ = self.listener.set(listener);
        let _ = self.bound.set(address);
        tracing::info!(address = %address, "daemon connector listening");
        Ok(address)
    }

    fn accept(&self) -> Result<Option<Connection>, DaemonError> {
        let Some(listener) = self.listener.get() else {
            return Err(DaemonError::Protocol("accept called before bind".to_string()));
        };
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            let (stream, peer) = listener
                .accept()
                .map_err(|e| io_err(self.requested.to_string(), e))?;
            if self.is_closed() {
                return Ok(None);
            }
            match self.register(stream) {
                Ok(Some(connection)) => return Ok(Some(connection)),
                Ok(None) => return Ok(None),
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "dropping unusable connection");
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(address) = self.local_addr() {
            let _ = TcpStream::connect_timeout(&wake_address(address), WAKE_TIMEOUT);
        }
        let open = self.open.lock();
        for stream in open.values() {
            // the peer may already be gone
            let _ = stream.shutdown(Shutdown::Read);
        }
        tracing::debug!(open_connections = open.len(), "daemon connector closed");
    }
}

impl TcpConnector {
    /// Wrap an accepted stream, recording its read half. `None` if the
    /// connector closed in the meantime.
    fn register(&self, stream: TcpStream) -> Result<Option<Connection>, DaemonError> {
        let read_half = stream
            .try_clone()
            .map_err(|e| io_err(self.requested.to_string(), e))?;
        let mut connection = Connection::new(stream)?;

        // `close` sets the flag before sweeping, so checking it under the
        // lock means every registered stream is either swept or refused.
        let mut open = self.open.lock();
        if self.is_closed() {
            return Ok(None);
        }
        let id = self.open.next_id.fetch_add(1, Ordering::Relaxed);
        open.insert(id, read_half);
        drop(open);
        connection._open = Some(OpenStream {
            streams: Arc::clone(&self.open),
            id,
        });
        Ok(Some(connection))
    }
}

/// An address we can connect to in order to reach a listener bound to `bound`.
fn wake_address(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port()),
        _ => bound,
    }
}
