//! The device-side event loop: listener, connections and frame backlog.
//!
//! A single [`ConnectionManager`] task owns every piece of connection state.
//! Socket I/O runs on small per-connection reader and writer tasks that only
//! move bytes; they talk to the loop through [`LoopEvent`]s. Everything the
//! router touches (active requests, frame state, the connection map) is
//! therefore mutated from one place only.
//!
//! Each loop iteration either processes one item from the backlog of
//! connections with unparsed buffered bytes, or waits (bounded by the idle
//! interval) for a new connection, a socket event or an execution-context
//! completion. The backlog always goes first.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::connection::{ConnectionManager, ServerConfig};
//! use tether_core::context::SpawnedContext;
//! use tether_core::handler::MemoryRegistry;
//! use tether_core::router::RequestRouter;
//! use tokio_util::sync::CancellationToken;
//! # use tether_core::context::AsyncHandler;
//! # async fn example<H: AsyncHandler>(handler: H) -> Result<(), Box<dyn std::error::Error>> {
//!
//! let manager = ConnectionManager::bind(ServerConfig::new("0.0.0.0:9000".parse()?)).await?;
//! let context = SpawnedContext::new(handler, manager.completion_sender());
//! let router = RequestRouter::new(MemoryRegistry::new(), context);
//!
//! manager.run(router, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::context::{CompletionSender, ContextCompletion};
use crate::emitter::{self, OutboundFrame};
use crate::reassembler::{FrameReassembler, Progress};
use crate::router::{RequestRouter, ResponseSink, RouteError};
use crate::wire::{ByteBuffer, FrameLimits};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default device listening port.
pub const DEFAULT_PORT: u16 = 9000;

/// Longest the loop blocks when there is nothing to do.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_secs(1);

/// Size of each socket read.
const READ_CHUNK: usize = 16 * 1024;

const LISTEN_BACKLOG: i32 = 128;

/// Frames queued per connection before a peer that is not reading is cut
/// off.
pub const OUTBOUND_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifies one accepted connection for the lifetime of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors from the device server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Listener and framing settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub limits: FrameLimits,
    pub idle_wait: Duration,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            limits: FrameLimits::default(),
            idle_wait: DEFAULT_IDLE_WAIT,
        }
    }
}

/// Events posted into the loop by I/O tasks and the execution context.
#[derive(Debug)]
pub enum LoopEvent {
    /// Bytes arrived on a connection.
    Readable { conn: ConnectionId, bytes: Vec<u8> },
    /// The peer closed its write half (a read returned zero bytes).
    Closed { conn: ConnectionId },
    /// A read failed.
    ReadFailed { conn: ConnectionId, error: io::Error },
    /// A queued frame could not be written.
    WriteFailed { conn: ConnectionId, error: io::Error },
    /// An asynchronous operation finished.
    Completion(ContextCompletion),
}

/// A frame waiting for a connection's writer task.
#[derive(Debug)]
enum Queued {
    Ack(Vec<u8>),
    Response(OutboundFrame),
}

/// A connection with buffered bytes still to be parsed.
#[derive(Debug, Clone, Copy)]
struct BacklogItem {
    conn: ConnectionId,
    pending: usize,
}

struct Connection {
    peer: SocketAddr,
    inbound: ByteBuffer,
    reassembler: FrameReassembler,
    outbound: mpsc::Sender<Queued>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    queued: bool,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping `outbound` lets the writer drain what is queued and exit.
        self.reader.abort();
    }
}

/// Queues frames onto connections owned by the loop.
struct ConnectionSink<'a> {
    connections: &'a HashMap<ConnectionId, Connection>,
    /// Connections whose outbound queue filled up; torn down after routing.
    overflowed: Vec<ConnectionId>,
}

impl<'a> ConnectionSink<'a> {
    fn new(connections: &'a HashMap<ConnectionId, Connection>) -> Self {
        Self {
            connections,
            overflowed: Vec::new(),
        }
    }

    fn push(&mut self, conn: ConnectionId, frame: Queued) -> bool {
        let Some(connection) = self.connections.get(&conn) else {
            return false;
        };
        match connection.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.overflowed.contains(&conn) {
                    self.overflowed.push(conn);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl ResponseSink for ConnectionSink<'_> {
    fn send_ack(&mut self, conn: ConnectionId, id: &str) {
        match emitter::ack_frame(id) {
            Ok(bytes) => {
                if !self.push(conn, Queued::Ack(bytes)) {
                    debug!(%conn, id, "ack not queued");
                }
            }
            Err(e) => warn!(id, error = %e, "ack could not be encoded"),
        }
    }

    fn send_response(&mut self, conn: ConnectionId, frame: OutboundFrame) -> bool {
        self.push(conn, Queued::Response(frame))
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Owns the listener, every live connection and the frame backlog.
pub struct ConnectionManager {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    connections: HashMap<ConnectionId, Connection>,
    backlog: VecDeque<BacklogItem>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    gauge: watch::Sender<usize>,
    next_id: u64,
}

impl ConnectionManager {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = bind_listener(config.addr).map_err(|source| ServerError::Bind {
            addr: config.addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (gauge, _) = watch::channel(0);
        Ok(Self {
            listener,
            local_addr,
            config,
            connections: HashMap::new(),
            backlog: VecDeque::new(),
            events_tx,
            events_rx,
            gauge,
            next_id: 1,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for execution contexts to post completions into this loop.
    pub fn completion_sender(&self) -> CompletionSender {
        CompletionSender::new(self.events_tx.clone())
    }

    /// The number of live connections, updated as peers come and go.
    pub fn connection_watch(&self) -> watch::Receiver<usize> {
        self.gauge.subscribe()
    }

    /// Run the loop until `shutdown` is cancelled.
    pub async fn run(
        mut self,
        mut router: RequestRouter,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "device listener ready");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Some(item) = self.backlog.pop_front() {
                trace!(conn = %item.conn, pending = item.pending, "backlog");
                if let Some(connection) = self.connections.get_mut(&item.conn) {
                    connection.queued = false;
                    self.process(item.conn, &mut router);
                }
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.register(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event, &mut router),
                _ = tokio::time::sleep(self.config.idle_wait) => {}
            }
        }

        info!(connections = self.connections.len(), "device listener shutting down");
        self.connections.clear();
        self.gauge.send_replace(0);
        Ok(())
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "TCP_NODELAY not set");
        }
        let conn = ConnectionId(self.next_id);
        self.next_id += 1;

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let reader = tokio::spawn(read_loop(conn, read_half, self.events_tx.clone()));
        let writer = tokio::spawn(write_loop(conn, write_half, outbound_rx, self.events_tx.clone()));

        self.connections.insert(
            conn,
            Connection {
                peer,
                inbound: ByteBuffer::new(),
                reassembler: FrameReassembler::new(self.config.limits),
                outbound,
                reader,
                writer,
                queued: false,
            },
        );
        self.gauge.send_replace(self.connections.len());
        debug!(%conn, %peer, "connection accepted");
    }

    fn handle_event(&mut self, event: LoopEvent, router: &mut RequestRouter) {
        match event {
            LoopEvent::Readable { conn, bytes } => {
                let Some(connection) = self.connections.get_mut(&conn) else {
                    return;
                };
                trace!(%conn, len = bytes.len(), "readable");
                connection.inbound.append(&bytes);
                // Queued connections are drained by the backlog, in order.
                if !connection.queued {
                    self.process(conn, router);
                }
            }
            LoopEvent::Closed { conn } => {
                self.deregister(conn, "peer closed");
            }
            LoopEvent::ReadFailed { conn, error } => {
                debug!(%conn, error = %error, "read failed");
                self.deregister(conn, "read failed");
            }
            LoopEvent::WriteFailed { conn, error } => {
                warn!(%conn, error = %error, "write failed");
                self.deregister(conn, "write failed");
            }
            LoopEvent::Completion(completion) => {
                let mut sink = ConnectionSink::new(&self.connections);
                router.complete(completion, &mut sink);
                let overflowed = sink.overflowed;
                self.drop_overflowed(overflowed);
            }
        }
    }

    /// Advance the reassembler for `conn` by at most one frame.
    fn process(&mut self, conn: ConnectionId, router: &mut RequestRouter) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let progress = connection.reassembler.process(&mut connection.inbound);

        match progress {
            Ok(Progress::NeedMore) => {}
            Ok(Progress::Complete { frame, leftover }) => {
                let mut sink = ConnectionSink::new(&self.connections);
                match router.route(conn, &frame.text, frame.binary, &mut sink) {
                    Ok(()) => {}
                    Err(e @ RouteError::DuplicateRequest(_)) => debug!(%conn, "{e}; dropped"),
                    Err(e) => warn!(%conn, error = %e, "request not dispatched"),
                }
                let overflowed = sink.overflowed;
                if !overflowed.is_empty() {
                    self.drop_overflowed(overflowed);
                    return;
                }

                if leftover > 0 {
                    if let Some(connection) = self.connections.get_mut(&conn) {
                        connection.queued = true;
                        self.backlog.push_back(BacklogItem {
                            conn,
                            pending: leftover,
                        });
                    }
                }
            }
            Err(e) => {
                warn!(%conn, error = %e, "framing error");
                self.deregister(conn, "framing error");
            }
        }
    }

    /// Cut off peers that stopped reading. Their queued frames are
    /// discarded rather than drained.
    fn drop_overflowed(&mut self, overflowed: Vec<ConnectionId>) {
        for conn in overflowed {
            warn!(%conn, queued = OUTBOUND_QUEUE, "peer not reading responses");
            if let Some(connection) = self.deregister(conn, "outbound queue full") {
                connection.writer.abort();
            }
        }
    }

    fn deregister(&mut self, conn: ConnectionId, reason: &str) -> Option<Connection> {
        self.backlog.retain(|item| item.conn != conn);
        let connection = self.connections.remove(&conn)?;
        self.gauge.send_replace(self.connections.len());
        debug!(
            %conn,
            peer = %connection.peer,
            partial_frame = connection.reassembler.in_progress(),
            buffered = connection.inbound.available(),
            reason,
            "connection closed"
        );
        Some(connection)
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn read_loop(
    conn: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => LoopEvent::Closed { conn },
            Ok(n) => LoopEvent::Readable {
                conn,
                bytes: buf[..n].to_vec(),
            },
            Err(error) => LoopEvent::ReadFailed { conn, error },
        };
        let done = !matches!(event, LoopEvent::Readable { .. });
        if events.send(event).is_err() || done {
            return;
        }
    }
}

async fn write_loop(
    conn: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Queued>,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    while let Some(queued) = outbound.recv().await {
        let bytes = match &queued {
            Queued::Ack(bytes) => bytes,
            Queued::Response(frame) => &frame.bytes,
        };
        if let Err(error) = emitter::write_chunked(&mut writer, bytes).await {
            let _ = events.send(LoopEvent::WriteFailed { conn, error });
            return;
        }
        if let Queued::Response(frame) = &queued {
            trace!(
                %conn,
                id = %frame.id,
                op = frame.kind.map_or("unknown", |k| k.as_str()),
                success = frame.success,
                time_taken = frame.time_taken,
                len = frame.bytes.len(),
                "response written"
            );
        }
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
