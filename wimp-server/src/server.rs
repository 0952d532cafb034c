//! Local server: listening socket, process table, receivers, outgoing buffer and incoming queue.
//!
//! A `LocalServer` is an owned context value; several may coexist in one process.
//! Its methods take `&mut self` and are meant to be driven from one task.
//! The incoming queue is shared with the receiver tasks and may be drained from any thread.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use wimp_core::wire::KEEPALIVE;
use wimp_core::{Frame, FrameEncodeError, IncomingQueue, QueueGuard, Relation};

use crate::config::Config;
use crate::handshake::handshake_accept;
use crate::launch::{spawn_executable_process, ChildLaunch};
use crate::receiver::{Receiver, ReceiverConfig, ReceiverState};
use crate::table::{resolve, Attach, ProcessTable, TableError};

const LISTEN_BACKLOG: u32 = 1024;
const POLL_START: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(200);

/// Lifecycle of a local server. There is no Uninitialized value: a server exists only once `init` succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Listening, no receiver active.
    Initialized,
    /// At least one receiver active.
    Running,
    /// Terminal.
    Closed,
}

/// Error from local server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid address {0}")]
    AddressFailure(String),
    #[error("socket creation failed: {0}")]
    SocketFailure(#[source] std::io::Error),
    #[error("bind to {addr} failed: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listen failed: {0}")]
    ListenFailure(#[source] std::io::Error),
    #[error("only {connected} of {expected} processes connected")]
    TooFewProcesses { expected: usize, connected: usize },
    #[error("connection from undeclared process {0:?}")]
    UnexpectedProcess(String),
    #[error("invalid process name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("process {0:?} unreachable: {1}")]
    Unreachable(String, #[source] std::io::Error),
    #[error("launching {0:?} failed: {1}")]
    Launch(String, #[source] std::io::Error),
    #[error("server closed")]
    Closed,
}

/// Why one destination's instructions were not delivered by `flush`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown process")]
    UnknownProcess,
    #[error("no connection from process")]
    NotConnected,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-destination outcome of `flush`. Each destination succeeds or fails on its own.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// (destination, frames written)
    pub sent: Vec<(String, usize)>,
    /// (destination, frames dropped, error)
    pub failed: Vec<(String, usize, SendError)>,
}

impl FlushReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn frames_sent(&self) -> usize {
        self.sent.iter().map(|(_, n)| n).sum()
    }
}

/// Bind `domain:port` and return the port the OS picked when `port` is 0.
/// The socket is released before returning, so the port may be taken again by the time it is used.
pub fn assign_unused_local_port(domain: &str) -> Result<u16, ServerError> {
    let addr = (domain, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut a| a.next())
        .ok_or_else(|| ServerError::AddressFailure(format!("{domain}:0")))?;
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|source| ServerError::BindFailure { addr, source })?;
    let port = listener
        .local_addr()
        .map_err(ServerError::SocketFailure)?
        .port();
    Ok(port)
}

pub struct LocalServer {
    name: String,
    config: Config,
    local_addr: SocketAddr,
    closed: bool,
    table: Arc<Mutex<ProcessTable>>,
    queue: Arc<IncomingQueue>,
    receivers: HashMap<String, Receiver>,
    outgoing: BTreeMap<String, Vec<Frame>>,
    accept_task: Option<JoinHandle<()>>,
}

impl LocalServer {
    /// Bind `config.domain:config.port` (0 = ephemeral) and start accepting peers.
    pub async fn init(name: &str, config: Config) -> Result<Self, ServerError> {
        if !wimp_core::protocol::is_valid_name(name) {
            return Err(ServerError::InvalidName(name.to_string()));
        }
        let addr = tokio::net::lookup_host((config.domain.as_str(), config.port))
            .await
            .ok()
            .and_then(|mut a| a.next())
            .ok_or_else(|| {
                ServerError::AddressFailure(format!("{}:{}", config.domain, config.port))
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ServerError::SocketFailure)?;
        socket
            .bind(addr)
            .map_err(|source| ServerError::BindFailure { addr, source })?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(ServerError::ListenFailure)?;
        let local_addr = listener.local_addr().map_err(ServerError::SocketFailure)?;
        info!("{} listening on {}", name, local_addr);

        let table = Arc::new(Mutex::new(ProcessTable::new()));
        let queue = Arc::new(IncomingQueue::with_limit(config.max_queue_len));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            table.clone(),
            name.to_string(),
            config.accept_timeout(),
        ));
        Ok(Self {
            name: name.to_string(),
            config,
            local_addr,
            closed: false,
            table,
            queue,
            receivers: HashMap::new(),
            outgoing: BTreeMap::new(),
            accept_task: Some(accept_task),
        })
    }

    /// `init` with default settings on `domain:port`.
    pub async fn bind(name: &str, domain: &str, port: u16) -> Result<Self, ServerError> {
        let config = Config {
            domain: domain.to_string(),
            port,
            ..Config::default()
        };
        Self::init(name, config).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        if self.closed {
            ServerState::Closed
        } else if self
            .receivers
            .values()
            .any(|r| r.state() == ReceiverState::Active)
        {
            ServerState::Running
        } else {
            ServerState::Initialized
        }
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.closed {
            Err(ServerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Register a peer and start the receiver that dials it.
    /// The peer's own receiver connects back to us; that connection becomes our outbound path.
    pub async fn add_process(
        &mut self,
        name: &str,
        domain: &str,
        port: u16,
        relation: Relation,
    ) -> Result<(), ServerError> {
        self.ensure_open()?;
        let addr = resolve(domain, port).await?;
        self.table
            .lock()
            .await
            .add(name, domain, port, addr, relation)?;
        let mut receiver = Receiver::new(
            ReceiverConfig {
                local_name: self.name.clone(),
                peer: name.to_string(),
                addr,
                connect_timeout: self.config.connect_timeout(),
                max_frame_len: self.config.max_frame_len,
            },
            self.queue.clone(),
        );
        receiver.start();
        self.receivers.insert(name.to_string(), receiver);
        debug!("{}: added {} process {} at {}", self.name, relation, name, addr);
        Ok(())
    }

    /// Launch `program` as child process `name` listening on `port`, pointed back at this
    /// server. The child is not declared here; follow with `add_process` for it.
    pub fn start_executable_process(
        &self,
        name: &str,
        program: &Path,
        port: u16,
        extra_args: &[&str],
    ) -> Result<Child, ServerError> {
        self.ensure_open()?;
        let launch = ChildLaunch {
            name: name.to_string(),
            port,
            parent_name: self.name.clone(),
            parent_domain: self.config.domain.clone(),
            parent_port: self.port(),
            extra_args: extra_args.iter().map(|a| OsString::from(*a)).collect(),
        };
        spawn_executable_process(program, &launch)
            .map_err(|e| ServerError::Launch(name.to_string(), e))
    }

    /// Deregister a peer: stop its receiver and drop its connection.
    pub async fn remove_process(&mut self, name: &str) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.table.lock().await.remove(name)?;
        if let Some(mut receiver) = self.receivers.remove(name) {
            receiver.stop();
        }
        self.outgoing.remove(name);
        Ok(())
    }

    pub async fn relation_of(&self, name: &str) -> Result<Relation, ServerError> {
        Ok(self.table.lock().await.lookup(name)?.relation)
    }

    pub async fn process_names(&self) -> Vec<String> {
        self.table.lock().await.names()
    }

    pub fn receiver_state(&self, name: &str) -> Option<ReceiverState> {
        self.receivers.get(name).map(Receiver::state)
    }

    /// Wait until every process in `names` has connected back to us.
    /// Fails with `UnexpectedProcess` if a connection arrived from an undeclared name,
    /// or `TooFewProcesses` if the deadline passes first.
    pub async fn accept_processes(
        &mut self,
        names: &[&str],
        limit: Duration,
    ) -> Result<(), ServerError> {
        self.ensure_open()?;
        let deadline = Instant::now() + limit;
        let mut delay = POLL_START;
        loop {
            let connected = {
                let mut table = self.table.lock().await;
                if let Some(stray) = table.pending_names().into_iter().next() {
                    table.drop_pending(&stray);
                    warn!("{}: closed connection from undeclared {}", self.name, stray);
                    return Err(ServerError::UnexpectedProcess(stray));
                }
                let mut connected = 0;
                for name in names {
                    if table.lookup(name)?.is_connected() {
                        connected += 1;
                    }
                }
                connected
            };
            if connected == names.len() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ServerError::TooFewProcesses {
                    expected: names.len(),
                    connected,
                });
            }
            sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    /// True once `name` has connected to us and a keepalive write to it succeeds,
    /// within the configured listen timeout.
    pub async fn check_process_listening(&mut self, name: &str) -> bool {
        let limit = self.config.listen_timeout();
        match self.wait_process_listening(name, limit).await {
            Ok(()) => true,
            Err(e) => {
                debug!("{}: {} not listening: {}", self.name, name, e);
                false
            }
        }
    }

    /// Wait (with backoff) for `name`'s connection, then test it with a keepalive.
    /// `Unreachable` if the write fails or no connection arrives before `limit`.
    pub async fn wait_process_listening(
        &mut self,
        name: &str,
        limit: Duration,
    ) -> Result<(), ServerError> {
        self.ensure_open()?;
        let deadline = Instant::now() + limit;
        let mut delay = POLL_START;
        loop {
            {
                let mut table = self.table.lock().await;
                let entry = table.lookup_mut(name)?;
                if let Some(conn) = entry.connection.as_mut() {
                    return match conn.write_all(&KEEPALIVE).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            entry.connection = None;
                            Err(ServerError::Unreachable(name.to_string(), e))
                        }
                    };
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ServerError::Unreachable(
                    name.to_string(),
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no connection before deadline",
                    ),
                ));
            }
            sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    /// Buffer an instruction for `dest`. Nothing is written until `flush`.
    /// The payload is copied; the caller's buffer need not outlive the call.
    pub fn enqueue_outgoing(
        &mut self,
        dest: &str,
        opcode: u64,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        self.enqueue_frame(Frame::new(
            opcode,
            &self.name,
            dest,
            Bytes::copy_from_slice(payload),
        )?)
    }

    /// Buffer an already built frame under its destination.
    pub fn enqueue_frame(&mut self, frame: Frame) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.outgoing
            .entry(frame.dest().to_string())
            .or_default()
            .push(frame);
        Ok(())
    }

    /// Frames buffered and not yet flushed.
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.values().map(Vec::len).sum()
    }

    /// Route a received frame meant for another declared process: move it to the
    /// outgoing buffer with its original source. Returns the frame back if it is ours
    /// or its destination is unknown.
    pub async fn forward(&mut self, frame: Frame) -> Result<(), Frame> {
        if self.closed || frame.dest() == self.name {
            return Err(frame);
        }
        if !self.table.lock().await.contains(frame.dest()) {
            return Err(frame);
        }
        debug!(
            "{}: routing {} from {} to {}",
            self.name,
            frame.opcode(),
            frame.source(),
            frame.dest()
        );
        self.outgoing
            .entry(frame.dest().to_string())
            .or_default()
            .push(frame);
        Ok(())
    }

    /// Write every buffered instruction, one batch per destination, then clear the buffer.
    pub async fn flush(&mut self) -> Result<FlushReport, ServerError> {
        self.ensure_open()?;
        let outgoing = std::mem::take(&mut self.outgoing);
        let mut report = FlushReport::default();
        let mut table = self.table.lock().await;
        for (dest, frames) in outgoing {
            let count = frames.len();
            match write_batch(&mut table, &dest, &frames).await {
                Ok(()) => report.sent.push((dest, count)),
                Err(e) => {
                    warn!("{}: dropping {} frames for {}: {}", self.name, count, dest, e);
                    report.failed.push((dest, count, e));
                }
            }
        }
        Ok(report)
    }

    /// Enter the consumer critical section. Dropping the guard unlocks.
    pub fn lock_queue(&self) -> QueueGuard<'_> {
        self.queue.lock()
    }

    /// Pop one frame under a short lock. None if nothing is waiting.
    pub fn next_instruction(&self) -> Option<Frame> {
        self.queue.lock().pop()
    }

    /// Handle to the incoming queue, e.g. for a consumer thread.
    pub fn queue(&self) -> Arc<IncomingQueue> {
        self.queue.clone()
    }

    /// Wait up to `limit` for the next frame.
    pub async fn wait_instruction(&self, limit: Duration) -> Option<Frame> {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || queue.wait_pop(limit))
            .await
            .ok()
            .flatten()
    }

    /// Wait for the oldest frame with `opcode`; other frames stay queued in order.
    /// Sleeps on the queue condvar and holds the consumer lock until it returns.
    pub async fn wait_response(&self, opcode: u64, limit: Duration) -> Result<Frame, ServerError> {
        self.ensure_open()?;
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || queue.wait_take_opcode(opcode, limit))
            .await
            .ok()
            .flatten()
            .ok_or_else(|| ServerError::Timeout(format!("opcode {opcode}")))
    }

    /// Stop receivers and the accept loop, drop every connection and clear all state. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, mut receiver) in self.receivers.drain() {
            receiver.stop();
        }
        self.table.lock().await.close();
        self.outgoing.clear();
        let dropped = self.queue.clear();
        info!(
            "{} closed ({} unconsumed instructions dropped)",
            self.name, dropped
        );
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn write_batch(
    table: &mut ProcessTable,
    dest: &str,
    frames: &[Frame],
) -> Result<(), SendError> {
    let entry = table.lookup_mut(dest).map_err(|_| SendError::UnknownProcess)?;
    let conn = entry.connection.as_mut().ok_or(SendError::NotConnected)?;
    let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::total_size).sum());
    for frame in frames {
        frame.encode_into(&mut buf)?;
    }
    if let Err(e) = conn.write_all(&buf).await {
        entry.connection = None;
        return Err(SendError::Io(e));
    }
    Ok(())
}

/// Accept connections, handshake each on its own task and hand it to the table.
async fn accept_loop(
    listener: TcpListener,
    table: Arc<Mutex<ProcessTable>>,
    own_name: String,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("{}: accept failed: {}", own_name, e);
                break;
            }
        };
        let table = table.clone();
        let own_name = own_name.clone();
        tokio::spawn(async move {
            attach_connection(stream, peer_addr, table, &own_name, handshake_timeout).await;
        });
    }
}

async fn attach_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    table: Arc<Mutex<ProcessTable>>,
    own_name: &str,
    handshake_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);
    let peer = match timeout(handshake_timeout, handshake_accept(&mut stream, own_name)).await {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => {
            warn!("{}: handshake from {} failed: {}", own_name, peer_addr, e);
            return;
        }
        Err(_) => {
            warn!("{}: handshake from {} timed out", own_name, peer_addr);
            return;
        }
    };
    match table.lock().await.attach(&peer, stream) {
        Attach::Attached => info!("{}: {} connected from {}", own_name, peer, peer_addr),
        Attach::Replaced => info!("{}: {} reconnected from {}", own_name, peer, peer_addr),
        Attach::Pending => debug!("{}: {} connected before being declared", own_name, peer),
        Attach::Refused => debug!("{}: refusing {} (closed or too many pending)", own_name, peer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wimp_core::{opcode_from_name, pack_strings, EXIT, LOG, PING};

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback() -> Config {
        Config {
            domain: "127.0.0.1".into(),
            ..Config::default()
        }
    }

    /// Two servers that have declared each other and are connected both ways.
    async fn linked_pair(parent: &str, child: &str) -> (LocalServer, LocalServer) {
        let mut p = LocalServer::init(parent, loopback()).await.unwrap();
        let mut c = LocalServer::init(child, loopback()).await.unwrap();
        p.add_process(child, "127.0.0.1", c.port(), Relation::Child)
            .await
            .unwrap();
        c.add_process(parent, "127.0.0.1", p.port(), Relation::Parent)
            .await
            .unwrap();
        assert!(p.check_process_listening(child).await);
        assert!(c.check_process_listening(parent).await);
        (p, c)
    }

    /// Drain `server` in lock/drain/unlock rounds until `want` frames arrived.
    async fn drain_until(server: &LocalServer, want: usize) -> Vec<Frame> {
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        while got.len() < want {
            {
                let mut guard = server.lock_queue();
                while let Some(frame) = guard.pop() {
                    got.push(frame);
                }
            }
            assert!(Instant::now() < deadline, "only {} of {} frames", got.len(), want);
            sleep(Duration::from_millis(1)).await;
        }
        got
    }

    #[tokio::test]
    async fn ephemeral_port_reported() {
        let mut s = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        assert_ne!(s.port(), 0);
        assert_eq!(s.state(), ServerState::Initialized);
        assert!(s.next_instruction().is_none());
        s.close().await;
    }

    #[tokio::test]
    async fn unused_port_is_bindable() {
        let port = assign_unused_local_port("127.0.0.1").unwrap();
        assert_ne!(port, 0);
        let mut s = LocalServer::bind("master", "127.0.0.1", port).await.unwrap();
        assert_eq!(s.port(), port);
        s.close().await;
    }

    #[tokio::test]
    async fn init_errors() {
        assert!(matches!(
            LocalServer::bind("", "127.0.0.1", 0).await,
            Err(ServerError::InvalidName(_))
        ));
        assert!(matches!(
            LocalServer::bind("m", "not a host!", 0).await,
            Err(ServerError::AddressFailure(_))
        ));
        let mut taken = LocalServer::bind("a", "127.0.0.1", 0).await.unwrap();
        assert!(matches!(
            LocalServer::bind("b", "127.0.0.1", taken.port()).await,
            Err(ServerError::BindFailure { .. })
        ));
        taken.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        p.close().await;
        p.close().await;
        assert_eq!(p.state(), ServerState::Closed);
        assert!(matches!(
            p.enqueue_outgoing("client", 1, &[]),
            Err(ServerError::Closed)
        ));
        assert!(matches!(p.flush().await, Err(ServerError::Closed)));
        assert!(p.process_names().await.is_empty());
        c.close().await;
    }

    #[tokio::test]
    async fn duplicate_process_rejected() {
        let mut s = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        s.add_process("client", "127.0.0.1", 1, Relation::Child)
            .await
            .unwrap();
        assert!(matches!(
            s.add_process("client", "127.0.0.1", 2, Relation::Child).await,
            Err(ServerError::Table(TableError::DuplicateName(_)))
        ));
        assert_eq!(s.relation_of("client").await.unwrap(), Relation::Child);
        s.remove_process("client").await.unwrap();
        assert!(s.relation_of("client").await.is_err());
        s.close().await;
    }

    // Scenario 1: the child connects back and the parent's listening check passes.
    #[tokio::test]
    async fn process_validation() {
        let mut p = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        let child_port = assign_unused_local_port("127.0.0.1").unwrap();
        let parent_port = p.port();
        let child = tokio::spawn(async move {
            let mut c = LocalServer::bind("client", "127.0.0.1", child_port)
                .await
                .unwrap();
            c.add_process("master", "127.0.0.1", parent_port, Relation::Parent)
                .await
                .unwrap();
            c
        });
        p.add_process("client", "127.0.0.1", child_port, Relation::Child)
            .await
            .unwrap();
        p.accept_processes(&["client"], WAIT).await.unwrap();
        assert!(p.check_process_listening("client").await);
        let mut c = child.await.unwrap();
        assert!(c.check_process_listening("master").await);
        assert_eq!(
            p.receivers.get_mut("client").unwrap().wait_settled(WAIT).await,
            ReceiverState::Active
        );
        assert_eq!(p.state(), ServerState::Running);
        c.close().await;
        p.close().await;
    }

    #[tokio::test]
    async fn listening_check_times_out_for_silent_peer() {
        let mut s = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        s.add_process("ghost", "127.0.0.1", 1, Relation::Child)
            .await
            .unwrap();
        assert!(matches!(
            s.wait_process_listening("ghost", Duration::from_millis(50)).await,
            Err(ServerError::Unreachable(..))
        ));
        assert!(matches!(
            s.accept_processes(&["ghost"], Duration::from_millis(50)).await,
            Err(ServerError::TooFewProcesses { expected: 1, connected: 0 })
        ));
        assert!(matches!(
            s.wait_process_listening("nobody", WAIT).await,
            Err(ServerError::Table(TableError::NotFound(_)))
        ));
        s.close().await;
    }

    #[tokio::test]
    async fn undeclared_connection_is_unexpected() {
        let mut p = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        let mut stranger = LocalServer::bind("stranger", "127.0.0.1", 0).await.unwrap();
        stranger
            .add_process("master", "127.0.0.1", p.port(), Relation::Parent)
            .await
            .unwrap();
        let deadline = Instant::now() + WAIT;
        let err = loop {
            match p.accept_processes(&[], Duration::ZERO).await {
                Err(e) => break e,
                Ok(()) => {
                    assert!(Instant::now() < deadline);
                    sleep(Duration::from_millis(5)).await;
                }
            }
        };
        assert!(matches!(err, ServerError::UnexpectedProcess(ref n) if n == "stranger"));
        // The parked socket is closed once reported, so it is not reported again
        // and the stranger's receiver sees the disconnect.
        p.accept_processes(&[], Duration::ZERO).await.unwrap();
        let deadline = Instant::now() + WAIT;
        while stranger.receiver_state("master") != Some(ReceiverState::Closed) {
            assert!(Instant::now() < deadline, "parked connection left open");
            sleep(Duration::from_millis(5)).await;
        }
        stranger.close().await;
        p.close().await;
    }

    // Scenario 2 and 3, plus per-connection ordering.
    #[tokio::test]
    async fn instructions_arrive_in_order_with_payloads() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        let say_hello = opcode_from_name("say_hello");
        let echo = opcode_from_name("echo");
        p.enqueue_outgoing("client", say_hello, &[]).unwrap();
        p.enqueue_outgoing("client", echo, b"Echo!\0").unwrap();
        p.enqueue_outgoing("client", EXIT, &[]).unwrap();
        assert_eq!(p.outgoing_len(), 3);
        let report = p.flush().await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.frames_sent(), 3);
        assert_eq!(p.outgoing_len(), 0);

        let frames = drain_until(&c, 3).await;
        let ops: Vec<u64> = frames.iter().map(Frame::opcode).collect();
        assert_eq!(ops, vec![say_hello, echo, EXIT]);
        assert_eq!(frames[0].arg_size(), 0);
        assert!(frames[0].payload().is_empty());
        assert_eq!(frames[1].payload(), b"Echo!\0");
        assert_eq!(frames[1].arg_size(), 6);
        assert_eq!(frames[1].payload_str(), Some("Echo!"));
        assert_eq!(frames[1].source(), "master");
        assert_eq!(frames[1].dest(), "client");
        assert!(c.next_instruction().is_none());

        p.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn long_strings_cross_a_server_pair() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        let long = "0123456789abcdef".repeat(16 * 1024);
        let mut text = long.clone().into_bytes();
        text.push(0);
        let plain = opcode_from_name("long_message");
        let one = opcode_from_name("long_message_packed");
        let many = opcode_from_name("long_messages_packed");
        p.enqueue_outgoing("client", plain, &text).unwrap();
        p.enqueue_outgoing("client", one, &pack_strings([&long]).unwrap())
            .unwrap();
        p.enqueue_outgoing("client", many, &pack_strings([&long; 4]).unwrap())
            .unwrap();
        assert!(p.flush().await.unwrap().is_ok());

        let frames = drain_until(&c, 3).await;
        assert_eq!(frames[0].opcode(), plain);
        assert_eq!(frames[0].payload_str(), Some(long.as_str()));
        let single = frames[1].payload_strings().unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single.get(0), Some(long.as_str()));
        let packed = frames[2].payload_strings().unwrap();
        assert_eq!(packed.len(), 4);
        assert!(packed.iter().all(|s| s == long));
        p.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn flush_failures_are_per_destination() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        p.add_process("absent", "127.0.0.1", 1, Relation::Child)
            .await
            .unwrap();
        p.enqueue_outgoing("client", LOG, b"hi\0").unwrap();
        p.enqueue_outgoing("absent", LOG, b"hi\0").unwrap();
        p.enqueue_outgoing("nobody", LOG, b"hi\0").unwrap();
        let report = p.flush().await.unwrap();
        assert_eq!(report.sent, vec![("client".to_string(), 1)]);
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .iter()
            .any(|(d, _, e)| d == "absent" && matches!(e, SendError::NotConnected)));
        assert!(report
            .failed
            .iter()
            .any(|(d, _, e)| d == "nobody" && matches!(e, SendError::UnknownProcess)));
        let frames = drain_until(&c, 1).await;
        assert_eq!(frames[0].opcode(), LOG);
        assert_eq!(p.outgoing_len(), 0);
        p.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn wait_response_skips_other_frames() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        p.enqueue_outgoing("client", 1, &[]).unwrap();
        p.enqueue_outgoing("client", PING, &[]).unwrap();
        p.enqueue_outgoing("client", 2, &[]).unwrap();
        p.flush().await.unwrap();
        let pong = c.wait_response(PING, WAIT).await.unwrap();
        assert_eq!(pong.source(), "master");
        let rest = drain_until(&c, 2).await;
        assert_eq!(rest.iter().map(Frame::opcode).collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(
            c.wait_response(PING, Duration::from_millis(20)).await,
            Err(ServerError::Timeout(_))
        ));
        p.close().await;
        c.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_instruction_blocks_until_arrival() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        assert!(c.wait_instruction(Duration::from_millis(20)).await.is_none());
        p.enqueue_outgoing("client", 77, &[]).unwrap();
        p.flush().await.unwrap();
        let frame = c.wait_instruction(WAIT).await.unwrap();
        assert_eq!(frame.opcode(), 77);
        p.close().await;
        c.close().await;
    }

    // Master routes between two children that only know the master.
    #[tokio::test]
    async fn master_forwards_between_children() {
        let mut m = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        let mut c1 = LocalServer::bind("client1", "127.0.0.1", 0).await.unwrap();
        let mut c2 = LocalServer::bind("client2", "127.0.0.1", 0).await.unwrap();
        for c in [&mut c1, &mut c2] {
            m.add_process(c.name(), "127.0.0.1", c.port(), Relation::Child)
                .await
                .unwrap();
            c.add_process("master", "127.0.0.1", m.port(), Relation::Parent)
                .await
                .unwrap();
        }
        m.accept_processes(&["client1", "client2"], WAIT).await.unwrap();
        assert!(c1.check_process_listening("master").await);

        let hello = opcode_from_name("say_hello");
        // client1 addresses client2 but only has a route to the master.
        let frame = Frame::new(hello, "client1", "client2", Bytes::new()).unwrap();
        c1.outgoing.entry("master".into()).or_default().push(frame);
        c1.flush().await.unwrap();

        let at_master = drain_until(&m, 1).await.remove(0);
        assert_eq!(at_master.dest(), "client2");
        m.forward(at_master).await.unwrap();
        m.flush().await.unwrap();

        let at_c2 = drain_until(&c2, 1).await.remove(0);
        assert_eq!(at_c2.opcode(), hello);
        assert_eq!(at_c2.source(), "client1");

        let mine = Frame::new(EXIT, "client1", "master", Bytes::new()).unwrap();
        assert!(m.forward(mine).await.is_err());
        let lost = Frame::new(EXIT, "client1", "nowhere", Bytes::new()).unwrap();
        assert!(m.forward(lost).await.is_err());

        for s in [&mut m, &mut c1, &mut c2] {
            s.close().await;
        }
    }

    #[tokio::test]
    async fn closing_peer_closes_receiver() {
        let (mut p, mut c) = linked_pair("master", "client").await;
        p.close().await;
        let deadline = Instant::now() + WAIT;
        while c.receiver_state("master") != Some(ReceiverState::Closed) {
            assert!(Instant::now() < deadline, "receiver never saw the disconnect");
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(c.state(), ServerState::Initialized);
        c.close().await;
    }

    #[tokio::test]
    async fn bounded_queue_drops_excess() {
        let mut p = LocalServer::bind("master", "127.0.0.1", 0).await.unwrap();
        let mut c = LocalServer::init(
            "client",
            Config {
                max_queue_len: Some(3),
                ..loopback()
            },
        )
        .await
        .unwrap();
        p.add_process("client", "127.0.0.1", c.port(), Relation::Child)
            .await
            .unwrap();
        c.add_process("master", "127.0.0.1", p.port(), Relation::Parent)
            .await
            .unwrap();
        assert!(p.check_process_listening("client").await);
        for op in 0..10 {
            p.enqueue_outgoing("client", op, &[]).unwrap();
        }
        p.flush().await.unwrap();
        let deadline = Instant::now() + WAIT;
        while c.queue().len() < 3 {
            assert!(Instant::now() < deadline);
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(100)).await;
        let kept: Vec<u64> = c.lock_queue().drain_all().iter().map(Frame::opcode).collect();
        assert_eq!(kept, vec![0, 1, 2]);
        p.close().await;
        c.close().await;
    }

    // Scenario 4: 50,000 instructions flushed one by one, then 50,000 flushed every 1,000.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn brute_force_volume() {
        const COUNT: usize = 50_000;
        let single = opcode_from_name("incr_short");
        let batched = opcode_from_name("incr_short_batch");
        let (mut p, mut c) = linked_pair("master", "client").await;

        for _ in 0..COUNT {
            p.enqueue_outgoing("client", single, &[]).unwrap();
            assert!(p.flush().await.unwrap().is_ok());
        }
        for i in 0..COUNT {
            p.enqueue_outgoing("client", batched, &[]).unwrap();
            if (i + 1) % 1000 == 0 {
                assert!(p.flush().await.unwrap().is_ok());
            }
        }
        assert!(p.flush().await.unwrap().is_ok());

        let frames = drain_until(&c, 2 * COUNT).await;
        assert_eq!(frames.iter().filter(|f| f.opcode() == single).count(), COUNT);
        assert_eq!(frames.iter().filter(|f| f.opcode() == batched).count(), COUNT);
        assert!(c.next_instruction().is_none());
        p.close().await;
        c.close().await;
    }
}
