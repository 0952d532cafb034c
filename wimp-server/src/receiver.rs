//! Receiver: owns the inbound path from one peer.
//!
//! Dials the peer's listener (bounded retry), handshakes with our process name,
//! then decodes frames off the connection into the shared incoming queue.
//! Idle -> Connecting -> Active -> Closed; no reconnect.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use wimp_core::wire::{decode_frame_limited, frame_len, LEN_SIZE};
use wimp_core::{IncomingQueue, HEADER_SIZE};

use crate::handshake::handshake_connect;

const READ_BUFFER: usize = 64 * 1024;
const RETRY_START: Duration = Duration::from_millis(10);
const RETRY_MAX: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Connecting,
    Active,
    Closed,
}

/// What a receiver needs to reach its peer.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Our process name, announced in the handshake.
    pub local_name: String,
    /// The peer we receive from; the accepting side must answer with this name.
    pub peer: String,
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    pub max_frame_len: u32,
}

pub struct Receiver {
    config: ReceiverConfig,
    queue: Arc<IncomingQueue>,
    state_tx: Arc<watch::Sender<ReceiverState>>,
    state_rx: watch::Receiver<ReceiverState>,
    task: Option<JoinHandle<()>>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, queue: Arc<IncomingQueue>) -> Self {
        let (state_tx, state_rx) = watch::channel(ReceiverState::Idle);
        Self {
            config,
            queue,
            state_tx: Arc::new(state_tx),
            state_rx,
            task: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.config.peer
    }

    pub fn state(&self) -> ReceiverState {
        *self.state_rx.borrow()
    }

    /// Spawn the receive task. No-op unless Idle. Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        if self.state() != ReceiverState::Idle {
            return;
        }
        self.state_tx.send_replace(ReceiverState::Connecting);
        let config = self.config.clone();
        let queue = self.queue.clone();
        let state = self.state_tx.clone();
        info!(
            "starting receiver {}-{} ({})",
            config.peer, config.local_name, config.addr
        );
        self.task = Some(tokio::spawn(async move {
            run_receiver(config, queue, &state).await;
            state.send_replace(ReceiverState::Closed);
        }));
    }

    /// Wait until the receiver leaves Idle/Connecting or `limit` passes. Returns the state reached.
    pub async fn wait_settled(&mut self, limit: Duration) -> ReceiverState {
        let settled = self
            .state_rx
            .wait_for(|s| matches!(s, ReceiverState::Active | ReceiverState::Closed));
        let reached = match timeout(limit, settled).await {
            Ok(Ok(s)) => Some(*s),
            _ => None,
        };
        reached.unwrap_or_else(|| self.state())
    }

    /// Abort the task and drop the connection.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state_tx.send_replace(ReceiverState::Closed);
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Dial with `connect` until it succeeds or `limit` passes. Each attempt is itself
/// bounded by what is left of `limit`, so a peer that never answers cannot stall past it.
async fn connect_with_retry<F, Fut, S>(
    addr: SocketAddr,
    limit: Duration,
    mut connect: F,
) -> std::io::Result<S>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<S>>,
{
    let deadline = Instant::now() + limit;
    let mut delay = RETRY_START;
    loop {
        let err = match timeout_at(deadline, connect()).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{addr} not listening: {err}"),
            ));
        }
        trace!("connect to {} failed ({}), retrying", addr, err);
        sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(RETRY_MAX);
    }
}

async fn run_receiver(
    config: ReceiverConfig,
    queue: Arc<IncomingQueue>,
    state: &watch::Sender<ReceiverState>,
) {
    let addr = config.addr;
    let dial = connect_with_retry(addr, config.connect_timeout, || TcpStream::connect(addr));
    let mut stream = match dial.await {
        Ok(s) => s,
        Err(e) => {
            warn!("receiver for {}: {}", config.peer, e);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let handshake = timeout(
        config.connect_timeout,
        handshake_connect(&mut stream, &config.local_name),
    )
    .await;
    match handshake {
        Ok(Ok(name)) if name == config.peer => {}
        Ok(Ok(name)) => {
            warn!(
                "receiver for {}: unexpected process {:?} at {}",
                config.peer, name, config.addr
            );
            return;
        }
        Ok(Err(e)) => {
            warn!("receiver for {}: handshake failed: {}", config.peer, e);
            return;
        }
        Err(_) => {
            warn!("receiver for {}: handshake timed out", config.peer);
            return;
        }
    }
    info!("receiver for {} active", config.peer);
    state.send_replace(ReceiverState::Active);

    let reader = BufReader::with_capacity(READ_BUFFER, stream);
    let received = read_frames(reader, &queue, config.max_frame_len).await;
    info!(
        "receiver for {} closed after {} frames",
        config.peer, received
    );
}

/// Decode frames until EOF, a read error or a desynchronized stream. Returns frames enqueued.
pub(crate) async fn read_frames<R>(mut reader: R, queue: &IncomingQueue, max_frame_len: u32) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut received = 0u64;
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            debug!("connection ended: {}", e);
            break;
        }
        let len = frame_len(len_buf);
        if len == 0 {
            trace!("keepalive");
            continue;
        }
        if (len as usize) < HEADER_SIZE || len > max_frame_len {
            warn!("frame length {} out of range; closing connection", len);
            break;
        }
        let mut buf = BytesMut::zeroed(len as usize);
        buf[..LEN_SIZE].copy_from_slice(&len_buf);
        if let Err(e) = reader.read_exact(&mut buf[LEN_SIZE..]).await {
            debug!("connection ended mid-frame: {}", e);
            break;
        }
        let bytes = buf.freeze();
        match decode_frame_limited(&bytes, max_frame_len) {
            Ok((frame, _)) => match queue.push(frame) {
                Ok(()) => received += 1,
                Err(full) => warn!("dropping frame: {}", full),
            },
            Err(e) => warn!("discarding undecodable frame: {}", e),
        }
    }
    received
}
