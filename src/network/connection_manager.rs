//! Connection manager: owns every live peer connection.
//!
//! Connections are keyed by remote address string (the dialed address for
//! outbound, the socket peer address for inbound). Each connection gets a read
//! task and a writer task fed by a bounded queue. Broadcasts go through one
//! channel drained by a single fan-out task, which only ever `try_send`s into
//! per-connection queues, so a slow or dead peer never holds up the others.

use crate::error::{AppError, DialError};
use crate::network::wire::{self, Frame};
use crate::shutdown::ShutdownManager;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// Identity of one live connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHandle {
    pub id: ConnectionId,
    pub address: String,
    pub direction: ConnectionDirection,
}

/// What the read loop should do after a frame has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Close,
}

/// Receives connection events from read loops.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Frame queued on a new connection before it becomes visible to
    /// broadcasts, so it is always the first frame the peer receives.
    fn greeting(&self, peer: &PeerHandle) -> Option<Frame>;

    async fn on_frame(&self, peer: &PeerHandle, frame: String) -> FrameAction;
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Depth of the broadcast channel and of every per-connection queue
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_frame_bytes: wire::MAX_FRAME_SIZE,
        }
    }
}

struct ConnectionEntry {
    handle: PeerHandle,
    queue: mpsc::Sender<Frame>,
}

struct Outbound {
    frame: Frame,
    skip: Option<ConnectionId>,
}

pub struct ConnectionManager {
    connections: Mutex<HashMap<String, ConnectionEntry>>,
    next_id: AtomicU64,
    /// Our own listening endpoint, the fallback target when a dial fails
    local_address: Mutex<Option<String>>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    handler: OnceLock<Weak<dyn InboundHandler>>,
    settings: ConnectionSettings,
    shutdown: ShutdownManager,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, shutdown: ShutdownManager) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            local_address: Mutex::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            handler: OnceLock::new(),
            settings,
            shutdown,
        }
    }

    /// Install the receiver of inbound frames. Only the first call has an effect.
    pub fn bind_handler(&self, handler: Weak<dyn InboundHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    pub fn set_local_address(&self, address: String) {
        *self.local_address.lock() = Some(address);
    }

    pub fn local_address(&self) -> Option<String> {
        self.local_address.lock().clone()
    }

    pub async fn bind(&self, address: &str) -> Result<TcpListener, AppError> {
        TcpListener::bind(address)
            .await
            .map_err(|source| AppError::Bind {
                address: address.to_string(),
                source,
            })
    }

    /// Accept connections until shutdown. Accept failures are logged and retried.
    pub fn listen(self: &Arc<Self>, listener: TcpListener) {
        let manager = Arc::clone(self);
        self.shutdown.spawn("accept", async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        info!("Got a connection from {}", remote);
                        manager.register(stream, remote.to_string(), ConnectionDirection::Inbound);
                    }
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        });
    }

    /// Start the task that drains the broadcast channel. Only the first call has an effect.
    pub fn start_fanout(self: &Arc<Self>) {
        let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
            return;
        };
        let manager = Arc::clone(self);
        self.shutdown.spawn("fanout", async move {
            while let Some(outbound) = outbound_rx.recv().await {
                manager.fan_out(outbound);
            }
        });
    }

    fn fan_out(&self, outbound: Outbound) {
        let targets: Vec<(PeerHandle, mpsc::Sender<Frame>)> = {
            let connections = self.connections.lock();
            connections
                .values()
                .filter(|entry| Some(entry.handle.id) != outbound.skip)
                .map(|entry| (entry.handle.clone(), entry.queue.clone()))
                .collect()
        };

        if targets.is_empty() {
            debug!("Broadcast: no peers connected");
            return;
        }

        debug!("Broadcasting to {} peer(s)", targets.len());
        for (peer, queue) in targets {
            Self::enqueue(&peer, &queue, outbound.frame.clone());
        }
    }

    fn enqueue(peer: &PeerHandle, queue: &mpsc::Sender<Frame>, frame: Frame) -> bool {
        match queue.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Send queue full for {}, dropping frame", peer.address);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Connection {} already closed", peer.address);
                false
            }
        }
    }

    /// Connect to `address`. If that fails, connect to our own listening
    /// endpoint instead so the node always holds at least one connection.
    pub async fn dial(self: &Arc<Self>, address: &str) -> Result<PeerHandle, DialError> {
        match self.connect(address).await {
            Ok(handle) => Ok(handle),
            Err(DialError::ShuttingDown) => Err(DialError::ShuttingDown),
            Err(e) => {
                let Some(own) = self.local_address() else {
                    return Err(e);
                };
                if own == address {
                    return Err(e);
                }
                warn!("{}. Connecting to own network at {}", e, own);
                self.connect(&own).await
            }
        }
    }

    /// Connect to `address` without fallback. Returns the existing connection
    /// if one is already registered under that address.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<PeerHandle, DialError> {
        if self.shutdown.is_shutting_down() {
            return Err(DialError::ShuttingDown);
        }
        if let Some(existing) = self.find(address) {
            debug!("Already connected to peer: {}", address);
            return Ok(existing);
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| DialError::Connect {
                address: address.to_string(),
                source,
            })?;
        info!("Connected to {}", address);

        Ok(self.register(stream, address.to_string(), ConnectionDirection::Outbound))
    }

    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        address: String,
        direction: ConnectionDirection,
    ) -> PeerHandle {
        let (queue_tx, queue_rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let handle = PeerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            address: address.clone(),
            direction,
        };

        if let Some(frame) = self.handler().and_then(|handler| handler.greeting(&handle)) {
            // The queue is empty and has room for at least one frame.
            Self::enqueue(&handle, &queue_tx, frame);
        }

        {
            let mut connections = self.connections.lock();
            if let Some(existing) = connections.get(&address) {
                // Lost a race with a concurrent dial to the same address.
                debug!("Already connected to peer: {}", address);
                return existing.handle.clone();
            }
            connections.insert(
                address,
                ConnectionEntry {
                    handle: handle.clone(),
                    queue: queue_tx,
                },
            );
        }

        let (reader, writer) = stream.into_split();

        let manager = Arc::clone(self);
        let writer_handle = handle.clone();
        self.shutdown.spawn("connection-writer", async move {
            manager.write_loop(writer_handle, writer, queue_rx).await;
        });

        let manager = Arc::clone(self);
        let reader_handle = handle.clone();
        self.shutdown.spawn("connection-reader", async move {
            manager.read_loop(reader_handle, reader).await;
        });

        handle
    }

    async fn write_loop(
        &self,
        peer: PeerHandle,
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::Receiver<Frame>,
    ) {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!("Failed to write to {}: {}", peer.address, e);
                self.on_disconnect(&peer);
                return;
            }
        }
    }

    async fn read_loop(&self, peer: PeerHandle, reader: tokio::net::tcp::OwnedReadHalf) {
        let Some(handler) = self.handler() else {
            warn!("No frame handler installed, closing {}", peer.address);
            self.on_disconnect(&peer);
            return;
        };

        let mut frames = wire::frame_reader(reader, self.settings.max_frame_bytes);
        loop {
            match frames.next().await {
                Some(Ok(line)) => {
                    if handler.on_frame(&peer, line).await == FrameAction::Close {
                        info!("Closing connection to {}", peer.address);
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        "Read error from {}: {}",
                        peer.address,
                        wire::classify_codec_error(e)
                    );
                    break;
                }
                None => {
                    info!("Peer {} disconnected", peer.address);
                    break;
                }
            }
        }

        self.on_disconnect(&peer);
    }

    /// Deregister a connection. Entries registered later under the same address
    /// are left alone. Returns true if the connection was registered.
    pub fn on_disconnect(&self, peer: &PeerHandle) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(&peer.address) {
            Some(entry) if entry.handle.id == peer.id => {
                connections.remove(&peer.address);
                debug!("Unregistered connection: {}", peer.address);
                true
            }
            _ => false,
        }
    }

    /// Queue a frame for every registered connection.
    pub async fn broadcast(&self, frame: Frame) {
        self.queue_broadcast(Outbound { frame, skip: None }).await;
    }

    /// Queue a frame for every registered connection except `skip`.
    pub async fn broadcast_except(&self, frame: Frame, skip: ConnectionId) {
        self.queue_broadcast(Outbound {
            frame,
            skip: Some(skip),
        })
        .await;
    }

    async fn queue_broadcast(&self, outbound: Outbound) {
        if self.outbound_tx.send(outbound).await.is_err() {
            warn!("Broadcast channel closed, dropping frame");
        }
    }

    pub fn find(&self, address: &str) -> Option<PeerHandle> {
        self.connections
            .lock()
            .get(address)
            .map(|entry| entry.handle.clone())
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connections.lock().contains_key(address)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn outbound_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|entry| entry.handle.direction == ConnectionDirection::Outbound)
            .count()
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}
