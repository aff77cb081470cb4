//! TCP transport: length-delimited JSON frames over plain sockets
//!
//! Every connection starts with each side sending a [`NodeHello`] frame.
//! After that, every frame carries one encoded message. At most one link
//! is kept per peer; a second connection to an already linked peer is
//! closed right after the handshake.

use crate::error::{MeshError, MeshResult};
use crate::frame::{self, MAX_FRAME_LEN};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{Message, PeerId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 128;
const EVENT_QUEUE: usize = 1024;

/// Identity exchanged as the first frame on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHello {
    pub device_id: PeerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

struct PeerLink {
    conn_id: u64,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

struct Inner {
    local: NodeHello,
    links: DashMap<PeerId, PeerLink>,
    /// Peer learned from each seed address during its last handshake
    seed_peers: DashMap<String, PeerId>,
    dialing: DashSet<String>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    next_conn_id: AtomicU64,
}

impl Inner {
    async fn emit(&self, event: TransportEvent) {
        // Receiver gone means the node is shutting down
        let _ = self.events.send(event).await;
    }

    fn seed_is_linked(&self, seed: &str) -> bool {
        self.seed_peers
            .get(seed)
            .map_or(false, |peer| self.links.contains_key(peer.value()))
    }
}

pub struct TcpTransport {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    seeds: Vec<String>,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections
    ///
    /// Returns the transport together with the receiving end of its event
    /// stream. Everything the transport spawns stops when `cancel` fires.
    pub async fn bind(
        listen_addr: &str,
        local: NodeHello,
        seeds: Vec<String>,
        cancel: CancellationToken,
    ) -> MeshResult<(Arc<Self>, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
            MeshError::ConnectionFailed(format!("failed to bind {}: {}", listen_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        let (events, receiver) = mpsc::channel(EVENT_QUEUE);

        info!(
            device_id = %local.device_id,
            addr = %local_addr,
            seeds = seeds.len(),
            "TCP transport listening"
        );

        let inner = Arc::new(Inner {
            local,
            links: DashMap::new(),
            seed_peers: DashMap::new(),
            dialing: DashSet::new(),
            events,
            cancel,
            next_conn_id: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(listener, inner.clone()));

        Ok((
            Arc::new(Self {
                inner,
                local_addr,
                seeds,
            }),
            receiver,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial one address now, outside the scan schedule
    pub fn dial(&self, addr: impl Into<String>) {
        spawn_dial(self.inner.clone(), addr.into());
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start_scanning(&self, scan_interval: Duration) -> MeshResult<()> {
        let inner = self.inner.clone();
        let seeds = self.seeds.clone();

        info!(
            interval_ms = scan_interval.as_millis() as u64,
            seeds = seeds.len(),
            "Starting peer scan"
        );

        tokio::spawn(async move {
            let mut ticker = interval(scan_interval);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for seed in &seeds {
                            if inner.dialing.contains(seed) || inner.seed_is_linked(seed) {
                                continue;
                            }
                            spawn_dial(inner.clone(), seed.clone());
                        }
                    }
                }
            }
            debug!("Peer scan stopped");
        });

        Ok(())
    }

    async fn send(&self, peer: &PeerId, message: &Message) -> MeshResult<()> {
        let bytes = Bytes::from(frame::encode(message)?);
        let outbound = self
            .inner
            .links
            .get(peer)
            .map(|link| link.outbound.clone())
            .ok_or_else(|| MeshError::DeviceNotFound(peer.clone()))?;

        outbound
            .send(bytes)
            .await
            .map_err(|_| MeshError::TransmissionFailed(format!("link to {} closed", peer)))
    }

    async fn disconnect(&self, peer: &PeerId) -> MeshResult<()> {
        match self.inner.links.get(peer) {
            Some(link) => {
                link.cancel.cancel();
                Ok(())
            }
            None => Err(MeshError::DeviceNotFound(peer.clone())),
        }
    }

    async fn connected_devices(&self) -> MeshResult<Vec<PeerId>> {
        Ok(self
            .inner
            .links
            .iter()
            .map(|entry| entry.key().clone())
            .collect())
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!(remote_addr = %remote_addr, "Incoming connection");
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_connection(inner, stream, None).await {
                            warn!(remote_addr = %remote_addr, error = %e, "Inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

fn spawn_dial(inner: Arc<Inner>, addr: String) {
    if !inner.dialing.insert(addr.clone()) {
        return;
    }

    tokio::spawn(async move {
        let result = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => run_connection(inner.clone(), stream, Some(addr.clone())).await,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(MeshError::ConnectionFailed(format!("connect to {} timed out", addr))),
        };
        if let Err(e) = result {
            debug!(addr = %addr, error = %e, "Dial failed");
        }
        inner.dialing.remove(&addr);
    });
}

async fn run_connection(
    inner: Arc<Inner>,
    stream: TcpStream,
    seed: Option<String>,
) -> MeshResult<()> {
    let mut framed = Framed::new(stream, codec());

    framed
        .send(Bytes::from(serde_json::to_vec(&inner.local)?))
        .await?;
    let remote: NodeHello = match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(bytes))) => serde_json::from_slice(&bytes)?,
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => {
            return Err(MeshError::ConnectionFailed(
                "closed during handshake".to_string(),
            ))
        }
        Err(_) => return Err(MeshError::ConnectionFailed("handshake timed out".to_string())),
    };

    if remote.device_id == inner.local.device_id {
        return Err(MeshError::ConnectionFailed(
            "refusing connection to self".to_string(),
        ));
    }

    let peer_id = remote.device_id.clone();
    if let Some(seed) = &seed {
        inner.seed_peers.insert(seed.clone(), peer_id.clone());
    }

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let link_cancel = inner.cancel.child_token();
    let (outbound, mut queue) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

    match inner.links.entry(peer_id.clone()) {
        Entry::Occupied(_) => {
            debug!(peer_id = %peer_id, "Already linked; closing duplicate connection");
            return Ok(());
        }
        Entry::Vacant(slot) => {
            slot.insert(PeerLink {
                conn_id,
                outbound,
                cancel: link_cancel.clone(),
            });
        }
    }

    info!(peer_id = %peer_id, name = %remote.name, "Peer link established");
    inner
        .emit(TransportEvent::PeerConnected {
            peer_id: peer_id.clone(),
            name: remote.name.clone(),
            group_id: remote.group_id.clone(),
        })
        .await;

    let (mut sink, mut frames) = framed.split::<Bytes>();

    let writer_cancel = link_cancel.clone();
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(bytes) => {
                        if let Err(e) = sink.send(bytes).await {
                            warn!(peer_id = %writer_peer, error = %e, "Write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        writer_cancel.cancel();
    });

    loop {
        tokio::select! {
            _ = link_cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(bytes)) => {
                    inner
                        .emit(TransportEvent::FrameReceived {
                            peer_id: peer_id.clone(),
                            bytes: bytes.to_vec(),
                        })
                        .await;
                }
                Some(Err(e)) => {
                    warn!(peer_id = %peer_id, error = %e, "Read failed");
                    break;
                }
                None => break,
            }
        }
    }

    link_cancel.cancel();
    let _ = writer.await;
    inner.links.remove_if(&peer_id, |_, link| link.conn_id == conn_id);

    info!(peer_id = %peer_id, "Peer link closed");
    inner
        .emit(TransportEvent::PeerDisconnected { peer_id })
        .await;
    Ok(())
}
