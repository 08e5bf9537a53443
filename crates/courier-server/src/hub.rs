//! The routing hub: accept loop, peer table, dispatch rules, and transfer
//! coordination.
//!
//! One task loops on the listener; each accepted connection gets a dedicated
//! read task, and forwards go straight through the target endpoint's
//! serialized write path, which preserves per-sender/target order. A
//! background task sweeps idle transfers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_net::Connection;
use courier_proto::{Message, SERVER_SENDER};

use crate::registry::{ChunkOutcome, TRANSFER_IDLE_MAX, Transfer, TransferRegistry};

/// How often the idle-transfer sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Socket buffer size applied to accepted connections.
const SOCKET_BUF_SIZE: usize = 256 * 1024;

/// Lifecycle notifications, published on a broadcast channel instead of
/// callbacks so the hub's ownership stays explicit.
#[derive(Debug, Clone)]
pub enum HubEvent {
    PeerJoined { id: String },
    PeerLeft { id: String, name: String },
    TransferStarted {
        id: Uuid,
        sender: String,
        target: String,
        file_name: String,
        size: u64,
    },
    TransferEnded {
        id: Uuid,
        success: bool,
        reason: String,
    },
}

/// One connected peer as the hub sees it.
pub struct Peer {
    pub id: String,
    name: std::sync::RwLock<String>,
    pub connected_at: DateTime<Utc>,
    conn: Arc<Connection>,
}

impl Peer {
    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }
}

/// Manages all connected peers and routes messages between them.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    registry: TransferRegistry,
    events: broadcast::Sender<HubEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Hub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(HubInner {
                peers: RwLock::new(HashMap::new()),
                registry: TransferRegistry::new(),
                events,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Subscribe to lifecycle events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Accept loop. Runs until [`Hub::shutdown`] is called.
    pub async fn run(&self, listener: TcpListener) {
        let sweeper = self.clone();
        self.inner
            .tracker
            .spawn(async move { sweeper.sweep_loop().await });

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        let hub = self.clone();
                        self.inner.tracker.spawn(async move {
                            hub.handle_peer(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                },
            }
        }
    }

    /// Trips every endpoint's cancellation signal and waits for the
    /// per-connection tasks to drain.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.peers.write().await.clear();
    }

    async fn handle_peer(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = tune_socket(&stream) {
            warn!("socket options for {addr}: {e}");
        }
        let conn = Arc::new(Connection::with_cancel(
            stream,
            self.inner.shutdown.child_token(),
        ));

        let peer = self.register(conn).await;
        info!("peer {} connected from {addr}", peer.id);
        let _ = self.inner.events.send(HubEvent::PeerJoined {
            id: peer.id.clone(),
        });

        loop {
            match peer.conn.recv().await {
                Ok(Some(msg)) => self.dispatch(&peer, msg).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("peer {}: {e}", peer.id);
                    break;
                }
            }
        }

        self.remove_peer(&peer).await;
    }

    /// Draws a fresh 8-hex-char id (retrying while in use) and registers the
    /// endpoint under it. Check and insert happen under one write lock, so
    /// ids are unique among currently connected peers.
    async fn register(&self, conn: Arc<Connection>) -> Arc<Peer> {
        let mut peers = self.inner.peers.write().await;
        let id = loop {
            let raw = rand::rng().random::<u64>();
            let candidate = hex::encode(&raw.to_be_bytes()[..4]);
            if !peers.contains_key(&candidate) {
                break candidate;
            }
        };
        let peer = Arc::new(Peer {
            id: id.clone(),
            name: std::sync::RwLock::new(String::new()),
            connected_at: Utc::now(),
            conn,
        });
        peers.insert(id, peer.clone());
        peer
    }

    async fn remove_peer(&self, peer: &Arc<Peer>) {
        peer.conn.close();
        let present = self.inner.peers.write().await.remove(&peer.id).is_some();
        if !present {
            return;
        }

        // Abort transfers the peer was part of and tell the surviving side.
        for t in self.inner.registry.remove_involving(&peer.id) {
            let survivor = if t.sender == peer.id {
                &t.target
            } else {
                &t.sender
            };
            self.send_to(
                survivor,
                &Message::FileEnd {
                    sender: SERVER_SENDER.into(),
                    target: survivor.clone(),
                    transfer_id: t.id.to_string(),
                    success: false,
                    error: "peer disconnected".into(),
                },
            )
            .await;
            let _ = self.inner.events.send(HubEvent::TransferEnded {
                id: t.id,
                success: false,
                reason: "peer disconnected".into(),
            });
        }

        info!("peer {} disconnected", peer.id);
        let _ = self.inner.events.send(HubEvent::PeerLeft {
            id: peer.id.clone(),
            name: peer.name(),
        });
    }

    /// Applies the routing table to one inbound message. The sender field is
    /// rewritten to the authoritative id first, whatever the peer claimed.
    async fn dispatch(&self, peer: &Arc<Peer>, mut msg: Message) {
        msg.set_sender(&peer.id);

        match msg {
            Message::Chat { ref target, .. } => {
                if target.is_empty() {
                    self.broadcast(&msg, &peer.id).await;
                } else if !self.send_to(target, &msg).await {
                    self.report_error(peer, format!("unknown peer {target}")).await;
                }
            }

            Message::FileStart {
                ref target,
                ref transfer_id,
                ref file_name,
                file_size,
                ..
            } => {
                let Some(tid) = self.parse_transfer_id(peer, transfer_id).await else {
                    return;
                };
                if self.find_peer(target).await.is_none() {
                    self.report_error(peer, format!("unknown peer {target}")).await;
                    return;
                }
                match self
                    .inner
                    .registry
                    .open(tid, file_name, file_size, &peer.id, target)
                {
                    Ok(t) => {
                        let _ = self.inner.events.send(HubEvent::TransferStarted {
                            id: t.id,
                            sender: t.sender,
                            target: t.target.clone(),
                            file_name: t.file_name,
                            size: t.size,
                        });
                        if !self.send_to(&t.target, &msg).await {
                            self.abort_transfer(tid, "recipient unreachable").await;
                            self.report_error(peer, "recipient unreachable".into()).await;
                        }
                    }
                    Err(e) => self.report_error(peer, e.to_string()).await,
                }
            }

            Message::DownloadAccept {
                ref transfer_id, ..
            } => {
                let Some(tid) = self.parse_transfer_id(peer, transfer_id).await else {
                    return;
                };
                match self.inner.registry.accept(tid, &peer.id) {
                    Ok(t) => {
                        self.send_to(
                            &t.sender,
                            &Message::UploadConfirmed {
                                sender: SERVER_SENDER.into(),
                                transfer_id: transfer_id.clone(),
                            },
                        )
                        .await;
                    }
                    Err(e) => self.report_error(peer, e.to_string()).await,
                }
            }

            Message::DownloadReject {
                ref transfer_id, ..
            } => {
                let Some(tid) = self.parse_transfer_id(peer, transfer_id).await else {
                    return;
                };
                match self.inner.registry.reject(tid, &peer.id) {
                    Ok(t) => {
                        self.send_to(
                            &t.sender,
                            &Message::FileEnd {
                                sender: SERVER_SENDER.into(),
                                target: t.sender.clone(),
                                transfer_id: transfer_id.clone(),
                                success: false,
                                error: "rejected by recipient".into(),
                            },
                        )
                        .await;
                        let _ = self.inner.events.send(HubEvent::TransferEnded {
                            id: t.id,
                            success: false,
                            reason: "rejected".into(),
                        });
                    }
                    Err(e) => self.report_error(peer, e.to_string()).await,
                }
            }

            Message::FileData {
                ref transfer_id,
                seq,
                ref data,
                ..
            } => {
                let Some(tid) = self.parse_transfer_id(peer, transfer_id).await else {
                    return;
                };
                match self.inner.registry.observe_chunk(tid, seq, data.len()) {
                    Ok(outcome) => {
                        // Route by the registry's notion of the target, not
                        // whatever the chunk frame claims.
                        if let Some(t) = self.inner.registry.get(tid) {
                            self.send_to(&t.target, &msg).await;
                        }
                        self.send_to(
                            &peer.id,
                            &Message::Ack {
                                sender: SERVER_SENDER.into(),
                                target: peer.id.clone(),
                                transfer_id: transfer_id.clone(),
                                seq,
                            },
                        )
                        .await;
                        if outcome == ChunkOutcome::Complete {
                            debug!("transfer {tid}: full chunk set observed");
                        }
                    }
                    Err(e) => self.report_error(peer, e.to_string()).await,
                }
            }

            Message::FileEnd {
                ref target,
                ref transfer_id,
                success,
                ..
            } => {
                let closed = Uuid::parse_str(transfer_id)
                    .ok()
                    .and_then(|tid| self.inner.registry.close(tid, success));
                // Either side may end a transfer (the receiver does on a
                // local write failure); forward to whichever side this
                // frame did not come from.
                let route = match &closed {
                    Some(t) if t.sender == peer.id => t.target.clone(),
                    Some(t) => t.sender.clone(),
                    None => target.clone(),
                };
                if !route.is_empty() {
                    self.send_to(&route, &msg).await;
                }
                if let Some(t) = closed {
                    let _ = self.inner.events.send(HubEvent::TransferEnded {
                        id: t.id,
                        success,
                        reason: if success { "completed" } else { "aborted" }.into(),
                    });
                }
            }

            Message::Ack { ref target, .. } | Message::Error { ref target, .. } => {
                if !target.is_empty() {
                    self.send_to(target, &msg).await;
                }
            }

            Message::ClientConnect {
                ref client_name, ..
            } => {
                *peer.name.write().unwrap() = client_name.clone();
                info!("peer {} is now known as {client_name:?}", peer.id);
                self.send_to(
                    &peer.id,
                    &Message::ClientIdResponse {
                        sender: SERVER_SENDER.into(),
                        client_id: peer.id.clone(),
                    },
                )
                .await;
            }

            Message::ClientDisconnect { ref reason, .. } => {
                debug!("peer {} says goodbye: {reason:?}", peer.id);
                peer.conn.close();
            }

            // Peers have no business sending hub-originated kinds; drop them.
            Message::ClientIdResponse { .. } | Message::UploadConfirmed { .. } => {
                warn!(
                    "peer {} sent server-only kind {}, dropping",
                    peer.id,
                    msg.kind_name()
                );
            }
        }
    }

    async fn parse_transfer_id(&self, peer: &Arc<Peer>, raw: &str) -> Option<Uuid> {
        match Uuid::parse_str(raw) {
            Ok(tid) => Some(tid),
            Err(_) => {
                self.report_error(peer, format!("bad transfer id {raw:?}")).await;
                None
            }
        }
    }

    async fn find_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.peers.read().await.get(id).cloned()
    }

    /// Unicast. Returns false if the target is not connected. A write
    /// failure marks the endpoint for cleanup but still counts as routed.
    async fn send_to(&self, id: &str, msg: &Message) -> bool {
        let Some(peer) = self.find_peer(id).await else {
            return false;
        };
        if let Err(e) = peer.conn.send(msg).await {
            warn!("write to peer {id} failed: {e}");
            peer.conn.close();
        }
        true
    }

    /// Best-effort fan-out to every connected peer except `exclude`. The
    /// peer set is snapshotted first so no lock is held across network I/O.
    async fn broadcast(&self, msg: &Message, exclude: &str) {
        let targets: Vec<Arc<Peer>> = {
            let peers = self.inner.peers.read().await;
            peers
                .values()
                .filter(|p| p.id != exclude)
                .cloned()
                .collect()
        };
        for peer in targets {
            if let Err(e) = peer.conn.send(msg).await {
                warn!("broadcast to peer {} failed: {e}", peer.id);
                peer.conn.close();
            }
        }
    }

    /// ERROR frame back to the offending peer. Protocol errors never
    /// terminate the connection.
    async fn report_error(&self, peer: &Arc<Peer>, description: String) {
        debug!("peer {}: {description}", peer.id);
        self.send_to(
            &peer.id,
            &Message::Error {
                sender: SERVER_SENDER.into(),
                target: peer.id.clone(),
                description,
            },
        )
        .await;
    }

    async fn abort_transfer(&self, id: Uuid, reason: &str) {
        if self.inner.registry.close(id, false).is_some() {
            let _ = self.inner.events.send(HubEvent::TransferEnded {
                id,
                success: false,
                reason: reason.into(),
            });
        }
    }

    async fn sweep_loop(&self) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let removed = self
                .inner
                .registry
                .sweep(Instant::now(), TRANSFER_IDLE_MAX);
            if removed.is_empty() {
                continue;
            }
            info!("sweep: expired {} idle transfers", removed.len());
            for t in removed {
                self.notify_expired(&t).await;
            }
        }
    }

    async fn notify_expired(&self, t: &Transfer) {
        for side in [&t.sender, &t.target] {
            self.send_to(
                side,
                &Message::FileEnd {
                    sender: SERVER_SENDER.into(),
                    target: side.to_string(),
                    transfer_id: t.id.to_string(),
                    success: false,
                    error: "expired".into(),
                },
            )
            .await;
        }
        let _ = self.inner.events.send(HubEvent::TransferEnded {
            id: t.id,
            success: false,
            reason: "expired".into(),
        });
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_send_buffer_size(SOCKET_BUF_SIZE)?;
    sock.set_recv_buffer_size(SOCKET_BUF_SIZE)?;
    Ok(())
}
