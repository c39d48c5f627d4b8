use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{NodeConfig, PROTOCOL_VERSION, USER_AGENT};
use crate::debug_log::DebugLog;
use crate::net::message::{NetAddress, NetworkMessage, VersionMessage};
use crate::net::misbehavior::{Misbehavior, MisbehaviorRecord};
use crate::net::peer::{DisconnectReason, PeerConnection, PeerId, PeerStats};
use crate::net::policy::PayloadPolicy;
use crate::net::scheduler::{MessageScheduler, PushOutcome, QueuedMessage};
use crate::net::validation::HeaderValidator;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const OUTBOUND_CONNECT_TIMEOUT_SECS: u64 = 3;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Aggregate traffic across every peer, as reported by `getnettotals`
#[derive(Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetTotalsSnapshot {
    pub total_bytes_recv: u64,
    pub total_bytes_sent: u64,
}

impl NetTotals {
    pub fn record_recv(&self, n: usize) {
        self.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetTotalsSnapshot {
        NetTotalsSnapshot {
            total_bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            total_bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version_sent: bool,
    pub version_received: bool,
    pub verack_received: bool,
    pub getaddr_answered: bool,
}

pub struct PeerInfo {
    pub stats: Arc<PeerStats>,
    pub handshake: Handshake,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PeerInfo {
    fn send(&self, msg: &NetworkMessage, magic: [u8; 4]) {
        let frame = msg.to_frame(magic);
        let len = frame.len();
        self.stats.queue_send(len);
        // a closed channel means the writer already exited on disconnect
        if self.tx.send(frame).is_err() {
            self.stats.dequeue_send(len);
        }
    }
}

#[derive(Clone)]
pub struct P2PNode {
    pub peers: Arc<Mutex<HashMap<PeerId, PeerInfo>>>,
    pub scheduler: Arc<MessageScheduler>,
    pub totals: Arc<NetTotals>,
    pub log: Arc<DebugLog>,
    config: Arc<NodeConfig>,
    validator: HeaderValidator,
    policy: PayloadPolicy,
    next_peer_id: Arc<AtomicU64>,
    local_nonce: u64,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Running node: listener, dispatcher and every peer task
pub struct NodeHandle {
    node: P2PNode,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node(&self) -> &P2PNode {
        &self.node
    }

    pub fn debug_log(&self) -> &Arc<DebugLog> {
        &self.node.log
    }

    pub fn net_totals(&self) -> NetTotalsSnapshot {
        self.node.totals.snapshot()
    }

    pub async fn peer_count(&self) -> usize {
        self.node.peers.lock().await.len()
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn net_address_of(addr: SocketAddr) -> NetAddress {
    let ip = match addr {
        SocketAddr::V4(v4) => v4.ip().to_ipv6_mapped().octets(),
        SocketAddr::V6(v6) => v6.ip().octets(),
    };
    NetAddress { services: 0, ip, port: addr.port() }
}

impl P2PNode {
    pub fn new(config: NodeConfig) -> Self {
        let mut nonce = [0u8; 8];
        // a zero nonce only weakens self-connection detection
        let _ = getrandom::getrandom(&mut nonce);
        let (shutdown, _) = watch::channel(false);
        P2PNode {
            peers: Arc::new(Mutex::new(HashMap::new())),
            scheduler: Arc::new(MessageScheduler::new(config.receive_flood_size)),
            totals: Arc::new(NetTotals::default()),
            log: Arc::new(DebugLog::new(config.debug_log_capacity)),
            validator: HeaderValidator::new(config.magic(), config.max_message_length),
            policy: PayloadPolicy::default(),
            next_peer_id: Arc::new(AtomicU64::new(0)),
            local_nonce: u64::from_le_bytes(nonce),
            shutdown: Arc::new(shutdown),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn bind(&self) -> Result<TcpListener, BoxError> {
        let addr = self.config.listen_addr()?;

        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        // Allow quick restarts on the same port
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Bind the listener and spawn the accept loop and the dispatcher
    pub async fn start(config: NodeConfig) -> Result<NodeHandle, BoxError> {
        let node = P2PNode::new(config);
        let listener = node.bind()?;
        let local_addr = listener.local_addr()?;
        node.log.debug(format!("Bound to {local_addr}"));

        let accept = {
            let node = node.clone();
            tokio::spawn(async move { node.accept_loop(listener).await })
        };
        let dispatch = {
            let node = node.clone();
            tokio::spawn(async move { node.dispatch_loop().await })
        };

        Ok(NodeHandle {
            node,
            local_addr,
            tasks: vec![accept, dispatch],
        })
    }

    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let peers = self.peers.lock().await;
        for p in peers.values() {
            p.stats.mark_disconnect();
        }
    }

    async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
        // Err means the sender is gone, which is a shutdown as well
        let _ = rx.wait_for(|stop| *stop).await;
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let stop = Self::wait_shutdown(self.shutdown.subscribe());
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                accept_res = listener.accept() => {
                    let (stream, peer_addr) = match accept_res {
                        Ok(a) => a,
                        Err(e) => {
                            self.log.warn(format!("accept failed: {e}"));
                            continue;
                        }
                    };
                    let inbound_count = self.peers.lock().await.values().filter(|p| p.stats.inbound).count();
                    if inbound_count >= self.config.max_inbound {
                        self.log.debug(format!("rejecting inbound {peer_addr}: connection limit"));
                        continue;
                    }
                    self.spawn_connection(stream, peer_addr, true).await;
                }
            }
        }
    }

    /// Connect to a peer and start the handshake with our version message
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, BoxError> {
        self.log.debug(format!("trying connection {addr}"));
        let stream = timeout(
            Duration::from_secs(OUTBOUND_CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await??;
        Ok(self.spawn_connection(stream, addr, false).await)
    }

    fn our_version(&self, peer_addr: SocketAddr) -> NetworkMessage {
        NetworkMessage::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: unix_time(),
            addr_recv: net_address_of(peer_addr),
            addr_from: NetAddress::default(),
            nonce: self.local_nonce,
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
            relay: true,
        })
    }

    async fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, inbound: bool) -> PeerId {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(PeerStats::new(id, addr, inbound, self.config.misbehavior_threshold));
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let resume = self.scheduler.register(id);

        let mut info = PeerInfo {
            stats: stats.clone(),
            handshake: Handshake::default(),
            tx,
        };
        if !inbound {
            info.send(&self.our_version(addr), self.config.magic());
            info.handshake.version_sent = true;
        }
        self.peers.lock().await.insert(id, info);
        self.log.debug(format!(
            "Added connection {} peer={id} ({addr})",
            if inbound { "inbound" } else { "outbound" }
        ));

        tokio::spawn(write_loop(write_half, rx, stats.clone(), self.totals.clone()));

        let node = self.clone();
        tokio::spawn(async move {
            let reason = node.read_loop(read_half, stats.clone(), resume).await;
            node.finish_peer(&stats, &reason).await;
        });
        id
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf, stats: Arc<PeerStats>, resume: Arc<Notify>) -> DisconnectReason {
        let id = stats.id;
        let mut conn = PeerConnection::new(stats.clone(), self.validator, self.policy, self.log.clone());
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let send_budget = self.config.send_flood_size.max(1);
        loop {
            // Peer is not reading our replies: stop reading its requests
            if stats.send_backlog() >= send_budget {
                tokio::select! {
                    _ = stats.disconnected() => return DisconnectReason::Requested,
                    _ = stats.send_below(send_budget) => {}
                }
            }

            let n = tokio::select! {
                _ = stats.disconnected() => return DisconnectReason::Requested,
                r = read_half.read(&mut buf) => match r {
                    Ok(0) => return DisconnectReason::Closed,
                    Ok(n) => n,
                    Err(e) => return DisconnectReason::Io(e),
                },
            };
            self.totals.record_recv(n);
            let received = match conn.receive_bytes(&buf[..n]) {
                Ok(r) => r,
                Err(reason) => return reason,
            };

            let mut paused = false;
            for r in received {
                match self.scheduler.push(id, r.msg, r.wire_len) {
                    PushOutcome::Paused => paused = true,
                    PushOutcome::Queued => {}
                    PushOutcome::Dropped => return DisconnectReason::Requested,
                }
            }

            // Stop reading the socket until the dispatcher catches up
            while paused && self.scheduler.is_paused(id) {
                tokio::select! {
                    _ = stats.disconnected() => return DisconnectReason::Requested,
                    _ = resume.notified() => {}
                }
                paused = self.scheduler.is_registered(id);
            }
        }
    }

    async fn finish_peer(&self, stats: &PeerStats, reason: &DisconnectReason) {
        stats.mark_disconnect();
        self.scheduler.remove(stats.id);
        self.peers.lock().await.remove(&stats.id);
        self.log.debug(format!(
            "disconnecting peer={} ({}): {reason} [recv {} bytes, sent {} bytes]",
            stats.id,
            stats.addr,
            stats.bytes_recv(),
            stats.bytes_sent()
        ));
    }

    async fn dispatch_loop(&self) {
        let stop = Self::wait_shutdown(self.shutdown.subscribe());
        tokio::pin!(stop);
        loop {
            let item = tokio::select! {
                _ = &mut stop => break,
                item = self.scheduler.next() => item,
            };
            let mut peers = self.peers.lock().await;
            let Some(peer) = peers.get_mut(&item.peer) else {
                continue;
            };
            if peer.stats.is_disconnected() {
                continue;
            }
            self.handle_msg(item, peer);
        }
    }

    fn misbehaving(&self, peer: &PeerInfo, reason: Misbehavior) {
        let rec = MisbehaviorRecord::new(peer.stats.id, reason);
        if peer.stats.misbehavior.record(&rec, &self.log).should_disconnect() {
            peer.stats.mark_disconnect();
            self.scheduler.remove(peer.stats.id);
        }
    }

    fn handle_msg(&self, item: QueuedMessage, peer: &mut PeerInfo) {
        let id = item.peer;
        let magic = self.config.magic();

        if let NetworkMessage::Version(v) = &item.msg {
            if peer.handshake.version_received {
                self.misbehaving(peer, Misbehavior::DuplicateVersion);
                return;
            }
            if v.nonce == self.local_nonce && !peer.stats.inbound {
                self.log.warn(format!("connected to self at {}, disconnecting", peer.stats.addr));
                peer.stats.mark_disconnect();
                return;
            }
            peer.handshake.version_received = true;
            self.log.debug(format!(
                "receive version message: {}: version {}, blocks={}, peer={id}",
                v.user_agent, v.version, v.start_height
            ));
            if !peer.handshake.version_sent {
                peer.send(&self.our_version(peer.stats.addr), magic);
                peer.handshake.version_sent = true;
            }
            peer.send(&NetworkMessage::Verack, magic);
            return;
        }

        if !peer.handshake.version_received {
            self.misbehaving(
                peer,
                Misbehavior::BeforeVersion {
                    msgtype: item.msg.msgtype().to_string(),
                },
            );
            return;
        }

        match item.msg {
            NetworkMessage::Verack => {
                if !peer.handshake.verack_received {
                    peer.handshake.verack_received = true;
                    self.log.debug(format!(
                        "New {} peer connected: peer={id}",
                        if peer.stats.inbound { "inbound" } else { "outbound" }
                    ));
                }
            }
            NetworkMessage::Ping(nonce) => peer.send(&NetworkMessage::Pong(nonce), magic),
            NetworkMessage::Pong(_) | NetworkMessage::SendHeaders => {}
            NetworkMessage::GetAddr => {
                // answer once per connection, and only to inbound peers
                if peer.stats.inbound && !peer.handshake.getaddr_answered {
                    peer.handshake.getaddr_answered = true;
                    peer.send(&NetworkMessage::Addr(Vec::new()), magic);
                }
            }
            NetworkMessage::Inv(list) | NetworkMessage::GetData(list) | NetworkMessage::NotFound(list) => {
                self.log.debug(format!("received {} entries of inventory peer={id}", list.len()));
            }
            NetworkMessage::Headers(headers) => {
                self.log.debug(format!("received {} headers peer={id}", headers.len()));
            }
            NetworkMessage::Addr(addrs) => {
                self.log.debug(format!("received {} addresses peer={id}", addrs.len()));
            }
            NetworkMessage::Unknown { msgtype, .. } => {
                self.log.debug(format!("Unknown message type {msgtype} peer={id}"));
            }
            NetworkMessage::Version(_) => {}
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stats: Arc<PeerStats>,
    totals: Arc<NetTotals>,
) {
    loop {
        let buf = tokio::select! {
            _ = stats.disconnected() => break,
            next = rx.recv() => match next {
                Some(b) => b,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = stats.disconnected() => {
                stats.dequeue_send(buf.len());
                break;
            }
            r = write_half.write_all(&buf) => r,
        };
        stats.dequeue_send(buf.len());
        if written.is_err() {
            stats.mark_disconnect();
            break;
        }
        stats.record_sent(buf.len());
        totals.record_sent(buf.len());
    }
    let _ = write_half.shutdown().await;
}
