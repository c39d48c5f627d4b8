// Raw TCP test peer speaking the wire protocol directly, so tests can send
// frames the node would never produce itself.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;

use p2pframe::config::{NodeConfig, PROTOCOL_VERSION};
use p2pframe::net::message::{
    HEADER_SIZE, MessageHeader, NetAddress, NetworkMessage, VersionMessage, build_raw_frame,
    write_compact_size,
};
use p2pframe::net::node::{NodeHandle, P2PNode};

pub const MSG_LIMIT: usize = 4_000_000;
/// Largest string that still fits in a MSG_LIMIT payload behind its 5-byte length prefix
pub const VALID_DATA_LIMIT: usize = MSG_LIMIT - 5;

pub async fn start_node() -> NodeHandle {
    P2PNode::start(NodeConfig::local_regtest()).await.unwrap()
}

/// Payload of a `badmsg`: one length-prefixed string
pub fn badmsg_payload(data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 9);
    write_compact_size(&mut payload, data.len() as u64);
    payload.extend_from_slice(data);
    payload
}

pub struct TestPeer {
    pub magic: [u8; 4],
    reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    next_nonce: u64,
}

impl TestPeer {
    pub async fn connect(addr: SocketAddr, magic: [u8; 4]) -> TestPeer {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        let (reader, writer) = stream.into_split();
        TestPeer {
            magic,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            next_nonce: 1,
        }
    }

    /// Connect and complete the version handshake
    pub async fn connect_and_handshake(node: &NodeHandle) -> TestPeer {
        let mut peer = TestPeer::connect(node.local_addr(), node.node().config().magic()).await;
        peer.handshake().await;
        peer
    }

    pub fn writer(&self) -> Arc<Mutex<OwnedWriteHalf>> {
        self.writer.clone()
    }

    pub fn build_message(&self, msg: &NetworkMessage) -> Vec<u8> {
        msg.to_frame(self.magic)
    }

    pub fn build_raw(&self, msgtype: &str, payload: &[u8]) -> Vec<u8> {
        build_raw_frame(self.magic, msgtype, payload)
    }

    /// Write bytes as-is. Errors are ignored since the node may already
    /// have closed the connection.
    pub async fn send_raw(&self, bytes: &[u8]) {
        let mut w = self.writer.lock().await;
        let _ = w.write_all(bytes).await;
        let _ = w.flush().await;
    }

    pub async fn send_message(&self, msg: &NetworkMessage) {
        self.send_raw(&self.build_message(msg)).await;
    }

    pub async fn recv_message(&mut self, wait: Duration) -> Option<NetworkMessage> {
        timeout(wait, self.read_message()).await.ok().flatten()
    }

    async fn read_message(&mut self) -> Option<NetworkMessage> {
        let mut hdr = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut hdr).await.ok()?;
        let header = MessageHeader::from_bytes(&hdr);
        let mut payload = vec![0u8; header.length as usize];
        self.reader.read_exact(&mut payload).await.ok()?;
        let msgtype = header.msgtype_str()?.to_string();
        NetworkMessage::decode(&msgtype, &payload).ok()
    }

    pub fn version_message(&self) -> NetworkMessage {
        NetworkMessage::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: 0,
            addr_recv: NetAddress::default(),
            addr_from: NetAddress::default(),
            nonce: 0x5eed_5eed,
            user_agent: "/test-peer:0.1/".to_string(),
            start_height: 0,
            relay: false,
        })
    }

    pub async fn handshake(&mut self) {
        self.send_message(&self.version_message()).await;
        let (mut got_version, mut got_verack) = (false, false);
        while !(got_version && got_verack) {
            match self.recv_message(Duration::from_secs(5)).await {
                Some(NetworkMessage::Version(_)) => got_version = true,
                Some(NetworkMessage::Verack) => got_verack = true,
                Some(_) => {}
                None => panic!("handshake did not complete"),
            }
        }
        self.send_message(&NetworkMessage::Verack).await;
        self.sync_with_ping(Duration::from_secs(5)).await;
    }

    /// Send a ping and wait for the matching pong. Every message sent
    /// earlier on this connection has been processed once this returns.
    pub async fn sync_with_ping(&mut self, wait: Duration) {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.send_message(&NetworkMessage::Ping(nonce)).await;
        let got = timeout(wait, async {
            loop {
                match self.read_message().await {
                    Some(NetworkMessage::Pong(n)) if n == nonce => return true,
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await;
        assert_eq!(got, Ok(true), "no pong for ping {nonce} within {wait:?}");
    }

    pub async fn send_and_ping(&mut self, msg: &NetworkMessage) {
        self.send_message(msg).await;
        self.sync_with_ping(Duration::from_secs(5)).await;
    }

    /// True once the node has closed the connection
    pub async fn wait_for_disconnect(&mut self, wait: Duration) -> bool {
        let mut buf = vec![0u8; 64 * 1024];
        timeout(wait, async {
            loop {
                match self.reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await
        .is_ok()
    }
}
