// Per-peer receive pipeline, independent of any socket.
//
// bytes -> counters -> FrameReader (magic, length) -> HeaderValidator (type,
// checksum) -> PayloadPolicy -> decode. Fatal errors end the connection,
// recoverable ones drop a single message, policy violations are scored.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::debug_log::DebugLog;
use crate::net::frame::{FrameReader, RawFrame};
use crate::net::message::NetworkMessage;
use crate::net::misbehavior::{MisbehaviorRecord, MisbehaviorScore, ScoreOutcome};
use crate::net::policy::PayloadPolicy;
use crate::net::validation::{FrameError, HeaderValidator};

pub type PeerId = u64;

#[derive(Debug, thiserror::Error)]
pub enum DisconnectReason {
    #[error("{0}")]
    Frame(FrameError),
    #[error("misbehavior score {score} reached threshold")]
    Misbehavior { score: u32 },
    #[error("connection closed by peer")]
    Closed,
    #[error("disconnect requested")]
    Requested,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// State of one connection shared between its reader, writer and the dispatcher
pub struct PeerStats {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub misbehavior: MisbehaviorScore,
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    send_backlog: AtomicUsize,
    send_drained: Notify,
    disconnect: AtomicBool,
    disconnect_notify: Notify,
}

impl PeerStats {
    pub fn new(id: PeerId, addr: SocketAddr, inbound: bool, misbehavior_threshold: u32) -> Self {
        PeerStats {
            id,
            addr,
            inbound,
            misbehavior: MisbehaviorScore::new(misbehavior_threshold),
            bytes_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_backlog: AtomicUsize::new(0),
            send_drained: Notify::new(),
            disconnect: AtomicBool::new(false),
            disconnect_notify: Notify::new(),
        }
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes handed to the writer that have not reached the socket yet
    pub fn send_backlog(&self) -> usize {
        self.send_backlog.load(Ordering::Acquire)
    }

    pub fn queue_send(&self, n: usize) {
        self.send_backlog.fetch_add(n, Ordering::AcqRel);
    }

    /// `n` queued bytes left the send queue, written or discarded
    pub fn dequeue_send(&self, n: usize) {
        let _ = self
            .send_backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(n)));
        self.send_drained.notify_waiters();
    }

    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Resolves once the send backlog is below `budget`
    pub async fn send_below(&self, budget: usize) {
        loop {
            let drained = self.send_drained.notified();
            if self.send_backlog() < budget {
                return;
            }
            drained.await;
        }
    }

    fn record_recv(&self, n: usize) {
        self.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Flag the peer for disconnection. Returns true the first time only.
    pub fn mark_disconnect(&self) -> bool {
        let first = !self.disconnect.swap(true, Ordering::AcqRel);
        if first {
            self.disconnect_notify.notify_waiters();
        }
        first
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Resolves once the peer has been flagged for disconnection
    pub async fn disconnected(&self) {
        loop {
            let notified = self.disconnect_notify.notified();
            if self.is_disconnected() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub msg: NetworkMessage,
    pub wire_len: usize,
}

pub struct PeerConnection {
    stats: Arc<PeerStats>,
    reader: FrameReader,
    policy: PayloadPolicy,
    log: Arc<DebugLog>,
}

impl PeerConnection {
    pub fn new(
        stats: Arc<PeerStats>,
        validator: HeaderValidator,
        policy: PayloadPolicy,
        log: Arc<DebugLog>,
    ) -> Self {
        PeerConnection {
            stats,
            reader: FrameReader::new(validator),
            policy,
            log,
        }
    }

    pub fn stats(&self) -> &Arc<PeerStats> {
        &self.stats
    }

    /// Bytes held for a frame that is not complete yet
    pub fn buffered_len(&self) -> usize {
        self.reader.partial_len()
    }

    /// Feed a chunk from the transport. Returns the messages it completed, in
    /// arrival order. On error the peer is already flagged for disconnect and
    /// every frame still buffered is discarded.
    pub fn receive_bytes(&mut self, chunk: &[u8]) -> Result<Vec<ReceivedMessage>, DisconnectReason> {
        self.stats.record_recv(chunk.len());
        if self.stats.is_disconnected() {
            return Err(DisconnectReason::Requested);
        }

        // Frames completed before a fatal error in the same chunk are dropped too
        if let Err(e) = self.reader.feed(chunk) {
            self.log_fatal(&e);
            self.stats.mark_disconnect();
            return Err(DisconnectReason::Frame(e));
        }

        let mut out = Vec::new();
        while let Some(frame) = self.reader.pop_frame() {
            if let Some(m) = self.process_frame(frame)? {
                out.push(m);
            }
        }
        Ok(out)
    }

    fn process_frame(&mut self, frame: RawFrame) -> Result<Option<ReceivedMessage>, DisconnectReason> {
        let id = self.stats.id;
        if let Err(e) = self.reader.validator().check_frame(&frame) {
            match &e {
                FrameError::BadMessageType { msgtype } => {
                    self.log.debug(format!("PROCESSMESSAGE: ERRORS IN HEADER {msgtype} peer={id}"));
                }
                FrameError::ChecksumMismatch { msgtype, length, expected, actual } => {
                    self.log.debug(format!(
                        "CHECKSUM ERROR ({msgtype}, {length} bytes), expected {} was {} peer={id}",
                        hex::encode(expected),
                        hex::encode(actual)
                    ));
                }
                fatal => {
                    // start checks already ran in the reader
                    self.log_fatal(fatal);
                    self.stats.mark_disconnect();
                    return Err(DisconnectReason::Frame(e));
                }
            }
            return Ok(None);
        }

        let wire_len = frame.wire_len();
        let msgtype = frame.header.msgtype_str().unwrap_or_default().to_string();

        if let Err(reason) = self.policy.check(&msgtype, &frame.payload) {
            let rec = MisbehaviorRecord::new(id, reason);
            let outcome = self.stats.misbehavior.record(&rec, &self.log);
            if let ScoreOutcome::Disconnect { score } = outcome {
                self.stats.mark_disconnect();
                return Err(DisconnectReason::Misbehavior { score });
            }
            return Ok(None);
        }

        match NetworkMessage::decode(&msgtype, &frame.payload) {
            Ok(msg) => Ok(Some(ReceivedMessage { msg, wire_len })),
            Err(e) => {
                self.log.debug(format!(
                    "PROCESSMESSAGE: {msgtype} ({} bytes) failed to decode: {e} peer={id}",
                    frame.payload.len()
                ));
                Ok(None)
            }
        }
    }

    fn log_fatal(&self, e: &FrameError) {
        let id = self.stats.id;
        match e {
            FrameError::InvalidMessageStart { msgtype, .. } => {
                self.log.warn(format!("PROCESSMESSAGE: INVALID MESSAGESTART {msgtype} peer={id}"));
            }
            FrameError::Oversized { msgtype, length, .. } => {
                self.log.warn(format!(
                    "Oversized message from peer={id}, disconnecting ({msgtype}, {length} bytes)"
                ));
            }
            other => self.log.warn(format!("{other} peer={id}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{BlockHeader, HEADER_SIZE, Inventory, MSG_TX, MessageHeader, build_raw_frame};

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn connection() -> (PeerConnection, Arc<DebugLog>) {
        let log = Arc::new(DebugLog::new(256));
        let stats = Arc::new(PeerStats::new(0, "127.0.0.1:18444".parse().unwrap(), true, 100));
        let conn = PeerConnection::new(
            stats,
            HeaderValidator::new(MAGIC, 4_000_000),
            PayloadPolicy::default(),
            log.clone(),
        );
        (conn, log)
    }

    fn badmsg(data: &[u8]) -> Vec<u8> {
        let mut payload = vec![data.len() as u8];
        payload.extend_from_slice(data);
        build_raw_frame(MAGIC, "badmsg", &payload)
    }

    #[test]
    fn test_split_header_counter_advances_on_arrival() {
        let msg = NetworkMessage::Ping(12345).to_frame(MAGIC);
        for cut in 1..HEADER_SIZE {
            let (mut conn, _) = connection();
            assert!(conn.receive_bytes(&msg[..cut]).unwrap().is_empty());
            assert_eq!(conn.stats().bytes_recv(), cut as u64, "cut at {cut}");
            let got = conn.receive_bytes(&msg[cut..]).unwrap();
            assert_eq!(conn.stats().bytes_recv(), msg.len() as u64);
            assert_eq!(got, vec![ReceivedMessage { msg: NetworkMessage::Ping(12345), wire_len: msg.len() }]);
        }
    }

    #[test]
    fn test_chunk_after_disconnect_still_counted() {
        let (mut conn, _) = connection();
        conn.stats().mark_disconnect();
        assert!(matches!(conn.receive_bytes(&[0u8; 10]), Err(DisconnectReason::Requested)));
        assert_eq!(conn.stats().bytes_recv(), 10);
    }

    #[tokio::test]
    async fn test_send_below_waits_for_drain() {
        let stats = Arc::new(PeerStats::new(2, "127.0.0.1:1".parse().unwrap(), true, 100));
        stats.queue_send(300);
        let waiter = stats.clone();
        let h = tokio::spawn(async move { waiter.send_below(100).await });
        tokio::task::yield_now().await;
        stats.dequeue_send(150);
        tokio::task::yield_now().await;
        assert!(!h.is_finished());
        stats.dequeue_send(150);
        tokio::time::timeout(std::time::Duration::from_secs(2), h).await.unwrap().unwrap();
        assert_eq!(stats.send_backlog(), 0);
    }

    #[test]
    fn test_invalid_magic_disconnects() {
        let (mut conn, log) = connection();
        let mut msg = badmsg(b"d");
        msg[0..4].copy_from_slice(&[0xff; 4]);
        let err = conn.receive_bytes(&msg).unwrap_err();
        assert!(matches!(err, DisconnectReason::Frame(FrameError::InvalidMessageStart { .. })));
        assert!(conn.stats().is_disconnected());
        assert!(log.contains_all_since(0, &["PROCESSMESSAGE: INVALID MESSAGESTART badmsg"]));
        assert!(!log.contains_all_since(0, &["CHECKSUM"]));
        // further input is refused
        assert!(matches!(conn.receive_bytes(&badmsg(b"d")), Err(DisconnectReason::Requested)));
    }

    #[test]
    fn test_checksum_error_keeps_connection() {
        let (mut conn, log) = connection();
        let mut msg = badmsg(b"d");
        msg[20..24].copy_from_slice(&[0xff; 4]);
        msg.extend(NetworkMessage::Ping(7).to_frame(MAGIC));
        let got = conn.receive_bytes(&msg).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg, NetworkMessage::Ping(7));
        assert!(!conn.stats().is_disconnected());
        assert!(log.contains_all_since(0, &["CHECKSUM ERROR (badmsg, 2 bytes), expected 78df0a04 was ffffffff"]));
    }

    #[test]
    fn test_oversized_disconnects_before_payload() {
        let (mut conn, log) = connection();
        let mut hdr = MessageHeader::new(MAGIC, "badmsg", b"");
        hdr.length = 4_000_001;
        let err = conn.receive_bytes(&hdr.to_bytes()).unwrap_err();
        assert!(matches!(err, DisconnectReason::Frame(FrameError::Oversized { .. })));
        assert_eq!(conn.buffered_len(), HEADER_SIZE);
        assert!(log.contains_all_since(0, &["Oversized message from peer=0"]));
    }

    #[test]
    fn test_bad_msgtype_logged_and_dropped() {
        let (mut conn, log) = connection();
        let mut msg = build_raw_frame(MAGIC, "badmsg", &[1, b'd']);
        msg[4..16].copy_from_slice(&[0xff; 12]);
        msg[7] = 0;
        assert!(conn.receive_bytes(&msg).unwrap().is_empty());
        assert!(!conn.stats().is_disconnected());
        assert!(log.contains_all_since(0, &["PROCESSMESSAGE: ERRORS IN HEADER"]));
    }

    #[test]
    fn test_oversized_inv_scored_not_disconnected() {
        let (mut conn, log) = connection();
        let inv = vec![Inventory { kind: MSG_TX, hash: [1u8; 32] }; 50_001];
        let got = conn.receive_bytes(&NetworkMessage::Inv(inv).to_frame(MAGIC)).unwrap();
        assert!(got.is_empty());
        assert!(!conn.stats().is_disconnected());
        assert_eq!(conn.stats().misbehavior.score(), 20);
        assert!(log.contains_all_since(0, &["Misbehaving", "inv message size = 50001"]));
    }

    #[test]
    fn test_oversized_headers_scored() {
        let (mut conn, log) = connection();
        let frame = NetworkMessage::Headers(vec![BlockHeader::default(); 2001]).to_frame(MAGIC);
        assert!(conn.receive_bytes(&frame).unwrap().is_empty());
        assert!(log.contains_all_since(0, &["Misbehaving", "headers message size = 2001"]));
    }

    #[test]
    fn test_repeated_violations_reach_threshold() {
        let (mut conn, _) = connection();
        let mut payload = Vec::new();
        crate::net::message::write_compact_size(&mut payload, 1001);
        let frame = build_raw_frame(MAGIC, "addr", &payload);
        for _ in 0..4 {
            conn.receive_bytes(&frame).unwrap();
        }
        let err = conn.receive_bytes(&frame).unwrap_err();
        assert!(matches!(err, DisconnectReason::Misbehavior { score: 100 }));
        assert!(conn.stats().is_disconnected());
    }

    #[test]
    fn test_decode_failure_not_scored() {
        let (mut conn, log) = connection();
        let frame = build_raw_frame(MAGIC, "ping", &[1, 2, 3]);
        assert!(conn.receive_bytes(&frame).unwrap().is_empty());
        assert_eq!(conn.stats().misbehavior.score(), 0);
        assert!(log.contains_all_since(0, &["PROCESSMESSAGE: ping (3 bytes) failed to decode"]));
    }

    #[tokio::test]
    async fn test_disconnected_future_resolves() {
        let stats = Arc::new(PeerStats::new(1, "127.0.0.1:1".parse().unwrap(), false, 100));
        let waiter = stats.clone();
        let h = tokio::spawn(async move { waiter.disconnected().await });
        tokio::task::yield_now().await;
        assert!(stats.mark_disconnect());
        assert!(!stats.mark_disconnect());
        h.await.unwrap();
    }
}
