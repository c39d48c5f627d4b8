// Per-peer inbound queues drained round-robin
//
// Each peer owns a FIFO queue. Peers with queued messages sit in a ring; the
// dispatcher takes one message from the front peer and moves that peer to the
// back, so a flooding peer gets one turn per round like everyone else.
//
// Backpressure: once a peer's queued bytes reach the flood size its reader is
// told to pause. The reader waits on the peer's resume handle, which is
// notified when the dispatcher drains the queue back below the limit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::net::message::NetworkMessage;
use crate::net::peer::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub peer: PeerId,
    pub msg: NetworkMessage,
    pub wire_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, and the peer is now over its flood size: stop reading
    Paused,
    /// The peer is no longer registered; the message was discarded
    Dropped,
}

struct PeerQueue {
    messages: VecDeque<(NetworkMessage, usize)>,
    queued_bytes: usize,
    paused: bool,
    resume: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<PeerId, PeerQueue>,
    ring: VecDeque<PeerId>,
}

pub struct MessageScheduler {
    inner: Mutex<Inner>,
    flood_size: usize,
    ready: Notify,
}

impl MessageScheduler {
    pub fn new(flood_size: usize) -> Self {
        MessageScheduler {
            inner: Mutex::new(Inner::default()),
            flood_size: flood_size.max(1),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a peer and return the handle its reader waits on while paused
    pub fn register(&self, peer: PeerId) -> Arc<Notify> {
        let resume = Arc::new(Notify::new());
        self.lock().queues.insert(
            peer,
            PeerQueue {
                messages: VecDeque::new(),
                queued_bytes: 0,
                paused: false,
                resume: resume.clone(),
            },
        );
        resume
    }

    /// Drop a peer's queue and everything in it
    pub fn remove(&self, peer: PeerId) {
        let mut inner = self.lock();
        if let Some(q) = inner.queues.remove(&peer) {
            // wake a paused reader so it can observe the disconnect
            q.resume.notify_one();
        }
        inner.ring.retain(|p| *p != peer);
    }

    pub fn push(&self, peer: PeerId, msg: NetworkMessage, wire_len: usize) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            let Some(q) = inner.queues.get_mut(&peer) else {
                return PushOutcome::Dropped;
            };
            let was_empty = q.messages.is_empty();
            q.messages.push_back((msg, wire_len));
            q.queued_bytes += wire_len;
            if q.queued_bytes >= self.flood_size {
                q.paused = true;
            }
            let outcome = if q.paused { PushOutcome::Paused } else { PushOutcome::Queued };
            if was_empty {
                inner.ring.push_back(peer);
            }
            outcome
        };
        self.ready.notify_one();
        outcome
    }

    /// Take the next message in round-robin order, if any peer has one
    pub fn pop(&self) -> Option<QueuedMessage> {
        let mut inner = self.lock();
        let peer = inner.ring.pop_front()?;
        let q = inner.queues.get_mut(&peer)?;
        let (msg, wire_len) = q.messages.pop_front()?;
        q.queued_bytes -= wire_len;
        if q.paused && q.queued_bytes < self.flood_size {
            q.paused = false;
            q.resume.notify_one();
        }
        if !q.messages.is_empty() {
            inner.ring.push_back(peer);
        }
        Some(QueuedMessage { peer, msg, wire_len })
    }

    /// Wait for the next message
    pub async fn next(&self) -> QueuedMessage {
        loop {
            if let Some(m) = self.pop() {
                return m;
            }
            self.ready.notified().await;
        }
    }

    pub fn is_paused(&self, peer: PeerId) -> bool {
        self.lock().queues.get(&peer).is_some_and(|q| q.paused)
    }

    #[cfg(test)]
    pub fn queued_bytes(&self, peer: PeerId) -> usize {
        self.lock().queues.get(&peer).map_or(0, |q| q.queued_bytes)
    }

    #[cfg(test)]
    pub fn queued_messages(&self, peer: PeerId) -> usize {
        self.lock().queues.get(&peer).map_or(0, |q| q.messages.len())
    }

    pub fn is_registered(&self, peer: PeerId) -> bool {
        self.lock().queues.contains_key(&peer)
    }
}
