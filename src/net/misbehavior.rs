// Misbehavior scoring
//
// Semantically invalid content (as opposed to malformed framing) adds a
// penalty to the peer's score. The score only grows; once it reaches the
// threshold the peer is disconnected. A new connection starts from zero.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::debug_log::DebugLog;
use crate::net::peer::PeerId;

/// Penalty for an over-long inv/getdata/notfound/headers/addr list
pub const OVERSIZED_LIST_PENALTY: u32 = 20;
/// Penalty for handshake ordering violations
pub const HANDSHAKE_PENALTY: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Misbehavior {
    OversizedList { msgtype: &'static str, size: u64 },
    DuplicateVersion,
    BeforeVersion { msgtype: String },
}

impl Misbehavior {
    pub fn penalty(&self) -> u32 {
        match self {
            Misbehavior::OversizedList { .. } => OVERSIZED_LIST_PENALTY,
            Misbehavior::DuplicateVersion | Misbehavior::BeforeVersion { .. } => HANDSHAKE_PENALTY,
        }
    }
}

impl fmt::Display for Misbehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Misbehavior::OversizedList { msgtype, size } => write!(f, "{msgtype} message size = {size}"),
            Misbehavior::DuplicateVersion => write!(f, "redundant version message"),
            Misbehavior::BeforeVersion { msgtype } => {
                write!(f, "{msgtype} message before version handshake")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisbehaviorRecord {
    pub peer_id: PeerId,
    pub reason: Misbehavior,
    pub score_delta: u32,
}

impl MisbehaviorRecord {
    pub fn new(peer_id: PeerId, reason: Misbehavior) -> Self {
        let score_delta = reason.penalty();
        MisbehaviorRecord { peer_id, reason, score_delta }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOutcome {
    /// Score increased but stays below the threshold
    Recorded { score: u32 },
    /// Threshold reached; the peer must be disconnected
    Disconnect { score: u32 },
}

impl ScoreOutcome {
    pub fn should_disconnect(&self) -> bool {
        matches!(self, ScoreOutcome::Disconnect { .. })
    }
}

/// Per-peer score, shared between the reader and the dispatcher
pub struct MisbehaviorScore {
    score: AtomicU32,
    threshold: u32,
}

impl MisbehaviorScore {
    pub fn new(threshold: u32) -> Self {
        MisbehaviorScore {
            score: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn score(&self) -> u32 {
        self.score.load(Ordering::Acquire)
    }

    pub fn record(&self, rec: &MisbehaviorRecord, log: &DebugLog) -> ScoreOutcome {
        let old = self
            .score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(s.saturating_add(rec.score_delta))
            })
            .unwrap_or_else(|s| s);
        let new = old.saturating_add(rec.score_delta);
        log.debug(format!(
            "Misbehaving: peer={} ({} -> {}) reason: {}",
            rec.peer_id, old, new, rec.reason
        ));
        if new >= self.threshold {
            log.warn(format!(
                "Misbehaving: peer={} reached threshold {}, disconnecting",
                rec.peer_id, self.threshold
            ));
            ScoreOutcome::Disconnect { score: new }
        } else {
            ScoreOutcome::Recorded { score: new }
        }
    }
}
