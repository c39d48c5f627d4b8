// In-memory debug log
//
// Every diagnostic the network layer emits is recorded here and mirrored to
// `tracing`. Lines carry a monotonically increasing sequence number so callers
// can take a position, trigger some behaviour, and then inspect only what was
// logged afterwards.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Warn,
}

struct Ring {
    lines: VecDeque<(u64, String)>,
    next_seq: u64,
}

pub struct DebugLog {
    ring: Mutex<Ring>,
    capacity: usize,
    appended: Notify,
}

impl DebugLog {
    pub fn new(capacity: usize) -> Self {
        DebugLog {
            ring: Mutex::new(Ring {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            appended: Notify::new(),
        }
    }

    pub fn log(&self, level: LogLevel, line: impl Into<String>) {
        let line = line.into();
        match level {
            LogLevel::Debug => tracing::debug!(target: "p2pframe::net", "{line}"),
            LogLevel::Warn => tracing::warn!(target: "p2pframe::net", "{line}"),
        }
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            let seq = ring.next_seq;
            ring.next_seq += 1;
            if ring.lines.len() == self.capacity {
                ring.lines.pop_front();
            }
            ring.lines.push_back((seq, line));
        }
        self.appended.notify_waiters();
    }

    pub fn debug(&self, line: impl Into<String>) {
        self.log(LogLevel::Debug, line);
    }

    pub fn warn(&self, line: impl Into<String>) {
        self.log(LogLevel::Warn, line);
    }

    /// Sequence number the next line will receive
    pub fn position(&self) -> u64 {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).next_seq
    }

    /// Retained lines logged at or after `pos`
    pub fn lines_since(&self, pos: u64) -> Vec<String> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.lines
            .iter()
            .filter(|(seq, _)| *seq >= pos)
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines_since(0)
    }

    /// True when every needle appears in some line logged since `pos`
    pub fn contains_all_since(&self, pos: u64, needles: &[&str]) -> bool {
        let lines = self.lines_since(pos);
        needles
            .iter()
            .all(|n| lines.iter().any(|l| l.contains(n)))
    }

    /// Wait until every needle has been logged since `pos`, or the timeout
    /// expires. Returns whether all needles were found.
    pub async fn wait_for(&self, pos: u64, needles: &[&str], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            if self.contains_all_since(pos, needles) {
                return true;
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return self.contains_all_since(pos, needles);
            }
        }
    }
}
