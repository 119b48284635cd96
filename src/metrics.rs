//! Counters for the datagram underlay.
//!
//! Plain atomics, no exporter: the control plane scrapes snapshots. Each
//! underlay owns one set so tests can assert on exact increments.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct UnderlayMetrics {
    /// Datagrams from a source other than the configured server (client only).
    pub unsolicited: AtomicU64,
    /// Datagrams too short, failing authentication, or failing to parse.
    pub malformed: AtomicU64,
    /// Datagrams rejected by the replay cache.
    pub replay_new_session: AtomicU64,
    /// Segments dropped because a session receive queue was full.
    pub recv_overflow: AtomicU64,
    /// Segments for an unknown session id.
    pub no_session: AtomicU64,
    /// Sessions created on this underlay.
    pub sessions_opened: AtomicU64,
    /// Sessions removed from this underlay.
    pub sessions_closed: AtomicU64,
    /// Datagrams written to the socket.
    pub datagrams_sent: AtomicU64,
    /// Valid segments returned by the read path.
    pub segments_received: AtomicU64,
}

impl UnderlayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            unsolicited: self.unsolicited.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            replay_new_session: self.replay_new_session.load(Ordering::Relaxed),
            recv_overflow: self.recv_overflow.load(Ordering::Relaxed),
            no_session: self.no_session.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            segments_received: self.segments_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub unsolicited: u64,
    pub malformed: u64,
    pub replay_new_session: u64,
    pub recv_overflow: u64,
    pub no_session: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub datagrams_sent: u64,
    pub segments_received: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let metrics = UnderlayMetrics::new();
        bump(&metrics.unsolicited);
        bump(&metrics.unsolicited);
        bump(&metrics.replay_new_session);
        let snap = metrics.snapshot();
        assert_eq!(snap.unsolicited, 2);
        assert_eq!(snap.replay_new_session, 1);
        assert_eq!(snap.malformed, 0);
    }
}
