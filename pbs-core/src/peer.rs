//! Peer-server resource propagation: the `PS_RSC_UPDATE` /
//! `PS_RSC_UPDATE_FULL` / `PS_RSC_UPDATE_ACK` protocol run between
//! Servers in a multi-server (partitioned) deployment.
//!
//! Grounded in the original's `multi_svr.c`: `mcast_resc_usage` batches
//! node-resource deltas and fans them out to every peer on one
//! sequence-numbered multicast; `req_resc_update` is the full resync a
//! peer gets on first hello or on detecting it missed an increment;
//! `process_status_reply` feeds the alien-node cache. Per-peer
//! outstanding-sequence and alien-node bookkeeping already lives on
//! [`crate::node::mom::PeerServerRecord`]; this module is the ledger that
//! decides *what* to multicast and *who* needs a full push, independent
//! of any one peer's connection state.

use std::collections::{HashMap, HashSet, VecDeque};

/// Whether a queued update asserts or releases a job's hold on a vnode's
/// resources -- `pbs-server`'s `UpdateOp::INCR`/`DECR` wire enum, named
/// here so `pbs-core` doesn't depend on generated proto types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOp {
    Incr,
    Decr,
}

/// One queued incremental resource-usage delta, not yet flushed onto the
/// wire. The payload is an opaque pre-encoded string: this crate has no
/// network transport of its own, so the wire format is `pbs-server`'s
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub seq: u64,
    pub job_id: String,
    pub op: ResourceOp,
    pub payload: String,
}

/// All state needed to decide, on each reactor tick, what resource
/// updates go out to peer Servers and which peers need a full resync
/// rather than an incremental one.
#[derive(Debug, Default)]
pub struct PeerLedger {
    next_seq: u64,
    pending: VecDeque<PendingUpdate>,
    /// Peers that must receive `PS_RSC_UPDATE_FULL` before any further
    /// incremental update makes sense to them (freshly connected, or
    /// detected as having missed a sequence).
    full_push_needed: HashSet<String>,
    /// The hello epoch last seen from each peer, used to tell a genuine
    /// reconnect (new epoch) from a duplicate/replayed hello.
    peer_epoch: HashMap<String, u64>,
}

impl PeerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one job's resource usage delta as the next sequence number
    /// in the global per-server stream (`PS_RSC_UPDATE` is sequenced
    /// server-wide, not per destination peer).
    pub fn queue_incremental(&mut self, job_id: impl Into<String>, op: ResourceOp, payload: impl Into<String>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending.push_back(PendingUpdate {
            seq,
            job_id: job_id.into(),
            op,
            payload: payload.into(),
        });
        seq
    }

    /// Drain every update queued since the last flush, in sequence order,
    /// for the caller to multicast in a single batch (the original's
    /// `mcast_resc_usage` coalesces exactly this way rather than sending
    /// one message per changed resource).
    pub fn drain_pending(&mut self) -> Vec<PendingUpdate> {
        self.pending.drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Mark `peer` as needing a full resync (`PS_RSC_UPDATE_FULL`) ahead
    /// of any further incremental update. Idempotent.
    pub fn mark_full_push(&mut self, peer_host: impl Into<String>) {
        self.full_push_needed.insert(peer_host.into());
    }

    /// Drain the set of peers due a full push, for the caller to fan out
    /// via e.g. `futures::future::join_all`.
    pub fn take_full_push_targets(&mut self) -> Vec<String> {
        self.full_push_needed.drain().collect()
    }

    /// Record a hello (or resume-on-reconnect) from `peer_host` carrying
    /// its session epoch. Returns `true` if this is a new epoch — i.e. a
    /// genuine (re)connection rather than a duplicate hello — in which
    /// case the peer is also scheduled for a full push, since any
    /// outstanding incremental sequence it held is now meaningless.
    pub fn note_hello(&mut self, peer_host: &str, epoch: u64) -> bool {
        let is_new = match self.peer_epoch.get(peer_host) {
            Some(&known) if known == epoch => false,
            _ => true,
        };
        if is_new {
            self.peer_epoch.insert(peer_host.to_owned(), epoch);
            self.mark_full_push(peer_host);
        }
        is_new
    }

    pub fn known_epoch(&self, peer_host: &str) -> Option<u64> {
        self.peer_epoch.get(peer_host).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_monotonically_across_nodes() {
        let mut ledger = PeerLedger::new();
        let s1 = ledger.queue_incremental("1.server", ResourceOp::Incr, "(n1:ncpus=4)");
        let s2 = ledger.queue_incremental("2.server", ResourceOp::Incr, "(n2:ncpus=8)");
        assert_eq!((s1, s2), (1, 2));
    }

    #[test]
    fn drain_pending_empties_the_queue() {
        let mut ledger = PeerLedger::new();
        ledger.queue_incremental("1.server", ResourceOp::Incr, "(n1:ncpus=4)");
        ledger.queue_incremental("2.server", ResourceOp::Decr, "(n2:ncpus=8)");
        let drained = ledger.drain_pending();
        assert_eq!(drained.len(), 2);
        assert!(!ledger.has_pending());
    }

    #[test]
    fn first_hello_triggers_full_push() {
        let mut ledger = PeerLedger::new();
        assert!(ledger.note_hello("peerA", 1));
        let targets = ledger.take_full_push_targets();
        assert_eq!(targets, vec!["peerA".to_string()]);
    }

    #[test]
    fn duplicate_hello_same_epoch_does_not_retrigger() {
        let mut ledger = PeerLedger::new();
        ledger.note_hello("peerA", 1);
        ledger.take_full_push_targets();
        assert!(!ledger.note_hello("peerA", 1));
        assert!(ledger.take_full_push_targets().is_empty());
    }

    #[test]
    fn reconnect_with_new_epoch_triggers_full_push_again() {
        let mut ledger = PeerLedger::new();
        ledger.note_hello("peerA", 1);
        ledger.take_full_push_targets();
        assert!(ledger.note_hello("peerA", 2));
        assert_eq!(ledger.take_full_push_targets(), vec!["peerA".to_string()]);
        assert_eq!(ledger.known_epoch("peerA"), Some(2));
    }
}
