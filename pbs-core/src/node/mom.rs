//! The two kinds of daemon peer a Server talks to: a MoM (execution
//! host) and a peer Server (another partition in a multi-server
//! deployment).
//!
//! A single `mominfo_t`/`mom_svrinfo_t` pair traditionally serves both
//! roles, told apart with a flag check scattered across the codebase.
//! `DaemonPeer` makes the shared surface (address,
//! liveness, the outstanding-request ledger) a trait, and gives each
//! role its own concrete struct so a peer-server codepath can no longer
//! accidentally be handed a Mom record.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use crate::store::Named;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Down,
    Connecting,
    Up,
}

/// Shared surface both daemon-peer kinds expose to the dispatch and
/// peer-update layers.
pub trait DaemonPeer {
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn state(&self) -> PeerState;
    fn set_state(&mut self, state: PeerState);
    fn last_contact(&self) -> Option<SystemTime>;
    fn mark_contacted(&mut self, at: SystemTime);
}

/// Record for an execution host (Mom). `hello_seq` tracks the stream
/// sequencing the Mom's RPP/TPP-equivalent stream used, so a
/// stream-reset can be detected as a discontinuity rather than inferred
/// from a timeout alone.
#[derive(Debug, Clone)]
pub struct MomRecord {
    pub host: String,
    pub port: u16,
    pub state: PeerState,
    pub last_contact: Option<SystemTime>,
    pub hello_seq: u64,
    /// Nodes (vnodes) this Mom currently reports, by name. The natural
    /// vnode (host == vnode name) is first by convention but not
    /// structurally distinguished here; `PoolRole` on the `Node` itself
    /// is authoritative.
    pub vnode_names: Vec<String>,
}

impl MomRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: PeerState::Down,
            last_contact: None,
            hello_seq: 0,
            vnode_names: Vec::new(),
        }
    }
}

impl Named for MomRecord {
    fn name(&self) -> &str {
        &self.host
    }
}

impl DaemonPeer for MomRecord {
    fn host(&self) -> &str {
        &self.host
    }
    fn port(&self) -> u16 {
        self.port
    }
    fn state(&self) -> PeerState {
        self.state
    }
    fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }
    fn last_contact(&self) -> Option<SystemTime> {
        self.last_contact
    }
    fn mark_contacted(&mut self, at: SystemTime) {
        self.last_contact = Some(at);
    }
}

/// Record for a peer Server in a multi-server (partitioned) deployment.
/// `outstanding_incr` is the per-peer ledger of resource-update sequence
/// numbers this server has sent but not yet seen acknowledged; a
/// duplicate ack or an ack for a sequence not in this set is a protocol
/// error, not silently ignored.
#[derive(Debug, Clone)]
pub struct PeerServerRecord {
    pub host: String,
    pub port: u16,
    pub state: PeerState,
    pub last_contact: Option<SystemTime>,
    pub outstanding_incr: Vec<u64>,
    /// Nodes this peer has claimed (reported as owned by it rather than
    /// by this server): the alien-node cache's source data.
    pub alien_nodes: Vec<String>,
    pub alien_cache_refreshed_at: Option<SystemTime>,
    /// Jobids this peer has asserted an INCR for and we've accepted, not
    /// yet matched by a DECR. A second INCR for a jobid already in this
    /// set is a protocol error (the peer retransmitted or desynced) and
    /// is dropped by the caller rather than double-applied.
    incoming_incr: HashSet<String>,
}

impl PeerServerRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: PeerState::Down,
            last_contact: None,
            outstanding_incr: Vec::new(),
            alien_nodes: Vec::new(),
            alien_cache_refreshed_at: None,
            incoming_incr: HashSet::new(),
        }
    }

    /// Accept an inbound INCR for `job_id` from this peer. Returns `false`
    /// (and leaves the ledger untouched) if `job_id` already has an
    /// outstanding INCR from this peer -- the caller drops the duplicate
    /// with a warning rather than applying it twice.
    pub fn accept_incoming_incr(&mut self, job_id: impl Into<String>) -> bool {
        self.incoming_incr.insert(job_id.into())
    }

    /// Clear the ledger entry for `job_id` on a matching DECR.
    pub fn accept_incoming_decr(&mut self, job_id: &str) {
        self.incoming_incr.remove(job_id);
    }

    /// Discard the entire incoming-INCR ledger: called when a
    /// `PS_RSC_UPDATE_FULL` arrives, since the full resync supersedes any
    /// prior incremental state this peer had asserted.
    pub fn reset_incoming_incr(&mut self) {
        self.incoming_incr.clear();
    }

    /// Record an outbound `PS_RSC_UPDATE` sequence as outstanding.
    pub fn note_sent(&mut self, seq: u64) {
        self.outstanding_incr.push(seq);
    }

    /// Acknowledge a sequence. Returns an error if the sequence was not
    /// outstanding (already acked, or never sent) so the caller can
    /// treat it as the protocol violation it is rather than drop it
    /// silently.
    pub fn ack(&mut self, seq: u64) -> Result<(), DuplicateAck> {
        if let Some(pos) = self.outstanding_incr.iter().position(|&s| s == seq) {
            self.outstanding_incr.remove(pos);
            Ok(())
        } else {
            Err(DuplicateAck(seq))
        }
    }

    /// Whether the alien-node cache is stale and due a refresh, given a
    /// minimum refresh interval (rate-limiting re-queries to a peer that
    /// is flapping).
    pub fn alien_cache_stale(&self, now: SystemTime, min_interval: Duration) -> bool {
        match self.alien_cache_refreshed_at {
            None => true,
            Some(last) => now.duration_since(last).map(|d| d >= min_interval).unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateAck(pub u64);

impl std::fmt::Display for DuplicateAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "duplicate or unsolicited ack for sequence {}", self.0)
    }
}
impl std::error::Error for DuplicateAck {}

impl Named for PeerServerRecord {
    fn name(&self) -> &str {
        &self.host
    }
}

impl DaemonPeer for PeerServerRecord {
    fn host(&self) -> &str {
        &self.host
    }
    fn port(&self) -> u16 {
        self.port
    }
    fn state(&self) -> PeerState {
        self.state
    }
    fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }
    fn last_contact(&self) -> Option<SystemTime> {
        self.last_contact
    }
    fn mark_contacted(&mut self, at: SystemTime) {
        self.last_contact = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_unknown_sequence_is_duplicate_ack() {
        let mut peer = PeerServerRecord::new("peer1", 15001);
        peer.note_sent(1);
        assert!(peer.ack(1).is_ok());
        assert_eq!(peer.ack(1), Err(DuplicateAck(1)));
        assert_eq!(peer.ack(99), Err(DuplicateAck(99)));
    }

    #[test]
    fn alien_cache_stale_initially_and_after_interval() {
        let peer = PeerServerRecord::new("peer1", 15001);
        let now = SystemTime::now();
        assert!(peer.alien_cache_stale(now, Duration::from_secs(60)));
    }

    #[test]
    fn duplicate_incoming_incr_for_same_jobid_is_rejected() {
        let mut peer = PeerServerRecord::new("peer1", 15001);
        assert!(peer.accept_incoming_incr("1.serverA"));
        assert!(!peer.accept_incoming_incr("1.serverA"));
        peer.accept_incoming_decr("1.serverA");
        assert!(peer.accept_incoming_incr("1.serverA"));
    }

    #[test]
    fn reset_incoming_incr_clears_ledger() {
        let mut peer = PeerServerRecord::new("peer1", 15001);
        peer.accept_incoming_incr("1.serverA");
        peer.reset_incoming_incr();
        assert!(peer.accept_incoming_incr("1.serverA"));
    }
}
