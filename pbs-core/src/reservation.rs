//! Advance reservations: the UNCONFIRMED -> CONFIRMED -> RUNNING ->
//! FINISHED state machine, with DEGRADED tracked as an orthogonal flag
//! (a reservation can be RUNNING and DEGRADED at once, e.g. after one of
//! its nodes goes down mid-occupancy) and an alter operation that can
//! roll back to a pre-alter snapshot if the altered confirm fails.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use crate::attribute::{AttrArray, AttrDef, AttrDefFlags, AttrRegistry, AttrValue};
use crate::error::{CoreError, Result as CoreResult};
use crate::ids::Handle;
use crate::node::Node;
use crate::store::{EntityTable, Named};

/// The reservation's attribute table: resource request and authorized
/// users, not already carried as typed fields on [`Reservation`].
pub fn reservation_registry() -> &'static AttrRegistry {
    static REGISTRY: OnceLock<AttrRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        AttrRegistry::builder()
            .attr(
                AttrDef::new("Resource_List", AttrDefFlags::USRD | AttrDefFlags::USWR | AttrDefFlags::MGWR),
                AttrValue::ResourceList(Default::default()),
            )
            .attr(
                AttrDef::new("Authorized_Users", AttrDefFlags::USRD | AttrDefFlags::MGWR),
                AttrValue::Acl(Vec::new()),
            )
            .attr(
                AttrDef::new("reserve_name", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::Str(String::new()),
            )
            .build()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Unconfirmed,
    Confirmed,
    Running,
    Finished,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReservationState::Unconfirmed => "UNCONFIRMED",
            ReservationState::Confirmed => "CONFIRMED",
            ReservationState::Running => "RUNNING",
            ReservationState::Finished => "FINISHED",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of the fields an `alter` can change, taken before the
/// alter is applied so it can be restored if the scheduler rejects the
/// altered request.
#[derive(Debug, Clone)]
struct AlterSnapshot {
    start: SystemTime,
    duration: Duration,
    extra: AttrArray,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub owner: String,
    pub start: SystemTime,
    pub duration: Duration,
    pub state: ReservationState,
    pub degraded: bool,
    pub retry_count: u32,
    pub retry_cutoff: SystemTime,
    pub extra: AttrArray,
    /// The vnodes occupied once the reservation is CONFIRMED or RUNNING.
    /// Empty only while UNCONFIRMED; [`bind_vnodes`]/[`unbind_vnodes`] keep
    /// this and each vnode's own reverse list in sync.
    pub assigned_vnodes: Vec<Handle<Node>>,
    pending_alter: Option<AlterSnapshot>,
}

impl Named for Reservation {
    fn name(&self) -> &str {
        &self.id
    }
}

impl Reservation {
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        start: SystemTime,
        duration: Duration,
        retry_cutoff: SystemTime,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            start,
            duration,
            state: ReservationState::Unconfirmed,
            degraded: false,
            retry_count: 0,
            retry_cutoff,
            extra: AttrArray::for_registry(reservation_registry()),
            assigned_vnodes: Vec::new(),
            pending_alter: None,
        }
    }

    pub fn confirm(&mut self) -> CoreResult<()> {
        if self.state != ReservationState::Unconfirmed {
            return Err(CoreError::bad_state(format!(
                "reservation {} cannot be confirmed from state {}",
                self.id, self.state
            )));
        }
        self.state = ReservationState::Confirmed;
        Ok(())
    }

    /// Record a failed confirm attempt. Returns `true` if the retry
    /// window (`retry_cutoff`) has now elapsed and the caller should
    /// give up and delete the reservation instead of retrying again.
    pub fn note_confirm_failure(&mut self, now: SystemTime) -> bool {
        self.retry_count += 1;
        now >= self.retry_cutoff
    }

    pub fn begin_running(&mut self) -> CoreResult<()> {
        if self.state != ReservationState::Confirmed {
            return Err(CoreError::bad_state(format!(
                "reservation {} cannot start running from state {}",
                self.id, self.state
            )));
        }
        self.state = ReservationState::Running;
        Ok(())
    }

    pub fn finish(&mut self) {
        self.state = ReservationState::Finished;
        self.degraded = false;
    }

    /// Mark the reservation degraded (a constituent node went down).
    /// Orthogonal to `state`: a RUNNING reservation stays RUNNING.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn clear_degraded(&mut self) {
        self.degraded = false;
    }

    /// Begin an alter: snapshot the mutable fields so they can be rolled
    /// back if the scheduler rejects the altered occupancy.
    pub fn begin_alter(&mut self, new_start: SystemTime, new_duration: Duration) -> CoreResult<()> {
        if self.pending_alter.is_some() {
            return Err(CoreError::bad_state(format!(
                "reservation {} already has an alter in progress",
                self.id
            )));
        }
        self.pending_alter = Some(AlterSnapshot {
            start: self.start,
            duration: self.duration,
            extra: self.extra.clone(),
        });
        self.start = new_start;
        self.duration = new_duration;
        Ok(())
    }

    pub fn commit_alter(&mut self) {
        self.pending_alter = None;
    }

    /// Roll the reservation back to the state it was in before
    /// `begin_alter`. Errors if no alter is in flight.
    pub fn revert_alter(&mut self) -> CoreResult<()> {
        let snapshot = self
            .pending_alter
            .take()
            .ok_or_else(|| CoreError::bad_state(format!("reservation {} has no alter to revert", self.id)))?;
        self.start = snapshot.start;
        self.duration = snapshot.duration;
        self.extra = snapshot.extra;
        Ok(())
    }
}

/// Bind a confirmed reservation to the vnodes it occupies, linking both
/// directions: `resv.assigned_vnodes` and every named node's own
/// `reservations` list. Replaces any prior binding wholesale (an alter
/// that changes occupancy calls this again rather than patching in
/// place).
pub fn bind_vnodes(
    reservations: &mut EntityTable<Reservation>,
    nodes: &mut EntityTable<Node>,
    resv: Handle<Reservation>,
    vnodes: Vec<Handle<Node>>,
) -> CoreResult<()> {
    if vnodes.is_empty() {
        return Err(CoreError::bad_state(
            "a confirmed or running reservation must occupy at least one vnode",
        ));
    }
    unbind_vnodes(reservations, nodes, resv)?;
    for &vh in &vnodes {
        let node = nodes
            .get_mut(vh)
            .ok_or_else(|| CoreError::internal("reservation bound to an unknown vnode handle"))?;
        if !node.reservations.contains(&resv) {
            node.reservations.push(resv);
        }
    }
    let r = reservations
        .get_mut(resv)
        .ok_or_else(|| CoreError::internal("reservation handle resolved but entry missing"))?;
    r.assigned_vnodes = vnodes;
    Ok(())
}

/// Tear down a reservation's vnode binding in both directions. Called on
/// `finish()` and before rebinding during an alter; a no-op if the
/// reservation currently holds no vnodes.
pub fn unbind_vnodes(
    reservations: &mut EntityTable<Reservation>,
    nodes: &mut EntityTable<Node>,
    resv: Handle<Reservation>,
) -> CoreResult<()> {
    let r = reservations
        .get_mut(resv)
        .ok_or_else(|| CoreError::internal("reservation handle resolved but entry missing"))?;
    let previous = std::mem::take(&mut r.assigned_vnodes);
    for vh in previous {
        if let Some(node) = nodes.get_mut(vh) {
            node.reservations.retain(|&h| h != resv);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_resv() -> Reservation {
        Reservation::new(
            "R1.server",
            "alice",
            SystemTime::now(),
            Duration::from_secs(3600),
            SystemTime::now() + Duration::from_secs(600),
        )
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut r = new_resv();
        r.confirm().unwrap();
        assert_eq!(r.state, ReservationState::Confirmed);
        r.begin_running().unwrap();
        assert_eq!(r.state, ReservationState::Running);
        r.mark_degraded();
        assert!(r.degraded);
        assert_eq!(r.state, ReservationState::Running);
        r.finish();
        assert_eq!(r.state, ReservationState::Finished);
        assert!(!r.degraded);
    }

    #[test]
    fn alter_can_be_reverted() {
        let mut r = new_resv();
        let original_duration = r.duration;
        r.begin_alter(r.start, Duration::from_secs(7200)).unwrap();
        assert_eq!(r.duration, Duration::from_secs(7200));
        r.revert_alter().unwrap();
        assert_eq!(r.duration, original_duration);
    }

    #[test]
    fn confirm_failure_reports_cutoff_elapsed() {
        let mut r = new_resv();
        r.retry_cutoff = SystemTime::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(r.note_confirm_failure(SystemTime::now()));
    }

    #[test]
    fn bind_vnodes_links_both_directions() {
        use crate::node::{initialize_pbsnode, NodeType, PoolRole};
        use crate::ids::Arena;

        let mut nodes: EntityTable<Node> = EntityTable::new();
        let mom_handle = {
            let mut arena: Arena<crate::node::mom::MomRecord> = Arena::new();
            arena.insert(crate::node::mom::MomRecord::new("momhost", 15002))
        };
        let n1 = nodes.insert(initialize_pbsnode("n1", mom_handle, NodeType::Cluster, PoolRole::Member));
        let n2 = nodes.insert(initialize_pbsnode("n2", mom_handle, NodeType::Cluster, PoolRole::Member));

        let mut reservations: EntityTable<Reservation> = EntityTable::new();
        let mut r = new_resv();
        r.confirm().unwrap();
        let rh = reservations.insert(r);

        bind_vnodes(&mut reservations, &mut nodes, rh, vec![n1, n2]).unwrap();
        assert_eq!(reservations.get(rh).unwrap().assigned_vnodes, vec![n1, n2]);
        assert!(nodes.get(n1).unwrap().reservations.contains(&rh));
        assert!(nodes.get(n2).unwrap().reservations.contains(&rh));

        unbind_vnodes(&mut reservations, &mut nodes, rh).unwrap();
        assert!(reservations.get(rh).unwrap().assigned_vnodes.is_empty());
        assert!(!nodes.get(n1).unwrap().reservations.contains(&rh));
        assert!(!nodes.get(n2).unwrap().reservations.contains(&rh));
    }

    #[test]
    fn bind_vnodes_rejects_empty_list() {
        let mut nodes: EntityTable<Node> = EntityTable::new();
        let mut reservations: EntityTable<Reservation> = EntityTable::new();
        let rh = reservations.insert(new_resv());
        assert!(bind_vnodes(&mut reservations, &mut nodes, rh, vec![]).is_err());
    }
}
