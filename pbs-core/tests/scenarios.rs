//! End-to-end scenario tests against the pure state machine, independent
//! of any gRPC wiring. These correspond to spec.md section 8's numbered
//! scenarios; S1, S4, and S6 additionally touch the wire-format/dispatch
//! layer and are covered in `pbs-server`'s own scenario tests instead.

use std::time::{Duration, SystemTime};

use pbs_core::attribute::{ResourceValue, SetOp};
use pbs_core::ids::{Arena, Handle};
use pbs_core::node::mom::MomRecord;
use pbs_core::node::{initialize_pbsnode, NodeState, NodeType, PoolRole, Node};
use pbs_core::reservation::{bind_vnodes, unbind_vnodes, Reservation, ReservationState};
use pbs_core::scheduler::{SchedCommand, ScSched};
use pbs_core::store::EntityTable;

fn mom_handle() -> Handle<MomRecord> {
    let mut arena: Arena<MomRecord> = Arena::new();
    arena.insert(MomRecord::new("mom1", 15002))
}

/// S2 — indirect resource: vnode B points `foo` at vnode A; consuming
/// `foo=4` on B must debit A's `resources_assigned`, and a subsequent
/// attempt to make A itself indirect (now that it's a TARGET) must fail.
#[test]
fn s2_indirect_resource_consumption_and_rehop_rejection() {
    use pbs_core::node::indirect::{commit_set_indirect, validate_set_indirect, ValidatedTarget};

    let mut nodes: EntityTable<Node> = EntityTable::new();
    let mom = mom_handle();
    let mut a = initialize_pbsnode("A", mom, NodeType::Cluster, PoolRole::Member);
    a.resources_available.set_or_merge("foo", "10", SetOp::Set).unwrap();
    let b = initialize_pbsnode("B", mom, NodeType::Cluster, PoolRole::Member);
    let a_handle = nodes.insert(a);
    let b_handle = nodes.insert(b);

    let validated = validate_set_indirect(&nodes, b_handle, "foo", "A", false).unwrap();
    assert_eq!(validated, ValidatedTarget::Resolved(a_handle));
    commit_set_indirect(&mut nodes, b_handle, "foo", "A", validated, true).unwrap();

    // A run on B requesting foo=4 resolves through the indirection and
    // debits A's resources_assigned directly.
    let b_node = nodes.get(b_handle).unwrap();
    let resolved = b_node
        .resources_available
        .resolve("foo", |target| {
            nodes.find_by_name(target).and_then(|h| nodes.get(h)).map(|n| &n.resources_available)
        })
        .unwrap();
    assert_eq!(resolved, Some(&ResourceValue::Long(10)));

    let a_node = nodes.get_mut(a_handle).unwrap();
    a_node.resources_assigned.set_or_merge("foo", "4", SetOp::Incr).unwrap();
    assert_eq!(a_node.resources_assigned.get("foo"), Some(&ResourceValue::Long(4)));

    // A is now a TARGET; it may not itself become indirect (no chaining).
    let mut c = initialize_pbsnode("C", mom, NodeType::Cluster, PoolRole::Member);
    c.resources_available.set_or_merge("foo", "1", SetOp::Set).unwrap();
    nodes.insert(c);
    let err = validate_set_indirect(&nodes, a_handle, "foo", "C", false);
    assert!(err.is_err());
}

/// S3 — alter during cycle: a job altered mid-cycle must be flagged
/// stale so the Scheduler's run-request for it is rejected; a later
/// cycle's run-request for the same job succeeds.
#[test]
fn s3_altered_job_rejected_mid_cycle_then_succeeds_next_cycle() {
    let mut arena: Arena<pbs_core::job::Job> = Arena::new();
    let job = arena.insert(pbs_core::job::Job::new("1.svr", "alice", "workq"));

    let mut sched = ScSched::new("partA");
    sched.connect(1, 2);
    sched.enqueue_qrun(job);
    let (cmd, _) = sched.begin_cycle(SchedCommand::Scheduling).unwrap();
    assert!(matches!(cmd, SchedCommand::Scheduling));

    // qalter lands while the cycle is in flight.
    sched.mark_altered(job);
    assert!(sched.check_stale(job), "altered job must be rejected for this cycle");

    // Cycle ends; a fresh qrun for the same job in the next cycle is not
    // stale (the alter flag was scoped to the cycle it landed in).
    sched.note_cycle_end(0);
    sched.enqueue_qrun(job);
    sched.connect(3, 4);
    sched.begin_cycle(SchedCommand::Scheduling).unwrap();
    assert!(!sched.check_stale(job), "next cycle's run-request must succeed");
}

/// S5 — reservation degraded: confirming a reservation on vnode V, then
/// offlining V, must degrade the reservation without dropping it out of
/// CONFIRMED; swapping in a replacement vnode and retrying clears the
/// degraded flag.
#[test]
fn s5_reservation_degrades_on_node_offline_and_recovers_on_replacement() {
    let mut nodes: EntityTable<Node> = EntityTable::new();
    let mom = mom_handle();
    let v = nodes.insert(initialize_pbsnode("V", mom, NodeType::Cluster, PoolRole::Member));

    let mut reservations: EntityTable<Reservation> = EntityTable::new();
    let now = SystemTime::now();
    let resv = reservations.insert(Reservation::new(
        "R1.svr",
        "alice",
        now,
        Duration::from_secs(3600),
        now + Duration::from_secs(600),
    ));
    reservations.get_mut(resv).unwrap().confirm().unwrap();
    bind_vnodes(&mut reservations, &mut nodes, resv, vec![v]).unwrap();
    assert_eq!(reservations.get(resv).unwrap().state, ReservationState::Confirmed);
    assert!(nodes.get(v).unwrap().reservations.contains(&resv));

    // V goes offline: the reactor's node-down handling degrades every
    // reservation occupying it, but its state stays CONFIRMED.
    nodes.get_mut(v).unwrap().set_state(NodeState::OFFLINE);
    assert!(nodes.get(v).unwrap().is_unavailable());
    let occupants = nodes.get(v).unwrap().reservations.clone();
    for rh in occupants {
        reservations.get_mut(rh).unwrap().mark_degraded();
    }
    assert!(reservations.get(resv).unwrap().degraded);
    assert_eq!(reservations.get(resv).unwrap().state, ReservationState::Confirmed);

    // V is replaced by V': rebind, which also unbinds the old vnode, and
    // the retry clears the degraded flag.
    let v_prime = nodes.insert(initialize_pbsnode("V2", mom, NodeType::Cluster, PoolRole::Member));
    bind_vnodes(&mut reservations, &mut nodes, resv, vec![v_prime]).unwrap();
    reservations.get_mut(resv).unwrap().clear_degraded();

    assert!(!nodes.get(v).unwrap().reservations.contains(&resv));
    assert!(nodes.get(v_prime).unwrap().reservations.contains(&resv));
    assert!(!reservations.get(resv).unwrap().degraded);
    assert_eq!(reservations.get(resv).unwrap().state, ReservationState::Confirmed);

    unbind_vnodes(&mut reservations, &mut nodes, resv).unwrap();
    assert!(reservations.get(resv).unwrap().assigned_vnodes.is_empty());
}
