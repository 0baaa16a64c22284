//! End-to-end scenario tests exercising `Core` directly, the same way a
//! gRPC handler would, but without the tonic/reactor plumbing around it
//! (no running service is spun up). Corresponds to spec.md section 8's
//! S1, S4, and S6; S2/S3/S5 live in `pbs-core`'s own scenario tests since
//! they never touch anything `pbs-server`-specific.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use pbs_core::accounting::{AccountingEvent, AccountingSink};
use pbs_core::attribute::SetOp;
use pbs_core::config::CoreConfig;
use pbs_core::core_ctx::{Core, ServerIdentity};
use pbs_core::ids::Arena;
use pbs_core::job::{Job, JobState, RerunSubstate, Substate};
use pbs_core::node::mom::MomRecord;
use pbs_core::node::{initialize_pbsnode, NodeType, PoolRole};
use pbs_core::peer::ResourceOp;

use pbs_server::execvnode;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl AccountingSink for RecordingSink {
    fn record(&self, event: AccountingEvent<'_>) {
        self.events.lock().push(event.to_string());
    }
}

fn test_core(name: &str, sink: Arc<RecordingSink>) -> Core {
    Core::new(
        ServerIdentity {
            name: name.to_owned(),
            extra: pbs_core::attribute::AttrArray::new(0),
        },
        CoreConfig::default(),
        sink,
    )
}

/// S1 — simple submit-run-end: a one-chunk job against a free vnode with
/// `ncpus=1`. The vnode's `resources_assigned.ncpus` goes to 1 on run and
/// back to 0 on obit; the job's own state goes Q -> R -> X.
#[test]
fn s1_submit_run_end_round_trips_resource_accounting() {
    let sink = Arc::new(RecordingSink::default());
    let mut core = test_core("svr1", sink);

    let mut mom_arena: Arena<MomRecord> = Arena::new();
    let mom = mom_arena.insert(MomRecord::new("mom1", 15002));
    let mut node = initialize_pbsnode("n1", mom, NodeType::Cluster, PoolRole::Member);
    node.resources_available.set_or_merge("ncpus", "4", SetOp::Set).unwrap();
    node.resources_assigned.set_or_merge("ncpus", "0", SetOp::Set).unwrap();
    core.nodes.insert(node);

    let mut job = Job::new("1.svr1", "alice", "workq");
    job.state = JobState::Queued;
    let job_handle = core.jobs.insert(job);

    let exec_vnode = "(n1:ncpus=1)";
    execvnode::apply(&mut core, exec_vnode, SetOp::Incr).unwrap();
    core.jobs.get_mut(job_handle).unwrap().transition(job_handle, JobState::Running, core.accounting.as_ref());

    let node_handle = core.find_node("n1").unwrap();
    assert_eq!(
        core.nodes.get(node_handle).unwrap().resources_assigned.get("ncpus"),
        Some(&pbs_core::attribute::ResourceValue::Long(1))
    );
    assert_eq!(core.jobs.get(job_handle).unwrap().state, JobState::Running);

    // Obit arrives: credit the resources back and finish the job.
    execvnode::apply(&mut core, exec_vnode, SetOp::Decr).unwrap();
    core.jobs.get_mut(job_handle).unwrap().transition(job_handle, JobState::Finished, core.accounting.as_ref());

    assert_eq!(
        core.nodes.get(node_handle).unwrap().resources_assigned.get("ncpus"),
        Some(&pbs_core::attribute::ResourceValue::Long(0))
    );
    assert_eq!(core.jobs.get(job_handle).unwrap().state, JobState::Finished);
}

/// S4 — peer split and heal: three jobs run locally while the peer link
/// is down (their INCRs accumulate in the ledger instead of flushing),
/// then the link heals and a single full resync carries exactly the
/// three INCRs; the peer's own ledger converges to those three jobids.
#[test]
fn s4_peer_split_and_heal_converges_via_a_single_full_resync() {
    let sink = Arc::new(RecordingSink::default());
    let mut core = test_core("svrA", sink);

    // Three jobs run locally while disconnected from the peer.
    for i in 1..=3 {
        core.peers.queue_incremental(format!("{i}.svrA"), ResourceOp::Incr, format!("(n{i}:ncpus=1)"));
    }
    // Link severed: no flush happened, so the updates are still pending.
    core.peers.mark_full_push("svrB");
    assert!(core.peers.has_pending());

    // Link heals: instead of flushing the stale incrementals, a full
    // resync is owed. Build it the way `Dispatch::full_push` would, from
    // the authoritative pending set (here standing in for "every locally
    // running job's exec_vnode", since all three are in fact running).
    let full_resync = core.peers.drain_pending();
    assert_eq!(full_resync.len(), 3);
    let targets = core.peers.take_full_push_targets();
    assert_eq!(targets, vec!["svrB".to_string()]);

    // The peer applies the resync: a full push first clears its ledger,
    // then every INCR is accepted since none was outstanding before.
    let mut peer = pbs_core::node::mom::PeerServerRecord::new("svrA", 15005);
    peer.reset_incoming_incr();
    for update in &full_resync {
        assert!(peer.accept_incoming_incr(update.job_id.clone()));
    }
    // The peer's view now converges exactly to the three jobids asserted.
    for i in 1..=3 {
        assert!(!peer.accept_incoming_incr(format!("{i}.svrA")), "a duplicate INCR must be rejected post-convergence");
    }
}

/// S6 — force rerun with a dead MoM: `force=1` must move the job to the
/// discarding substate immediately (the "Ack" is the call returning at
/// all, with no RPC to the unreachable Mom on the critical path), and
/// completing the rerun restores the exec_vnode's resource accounting
/// exactly as an obit would.
#[test]
fn s6_force_rerun_against_dead_mom_restores_resource_accounting() {
    let sink = Arc::new(RecordingSink::default());
    let mut core = test_core("svr1", sink);

    let mut mom_arena: Arena<MomRecord> = Arena::new();
    let mom = mom_arena.insert(MomRecord::new("mom1", 15002));
    let mut node = initialize_pbsnode("n1", mom, NodeType::Cluster, PoolRole::Member);
    node.resources_available.set_or_merge("ncpus", "4", SetOp::Set).unwrap();
    node.resources_assigned.set_or_merge("ncpus", "0", SetOp::Set).unwrap();
    core.nodes.insert(node);

    let exec_vnode = "(n1:ncpus=2)";
    execvnode::apply(&mut core, exec_vnode, SetOp::Incr).unwrap();

    let mut job = Job::new("5.svr1", "alice", "workq");
    job.state = JobState::Running;
    let job_handle = core.jobs.insert(job);

    // force=true: the job is moved straight to Rerun3Discarding, no wait
    // on a kill ack from the (dead) Mom.
    core.jobs
        .get_mut(job_handle)
        .unwrap()
        .rerun(job_handle, true, core.accounting.as_ref())
        .unwrap();
    assert_eq!(
        core.jobs.get(job_handle).unwrap().substate,
        Substate::Rerun(RerunSubstate::Rerun3Discarding)
    );

    // The force-completion path (batch.rs's rerun_job) releases the
    // debited resources before requeuing, since no obit will ever arrive
    // from a Mom that was declared dead.
    execvnode::apply(&mut core, exec_vnode, SetOp::Decr).unwrap();
    let job_id = core.jobs.get(job_handle).unwrap().id.clone();
    core.peers.queue_incremental(job_id, ResourceOp::Decr, exec_vnode.to_owned());
    core.jobs
        .get_mut(job_handle)
        .unwrap()
        .rerun_complete(job_handle, core.accounting.as_ref())
        .unwrap();

    let node_handle = core.find_node("n1").unwrap();
    assert_eq!(
        core.nodes.get(node_handle).unwrap().resources_assigned.get("ncpus"),
        Some(&pbs_core::attribute::ResourceValue::Long(0)),
        "force-rerun must not leak the debited exec_vnode resources"
    );
    assert_eq!(core.jobs.get(job_handle).unwrap().state, JobState::Queued);
    assert_eq!(core.jobs.get(job_handle).unwrap().substate, Substate::None);
    assert!(core.peers.has_pending(), "the DECR must be queued to peers");
}

/// Boundary case from spec.md section 8: a plain (non-forced) rerun
/// whose Mom never acknowledges the kill is requeued by the watchdog
/// once `job_requeue_timeout` elapses, rather than blocking forever.
#[test]
fn rerun_watchdog_requeues_after_timeout_when_mom_never_acks() {
    let sink = Arc::new(RecordingSink::default());
    let mut core = test_core("svr1", sink);

    let mut job = Job::new("6.svr1", "alice", "workq");
    job.state = JobState::Running;
    let job_handle = core.jobs.insert(job);
    core.jobs
        .get_mut(job_handle)
        .unwrap()
        .rerun(job_handle, false, core.accounting.as_ref())
        .unwrap();
    assert_eq!(
        core.jobs.get(job_handle).unwrap().substate,
        Substate::Rerun(RerunSubstate::Rerun1)
    );

    core.work.schedule_at(
        Instant::now(),
        Box::new(move |core| {
            let accounting = core.accounting.clone();
            let fired = core
                .jobs
                .get_mut(job_handle)
                .unwrap()
                .rerun_watchdog_fire(job_handle, accounting.as_ref());
            assert!(fired, "watchdog must fire while still in Rerun1");
        }),
    );
    let ready = core.work.drain_ready(Instant::now() + Duration::from_millis(1));
    assert_eq!(ready.len(), 1);
    for task in ready {
        (task.run)(&mut core);
    }
    assert_eq!(core.jobs.get(job_handle).unwrap().substate, Substate::None);
}
