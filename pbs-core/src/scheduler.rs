//! Scheduler dispatch: the command/reply protocol between the Server and
//! the one-or-more Scheduler processes it drives, one per partition.
//!
//! Grounded in the original's `run_sched.c`: `send_sched_cmd` writes a
//! command on the secondary (here: primary command) stream and flips
//! `sc_cycle_started`; `am_jobs` is the alter-during-cycle guard array;
//! deferred `qrun` requests queue per-scheduler with a `dr_sent` flag
//! exactly as described in spec.md §4.4.

use std::collections::VecDeque;

use crate::error::{CoreError, Result as CoreResult};
use crate::ids::Handle;
use crate::job::Job;
use crate::store::Named;

/// The three states a Scheduler connection can be in. The Server only
/// ever sends a new cycle command from `Idle`; it reaches `Idle` again
/// exclusively by reading the cycle-end marker off the secondary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Scheduling,
    Down,
}

/// The command codes the original's `send_sched_cmd` writes on the wire.
/// `Configure` and `Quit` travel on the high-priority path and are never
/// dropped in favor of a pending-flag coalescing the way `Normal`/`AJob`
/// are; `FirstTime` is the one-shot "populate caches from scratch" cue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedCommand {
    FirstTime,
    Normal,
    AJob(String),
    Configure,
    Quit,
}

impl SchedCommand {
    fn is_high_priority(&self) -> bool {
        matches!(self, SchedCommand::Configure | SchedCommand::Quit)
    }
}

/// One manager/operator `qrun <jobid>` request queued against a specific
/// Scheduler. `dr_sent` distinguishes "piggybacked onto the in-flight
/// cycle command already" from "still waiting for the next cycle start".
#[derive(Debug, Clone)]
struct QrunRequest {
    job: Handle<Job>,
    dr_sent: bool,
}

/// Per-partition Scheduler connection pair: primary (Server -> Scheduler
/// commands) and secondary (Scheduler -> Server cycle-end + sub-queries),
/// modeled here as opaque stream identifiers since the transport itself
/// lives in `pbs-server`.
#[derive(Debug, Clone)]
pub struct ScSched {
    pub partition: String,
    pub primary_stream: Option<u64>,
    pub secondary_stream: Option<u64>,
    cycle: CycleState,
    /// Set while `Scheduling` and another cycle is requested before this
    /// one ends; consumed (and a fresh cycle started) on cycle-end.
    pending_cycle: bool,
    qrun_queue: VecDeque<QrunRequest>,
    /// Jobs moved or altered since the in-flight cycle's command was
    /// sent: the original's `am_jobs`. A run request naming one of these
    /// is rejected as stale.
    am_jobs: Vec<Handle<Job>>,
}

impl Named for ScSched {
    fn name(&self) -> &str {
        &self.partition
    }
}

impl ScSched {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            primary_stream: None,
            secondary_stream: None,
            cycle: CycleState::Down,
            pending_cycle: false,
            qrun_queue: VecDeque::new(),
            am_jobs: Vec::new(),
        }
    }

    pub fn cycle(&self) -> CycleState {
        self.cycle
    }

    pub fn connect(&mut self, primary: u64, secondary: u64) {
        self.primary_stream = Some(primary);
        self.secondary_stream = Some(secondary);
        self.cycle = CycleState::Idle;
    }

    /// Queue a manager/operator-requested run of a specific job against
    /// this Scheduler. Does not itself trigger a cycle; the caller
    /// decides whether to start one via [`Self::begin_cycle`].
    pub fn enqueue_qrun(&mut self, job: Handle<Job>) {
        self.qrun_queue.push_back(QrunRequest { job, dr_sent: false });
    }

    /// Attempt to send `cmd`. `Configure`/`Quit` always go out on the
    /// high-priority path regardless of cycle state (mirroring
    /// `SCH_SCHEDULE_HIGH` never losing `SCH_QUIT`). Any other command
    /// is refused while a cycle is already in progress: the caller
    /// should instead rely on `pending_cycle` having been set and retry
    /// at the next `note_cycle_end`.
    ///
    /// On success, if there is an unsent qrun request, its jobid is
    /// piggybacked and returned alongside the confirmed command.
    pub fn begin_cycle(&mut self, cmd: SchedCommand) -> CoreResult<(SchedCommand, Option<Handle<Job>>)> {
        if self.primary_stream.is_none() {
            return Err(CoreError::transient(format!(
                "scheduler '{}' has no connected primary stream",
                self.partition
            )));
        }
        if self.cycle == CycleState::Scheduling && !cmd.is_high_priority() {
            self.pending_cycle = true;
            return Err(CoreError::bad_state(format!(
                "scheduler '{}' is already mid-cycle; command deferred",
                self.partition
            )));
        }

        let piggyback = if matches!(cmd, SchedCommand::Normal | SchedCommand::FirstTime) {
            self.first_unsent_qrun()
        } else {
            None
        };

        if !cmd.is_high_priority() {
            self.cycle = CycleState::Scheduling;
            self.pending_cycle = false;
        }
        Ok((cmd, piggyback))
    }

    fn first_unsent_qrun(&mut self) -> Option<Handle<Job>> {
        let entry = self.qrun_queue.iter_mut().find(|q| !q.dr_sent)?;
        entry.dr_sent = true;
        Some(entry.job)
    }

    /// Mark a job as moved/altered mid-cycle. A run request against it
    /// should subsequently be rejected by [`Self::check_stale`].
    pub fn mark_altered(&mut self, job: Handle<Job>) {
        if self.cycle == CycleState::Scheduling && !self.am_jobs.contains(&job) {
            self.am_jobs.push(job);
        }
    }

    /// Whether a run request for `job` must be rejected because it was
    /// altered after the in-flight cycle's command was sent.
    pub fn check_stale(&self, job: Handle<Job>) -> bool {
        self.am_jobs.contains(&job)
    }

    /// Process the secondary stream's end-of-cycle marker (`0` = normal,
    /// nonzero = scheduler-reported error, which also marks it DOWN).
    /// Returns `true` if another cycle must be started immediately
    /// (a pending request arrived mid-cycle, or unsent qruns remain).
    pub fn note_cycle_end(&mut self, code: i32) -> bool {
        self.am_jobs.clear();
        // Requests answered as part of this cycle are done; anything
        // still queued with dr_sent unset survives to the next cycle.
        self.qrun_queue.retain(|q| !q.dr_sent);
        if code != 0 {
            self.cycle = CycleState::Down;
            return false;
        }
        self.cycle = CycleState::Idle;
        let more_qruns_pending = !self.qrun_queue.is_empty();
        let restart = self.pending_cycle || more_qruns_pending;
        self.pending_cycle = false;
        restart
    }

    /// The Scheduler closed its socket mid-cycle. Every qrun request
    /// that was sent-but-unanswered is failed with `PBSE_INTERNAL`
    /// (returned to the caller so it can reply to the original manager
    /// request); unsent ones are kept and the caller should raise the
    /// "unsent qrun pending" flag to force a re-cycle on reconnect.
    pub fn disconnect(&mut self) -> Vec<Handle<Job>> {
        self.primary_stream = None;
        self.secondary_stream = None;
        self.cycle = CycleState::Down;
        self.am_jobs.clear();
        let mut failed = Vec::new();
        self.qrun_queue.retain(|q| {
            if q.dr_sent {
                failed.push(q.job);
                false
            } else {
                true
            }
        });
        failed
    }

    pub fn has_unsent_qrun(&self) -> bool {
        self.qrun_queue.iter().any(|q| !q.dr_sent)
    }
}

/// All Scheduler connections, keyed by partition, plus the server-wide
/// "has SCH_SCHEDULE_FIRST ever been sent" latch (exactly one per
/// process lifetime, regardless of how many partitions exist).
#[derive(Debug, Default)]
pub struct SchedulerPool {
    by_partition: std::collections::HashMap<String, ScSched>,
    first_time_sent: bool,
}

impl SchedulerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, partition: &str) -> &mut ScSched {
        self.by_partition
            .entry(partition.to_owned())
            .or_insert_with(|| ScSched::new(partition))
    }

    pub fn get(&self, partition: &str) -> Option<&ScSched> {
        self.by_partition.get(partition)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ScSched> {
        self.by_partition.values_mut()
    }

    /// The next normal-priority command kind to use: `FirstTime` exactly
    /// once across the whole pool's lifetime, `Normal` forever after.
    pub fn next_normal_command(&mut self) -> SchedCommand {
        if !self.first_time_sent {
            self.first_time_sent = true;
            SchedCommand::FirstTime
        } else {
            SchedCommand::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Arena;

    fn job_handle() -> Handle<Job> {
        let mut arena: Arena<Job> = Arena::new();
        arena.insert(Job::new("1.server", "alice", "workq"))
    }

    #[test]
    fn first_dispatch_is_first_time_then_normal() {
        let mut pool = SchedulerPool::new();
        assert_eq!(pool.next_normal_command(), SchedCommand::FirstTime);
        assert_eq!(pool.next_normal_command(), SchedCommand::Normal);
        assert_eq!(pool.next_normal_command(), SchedCommand::Normal);
    }

    #[test]
    fn second_cycle_command_is_deferred_while_scheduling() {
        let mut sched = ScSched::new("default");
        sched.connect(1, 2);
        sched.begin_cycle(SchedCommand::Normal).unwrap();
        assert_eq!(sched.cycle(), CycleState::Scheduling);
        let err = sched.begin_cycle(SchedCommand::Normal);
        assert!(err.is_err());
    }

    #[test]
    fn quit_always_goes_out_even_mid_cycle() {
        let mut sched = ScSched::new("default");
        sched.connect(1, 2);
        sched.begin_cycle(SchedCommand::Normal).unwrap();
        let (cmd, _) = sched.begin_cycle(SchedCommand::Quit).unwrap();
        assert_eq!(cmd, SchedCommand::Quit);
        // The Normal cycle we started is still formally in progress.
        assert_eq!(sched.cycle(), CycleState::Scheduling);
    }

    #[test]
    fn qrun_piggybacks_onto_next_cycle_start() {
        let mut sched = ScSched::new("default");
        sched.connect(1, 2);
        let job = job_handle();
        sched.enqueue_qrun(job);
        let (_, piggyback) = sched.begin_cycle(SchedCommand::Normal).unwrap();
        assert_eq!(piggyback, Some(job));
        assert!(!sched.has_unsent_qrun());
    }

    #[test]
    fn unanswered_qrun_survives_cycle_end_and_requests_recycle() {
        let mut sched = ScSched::new("default");
        sched.connect(1, 2);
        sched.enqueue_qrun(job_handle());
        sched.enqueue_qrun(job_handle());
        sched.begin_cycle(SchedCommand::Normal).unwrap();
        // Only the first qrun was piggybacked; the second remains unsent.
        assert!(sched.has_unsent_qrun());
        let restart = sched.note_cycle_end(0);
        assert!(restart);
    }

    #[test]
    fn altered_job_is_flagged_stale_during_cycle() {
        let mut sched = ScSched::new("default");
        sched.connect(1, 2);
        let job = job_handle();
        sched.begin_cycle(SchedCommand::Normal).unwrap();
        sched.mark_altered(job);
        assert!(sched.check_stale(job));
        sched.note_cycle_end(0);
        assert!(!sched.check_stale(job));
    }

    #[test]
    fn disconnect_fails_sent_qruns_and_keeps_unsent() {
        let mut sched = ScSched::new("default");
        sched.connect(1, 2);
        let sent = job_handle();
        let unsent = job_handle();
        sched.enqueue_qrun(sent);
        sched.begin_cycle(SchedCommand::Normal).unwrap();
        sched.enqueue_qrun(unsent);
        let failed = sched.disconnect();
        assert_eq!(failed, vec![sent]);
        assert!(sched.has_unsent_qrun());
    }
}
