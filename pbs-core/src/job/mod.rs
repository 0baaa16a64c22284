//! The job state machine: ordinary jobs, array-job parents, and their
//! materialized subjobs, plus the rerun/force-rerun path.
//!
//! Every state change goes through [`Job::transition`], which is the
//! single place that both updates `state`/`substate` and fires the
//! accounting trigger — mirroring the original's convention that
//! `svr_setjobstate` is the only legal way to change `ji_qs.ji_state`.

use std::sync::OnceLock;

use crate::accounting::{AccountingEvent, AccountingSink};
use crate::attribute::{AttrArray, AttrDef, AttrDefFlags, AttrRegistry, AttrValue};
use crate::error::{CoreError, Result as CoreResult};
use crate::ids::Handle;
use crate::store::{EntityTable, Named};

/// The job's `attribute_def[]` table: every job attribute besides the
/// header fields (`id`, `owner`, `queue`, `state`, `substate`, `kind`)
/// that `Job` already carries as typed fields.
pub fn job_registry() -> &'static AttrRegistry {
    static REGISTRY: OnceLock<AttrRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        AttrRegistry::builder()
            .attr(
                AttrDef::new("Resource_List", AttrDefFlags::USRD | AttrDefFlags::USWR | AttrDefFlags::OPWR | AttrDefFlags::MGWR),
                AttrValue::ResourceList(Default::default()),
            )
            .attr(
                AttrDef::new("Hold_Types", AttrDefFlags::USRD | AttrDefFlags::OPWR | AttrDefFlags::MGWR),
                AttrValue::ArrayStr(Vec::new()),
            )
            .attr(
                AttrDef::new("Priority", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::Long(0),
            )
            .attr(
                AttrDef::new("ctime", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Time(0),
            )
            .attr(
                AttrDef::new("mtime", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Time(0),
            )
            .attr(
                AttrDef::new("etime", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Time(0),
            )
            .attr(
                AttrDef::new("euser", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("egroup", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("project", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("exec_vnode", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("Rerunable", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::Bool(true),
            )
            .attr(
                AttrDef::new("exit_status", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Long(0),
            )
            .attr(
                AttrDef::new("array_indices", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Str(String::new()),
            )
            .build()
    })
}

/// The one-letter job states reported in `qstat`, spelled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// 'T': being moved into this server's queue, not yet fully queued.
    Transit,
    /// 'Q': queued, eligible for the scheduler to consider.
    Queued,
    /// 'H': held, not eligible until released.
    Held,
    /// 'W': queued with a future execution time not yet reached.
    Waiting,
    /// 'R': running.
    Running,
    /// 'E': running but exiting (obit not yet processed).
    Exiting,
    /// 'S': administratively suspended.
    Suspended,
    /// 'U': suspended by user request (distinct limit/accounting treatment).
    UserSuspended,
    /// 'B': an array job once at least one subjob has begun running.
    Begun,
    /// 'M': moved to another server, kept as a tombstone entry.
    Moved,
    /// 'F': finished; retained only for history queries.
    Finished,
    /// 'X': a subjob slot that ran and is now terminal without ever
    /// being materialized into a full `Job` (the common case for array
    /// jobs with more subjobs than the server keeps materialized at once).
    SubjobExpired,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = match self {
            JobState::Transit => 'T',
            JobState::Queued => 'Q',
            JobState::Held => 'H',
            JobState::Waiting => 'W',
            JobState::Running => 'R',
            JobState::Exiting => 'E',
            JobState::Suspended => 'S',
            JobState::UserSuspended => 'U',
            JobState::Begun => 'B',
            JobState::Moved => 'M',
            JobState::Finished => 'F',
            JobState::SubjobExpired => 'X',
        };
        write!(f, "{c}")
    }
}

/// Substates that matter to the rerun path. Everything else is folded
/// into the parent `JobState` alone; these are the cases where "what
/// state am I in" genuinely needs a second axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerunSubstate {
    /// First rerun attempt: job requeued, waiting for the Mom to
    /// acknowledge the kill of the original process tree.
    Rerun1,
    /// Mom acknowledged; waiting for the job script/output epilogue to
    /// finish copying back before the slot is reusable.
    Rerun2,
    /// Force-rerun issued against an unresponsive Mom: the server gives
    /// up waiting for an ack and discards local job state unilaterally.
    Rerun3Discarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Substate {
    None,
    Rerun(RerunSubstate),
}

#[derive(Debug, Clone)]
pub enum SubjobSlot {
    /// Not yet materialized: just enough to answer "what state would
    /// this subjob report" without an allocated `Job`.
    Slot(JobState),
    /// Materialized into a full job on promotion to Running.
    Materialized(Handle<Job>),
}

#[derive(Debug, Clone)]
pub enum JobKind {
    Normal,
    ArrayParent { subjobs: Vec<SubjobSlot> },
    ArraySubjob { parent: Handle<Job>, index: usize },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub queue: String,
    pub state: JobState,
    pub substate: Substate,
    pub kind: JobKind,
    pub extra: AttrArray,
}

impl Named for Job {
    fn name(&self) -> &str {
        &self.id
    }
}

impl Job {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            queue: queue.into(),
            state: JobState::Transit,
            substate: Substate::None,
            kind: JobKind::Normal,
            extra: AttrArray::for_registry(job_registry()),
        }
    }

    pub fn new_array_parent(
        id: impl Into<String>,
        owner: impl Into<String>,
        queue: impl Into<String>,
        subjob_count: usize,
    ) -> Self {
        let mut job = Self::new(id, owner, queue);
        job.kind = JobKind::ArrayParent {
            subjobs: vec![SubjobSlot::Slot(JobState::Queued); subjob_count],
        };
        job
    }

    /// The single legal path for changing `state`: updates the field and
    /// fires the accounting trigger in one place so no caller can do one
    /// without the other.
    pub fn transition(
        &mut self,
        handle: Handle<Job>,
        to: JobState,
        accounting: &dyn AccountingSink,
    ) {
        let from = self.state;
        self.state = to;
        if matches!(to, JobState::Begun) {
            self.substate = Substate::None;
        }
        accounting.record(AccountingEvent::Transitioned { job: handle, from, to });
    }

    /// Promote subjob `index` from an inert slot to a fully materialized
    /// `Job`, returning the job to insert into the job table. Errors if
    /// the index is out of range or already materialized.
    pub fn materialize_subjob(
        &mut self,
        parent_handle: Handle<Job>,
        index: usize,
    ) -> CoreResult<Job> {
        let subjobs = match &mut self.kind {
            JobKind::ArrayParent { subjobs } => subjobs,
            _ => {
                return Err(CoreError::bad_state(
                    "materialize_subjob called on a non-array-parent job",
                ))
            }
        };
        let slot = subjobs
            .get_mut(index)
            .ok_or_else(|| CoreError::not_found(format!("subjob index {index}")))?;
        match slot {
            SubjobSlot::Materialized(_) => Err(CoreError::bad_state(format!(
                "subjob {index} is already materialized"
            ))),
            SubjobSlot::Slot(state) => {
                let mut subjob = Job::new(
                    format!("{}[{}]", self.id, index),
                    self.owner.clone(),
                    self.queue.clone(),
                );
                subjob.state = *state;
                subjob.kind = JobKind::ArraySubjob {
                    parent: parent_handle,
                    index,
                };
                Ok(subjob)
            }
        }
    }

    /// Record that the subjob table slot now holds a materialized
    /// handle (called once the caller has inserted the job returned by
    /// `materialize_subjob` into the job table).
    pub fn set_subjob_materialized(&mut self, index: usize, handle: Handle<Job>) -> CoreResult<()> {
        match &mut self.kind {
            JobKind::ArrayParent { subjobs } => {
                let slot = subjobs
                    .get_mut(index)
                    .ok_or_else(|| CoreError::not_found(format!("subjob index {index}")))?;
                *slot = SubjobSlot::Materialized(handle);
                Ok(())
            }
            _ => Err(CoreError::bad_state(
                "set_subjob_materialized called on a non-array-parent job",
            )),
        }
    }

    /// Demote a subjob back to an inert slot on obit, freeing its
    /// materialized `Job` allocation. The parent records only the
    /// terminal state going forward.
    pub fn demote_subjob_on_obit(&mut self, index: usize, final_state: JobState) -> CoreResult<()> {
        match &mut self.kind {
            JobKind::ArrayParent { subjobs } => {
                let slot = subjobs
                    .get_mut(index)
                    .ok_or_else(|| CoreError::not_found(format!("subjob index {index}")))?;
                *slot = SubjobSlot::Slot(final_state);
                Ok(())
            }
            _ => Err(CoreError::bad_state(
                "demote_subjob_on_obit called on a non-array-parent job",
            )),
        }
    }

    /// Begin the rerun path. A plain rerun waits for the Mom's kill ack
    /// before requeuing; a force-rerun skips straight to the discarding
    /// substate, abandoning any wait on the Mom.
    pub fn rerun(
        &mut self,
        handle: Handle<Job>,
        force: bool,
        accounting: &dyn AccountingSink,
    ) -> CoreResult<()> {
        if !matches!(self.state, JobState::Running | JobState::Exiting) {
            return Err(CoreError::bad_state(format!(
                "job {} cannot be rerun from state {}",
                self.id, self.state
            )));
        }
        self.substate = if force {
            Substate::Rerun(RerunSubstate::Rerun3Discarding)
        } else {
            Substate::Rerun(RerunSubstate::Rerun1)
        };
        accounting.record(AccountingEvent::Rerun { job: handle, forced: force });
        Ok(())
    }

    /// Advance a plain (non-forced) rerun from Rerun1 to Rerun2 on
    /// receipt of the Mom's kill acknowledgment.
    pub fn rerun_ack_kill(&mut self) -> CoreResult<()> {
        match self.substate {
            Substate::Rerun(RerunSubstate::Rerun1) => {
                self.substate = Substate::Rerun(RerunSubstate::Rerun2);
                Ok(())
            }
            _ => Err(CoreError::bad_state(
                "rerun_ack_kill called outside the Rerun1 substate",
            )),
        }
    }

    /// Complete a rerun (any substate) by requeuing the job.
    pub fn rerun_complete(&mut self, handle: Handle<Job>, accounting: &dyn AccountingSink) -> CoreResult<()> {
        if !matches!(self.substate, Substate::Rerun(_)) {
            return Err(CoreError::bad_state("rerun_complete called outside a rerun substate"));
        }
        self.substate = Substate::None;
        self.transition(handle, JobState::Queued, accounting);
        Ok(())
    }

    /// Fired by the server's `job_requeue_timeout` watchdog: if the job is
    /// still waiting on the Mom's kill acknowledgment (`Rerun1`), give up
    /// on it rather than block the rerun forever against an unresponsive
    /// Mom. A no-op (returns `false`) if the ack already arrived and moved
    /// the substate on, since the watchdog is scheduled unconditionally
    /// and has no way to cancel itself early.
    pub fn rerun_watchdog_fire(&mut self, handle: Handle<Job>, accounting: &dyn AccountingSink) -> bool {
        if matches!(self.substate, Substate::Rerun(RerunSubstate::Rerun1)) {
            self.substate = Substate::None;
            accounting.record(AccountingEvent::Aborted {
                job: handle,
                reason: "rerun timed out waiting for mom acknowledgment",
            });
            true
        } else {
            false
        }
    }

    /// Derive an array-parent's own reported state from its subjobs:
    /// `Begun` if any subjob is active, `SubjobExpired` once every subjob
    /// has reached a terminal state, `Queued` otherwise. Returns `None`
    /// for a non-array-parent job, since the question doesn't apply.
    /// Materialized subjobs are looked up in `jobs`; an unmaterialized
    /// slot already carries its own state directly.
    pub fn array_aggregate_state(&self, jobs: &EntityTable<Job>) -> Option<JobState> {
        let subjobs = match &self.kind {
            JobKind::ArrayParent { subjobs } => subjobs,
            _ => return None,
        };
        if subjobs.is_empty() {
            return Some(JobState::Queued);
        }
        let mut any_active = false;
        let mut all_terminal = true;
        for slot in subjobs {
            let state = match slot {
                SubjobSlot::Slot(state) => *state,
                SubjobSlot::Materialized(handle) => jobs.get(*handle).map(|j| j.state).unwrap_or(JobState::Queued),
            };
            if matches!(
                state,
                JobState::Running | JobState::Exiting | JobState::Suspended | JobState::UserSuspended
            ) {
                any_active = true;
            }
            if !matches!(state, JobState::Finished | JobState::SubjobExpired | JobState::Moved) {
                all_terminal = false;
            }
        }
        if any_active {
            Some(JobState::Begun)
        } else if all_terminal {
            Some(JobState::SubjobExpired)
        } else {
            Some(JobState::Queued)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::test_support::RecordingSink;
    use crate::ids::Arena;

    #[test]
    fn new_job_extra_array_sized_to_registry() {
        let job = Job::new("1.server", "alice", "workq");
        assert_eq!(job.extra.len(), job_registry().len());
        assert!(job_registry().index_of("Resource_List").is_some());
    }

    #[test]
    fn transition_fires_accounting_exactly_once() {
        let mut arena: Arena<Job> = Arena::new();
        let handle = arena.insert(Job::new("1.server", "alice", "workq"));
        let sink = RecordingSink::default();
        let job = arena.get_mut(handle).unwrap();
        job.transition(handle, JobState::Queued, &sink);
        assert_eq!(sink.events.lock().len(), 1);
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn force_rerun_skips_to_discarding_substate() {
        let mut job = Job::new("1.server", "alice", "workq");
        job.state = JobState::Running;
        let sink = RecordingSink::default();
        let mut arena: Arena<Job> = Arena::new();
        let handle = arena.insert(job.clone());
        job.rerun(handle, true, &sink).unwrap();
        assert_eq!(job.substate, Substate::Rerun(RerunSubstate::Rerun3Discarding));
    }

    #[test]
    fn materialize_then_demote_subjob() {
        let mut parent = Job::new_array_parent("1.server", "alice", "workq", 3);
        let parent_handle_arena: Arena<Job> = Arena::new();
        let _ = parent_handle_arena;
        let mut arena: Arena<Job> = Arena::new();
        let parent_handle = arena.insert(parent.clone());

        let subjob = parent.materialize_subjob(parent_handle, 1).unwrap();
        assert_eq!(subjob.id, "1.server[1]");
        let sub_handle = arena.insert(subjob);
        parent.set_subjob_materialized(1, sub_handle).unwrap();

        parent.demote_subjob_on_obit(1, JobState::Finished).unwrap();
        match &parent.kind {
            JobKind::ArrayParent { subjobs } => {
                assert!(matches!(subjobs[1], SubjobSlot::Slot(JobState::Finished)));
            }
            _ => panic!("expected array parent"),
        }
    }

    #[test]
    fn array_aggregate_state_tracks_subjobs() {
        let mut jobs: EntityTable<Job> = EntityTable::new();
        let parent_handle = jobs.insert(Job::new_array_parent("1.server", "alice", "workq", 3));

        // All unstarted: Queued.
        {
            let parent = jobs.get(parent_handle).unwrap();
            assert_eq!(parent.array_aggregate_state(&jobs), Some(JobState::Queued));
        }

        // Materialize subjob 0 as Running: aggregate becomes Begun.
        let mut running_sub = Job::new("1.server[0]", "alice", "workq");
        running_sub.state = JobState::Running;
        running_sub.kind = JobKind::ArraySubjob { parent: parent_handle, index: 0 };
        let sub_handle = jobs.insert(running_sub);
        jobs.get_mut(parent_handle).unwrap().set_subjob_materialized(0, sub_handle).unwrap();
        assert_eq!(
            jobs.get(parent_handle).unwrap().array_aggregate_state(&jobs),
            Some(JobState::Begun)
        );

        // Once every subjob is terminal: SubjobExpired.
        jobs.get_mut(sub_handle).unwrap().state = JobState::Finished;
        jobs.get_mut(parent_handle).unwrap().demote_subjob_on_obit(0, JobState::Finished).unwrap();
        jobs.get_mut(parent_handle).unwrap().demote_subjob_on_obit(1, JobState::SubjobExpired).unwrap();
        jobs.get_mut(parent_handle).unwrap().demote_subjob_on_obit(2, JobState::Finished).unwrap();
        assert_eq!(
            jobs.get(parent_handle).unwrap().array_aggregate_state(&jobs),
            Some(JobState::SubjobExpired)
        );
    }

    #[test]
    fn rerun_watchdog_fires_only_in_rerun1() {
        let mut job = Job::new("1.server", "alice", "workq");
        job.state = JobState::Running;
        let sink = RecordingSink::default();
        let mut arena: Arena<Job> = Arena::new();
        let handle = arena.insert(job.clone());

        job.rerun(handle, false, &sink).unwrap();
        assert!(job.rerun_watchdog_fire(handle, &sink));
        assert_eq!(job.substate, Substate::None);
        assert_eq!(sink.events.lock().len(), 2);

        // Once not in Rerun1 (e.g. plain Queued), firing again is a no-op.
        assert!(!job.rerun_watchdog_fire(handle, &sink));
        assert_eq!(sink.events.lock().len(), 2);
    }
}
