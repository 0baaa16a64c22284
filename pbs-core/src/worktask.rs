//! The work-task queue: the cooperative scheduling primitive the whole
//! server runs on instead of locks. Every asynchronous thing the server
//! waits on — a reply from a Mom, a timer, a deferred local callback —
//! is a task of one of the original's eight `work_type` kinds, and the
//! single reactor owns `&mut Core` for the full duration of running one.
//!
//! Grounded in the original's `pbs_queue_work`/`next_task`: a flat list
//! of pending tasks, each carrying the event it is waiting on, dispatched
//! by a single thread so no task ever observes another task's
//! half-applied state.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::core_ctx::Core;

/// The eight kinds of work task the original distinguishes, preserved
/// verbatim because dispatch semantics differ per kind (a `Timed` task
/// is polled against a deadline, a `Deferred_Reply` task is woken by a
/// specific incoming reply, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    /// Runs on the very next pass through the reactor loop.
    Immed,
    /// Runs once for every other pending task, round-robin, useful for
    /// tasks that should make slow background progress without starving
    /// `Immed` work.
    Interleave,
    /// Runs once a wall-clock deadline is reached.
    Timed,
    /// Woken when a specific child process/subprocess exits.
    DeferredChild,
    /// Woken when a reply to a specific outstanding request arrives.
    DeferredReply,
    /// Woken by another in-process component signaling completion
    /// locally (no network round trip).
    DeferredLocal,
    /// Woken by an event belonging to a different subsystem's queue
    /// (e.g. the scheduler-dispatch layer signaling cycle-end).
    DeferredOther,
    /// Woken on completion of a command dispatched to an external
    /// process (e.g. a pre/post-script hook).
    DeferredCmd,
}

pub type TaskFn = Box<dyn FnOnce(&mut Core) + Send>;

pub struct WorkTask {
    pub kind: WorkType,
    pub deadline: Option<Instant>,
    pub sequence: u64,
    pub run: TaskFn,
}

impl std::fmt::Debug for WorkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkTask")
            .field("kind", &self.kind)
            .field("deadline", &self.deadline)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl PartialEq for WorkTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for WorkTask {}
impl Ord for WorkTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first,
        // so reverse the natural order. Tasks without a deadline
        // (event-driven) sort after every timed task and break ties by
        // insertion order (lower sequence first), so reverse that too.
        match (other.deadline, self.deadline) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => other.sequence.cmp(&self.sequence),
        }
    }
}
impl PartialOrd for WorkTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The queue itself: timed/deadline-bearing tasks are ordered by
/// deadline in a heap; purely event-driven tasks (the `Deferred_*`
/// kinds and `Immed`/`Interleave`) are woken explicitly via `wake`.
#[derive(Default)]
pub struct WorkQueue {
    timed: BinaryHeap<WorkTask>,
    immediate: Vec<WorkTask>,
    next_sequence: u64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timed.len() + self.immediate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.next_sequence;
        self.next_sequence += 1;
        s
    }

    pub fn schedule_immediate(&mut self, kind: WorkType, run: TaskFn) {
        let sequence = self.next_seq();
        self.immediate.push(WorkTask {
            kind,
            deadline: None,
            sequence,
            run,
        });
    }

    pub fn schedule_at(&mut self, deadline: Instant, run: TaskFn) {
        let sequence = self.next_seq();
        self.timed.push(WorkTask {
            kind: WorkType::Timed,
            deadline: Some(deadline),
            sequence,
            run,
        });
    }

    /// Pop every timed task whose deadline has passed, plus every
    /// pending immediate/deferred task, in the order they should run
    /// this pass: expired timed tasks first (oldest deadline first),
    /// then immediate/interleave/deferred tasks in submission order.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<WorkTask> {
        let mut ready = Vec::new();
        while let Some(top) = self.timed.peek() {
            match top.deadline {
                Some(d) if d <= now => ready.push(self.timed.pop().unwrap()),
                _ => break,
            }
        }
        ready.append(&mut self.immediate);
        ready
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timed.peek().and_then(|t| t.deadline)
    }
}

/// A one-shot waiter a caller can hand out when scheduling a
/// `DeferredReply`/`DeferredChild`/`DeferredLocal`/`DeferredOther`/
/// `DeferredCmd` task: the reactor resolves it by running the task's
/// `run` closure, which in turn is expected to send on this channel if
/// the original caller is itself waiting on the result.
pub fn deferred_channel<T: Send + 'static>() -> (oneshot::Sender<T>, oneshot::Receiver<T>) {
    oneshot::channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn immediate_tasks_drain_in_submission_order() {
        let mut q = WorkQueue::new();
        q.schedule_immediate(WorkType::Immed, Box::new(|_| {}));
        q.schedule_immediate(WorkType::Interleave, Box::new(|_| {}));
        let ready = q.drain_ready(Instant::now());
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].sequence, 0);
        assert_eq!(ready[1].sequence, 1);
    }

    #[test]
    fn timed_tasks_wait_for_deadline() {
        let mut q = WorkQueue::new();
        let now = Instant::now();
        q.schedule_at(now + Duration::from_secs(10), Box::new(|_| {}));
        assert!(q.drain_ready(now).is_empty());
        assert!(!q.drain_ready(now + Duration::from_secs(11)).is_empty());
    }

    #[test]
    fn earliest_deadline_drains_first() {
        let mut q = WorkQueue::new();
        let now = Instant::now();
        q.schedule_at(now + Duration::from_secs(10), Box::new(|_| {}));
        q.schedule_at(now + Duration::from_secs(1), Box::new(|_| {}));
        let ready = q.drain_ready(now + Duration::from_secs(20));
        assert_eq!(ready[0].deadline, Some(now + Duration::from_secs(1)));
        assert_eq!(ready[1].deadline, Some(now + Duration::from_secs(10)));
    }
}
