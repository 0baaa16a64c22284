//! The reactor task: the single owner of `&mut Core` (spec.md §5 "no
//! locks anywhere in the design"; DESIGN NOTES "group globals into a
//! single `Core` context... the reactor task is the only thing that
//! ever holds `&mut Core`").
//!
//! Every other task in this process — a gRPC handler, the scheduler
//! dispatch loop, the peer fan-out loop — reaches `Core` only by
//! sending a closure across an unbounded channel and awaiting its
//! result on a paired oneshot, mirroring the original's single-threaded
//! `select`-style reactor plus work-task queue (spec.md §5). A closure
//! run here must never itself await: the only suspension point is the
//! `rx.await` the caller does *outside* the reactor, exactly the
//! "observable entity state is public between a suspension and its
//! resume" contract spec.md §5 describes.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use pbs_core::core_ctx::Core;
use pbs_core::worktask::TaskFn;

use crate::ServerError;

/// A pending call into the reactor: a closure over `&mut Core` plus the
/// oneshot it reports its result on. Kept distinct from `TaskFn` (which
/// has no reply channel) even though both close over `&mut Core`,
/// because every external caller needs a result back and a work-task
/// scheduled from inside the reactor itself generally does not.
type Call = Box<dyn FnOnce(&mut Core) + Send>;

#[derive(Clone)]
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<Call>,
}

impl ReactorHandle {
    /// Spawn the reactor loop owning `core` and return a cheaply
    /// cloneable handle to it. Every gRPC service and background task in
    /// `pbs-server` holds a clone of the handle returned here; none of
    /// them ever see `Core` directly.
    pub fn spawn(core: Core) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(core, rx));
        Self { tx }
    }

    /// Run `f` against `&mut Core` on the reactor task and await its
    /// result. `f` must not block or await internally — it runs
    /// in-line on the single reactor task and every other caller queued
    /// behind this one waits for it to return.
    pub async fn submit<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&mut Core) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call: Call = Box::new(move |core| {
            let result = f(core);
            // The receiver may have been dropped (caller cancelled);
            // that is not this closure's problem to report.
            let _ = reply_tx.send(result);
        });
        self.tx.send(call).map_err(|_| ServerError::ReactorGone)?;
        reply_rx.await.map_err(|_| ServerError::ReactorGone)
    }

    /// Enqueue a fire-and-forget work-task onto `Core`'s own
    /// [`pbs_core::worktask::WorkQueue`] rather than running it
    /// immediately inline. Used for continuations that should run on a
    /// later reactor pass (e.g. the background re-check task
    /// `node::indirect` schedules after an unset, spec.md §4.2).
    pub fn schedule_immediate(&self, run: TaskFn) -> Result<(), ServerError> {
        self.submit_fire_and_forget(move |core| {
            core.work
                .schedule_immediate(pbs_core::worktask::WorkType::Immed, run)
        })
    }

    fn submit_fire_and_forget<F>(&self, f: F) -> Result<(), ServerError>
    where
        F: FnOnce(&mut Core) + Send + 'static,
    {
        self.tx.send(Box::new(f)).map_err(|_| ServerError::ReactorGone)
    }
}

/// One pass of the reactor loop: drain every channel message currently
/// queued (so a burst of requests is applied without an intervening
/// work-queue drain starving them), then run every work-task whose
/// deadline has passed or which is purely event-driven.
async fn run(mut core: Core, mut rx: mpsc::UnboundedReceiver<Call>) {
    loop {
        let deadline = core.work.next_deadline();
        tokio::select! {
            biased;

            maybe_call = rx.recv() => {
                match maybe_call {
                    Some(call) => call(&mut core),
                    None => {
                        tracing::info!("reactor channel closed, shutting down reactor task");
                        return;
                    }
                }
                // Drain any further calls that arrived while we were
                // already scheduled, same pass, before touching the
                // work queue: callers should never wait behind a timer
                // that hasn't fired yet.
                while let Ok(call) = rx.try_recv() {
                    call(&mut core);
                }
            }

            _ = sleep_until(deadline) => {}
        }

        for task in core.work.drain_ready(Instant::now()) {
            (task.run)(&mut core);
        }
    }
}

/// Sleep until `deadline`, or forever if there is none pending — the
/// `select!` above simply never resolves that branch until a channel
/// message arrives instead.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => {
            let now = Instant::now();
            if d > now {
                sleep(d - now).await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Convenience re-export so callers can spell a short sleep without a
/// direct `tokio::time` dependency of their own (used by the dispatch
/// loops' poll interval).
pub const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
