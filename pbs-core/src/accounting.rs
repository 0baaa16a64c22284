//! The accounting trigger surface. The original writes fixed-format
//! records (`record_job_state`, `record_jobend`, ...) straight into the
//! server's accounting log, interleaved with the state-machine code
//! that decides a transition happened. Pulling it out as a trait lets
//! `Job::transition` stay the single place a state change is decided,
//! while the actual sink (flat-file log, or a no-op for tests) is
//! swapped independently.

use std::fmt;

use crate::ids::Handle;
use crate::job::{Job, JobState};

/// One accounting-relevant event. Kept as an enum rather than a single
/// "state changed" variant because several events (rerun, abort) carry
/// information beyond the before/after state pair.
#[derive(Debug, Clone)]
pub enum AccountingEvent<'a> {
    Transitioned {
        job: Handle<Job>,
        from: JobState,
        to: JobState,
    },
    Rerun {
        job: Handle<Job>,
        forced: bool,
    },
    Aborted {
        job: Handle<Job>,
        reason: &'a str,
    },
}

impl fmt::Display for AccountingEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountingEvent::Transitioned { job, from, to } => {
                write!(f, "job {job:?} transitioned {from} -> {to}")
            }
            AccountingEvent::Rerun { job, forced } => {
                write!(f, "job {job:?} rerun (forced={forced})")
            }
            AccountingEvent::Aborted { job, reason } => {
                write!(f, "job {job:?} aborted: {reason}")
            }
        }
    }
}

/// Implemented by whatever actually persists accounting events: a
/// flat-file writer in production, a `Vec`-backed double in tests.
pub trait AccountingSink: Send + Sync {
    fn record(&self, event: AccountingEvent<'_>);
}

/// Default sink: routes every event through `tracing` at `info` level on
/// a dedicated target, so a deployment can route accounting to its own
/// log file via a `tracing-appender` non-blocking writer without this
/// crate knowing anything about file paths.
#[derive(Debug, Default)]
pub struct TracingAccountingSink;

impl AccountingSink for TracingAccountingSink {
    fn record(&self, event: AccountingEvent<'_>) {
        tracing::info!(target: "pbs_core::accounting", "{event}");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<String>>,
    }

    impl AccountingSink for RecordingSink {
        fn record(&self, event: AccountingEvent<'_>) {
            self.events.lock().push(event.to_string());
        }
    }
}
