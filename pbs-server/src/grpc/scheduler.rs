//! The `SchedulerSecondary` surface: implemented by this Server, called
//! by each partition's Scheduler process to register itself, report a
//! cycle's end, and ask the per-cycle run-eligibility question spec.md
//! §4.4 calls the `am_jobs` guard.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::dispatch::Dispatch;
use crate::grpc::scheduler_proto::scheduler_secondary_server::SchedulerSecondary;
use crate::grpc::scheduler_proto::{
    CycleEndAck, CycleEndNotice, RegisterAck, RegisterRequest, RunReply, RunRequest,
};
use crate::reactor::ReactorHandle;

pub struct SchedulerSecondaryService {
    reactor: ReactorHandle,
    dispatch: Arc<Dispatch>,
}

impl SchedulerSecondaryService {
    pub fn new(reactor: ReactorHandle, dispatch: Arc<Dispatch>) -> Self {
        Self { reactor, dispatch }
    }
}

#[tonic::async_trait]
impl SchedulerSecondary for SchedulerSecondaryService {
    async fn register_scheduler(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterAck>, Status> {
        let RegisterRequest { partition, primary_endpoint } = request.into_inner();
        self.dispatch
            .register_scheduler_endpoint(&partition, &primary_endpoint)
            .await?;
        let dispatch = Arc::clone(&self.dispatch);
        tokio::spawn(async move {
            if let Err(err) = dispatch.start_cycle(&partition).await {
                tracing::warn!(%err, "failed to start first cycle after scheduler registration");
            }
        });
        Ok(Response::new(RegisterAck { accepted: true }))
    }

    async fn notify_cycle_end(
        &self,
        request: Request<CycleEndNotice>,
    ) -> Result<Response<CycleEndAck>, Status> {
        let CycleEndNotice { partition, code } = request.into_inner();
        self.dispatch.note_cycle_ended(&partition);
        let partition_for_restart = partition.clone();
        let restart = self
            .reactor
            .submit(move |core| {
                let sched = core.schedulers.get_or_create(&partition);
                if code != 0 {
                    tracing::warn!(partition = %partition, code, "scheduler reported a cycle-end error");
                }
                sched.note_cycle_end(code)
            })
            .await?;
        if restart {
            let dispatch = Arc::clone(&self.dispatch);
            tokio::spawn(async move {
                if let Err(err) = dispatch.start_cycle(&partition_for_restart).await {
                    tracing::warn!(%err, "failed to restart scheduler cycle after cycle-end");
                }
            });
        }
        Ok(Response::new(CycleEndAck {}))
    }

    async fn request_run(&self, request: Request<RunRequest>) -> Result<Response<RunReply>, Status> {
        let RunRequest { partition, job_id } = request.into_inner();
        let reply = self
            .reactor
            .submit(move |core| {
                let Some(job_handle) = core.find_job(&job_id) else {
                    return RunReply {
                        accepted: false,
                        reject_reason: format!("unknown job '{job_id}'"),
                    };
                };
                let sched = core.schedulers.get_or_create(&partition);
                if sched.check_stale(job_handle) {
                    RunReply {
                        accepted: false,
                        reject_reason: "job altered since the cycle's command was sent".to_owned(),
                    }
                } else {
                    RunReply { accepted: true, reject_reason: String::new() }
                }
            })
            .await?;
        Ok(Response::new(reply))
    }
}
