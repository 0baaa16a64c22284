//! The client-facing batch protocol (spec.md §6): one `BatchGrpc` RPC
//! per request family, grounded in the teacher's
//! `scheduler_server/grpc.rs` convention of an `async_trait` impl that
//! destructures the request and maps every fallible path through `?`
//! into a `tonic::Status` rather than hand-rolling error responses.
//!
//! Every handler runs its actual mutation as a closure submitted to the
//! [`ReactorHandle`]; nothing in this file ever touches `Core` directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tonic::{Request, Response, Status};

use pbs_core::attribute::{AttrParentKind, Privilege, SetOp};
use pbs_core::job::{job_registry, Job, JobState};
use pbs_core::node::node_registry;
use pbs_core::persistence::{FailoverLock, LockState};
use pbs_core::queue::{queue_registry, Queue, QueueType};
use pbs_core::reservation::{reservation_registry, Reservation};
use pbs_core::CoreError;

use crate::dispatch::Dispatch;
use crate::execvnode;
use crate::grpc::attrs::{apply_attr_list, encode_attr_list, WireAttr};
use crate::grpc::batch_proto::batch_grpc_server::BatchGrpc;
use crate::grpc::batch_proto::*;
use crate::reactor::ReactorHandle;

impl WireAttr for Svrattrl {
    fn name(&self) -> &str {
        &self.name
    }
    fn resource(&self) -> Option<&str> {
        if self.resource.is_empty() {
            None
        } else {
            Some(&self.resource)
        }
    }
    fn value(&self) -> &str {
        &self.value
    }
    fn op(&self) -> &str {
        &self.op
    }
}

fn wire_attrs(attrs: Option<AttrList>) -> Vec<Svrattrl> {
    attrs.map(|a| a.attrs).unwrap_or_default()
}

/// Read a job's `exec_vnode` attribute, if set to a non-empty string.
fn job_exec_vnode(core: &pbs_core::core_ctx::Core, handle: pbs_core::ids::Handle<Job>) -> Option<String> {
    let job = core.jobs.get(handle)?;
    let idx = job_registry().index_of("exec_vnode").expect("exec_vnode is registered");
    match job.extra.get(idx).value() {
        Some(pbs_core::attribute::AttrValue::Str(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

pub struct BatchService {
    reactor: ReactorHandle,
    failover_lock: Arc<Mutex<FailoverLock>>,
    dispatch: Arc<Dispatch>,
}

impl BatchService {
    pub fn new(
        reactor: ReactorHandle,
        failover_lock: Arc<Mutex<FailoverLock>>,
        dispatch: Arc<Dispatch>,
    ) -> Self {
        Self { reactor, failover_lock, dispatch }
    }
}

#[tonic::async_trait]
impl BatchGrpc for BatchService {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobReply>, Status> {
        let SubmitJobRequest { queue, owner, attrs } = request.into_inner();
        let attrs = wire_attrs(attrs);
        let job_id = self
            .reactor
            .submit(move |core| -> Result<String, Status> {
                let id = core.next_job_id();
                let mut job = Job::new(id.clone(), owner, queue.clone());
                apply_attr_list(&mut job.extra, job_registry(), AttrParentKind::Job, attrs)?;
                let handle = core.jobs.insert(job);
                let accepts = core
                    .find_queue(&queue)
                    .and_then(|h| core.queues.get(h))
                    .map(|q| q.accepts_jobs())
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("queue '{queue}'"))))?;
                let to = if accepts { JobState::Queued } else { JobState::Held };
                if let Some(job) = core.jobs.get_mut(handle) {
                    job.transition(handle, to, core.accounting.as_ref());
                }
                Ok(id)
            })
            .await??;
        self.dispatch.metrics().job_submitted();
        Ok(Response::new(SubmitJobReply { job_id }))
    }

    async fn hold_job(&self, request: Request<HoldJobRequest>) -> Result<Response<Ack>, Status> {
        let HoldJobRequest { job_id, hold_type } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                let job = core.jobs.get_mut(handle).expect("handle just resolved");
                job.extra
                    .decode_one(
                        job_registry(),
                        AttrParentKind::Job,
                        "Hold_Types",
                        None,
                        &hold_type,
                        pbs_core::attribute::SetOp::Set,
                    )
                    .map_err(Status::from)?;
                if !matches!(job.state, JobState::Finished | JobState::Moved) {
                    job.transition(handle, JobState::Held, core.accounting.as_ref());
                }
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn release_job(
        &self,
        request: Request<ReleaseJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let ReleaseJobRequest { job_id, .. } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                let queue_accepts = core
                    .find_queue(&core.jobs.get(handle).expect("handle just resolved").queue.clone())
                    .and_then(|h| core.queues.get(h))
                    .map(|q| q.accepts_jobs())
                    .unwrap_or(false);
                let job = core.jobs.get_mut(handle).expect("handle just resolved");
                if job.state != JobState::Held {
                    return Err(Status::from(CoreError::bad_state(format!(
                        "job '{}' is not held",
                        job.id
                    ))));
                }
                let to = if queue_accepts { JobState::Queued } else { JobState::Waiting };
                job.transition(handle, to, core.accounting.as_ref());
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn signal_job(
        &self,
        request: Request<SignalJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let SignalJobRequest { job_id, .. } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                let job = core.jobs.get(handle).expect("handle just resolved");
                if !matches!(job.state, JobState::Running | JobState::Suspended | JobState::UserSuspended) {
                    return Err(Status::from(CoreError::bad_state(format!(
                        "job '{job_id}' is not running"
                    ))));
                }
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn modify_job(
        &self,
        request: Request<ModifyJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let ModifyJobRequest { job_id, attrs } = request.into_inner();
        let attrs = wire_attrs(attrs);
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                let job = core.jobs.get_mut(handle).expect("handle just resolved");
                apply_attr_list(&mut job.extra, job_registry(), AttrParentKind::Job, attrs)
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn delete_job(
        &self,
        request: Request<DeleteJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let DeleteJobRequest { job_id, force } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                if !force {
                    let job = core.jobs.get(handle).expect("handle just resolved");
                    if matches!(job.state, JobState::Running | JobState::Exiting) {
                        return Err(Status::from(CoreError::bad_state(format!(
                            "job '{job_id}' is running; use force to delete"
                        ))));
                    }
                }
                core.jobs.remove(handle);
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    /// Begin the rerun path locally, then relay the kill/discard signal
    /// to the job's mother superior. A relay failure rolls the substate
    /// back rather than leaving the job stuck mid-rerun with nothing
    /// actually asked of Mom (spec.md §5: re-check preconditions after a
    /// suspension rather than assume the pre-suspension intent held).
    async fn rerun_job(
        &self,
        request: Request<RerunJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let RerunJobRequest { job_id, force } = request.into_inner();
        let job_id_for_mom = job_id.clone();
        let mom_endpoint = self
            .reactor
            .submit(move |core| -> Result<Option<(String, u16)>, Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                let accounting = core.accounting.clone();
                let job = core.jobs.get_mut(handle).expect("handle just resolved");
                job.rerun(handle, force, accounting.as_ref()).map_err(Status::from)?;
                let exec_vnode = match job.extra.get(
                    job_registry().index_of("exec_vnode").expect("exec_vnode is registered"),
                ).value() {
                    Some(pbs_core::attribute::AttrValue::Str(s)) if !s.is_empty() => s.clone(),
                    _ => return Ok(None),
                };
                match execvnode::resolve_mother_superior(core, &exec_vnode) {
                    Ok(endpoint) => Ok(Some(endpoint)),
                    Err(_) => Ok(None),
                }
            })
            .await??;

        let Some((mom_host, mom_port)) = mom_endpoint else {
            // No resolvable mother superior (job never ran, or its vnode
            // assignment no longer exists): the local substate flip is
            // all there is to relay.
            return Ok(Response::new(Ack {}));
        };

        let relay = self.dispatch.relay_rerun(&mom_host, mom_port, &job_id_for_mom, force).await;
        match relay {
            Ok(_accepted) => {
                self.reactor
                    .submit(move |core| -> Result<(), Status> {
                        let handle = core
                            .find_job(&job_id_for_mom)
                            .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id_for_mom}'"))))?;
                        if force {
                            // A force-rerun gives up on the Mom entirely, so
                            // the resources it debited on run never get a
                            // matching obit; release them here instead.
                            let exec_vnode = job_exec_vnode(core, handle);
                            if let Some(exec_vnode) = &exec_vnode {
                                let _ = execvnode::apply(core, exec_vnode, SetOp::Decr);
                            }
                            let job = core.jobs.get_mut(handle).expect("handle just resolved");
                            let accounting = core.accounting.clone();
                            job.rerun_complete(handle, accounting.as_ref()).map_err(Status::from)?;
                            if let Some(exec_vnode) = exec_vnode {
                                core.peers.queue_incremental(job_id_for_mom.clone(), pbs_core::peer::ResourceOp::Decr, exec_vnode);
                            }
                        } else {
                            let job = core.jobs.get_mut(handle).expect("handle just resolved");
                            job.rerun_ack_kill().map_err(Status::from)?;
                            // Give the Mom's epilogue/copy-back a bounded
                            // window; if it never completes the watchdog
                            // clears the substate rather than blocking the
                            // job in Rerun1 forever.
                            let deadline = std::time::Instant::now() + core.config.job_requeue_timeout;
                            let watchdog_job_id = job_id_for_mom.clone();
                            core.work.schedule_at(
                                deadline,
                                Box::new(move |core| {
                                    if let Some(handle) = core.find_job(&watchdog_job_id) {
                                        let accounting = core.accounting.clone();
                                        if let Some(job) = core.jobs.get_mut(handle) {
                                            if job.rerun_watchdog_fire(handle, accounting.as_ref()) {
                                                tracing::warn!(job = %watchdog_job_id, "rerun watchdog fired, abandoning wait on mom");
                                            }
                                        }
                                    }
                                }),
                            );
                        }
                        Ok(())
                    })
                    .await??;
                Ok(Response::new(Ack {}))
            }
            Err(err) => {
                self.reactor
                    .submit(move |core| {
                        if let Some(handle) = core.find_job(&job_id_for_mom) {
                            if let Some(job) = core.jobs.get_mut(handle) {
                                job.substate = pbs_core::job::Substate::None;
                            }
                        }
                    })
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Apply the new exec_vnode's resource debit, relay the dispatch to
    /// the mother superior, and only mark the job Running once Mom has
    /// accepted it. A rejection rolls the resource debit back so the
    /// scheduler sees the vnode free again rather than leaked.
    async fn run_job(&self, request: Request<RunJobRequest>) -> Result<Response<Ack>, Status> {
        let RunJobRequest { job_id, execvnode: exec_vnode } = request.into_inner();

        if exec_vnode.is_empty() {
            self.reactor
                .submit(move |core| -> Result<(), Status> {
                    let handle = core
                        .find_job(&job_id)
                        .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                    let job = core.jobs.get_mut(handle).expect("handle just resolved");
                    job.transition(handle, JobState::Running, core.accounting.as_ref());
                    Ok(())
                })
                .await??;
            self.dispatch.metrics().job_dispatched();
            return Ok(Response::new(Ack {}));
        }

        let job_id_for_mom = job_id.clone();
        let exec_vnode_for_mom = exec_vnode.clone();
        let mom_endpoint = self
            .reactor
            .submit(move |core| -> Result<(String, u16), Status> {
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                execvnode::apply(core, &exec_vnode, SetOp::Incr).map_err(Status::from)?;
                let job = core.jobs.get_mut(handle).expect("handle just resolved");
                job.extra
                    .decode_one(job_registry(), AttrParentKind::Job, "exec_vnode", None, &exec_vnode, SetOp::Set)
                    .map_err(Status::from)?;
                execvnode::resolve_mother_superior(core, &exec_vnode).map_err(Status::from)
            })
            .await??;

        let (mom_host, mom_port) = mom_endpoint;
        let relay = self.dispatch.relay_run(&mom_host, mom_port, &job_id_for_mom, &exec_vnode_for_mom).await;
        match relay {
            Ok(true) => {
                self.reactor
                    .submit(move |core| -> Result<(), Status> {
                        let handle = core
                            .find_job(&job_id_for_mom)
                            .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id_for_mom}'"))))?;
                        let job = core.jobs.get_mut(handle).expect("handle just resolved");
                        job.transition(handle, JobState::Running, core.accounting.as_ref());
                        core.peers.queue_incremental(
                            job_id_for_mom.clone(),
                            pbs_core::peer::ResourceOp::Incr,
                            exec_vnode_for_mom.clone(),
                        );
                        Ok(())
                    })
                    .await??;
                self.dispatch.metrics().job_dispatched();
                Ok(Response::new(Ack {}))
            }
            Ok(false) => {
                self.reactor
                    .submit(move |core| {
                        let _ = execvnode::apply(core, &exec_vnode_for_mom, SetOp::Decr);
                    })
                    .await?;
                Err(Status::unavailable(format!(
                    "mom at {mom_host}:{mom_port} rejected run dispatch for job '{job_id_for_mom}'"
                )))
            }
            Err(err) => {
                self.reactor
                    .submit(move |core| {
                        let _ = execvnode::apply(core, &exec_vnode_for_mom, SetOp::Decr);
                    })
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn order_jobs(
        &self,
        request: Request<OrderJobsRequest>,
    ) -> Result<Response<Ack>, Status> {
        let OrderJobsRequest { job_id_a, job_id_b } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let a = core
                    .find_job(&job_id_a)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id_a}'"))))?;
                let b = core
                    .find_job(&job_id_b)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id_b}'"))))?;
                let idx = job_registry().index_of("Priority").expect("defined in job_registry");
                let prio_a = core.jobs.get(a).and_then(|j| j.extra.get(idx).value().cloned());
                let prio_b = core.jobs.get(b).and_then(|j| j.extra.get(idx).value().cloned());
                if let (Some(va), Some(vb)) = (prio_a, prio_b) {
                    if let Some(job) = core.jobs.get_mut(a) {
                        job.extra
                            .get_mut(idx)
                            .set_slim(vb, pbs_core::attribute::SetOp::Set)
                            .map_err(Status::from)?;
                    }
                    if let Some(job) = core.jobs.get_mut(b) {
                        job.extra
                            .get_mut(idx)
                            .set_slim(va, pbs_core::attribute::SetOp::Set)
                            .map_err(Status::from)?;
                    }
                }
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn move_job(&self, request: Request<MoveJobRequest>) -> Result<Response<Ack>, Status> {
        let MoveJobRequest { job_id, destination_queue } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                core.find_queue(&destination_queue)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("queue '{destination_queue}'"))))?;
                let handle = core
                    .find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                let job = core.jobs.get_mut(handle).expect("handle just resolved");
                if matches!(job.state, JobState::Running | JobState::Exiting) {
                    return Err(Status::from(CoreError::bad_state(format!(
                        "job '{job_id}' is running and cannot be moved"
                    ))));
                }
                job.queue = destination_queue;
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn message_job(
        &self,
        request: Request<MessageJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let MessageJobRequest { job_id, text } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                core.find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                tracing::info!(job = %job_id, message = %text, "message delivered to job");
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn track_job(
        &self,
        request: Request<TrackJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let TrackJobRequest { job_id } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                core.find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn stage_job(
        &self,
        request: Request<StageJobRequest>,
    ) -> Result<Response<Ack>, Status> {
        let StageJobRequest { job_id } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                core.find_job(&job_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("job '{job_id}'"))))?;
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn stat_job(
        &self,
        request: Request<StatJobRequest>,
    ) -> Result<Response<StatJobReply>, Status> {
        let StatJobRequest { job_id } = request.into_inner();
        let jobs = self
            .reactor
            .submit(move |core| {
                let selected: Vec<pbs_core::ids::Handle<Job>> = if job_id.is_empty() {
                    core.jobs.iter().map(|(h, _)| h).collect()
                } else {
                    core.find_job(&job_id).into_iter().collect()
                };
                selected
                    .into_iter()
                    .filter_map(|h| core.jobs.get_mut(h).map(|j| {
                        let state = j.state.to_string();
                        let attrs = encode_attr_list(&mut j.extra, job_registry(), Privilege::Manager)
                            .into_iter()
                            .map(|(name, resource, value, op)| Svrattrl {
                                name,
                                resource,
                                value,
                                op: op.to_owned(),
                            })
                            .collect();
                        JobStatus { job_id: j.id.clone(), state, attrs: Some(AttrList { attrs }) }
                    }))
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(Response::new(StatJobReply { jobs }))
    }

    async fn select_job(
        &self,
        request: Request<SelectJobRequest>,
    ) -> Result<Response<SelectJobReply>, Status> {
        let SelectJobRequest { criteria } = request.into_inner();
        let criteria = wire_attrs(criteria);
        let queue_filter = criteria
            .iter()
            .find(|a| a.name == "queue")
            .map(|a| a.value.clone());
        let job_ids = self
            .reactor
            .submit(move |core| {
                core.jobs
                    .iter()
                    .filter(|(_, j)| queue_filter.as_ref().map(|q| &j.queue == q).unwrap_or(true))
                    .map(|(_, j)| j.id.clone())
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(Response::new(SelectJobReply { job_ids }))
    }

    async fn stat_node(
        &self,
        request: Request<StatNodeRequest>,
    ) -> Result<Response<StatNodeReply>, Status> {
        let StatNodeRequest { name } = request.into_inner();
        let nodes = self
            .reactor
            .submit(move |core| {
                let selected: Vec<pbs_core::ids::Handle<pbs_core::node::Node>> = if name.is_empty() {
                    core.nodes.iter().map(|(h, _)| h).collect()
                } else {
                    core.find_node(&name).into_iter().collect()
                };
                selected
                    .into_iter()
                    .filter_map(|h| core.nodes.get_mut(h).map(|n| {
                        let state = format!("{:?}", n.state);
                        let attrs = encode_attr_list(&mut n.extra, node_registry(), Privilege::Manager)
                            .into_iter()
                            .map(|(name, resource, value, op)| Svrattrl { name, resource, value, op: op.to_owned() })
                            .collect();
                        NodeStatus { name: n.name.clone(), state, attrs: Some(AttrList { attrs }) }
                    }))
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(Response::new(StatNodeReply { nodes }))
    }

    async fn stat_queue(
        &self,
        request: Request<StatQueueRequest>,
    ) -> Result<Response<StatQueueReply>, Status> {
        let StatQueueRequest { name } = request.into_inner();
        let queues = self
            .reactor
            .submit(move |core| {
                let selected: Vec<pbs_core::ids::Handle<Queue>> = if name.is_empty() {
                    core.queues.iter().map(|(h, _)| h).collect()
                } else {
                    core.find_queue(&name).into_iter().collect()
                };
                selected
                    .into_iter()
                    .filter_map(|h| core.queues.get_mut(h).map(|q| {
                        let attrs = encode_attr_list(&mut q.extra, queue_registry(), Privilege::Manager)
                            .into_iter()
                            .map(|(name, resource, value, op)| Svrattrl { name, resource, value, op: op.to_owned() })
                            .collect();
                        QueueStatus { name: q.name.clone(), attrs: Some(AttrList { attrs }) }
                    }))
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(Response::new(StatQueueReply { queues }))
    }

    async fn stat_server(
        &self,
        _request: Request<StatServerRequest>,
    ) -> Result<Response<StatServerReply>, Status> {
        let reply = self
            .reactor
            .submit(|core| {
                let name = core.identity.name.clone();
                let attrs = encode_attr_list(
                    &mut core.identity.extra,
                    pbs_core::core_ctx::server_registry(),
                    Privilege::Manager,
                )
                .into_iter()
                .map(|(name, resource, value, op)| Svrattrl { name, resource, value, op: op.to_owned() })
                .collect();
                StatServerReply { name, attrs: Some(AttrList { attrs }) }
            })
            .await?;
        Ok(Response::new(reply))
    }

    async fn connect(&self, request: Request<ConnectRequest>) -> Result<Response<Ack>, Status> {
        let ConnectRequest { client_name } = request.into_inner();
        tracing::debug!(client = %client_name, "client connected");
        Ok(Response::new(Ack {}))
    }

    async fn disconnect(
        &self,
        request: Request<DisconnectRequest>,
    ) -> Result<Response<Ack>, Status> {
        let DisconnectRequest { client_name } = request.into_inner();
        tracing::debug!(client = %client_name, "client disconnected");
        Ok(Response::new(Ack {}))
    }

    async fn submit_reservation(
        &self,
        request: Request<SubmitReservationRequest>,
    ) -> Result<Response<SubmitReservationReply>, Status> {
        let SubmitReservationRequest { attrs } = request.into_inner();
        let attrs = wire_attrs(attrs);
        let resv_id = self
            .reactor
            .submit(move |core| -> Result<String, Status> {
                let id = core.next_resv_id();
                let now = SystemTime::now();
                let mut resv = Reservation::new(id.clone(), String::new(), now, Duration::from_secs(3600), now + Duration::from_secs(600));
                apply_attr_list(&mut resv.extra, reservation_registry(), AttrParentKind::Reservation, attrs)?;
                core.reservations.insert(resv);
                Ok(id)
            })
            .await??;
        Ok(Response::new(SubmitReservationReply { resv_id }))
    }

    async fn delete_reservation(
        &self,
        request: Request<DeleteReservationRequest>,
    ) -> Result<Response<Ack>, Status> {
        let DeleteReservationRequest { resv_id } = request.into_inner();
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_reservation(&resv_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("reservation '{resv_id}'"))))?;
                core.reservations.remove(handle);
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn modify_reservation(
        &self,
        request: Request<ModifyReservationRequest>,
    ) -> Result<Response<Ack>, Status> {
        let ModifyReservationRequest { resv_id, attrs } = request.into_inner();
        let attrs = wire_attrs(attrs);
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                let handle = core
                    .find_reservation(&resv_id)
                    .ok_or_else(|| Status::from(CoreError::not_found(format!("reservation '{resv_id}'"))))?;
                let resv = core.reservations.get_mut(handle).expect("handle just resolved");
                resv.begin_alter(resv.start, resv.duration).map_err(Status::from)?;
                match apply_attr_list(&mut resv.extra, reservation_registry(), AttrParentKind::Reservation, attrs) {
                    Ok(()) => {
                        resv.commit_alter();
                        Ok(())
                    }
                    Err(status) => {
                        let _ = resv.revert_alter();
                        Err(status)
                    }
                }
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn manager(&self, request: Request<ManagerRequest>) -> Result<Response<Ack>, Status> {
        let ManagerRequest { command, object_type, object_name, attrs } = request.into_inner();
        let attrs = wire_attrs(attrs);
        self.reactor
            .submit(move |core| -> Result<(), Status> {
                match (object_type.as_str(), command.as_str()) {
                    ("queue", "create") => {
                        let mut q = Queue::new(object_name, QueueType::Execution);
                        apply_attr_list(&mut q.extra, queue_registry(), AttrParentKind::Queue, attrs)?;
                        core.queues.insert(q);
                    }
                    ("queue", "delete") => {
                        if let Some(h) = core.find_queue(&object_name) {
                            core.queues.remove(h);
                        }
                    }
                    ("queue", "set" | "unset") => {
                        let handle = core
                            .find_queue(&object_name)
                            .ok_or_else(|| Status::from(CoreError::not_found(format!("queue '{object_name}'"))))?;
                        let q = core.queues.get_mut(handle).expect("handle just resolved");
                        apply_attr_list(&mut q.extra, queue_registry(), AttrParentKind::Queue, attrs)?;
                    }
                    ("queue", "active") => {
                        let handle = core
                            .find_queue(&object_name)
                            .ok_or_else(|| Status::from(CoreError::not_found(format!("queue '{object_name}'"))))?;
                        let q = core.queues.get_mut(handle).expect("handle just resolved");
                        q.state = pbs_core::queue::QueueState::Started;
                        q.enabled = true;
                    }
                    ("server", "set" | "unset") => {
                        apply_attr_list(
                            &mut core.identity.extra,
                            pbs_core::core_ctx::server_registry(),
                            AttrParentKind::Server,
                            attrs,
                        )?;
                    }
                    ("sched", _) => {
                        core.schedulers.get_or_create(&object_name);
                    }
                    ("node", "create") => {
                        let mom = core.moms.insert(pbs_core::node::mom::MomRecord::new(object_name.clone(), 15002));
                        let mut node = pbs_core::node::initialize_pbsnode(
                            object_name,
                            mom,
                            pbs_core::node::NodeType::Cluster,
                            pbs_core::node::PoolRole::InventoryReporter,
                        );
                        apply_attr_list(&mut node.extra, node_registry(), AttrParentKind::Node, attrs)?;
                        core.nodes.insert(node);
                    }
                    ("node", "delete") => {
                        if let Some(h) = core.find_node(&object_name) {
                            core.nodes.remove(h);
                        }
                    }
                    ("node", "set" | "unset") => {
                        let handle = core
                            .find_node(&object_name)
                            .ok_or_else(|| Status::from(CoreError::not_found(format!("node '{object_name}'"))))?;
                        let n = core.nodes.get_mut(handle).expect("handle just resolved");
                        apply_attr_list(&mut n.extra, node_registry(), AttrParentKind::Node, attrs)?;
                    }
                    (other_type, other_cmd) => {
                        return Err(Status::invalid_argument(format!(
                            "unsupported manager command '{other_cmd}' on '{other_type}'"
                        )))
                    }
                }
                Ok(())
            })
            .await??;
        Ok(Response::new(Ack {}))
    }

    async fn failover(
        &self,
        _request: Request<FailoverRequest>,
    ) -> Result<Response<FailoverReply>, Status> {
        let state = self.failover_lock.lock().state();
        let lock_state = match state {
            LockState::Primary => "primary",
            LockState::Secondary => "secondary",
            LockState::Stale => "stale",
        };
        Ok(Response::new(FailoverReply {
            lock_state: lock_state.to_owned(),
        }))
    }
}
