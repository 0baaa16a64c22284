//! Outbound connections to the things this Server drives: Scheduler
//! processes (one primary-stream client per partition), peer Servers
//! (one client per federation member), and Mom execution hosts (one
//! control-channel client per mother superior actually dispatched to).
//! Grounded in the teacher's `scheduler_server/grpc.rs` pattern of a
//! per-destination `tonic` client cached in a concurrent map rather than
//! redialed per call.
//!
//! `pbs-core` never performs I/O (spec.md §5: every suspension point is
//! explicit and owned by the reactor's caller, not by `Core` itself), so
//! the decision of *what* to send lives behind [`crate::ReactorHandle`]
//! and the connection management plus the actual RPCs live here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tonic::transport::Channel;

use pbs_core::job::JobState;
use pbs_core::scheduler::SchedCommand;
use pbs_core::CoreError;
use pbs_mom_proto::MomClient;

use crate::grpc::peer_proto::peer_grpc_client::PeerGrpcClient;
use crate::grpc::peer_proto::{Hello, ResourceDelta, ResourceUpdate, UpdateOp};
use crate::grpc::scheduler_proto::scheduler_primary_client::SchedulerPrimaryClient;
use crate::grpc::scheduler_proto::{CommandCode, ScheduleCommand};
use crate::metrics::ServerMetricsCollector;
use crate::reactor::ReactorHandle;
use crate::ServerError;

fn command_code(cmd: &SchedCommand) -> (CommandCode, String) {
    match cmd {
        SchedCommand::FirstTime => (CommandCode::ScheduleFirst, String::new()),
        SchedCommand::Normal => (CommandCode::ScheduleNormal, String::new()),
        SchedCommand::AJob(job_id) => (CommandCode::ScheduleAjob, job_id.clone()),
        SchedCommand::Configure => (CommandCode::ScheduleConfigure, String::new()),
        SchedCommand::Quit => (CommandCode::ScheduleQuit, String::new()),
    }
}

/// Connection caches plus the logic to dial lazily and retry on a
/// transport error instead of poisoning the cache forever. Held behind
/// an `Arc` and cloned into every background task and gRPC handler that
/// needs to talk outward; `Mutex`-guarded maps are fine here because the
/// hot path is one dial per destination, not a per-call lookup storm.
pub struct Dispatch {
    reactor: ReactorHandle,
    scheduler_clients: Mutex<HashMap<String, SchedulerPrimaryClient<Channel>>>,
    peer_clients: Mutex<HashMap<String, PeerGrpcClient<Channel>>>,
    mom_clients: Mutex<HashMap<String, MomClient>>,
    cycle_starts: Mutex<HashMap<String, Instant>>,
    metrics: Arc<dyn ServerMetricsCollector>,
    self_host: String,
    self_port: u16,
}

impl Dispatch {
    pub fn new(
        reactor: ReactorHandle,
        self_host: String,
        self_port: u16,
        metrics: Arc<dyn ServerMetricsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            scheduler_clients: Mutex::new(HashMap::new()),
            peer_clients: Mutex::new(HashMap::new()),
            mom_clients: Mutex::new(HashMap::new()),
            cycle_starts: Mutex::new(HashMap::new()),
            metrics,
            self_host,
            self_port,
        })
    }

    pub fn metrics(&self) -> &Arc<dyn ServerMetricsCollector> {
        &self.metrics
    }

    /// Dial (or reuse) the control-channel client for the Mom at
    /// `host:port`. Cached the same way `scheduler_clients`/`peer_clients`
    /// are: one connection per destination, re-dialed lazily on first use
    /// and evicted on a transport error rather than retried in place.
    async fn mom_client(&self, host: &str, port: u16) -> Result<MomClient, ServerError> {
        let key = format!("{host}:{port}");
        if let Some(client) = self.mom_clients.lock().get(&key) {
            return Ok(client.clone());
        }
        let endpoint = format!("http://{host}:{port}");
        let client = MomClient::connect(endpoint)
            .await
            .map_err(|e| ServerError::Core(CoreError::transient(e.to_string())))?;
        self.mom_clients.lock().insert(key, client.clone());
        Ok(client)
    }

    fn evict_mom_client(&self, host: &str, port: u16) {
        self.mom_clients.lock().remove(&format!("{host}:{port}"));
    }

    /// Relay a job dispatch to its mother superior. Called after the
    /// reactor has already applied the exec_vnode's resource debit and
    /// before the job is marked Running, so the caller can roll the
    /// debit back if the Mom rejects it (spec.md §5: a suspension point
    /// must leave the caller able to re-check and undo on failure).
    pub async fn relay_run(
        &self,
        mom_host: &str,
        mom_port: u16,
        job_id: &str,
        exec_vnode: &str,
    ) -> Result<bool, ServerError> {
        let mut client = self.mom_client(mom_host, mom_port).await?;
        client.run_job(job_id, exec_vnode).await.map_err(|err| {
            self.evict_mom_client(mom_host, mom_port);
            ServerError::Core(CoreError::transient(err.to_string()))
        })
    }

    /// Relay a (force-)rerun signal to the job's mother superior: a plain
    /// rerun asks Mom to kill the process tree (`SignalRerun`); a forced
    /// rerun tells Mom to drop tracking immediately (`Discard`).
    pub async fn relay_rerun(
        &self,
        mom_host: &str,
        mom_port: u16,
        job_id: &str,
        force: bool,
    ) -> Result<bool, ServerError> {
        let mut client = self.mom_client(mom_host, mom_port).await?;
        let result = if force {
            client.discard(job_id).await
        } else {
            client.signal_rerun(job_id).await
        };
        result.map_err(|err| {
            self.evict_mom_client(mom_host, mom_port);
            ServerError::Core(CoreError::transient(err.to_string()))
        })
    }

    /// Record (or replace) the dial-back endpoint a Scheduler registered
    /// for `partition` via `RegisterScheduler`, connecting immediately so
    /// a later `start_cycle` never pays connection setup latency.
    pub async fn register_scheduler_endpoint(
        &self,
        partition: &str,
        primary_endpoint: &str,
    ) -> Result<(), ServerError> {
        let client = SchedulerPrimaryClient::connect(primary_endpoint.to_owned())
            .await
            .map_err(ServerError::Transport)?;
        self.scheduler_clients
            .lock()
            .insert(partition.to_owned(), client);
        self.reactor
            .submit({
                let partition = partition.to_owned();
                move |core| {
                    core.schedulers.get_or_create(&partition);
                }
            })
            .await?;
        Ok(())
    }

    /// Attempt to start a cycle against `partition`'s Scheduler: pulls
    /// the next command (`SCH_SCHEDULE_FIRST`/`Normal`, piggybacking an
    /// unsent qrun if one is queued) from `Core`, then pushes it over
    /// the cached primary-stream client. A cycle already in progress is
    /// not an error here — `ScSched::begin_cycle` records the request as
    /// pending and it is retried from `notify_cycle_end`.
    pub async fn start_cycle(&self, partition: &str) -> Result<(), ServerError> {
        let partition_owned = partition.to_owned();
        let outcome = self
            .reactor
            .submit(move |core| {
                let cmd = core.schedulers.next_normal_command();
                core.schedulers
                    .get_or_create(&partition_owned)
                    .begin_cycle(cmd)
                    .map(|(cmd, piggyback)| {
                        let piggyback_id = piggyback.and_then(|h| core.jobs.get(h)).map(|j| j.id.clone());
                        (cmd, piggyback_id)
                    })
            })
            .await?;

        let (cmd, piggyback_id) = match outcome {
            Ok(v) => v,
            Err(e) if e.is_retryable() => return Ok(()), // deferred; cycle-end or reconnect will retry
            Err(e) => return Err(ServerError::Core(e)),
        };

        let cmd = if let Some(job_id) = piggyback_id {
            // A qrun was piggybacked onto this cycle start regardless of
            // the command kind chosen; spec.md §4.4 treats AJob as an
            // overlay on Normal/FirstTime, not a separate command slot.
            let _ = job_id;
            cmd
        } else {
            cmd
        };

        let (code, job_id) = command_code(&cmd);
        self.metrics.scheduler_cycle_started(partition);
        self.cycle_starts.lock().insert(partition.to_owned(), Instant::now());
        let mut clients = self.scheduler_clients.lock();
        let Some(client) = clients.get_mut(partition) else {
            tracing::warn!(partition, "no registered Scheduler endpoint for partition");
            return Ok(());
        };
        client
            .dispatch(ScheduleCommand {
                code: code as i32,
                job_id,
            })
            .await
            .map_err(|status| {
                tracing::warn!(partition, %status, "scheduler dispatch RPC failed");
                ServerError::Transport(tonic::transport::Error::from(
                    std::io::Error::new(std::io::ErrorKind::Other, status.to_string()),
                ))
            })
            .ok();
        Ok(())
    }

    /// Record a cycle's completion for [`ServerMetricsCollector`] and
    /// clear its start marker. Called from the `NotifyCycleEnd` handler,
    /// which owns the only path back out of an in-progress cycle.
    pub fn note_cycle_ended(&self, partition: &str) {
        let elapsed_ms = self
            .cycle_starts
            .lock()
            .remove(partition)
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.metrics.scheduler_cycle_ended(partition, elapsed_ms);
    }

    /// Dial (or reuse) the peer's `PeerGrpc` client and say hello,
    /// recording whether this is a fresh epoch — and therefore due a
    /// full resource-assignment resync — on the reactor.
    pub async fn hello_peer(&self, host: &str, port: u16) -> Result<(), ServerError> {
        let endpoint = format!("http://{host}:{port}");
        let mut client = PeerGrpcClient::connect(endpoint).await.map_err(ServerError::Transport)?;
        let epoch = now_epoch();
        let ack = client
            .say_hello(Hello {
                host: self.self_host.clone(),
                port: self.self_port as u32,
                epoch,
            })
            .await
            .map_err(|status| ServerError::Core(pbs_core::CoreError::transient(status.to_string())))?;
        if !ack.into_inner().accepted {
            return Err(ServerError::Core(pbs_core::CoreError::transient(format!(
                "peer {host}:{port} rejected hello"
            ))));
        }
        self.peer_clients.lock().insert(host.to_owned(), client);
        let host_owned = host.to_owned();
        let needs_full = self
            .reactor
            .submit(move |core| core.peers.note_hello(&host_owned, epoch))
            .await?;
        if needs_full {
            self.full_push(host).await?;
        }
        Ok(())
    }

    /// Flush every queued incremental resource update to every
    /// connected peer in one batch (the original's `mcast_resc_usage`
    /// coalescing, spec.md §4.5), skipping peers due a full resync —
    /// those get `PS_RSC_UPDATE_FULL` instead via [`Self::full_push`].
    pub async fn flush_incremental_updates(&self) -> Result<(), ServerError> {
        let pending = self.reactor.submit(|core| core.peers.drain_pending()).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let deltas: Vec<ResourceDelta> = pending
            .iter()
            .map(|p| ResourceDelta {
                job_id: p.job_id.clone(),
                op: match p.op {
                    pbs_core::peer::ResourceOp::Incr => UpdateOp::Incr as i32,
                    pbs_core::peer::ResourceOp::Decr => UpdateOp::Decr as i32,
                },
                execvnode: p.payload.clone(),
                share_job: false,
            })
            .collect();
        let seq = pending.last().map(|p| p.seq).unwrap_or(0);

        let targets: Vec<String> = self.peer_clients.lock().keys().cloned().collect();
        for host in targets {
            let update = ResourceUpdate {
                seq,
                deltas: deltas.clone(),
                full: false,
                sender_host: self.self_host.clone(),
            };
            let mut client = {
                let guard = self.peer_clients.lock();
                match guard.get(&host) {
                    Some(c) => c.clone(),
                    None => continue,
                }
            };
            if let Err(status) = client.push_resource_update(update).await {
                tracing::warn!(peer = %host, %status, "resource update push failed; peer presumed disconnected");
                self.peer_clients.lock().remove(&host);
                self.reactor
                    .submit(move |core| core.peers.mark_full_push(host.clone()))
                    .await?;
            } else {
                self.metrics.peer_update_sent(&host, deltas.len());
            }
        }
        Ok(())
    }

    /// Full resync to one peer: every locally-owned running job's
    /// execvnode assignment, as a single `PS_RSC_UPDATE_FULL` (spec.md
    /// §4.5 "replyhello_psvr"), telling the peer to discard any prior
    /// outstanding INCRs from this server first.
    pub async fn full_push(&self, host: &str) -> Result<(), ServerError> {
        let deltas = self
            .reactor
            .submit(|core| {
                core.jobs
                    .iter()
                    .filter(|(_, j)| j.state == JobState::Running)
                    .filter_map(|(_, j)| {
                        let idx = pbs_core::job::job_registry().index_of("exec_vnode")?;
                        match j.extra.get(idx).value() {
                            Some(pbs_core::attribute::AttrValue::Str(s)) if !s.is_empty() => {
                                Some(ResourceDelta {
                                    job_id: j.id.clone(),
                                    op: UpdateOp::Incr as i32,
                                    execvnode: s.clone(),
                                    share_job: false,
                                })
                            }
                            _ => None,
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        let mut client = {
            let guard = self.peer_clients.lock();
            match guard.get(host) {
                Some(c) => c.clone(),
                None => return Ok(()),
            }
        };
        let delta_count = deltas.len();
        client
            .push_resource_update(ResourceUpdate {
                seq: 0,
                deltas,
                full: true,
                sender_host: self.self_host.clone(),
            })
            .await
            .map_err(|status| ServerError::Core(pbs_core::CoreError::transient(status.to_string())))?;
        self.metrics.peer_update_sent(host, delta_count);
        Ok(())
    }
}

fn now_epoch() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
