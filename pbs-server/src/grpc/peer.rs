//! The peer-to-peer resource propagation surface (spec.md §4.5): each
//! Server both hosts and dials this service. `SayHello` is the
//! connection handshake; `PushResourceUpdate` is the incremental/full
//! resource resync stream; `StatNodes` answers a peer's alien-node cache
//! refresh.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::dispatch::Dispatch;
use crate::grpc::peer_proto::peer_grpc_server::PeerGrpc;
use crate::grpc::peer_proto::{
    Hello, HelloAck, NodeSnapshot, ResourceUpdate, ResourceUpdateAck, StatReply, StatRequest, UpdateOp,
};
use crate::reactor::ReactorHandle;

pub struct PeerService {
    reactor: ReactorHandle,
    dispatch: Arc<Dispatch>,
}

impl PeerService {
    pub fn new(reactor: ReactorHandle, dispatch: Arc<Dispatch>) -> Self {
        Self { reactor, dispatch }
    }
}

#[tonic::async_trait]
impl PeerGrpc for PeerService {
    /// Record the inbound hello against our own peer ledger, then dial
    /// the sender back so the connection is bidirectional -- our own
    /// epoch bookkeeping and any full-push-on-reconnect we owe them rides
    /// on that outbound `hello_peer` call, not on this inbound one.
    async fn say_hello(&self, request: Request<Hello>) -> Result<Response<HelloAck>, Status> {
        let Hello { host, port, epoch } = request.into_inner();
        let host_for_table = host.clone();
        self.reactor
            .submit(move |core| {
                if core.peer_servers.find_by_name(&host_for_table).is_none() {
                    core.peer_servers.insert(pbs_core::node::mom::PeerServerRecord::new(
                        host_for_table,
                        port as u16,
                    ));
                }
            })
            .await?;

        let dispatch = Arc::clone(&self.dispatch);
        let port = port as u16;
        tokio::spawn(async move {
            if let Err(err) = dispatch.hello_peer(&host, port).await {
                tracing::debug!(peer = %host, %err, "reciprocal hello to peer failed");
            }
        });

        tracing::debug!(epoch, "accepted hello from peer server");
        Ok(Response::new(HelloAck { accepted: true }))
    }

    /// Apply an inbound resource-update batch, keyed by `sender_host` to
    /// this peer's own [`pbs_core::node::mom::PeerServerRecord`] ledger: a
    /// duplicate INCR for a jobid already outstanding from that sender is
    /// a protocol error and is dropped with a warning rather than applied
    /// twice. `full` discards the sender's prior ledger first, since a
    /// full resync supersedes whatever incremental state came before it.
    async fn push_resource_update(
        &self,
        request: Request<ResourceUpdate>,
    ) -> Result<Response<ResourceUpdateAck>, Status> {
        let ResourceUpdate { seq, deltas, full, sender_host } = request.into_inner();
        if full {
            tracing::info!(seq, deltas = deltas.len(), peer = %sender_host, "received full peer resource resync");
        } else {
            tracing::debug!(seq, deltas = deltas.len(), peer = %sender_host, "received incremental peer resource update");
        }
        self.reactor
            .submit(move |core| {
                let Some(handle) = core.peer_servers.find_by_name(&sender_host) else {
                    tracing::warn!(peer = %sender_host, "resource update from an unknown peer, accepting without dedup");
                    return;
                };
                let peer = core.peer_servers.get_mut(handle).expect("handle just resolved");
                if full {
                    peer.reset_incoming_incr();
                }
                for delta in &deltas {
                    match delta.op {
                        x if x == UpdateOp::Incr as i32 => {
                            if !peer.accept_incoming_incr(delta.job_id.clone()) {
                                tracing::warn!(
                                    peer = %sender_host,
                                    job = %delta.job_id,
                                    "dropping duplicate INCR for jobid already outstanding from this peer"
                                );
                                continue;
                            }
                        }
                        x if x == UpdateOp::Decr as i32 => {
                            peer.accept_incoming_decr(&delta.job_id);
                        }
                        _ => {}
                    }
                    tracing::trace!(
                        job = %delta.job_id,
                        execvnode = %delta.execvnode,
                        op = delta.op,
                        "peer resource delta"
                    );
                }
            })
            .await?;
        Ok(Response::new(ResourceUpdateAck { seq }))
    }

    async fn stat_nodes(&self, _request: Request<StatRequest>) -> Result<Response<StatReply>, Status> {
        let nodes = self
            .reactor
            .submit(|core| {
                core.nodes
                    .iter()
                    .map(|(_, n)| NodeSnapshot {
                        name: n.name.clone(),
                        state: format!("{:?}", n.state),
                        resource_lines: n
                            .resources_available
                            .encode_to_string()
                            .split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_owned)
                            .collect(),
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(Response::new(StatReply { nodes }))
    }
}
