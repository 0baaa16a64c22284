//! Thin client surface for the MoM execution daemon's opaque RPC
//! channel (spec.md section 4.3/4.4, section 1 "out of scope": MoM
//! process tracking, cpuset/topology enforcement, and signal delivery
//! all live on the other side of this boundary).
//!
//! This crate owns only the generated `tonic` client stub and a small
//! wrapper that turns connection/transport failures into the same
//! `thiserror`-derived shape the rest of the workspace uses, so
//! `pbs-server` never has to match on `tonic::transport::Error`
//! directly.

#[allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("pbs.mom");
}

use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

use proto::mom_control_client::MomControlClient;
use proto::{DiscardRequest, InventoryReport, RerunRequest, RunJobRequest};

#[derive(Error, Debug)]
pub enum MomClientError {
    #[error("could not connect to mom at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("mom rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}

/// A connected handle to one Mom's control surface. Cheap to clone:
/// `tonic::transport::Channel` multiplexes requests over one connection
/// internally, matching the original's one-TPP-stream-per-Mom model.
#[derive(Clone)]
pub struct MomClient {
    inner: MomControlClient<Channel>,
}

impl MomClient {
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, MomClientError> {
        let endpoint_str = endpoint.into();
        let channel = Endpoint::from_shared(endpoint_str.clone())
            .map_err(|source| MomClientError::Connect {
                endpoint: endpoint_str.clone(),
                source,
            })?
            .connect()
            .await
            .map_err(|source| MomClientError::Connect {
                endpoint: endpoint_str,
                source,
            })?;
        tracing::debug!(endpoint = %endpoint_str, "connected to mom control channel");
        Ok(Self {
            inner: MomControlClient::new(channel),
        })
    }

    /// Relay a job dispatch to this Mom, acting as the job's mother
    /// superior. The returned `bool` is whether MoM accepted the job.
    pub async fn run_job(&mut self, job_id: &str, exec_vnode: &str) -> Result<bool, MomClientError> {
        let resp = self
            .inner
            .run_job(RunJobRequest {
                job_id: job_id.to_owned(),
                exec_vnode: exec_vnode.to_owned(),
            })
            .await?;
        Ok(resp.into_inner().accepted)
    }

    /// Deliver `SIG_RERUN` to the named job's process tree. The
    /// returned `bool` is whether MoM accepted and is acting on the
    /// signal, not whether the kill has completed.
    pub async fn signal_rerun(&mut self, job_id: &str) -> Result<bool, MomClientError> {
        let resp = self
            .inner
            .signal_rerun(RerunRequest {
                job_id: job_id.to_owned(),
            })
            .await?;
        Ok(resp.into_inner().accepted)
    }

    /// Force-rerun path: tell MoM to drop its tracking of `job_id`
    /// immediately rather than waiting for the normal kill/epilogue
    /// sequence.
    pub async fn discard(&mut self, job_id: &str) -> Result<bool, MomClientError> {
        let resp = self
            .inner
            .discard(DiscardRequest {
                job_id: job_id.to_owned(),
            })
            .await?;
        Ok(resp.into_inner().done)
    }

    pub async fn report_inventory(
        &mut self,
        vnode_name: &str,
        topology: &str,
    ) -> Result<bool, MomClientError> {
        let resp = self
            .inner
            .report_inventory(InventoryReport {
                vnode_name: vnode_name.to_owned(),
                topology: topology.to_owned(),
            })
            .await?;
        Ok(resp.into_inner().accepted)
    }
}
