//! Server daemon configuration. `pbs-core::config::CoreConfig` covers the
//! state-machine tunables (failover staleness, alien cache refresh); this
//! adds the process-level surface (listen addresses, identity, log
//! target) the teacher's `SchedulerConfig` covers for `ballista-scheduler`.

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use pbs_core::config::CoreConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "pbs_server", about = "Batch workload manager server daemon")]
pub struct ServerArgs {
    /// Address the batch client gRPC service binds to.
    #[arg(long, default_value = "0.0.0.0:15001")]
    pub batch_listen: String,

    /// Address the Scheduler-facing (secondary) gRPC service binds to.
    #[arg(long, default_value = "0.0.0.0:15004")]
    pub scheduler_listen: String,

    /// Address the peer-server gRPC service binds to.
    #[arg(long, default_value = "0.0.0.0:15005")]
    pub peer_listen: String,

    /// This server's own name, as advertised to peers and Schedulers.
    #[arg(long, default_value = "pbs_server")]
    pub server_name: String,

    /// `host:port` of every peer Server in this federation.
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Path to a JSON config file overriding the defaults above and the
    /// `pbs-core` tunables below. CLI flags take precedence over the file.
    #[arg(long)]
    pub config_file: Option<String>,

    #[arg(long, default_value = "/var/spool/pbs/datastore/pbs_dblock")]
    pub failover_lock_path: String,

    #[arg(long, default_value = "30")]
    pub failover_staleness_secs: u64,

    /// How long a rerun waits for the Mom's kill acknowledgment before
    /// the watchdog gives up on it.
    #[arg(long, default_value = "300")]
    pub job_requeue_timeout_secs: u64,

    /// Total window after which a reservation that never confirms is
    /// deleted instead of retried again.
    #[arg(long, default_value = "600")]
    pub reserve_retry_cutoff_secs: u64,
}

/// The subset of configuration that round-trips through a config file,
/// separate from `ServerArgs` because `clap::Parser` derives don't mix
/// well with a free-floating `serde::Deserialize` impl on the same type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub batch_listen: String,
    pub scheduler_listen: String,
    pub peer_listen: String,
    pub server_name: String,
    pub peers: Vec<String>,
    pub core: CoreConfig,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            batch_listen: args.batch_listen,
            scheduler_listen: args.scheduler_listen,
            peer_listen: args.peer_listen,
            server_name: args.server_name,
            peers: args.peers,
            core: CoreConfig {
                failover_lock_path: args.failover_lock_path,
                failover_staleness_threshold: Duration::from_secs(args.failover_staleness_secs),
                job_requeue_timeout: Duration::from_secs(args.job_requeue_timeout_secs),
                reserve_retry_cutoff: Duration::from_secs(args.reserve_retry_cutoff_secs),
                ..CoreConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_round_trip_into_config() {
        let args = ServerArgs::parse_from(["pbs_server", "--server-name", "svr1"]);
        let cfg: ServerConfig = args.into();
        assert_eq!(cfg.server_name, "svr1");
        assert_eq!(cfg.batch_listen, "0.0.0.0:15001");
    }
}
