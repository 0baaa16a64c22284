//! The three gRPC surfaces this daemon exposes, one module per proto
//! file, matching the teacher's `scheduler_server/grpc.rs` +
//! `scheduler_server/mod.rs` convention of an `include!`d generated
//! module alongside a hand-written service impl.

#[allow(clippy::all)]
pub mod batch_proto {
    tonic::include_proto!("pbs.batch");
}

#[allow(clippy::all)]
pub mod scheduler_proto {
    tonic::include_proto!("pbs.scheduler");
}

#[allow(clippy::all)]
pub mod peer_proto {
    tonic::include_proto!("pbs.peer");
}

mod attrs;
pub mod batch;
pub mod peer;
pub mod scheduler;

pub use batch::BatchService;
pub use peer::PeerService;
pub use scheduler::SchedulerSecondaryService;
