//! The Server daemon: wires `pbs-core`'s single-threaded state machine
//! behind a reactor task, exposes it over the batch/scheduler/peer gRPC
//! surfaces, and talks out to MoMs via `pbs-mom-proto`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod execvnode;
pub mod grpc;
pub mod metrics;
pub mod reactor;

pub use error::ServerError;
pub use reactor::ReactorHandle;
