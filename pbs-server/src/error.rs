//! The single point where `pbs-core`'s closed error taxonomy becomes a
//! `tonic::Status`, per SPEC_FULL section 7: every `grpc/*.rs` handler
//! maps through `?` rather than hand-rolling `Status::internal` at each
//! call site the way the teacher's `scheduler_server/grpc.rs` does.

use pbs_core::CoreError;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("reactor channel closed")]
    ReactorGone,

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

impl From<CoreError> for tonic::Status {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(e) => tonic::Status::invalid_argument(e.to_string()),
            CoreError::BadState { reason } => tonic::Status::failed_precondition(reason),
            CoreError::Transient { reason } => tonic::Status::unavailable(reason),
            CoreError::Internal { reason } => tonic::Status::internal(reason),
            CoreError::Protocol { reason } => tonic::Status::invalid_argument(reason),
            CoreError::NotFound { what } => tonic::Status::not_found(what),
        }
    }
}

impl From<ServerError> for tonic::Status {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Core(e) => e.into(),
            ServerError::ReactorGone => {
                tonic::Status::unavailable("server reactor is not running")
            }
            ServerError::Transport(e) => tonic::Status::unavailable(e.to_string()),
        }
    }
}
