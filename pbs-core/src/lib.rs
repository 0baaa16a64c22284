//! Attribute runtime and entity/job/node/reservation state machines for
//! the batch server core.
//!
//! This crate has no network transport of its own: it is the single
//! `Core` context plus the state machines that operate on it, driven
//! entirely by the reactor task in `pbs-server`. See [`core_ctx::Core`]
//! for the aggregate context and [`worktask::WorkQueue`] for the
//! scheduling primitive that owns it.

pub mod accounting;
pub mod attribute;
pub mod config;
pub mod core_ctx;
pub mod error;
pub mod ids;
pub mod job;
pub mod node;
pub mod peer;
pub mod persistence;
pub mod queue;
pub mod reservation;
pub mod scheduler;
pub mod store;
pub mod worktask;

pub use error::{CoreError, Result};
