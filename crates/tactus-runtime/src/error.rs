//! Runtime errors.
//!
//! Recoverable failures surface as [`Error`] values; dropped schedules
//! are *not* errors (see `ScheduleResult`). Invariant violations that
//! would make further execution nondeterministic (token refcount
//! underflow, a queue head behind the current tag) do not appear here:
//! they log and panic, because there is no deterministic state left to
//! return to.

use thiserror::Error;

use crate::graph::{PortId, ReactionId, TriggerId};

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or driving a reactor program.
#[derive(Debug, Error)]
pub enum Error {
    /// A trigger id that does not exist in the reactor graph.
    #[error("unknown trigger: {0}")]
    UnknownTrigger(TriggerId),

    /// A port id that does not exist in the reactor graph.
    #[error("unknown port: {0}")]
    UnknownPort(PortId),

    /// Schedule was called on a trigger that is not an action.
    ///
    /// Timers, startup, and shutdown are armed by the runtime itself;
    /// only logical and physical actions accept user schedules.
    #[error("trigger {0} is not a schedulable action")]
    NotAnAction(TriggerId),

    /// A logical action was scheduled from outside a reaction.
    ///
    /// Logical time only exists inside a reaction invocation. Scheduling
    /// a logical action asynchronously would stamp it against a tag no
    /// thread is holding, so the cross-thread handle rejects it.
    #[error("logical action {0} scheduled asynchronously; use a physical action")]
    AsyncLogicalSchedule(TriggerId),

    /// Payload length does not match the trigger's or port's element size.
    #[error("payload of {got} bytes does not fit element size {element_size} x length {length}")]
    PayloadSizeMismatch {
        /// Declared element size in bytes.
        element_size: usize,
        /// Requested element count.
        length: usize,
        /// Actual payload size in bytes.
        got: usize,
    },

    /// The reaction dependency graph contains a cycle.
    ///
    /// Levels cannot be assigned, so the graph is rejected at build
    /// time. Contains the reactions that could not be leveled.
    #[error("reaction dependency cycle involving {0:?}")]
    DependencyCycle(Vec<ReactionId>),

    /// The trace file could not be created or written.
    #[error("trace i/o failed: {0}")]
    TraceIo(#[from] std::io::Error),
}
