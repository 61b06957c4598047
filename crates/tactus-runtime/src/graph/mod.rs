//! The static reactor graph.
//!
//! A reactor program is a fixed graph of reactors, reactions, triggers,
//! and ports, built once before execution and immutable afterwards. The
//! graph is an arena: it owns every descriptor, and the rest of the
//! runtime refers to them through copyable integer ids, so there are no
//! cyclic references and ownership is obvious.
//!
//! [`GraphBuilder`] stands in for a code generator: it wires the graph,
//! computes each reaction's dependency level (Kahn's algorithm; a cycle
//! is a build error), and assigns chain-id bitmasks used by the worker
//! scheduler to prove two reactions independent.

mod builder;
mod types;


pub use builder::GraphBuilder;
pub use types::{
    Port, PortId, ReactionFn, Reaction, ReactionId, Reactor, ReactorGraph, ReactorId,
    SpacingPolicy, Trigger, TriggerId, TriggerKind,
};
