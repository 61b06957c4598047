//! Tactus Runtime.
//!
//! A deterministic reactor runtime: a fixed graph of reactors whose
//! reactions fire in response to tagged events, with outputs
//! propagating over statically known port connections. Logical time
//! advances in totally ordered (time, microstep) tags while a pool of
//! worker threads executes independent reactions in parallel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │               Runtime                 │
//! │  ┌───────────┐      ┌─────────────┐  │
//! │  │ event queue│ tag  │reaction queue│  │ ← one critical section
//! │  │ (by tag)  ├─────▶│(level, EDF) │  │
//! │  └───────────┘advance└──────┬──────┘  │
//! │        ▲                    │ dispatch │
//! │        │ schedule_*   ┌─────▼──────┐  │
//! │        └──────────────┤  workers   │  │ ← bodies run unlocked
//! │                       └────────────┘  │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Execution Model
//!
//! The scheduler repeatedly (a) pops every event at the next tag,
//! (b) converts each into reaction enqueues, (c) lets workers drain the
//! reaction queue in dependency-level order, and (d) advances the
//! logical clock. Reactions call the `schedule` family to insert future
//! events and set ports to trigger downstream reactions at the same
//! tag. Payloads ride reference-counted tokens so fan-out never copies.
//!
//! # Modules
//!
//! - [`tag`] - Logical time: [`Tag`], saturating tag arithmetic
//! - [`token`] - Reference-counted payload carriers and the recycling pool
//! - [`graph`] - The static reactor graph and its builder
//! - [`executor`] - The runtime, scheduling primitives, and worker pool
//! - [`clock`] - Physical clock seam
//! - [`federation`] - Adapter seam for coordinated execution
//! - [`trace`] - Binary execution tracing
//! - [`config`] - Runtime configuration
//! - [`error`] - Error types

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod federation;
pub mod graph;
pub mod tag;
pub mod token;
pub mod trace;

mod queue;

pub use clock::{ManualClock, MonotonicClock, PhysicalClock};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use event::EventHandle;
pub use executor::{
    AsyncScheduler, DropReason, ReactionContext, RunReport, Runtime, ScheduleResult,
};
pub use federation::{FederationAdapter, FederationError, NoFederation};
pub use graph::{
    GraphBuilder, PortId, ReactionId, ReactorGraph, ReactorId, SpacingPolicy, TriggerId,
    TriggerKind,
};
pub use tag::{Interval, Microstep, Tag, TimePoint};
pub use token::{CopyConstructor, Destructor, OkToFree, TokenId};
