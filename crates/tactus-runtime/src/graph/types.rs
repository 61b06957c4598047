//! Graph descriptor types and ids.

use std::any::Any;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::executor::ReactionContext;
use crate::tag::Interval;
use crate::token::{CopyConstructor, Destructor};

/// Identifier of a reactor in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReactorId(pub(crate) u32);

/// Identifier of a reaction in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReactionId(pub(crate) u32);

/// Identifier of a trigger in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TriggerId(pub(crate) u32);

/// Identifier of a port in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(pub(crate) u32);

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactor#{}", self.0)
    }
}
impl fmt::Display for ReactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reaction#{}", self.0)
    }
}
impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trigger#{}", self.0)
    }
}
impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// What kind of schedulable source a trigger describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Scheduled from within a reaction; stamped with logical time.
    LogicalAction,
    /// Schedulable from any thread; stamped with physical time.
    PhysicalAction,
    /// Fires periodically, re-armed by the runtime.
    Timer {
        /// Delay of the first firing after start.
        offset: Interval,
        /// Firing period; zero means fire once.
        period: Interval,
    },
    /// Fires exactly once at the start tag.
    Startup,
    /// Fires exactly once at the stop tag.
    Shutdown,
}

impl TriggerKind {
    /// Whether user code may schedule this trigger.
    pub fn is_action(&self) -> bool {
        matches!(self, TriggerKind::LogicalAction | TriggerKind::PhysicalAction)
    }

    /// Whether events on this trigger are stamped with physical time.
    pub fn is_physical(&self) -> bool {
        matches!(self, TriggerKind::PhysicalAction)
    }
}

/// What to do when a schedule violates an action's minimum spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpacingPolicy {
    /// Discard the new event; the schedule call reports a drop.
    #[default]
    Drop,
    /// Move the new event out to the earliest admissible tag.
    Defer,
    /// Replace the already-queued event with the new one.
    Replace,
}

/// A schedulable source: action, timer, startup, or shutdown.
///
/// Static description only; the per-run mutable part (last scheduled
/// tag, presence) lives in the scheduler state.
pub struct Trigger {
    pub id: TriggerId,
    pub name: String,
    pub kind: TriggerKind,
    /// Owning reactor.
    pub reactor: ReactorId,
    /// Minimum delay added to every schedule of this trigger.
    pub min_delay: Interval,
    /// Minimum inter-arrival time between successive events; zero
    /// disables spacing enforcement.
    pub min_spacing: Interval,
    pub policy: SpacingPolicy,
    /// Payload element size in bytes; zero for payload-free triggers.
    pub element_size: usize,
    /// Reactions enabled when this trigger fires.
    pub reactions: Vec<ReactionId>,
}

/// A reaction body. Runs outside the critical section with a context
/// for scheduling, port access, and deadline checks.
pub type ReactionFn = Box<dyn Fn(&mut ReactionContext<'_>) + Send + Sync>;

/// A statically known unit of work.
pub struct Reaction {
    pub id: ReactionId,
    pub name: String,
    /// Owning reactor; its state is available to the body.
    pub reactor: ReactorId,
    /// Topological depth in the dependency DAG; assigned at build.
    pub level: u32,
    /// Relative physical-time deadline for invocation, if any.
    pub deadline: Option<Interval>,
    /// One bit per dependency chain this reaction belongs to. Two
    /// reactions with disjoint masks are provably independent.
    pub chain_mask: u64,
    pub body: ReactionFn,
    /// Invoked by `check_deadline` when the deadline has passed.
    pub deadline_handler: Option<ReactionFn>,
}

/// An output (or input) port: same-tag data flow between reactions.
///
/// Static description; presence and the published token live in the
/// scheduler state and reset at every tag advance.
pub struct Port {
    pub id: PortId,
    pub name: String,
    pub reactor: ReactorId,
    /// Payload element size in bytes.
    pub element_size: usize,
    /// Fan-out: number of downstream readers, fixed at build.
    pub num_destinations: usize,
    /// Reactions enabled (at the current tag) when this port is set.
    pub downstream: Vec<ReactionId>,
    /// Default destructor applied to tokens published here.
    pub destructor: Option<Destructor>,
    /// Default copy constructor applied to tokens published here.
    pub copy_constructor: Option<CopyConstructor>,
}

/// A container of state and reactions.
pub struct Reactor {
    pub id: ReactorId,
    pub name: String,
    /// User state, downcast by reaction bodies. The mutex is never
    /// contended: reactions of one reactor are ordered by their levels.
    pub state: Mutex<Box<dyn Any + Send>>,
}

/// The immutable arena owning every descriptor of a reactor program.
pub struct ReactorGraph {
    pub(crate) reactors: Vec<Reactor>,
    pub(crate) reactions: Vec<Reaction>,
    pub(crate) triggers: Vec<Trigger>,
    pub(crate) ports: Vec<Port>,
    /// Singleton startup trigger, if any reaction asked for one.
    pub(crate) startup: Option<TriggerId>,
    /// Singleton shutdown trigger, if any reaction asked for one.
    pub(crate) shutdown: Option<TriggerId>,
    /// All timer triggers, armed by the runtime at start.
    pub(crate) timers: Vec<TriggerId>,
    /// Whether the graph contains any physical action. Governs whether
    /// an empty event queue means "sleep" or "terminate".
    pub(crate) has_physical_actions: bool,
}

impl ReactorGraph {
    pub fn reactor(&self, id: ReactorId) -> &Reactor {
        &self.reactors[id.0 as usize]
    }

    pub fn reaction(&self, id: ReactionId) -> &Reaction {
        &self.reactions[id.0 as usize]
    }

    pub fn trigger(&self, id: TriggerId) -> &Trigger {
        &self.triggers[id.0 as usize]
    }

    pub fn port(&self, id: PortId) -> &Port {
        &self.ports[id.0 as usize]
    }

    pub fn reaction_count(&self) -> usize {
        self.reactions.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn reactions(&self) -> impl Iterator<Item = &Reaction> {
        self.reactions.iter()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    pub(crate) fn startup_trigger(&self) -> Option<TriggerId> {
        self.startup
    }

    pub(crate) fn shutdown_trigger(&self) -> Option<TriggerId> {
        self.shutdown
    }
}
