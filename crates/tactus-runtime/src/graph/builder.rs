//! Graph construction: wiring, leveling, chain assignment.

use std::any::Any;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::ReactionContext;
use crate::tag::Interval;
use crate::token::{CopyConstructor, Destructor};

use super::types::{
    Port, PortId, Reaction, ReactionId, Reactor, ReactorGraph, ReactorId, SpacingPolicy, Trigger,
    TriggerId, TriggerKind,
};

/// Builds a [`ReactorGraph`], standing in for generated initializers.
///
/// Wire reactors, reactions, triggers, and ports, then call
/// [`GraphBuilder::build`] to compute levels and chain masks. Reactions
/// declared on the same reactor are implicitly ordered by declaration,
/// in addition to any port edges between reactors.
#[derive(Default)]
pub struct GraphBuilder {
    reactors: Vec<Reactor>,
    reactions: Vec<Reaction>,
    triggers: Vec<Trigger>,
    ports: Vec<Port>,
    /// (writer reaction, port) pairs; combined with each port's
    /// downstream readers to form dependency edges.
    writes: Vec<(ReactionId, PortId)>,
    startup: Option<TriggerId>,
    shutdown: Option<TriggerId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reactor with its initial state.
    pub fn add_reactor(&mut self, name: &str, state: impl Any + Send) -> ReactorId {
        let id = ReactorId(self.reactors.len() as u32);
        self.reactors.push(Reactor {
            id,
            name: name.to_string(),
            state: Mutex::new(Box::new(state)),
        });
        id
    }

    /// Add a reaction to a reactor. Declaration order within one
    /// reactor is execution order.
    pub fn add_reaction(
        &mut self,
        reactor: ReactorId,
        name: &str,
        body: impl Fn(&mut ReactionContext<'_>) + Send + Sync + 'static,
    ) -> ReactionId {
        let id = ReactionId(self.reactions.len() as u32);
        self.reactions.push(Reaction {
            id,
            name: name.to_string(),
            reactor,
            level: 0,
            deadline: None,
            chain_mask: 0,
            body: Box::new(body),
            deadline_handler: None,
        });
        id
    }

    /// Attach a physical-time deadline and optional handler to a reaction.
    pub fn set_deadline(
        &mut self,
        reaction: ReactionId,
        deadline: Interval,
        handler: Option<Box<dyn Fn(&mut ReactionContext<'_>) + Send + Sync>>,
    ) {
        let r = &mut self.reactions[reaction.0 as usize];
        r.deadline = Some(deadline);
        r.deadline_handler = handler;
    }

    /// Add a logical action owned by `reactor`.
    pub fn add_logical_action(
        &mut self,
        reactor: ReactorId,
        name: &str,
        min_delay: Interval,
        element_size: usize,
    ) -> TriggerId {
        self.add_trigger(reactor, name, TriggerKind::LogicalAction, min_delay, element_size)
    }

    /// Add a physical action owned by `reactor`.
    pub fn add_physical_action(
        &mut self,
        reactor: ReactorId,
        name: &str,
        min_delay: Interval,
        element_size: usize,
    ) -> TriggerId {
        self.add_trigger(reactor, name, TriggerKind::PhysicalAction, min_delay, element_size)
    }

    /// Add a timer firing first at `offset` after start, then every
    /// `period`. A zero period fires once.
    pub fn add_timer(
        &mut self,
        reactor: ReactorId,
        name: &str,
        offset: Interval,
        period: Interval,
    ) -> TriggerId {
        self.add_trigger(reactor, name, TriggerKind::Timer { offset, period }, 0, 0)
    }

    /// Set the minimum inter-arrival time and violation policy of an action.
    pub fn set_min_spacing(&mut self, trigger: TriggerId, spacing: Interval, policy: SpacingPolicy) {
        let t = &mut self.triggers[trigger.0 as usize];
        t.min_spacing = spacing;
        t.policy = policy;
    }

    /// Enable `reaction` whenever `trigger` fires.
    pub fn trigger_reaction(&mut self, trigger: TriggerId, reaction: ReactionId) {
        self.triggers[trigger.0 as usize].reactions.push(reaction);
    }

    /// Enable `reaction` at the start tag.
    pub fn on_startup(&mut self, reaction: ReactionId) {
        let trigger = match self.startup {
            Some(t) => t,
            None => {
                let reactor = self.reactions[reaction.0 as usize].reactor;
                let t = self.add_trigger(reactor, "startup", TriggerKind::Startup, 0, 0);
                self.startup = Some(t);
                t
            }
        };
        self.trigger_reaction(trigger, reaction);
    }

    /// Enable `reaction` at the stop tag.
    pub fn on_shutdown(&mut self, reaction: ReactionId) {
        let trigger = match self.shutdown {
            Some(t) => t,
            None => {
                let reactor = self.reactions[reaction.0 as usize].reactor;
                let t = self.add_trigger(reactor, "shutdown", TriggerKind::Shutdown, 0, 0);
                self.shutdown = Some(t);
                t
            }
        };
        self.trigger_reaction(trigger, reaction);
    }

    /// Add a port owned by `reactor`.
    pub fn add_port(&mut self, reactor: ReactorId, name: &str, element_size: usize) -> PortId {
        let id = PortId(self.ports.len() as u32);
        self.ports.push(Port {
            id,
            name: name.to_string(),
            reactor,
            element_size,
            num_destinations: 0,
            downstream: Vec::new(),
            destructor: None,
            copy_constructor: None,
        });
        id
    }

    /// Declare that `writer` may set `port`. Forms a dependency edge to
    /// every reader connected with [`GraphBuilder::connect`].
    pub fn reaction_writes(&mut self, writer: ReactionId, port: PortId) {
        self.writes.push((writer, port));
    }

    /// Connect `port` to a downstream `reader`, enabled at the tag the
    /// port is set.
    pub fn connect(&mut self, port: PortId, reader: ReactionId) {
        self.ports[port.0 as usize].downstream.push(reader);
    }

    /// Default destructor for tokens published on `port`.
    pub fn set_port_destructor(&mut self, port: PortId, destructor: Destructor) {
        self.ports[port.0 as usize].destructor = Some(destructor);
    }

    /// Default copy constructor for tokens published on `port`.
    pub fn set_port_copy_constructor(&mut self, port: PortId, ctor: CopyConstructor) {
        self.ports[port.0 as usize].copy_constructor = Some(ctor);
    }

    /// Finish the graph: fan-out counts, dependency levels, chain masks.
    pub fn build(mut self) -> Result<ReactorGraph> {
        for port in &mut self.ports {
            port.num_destinations = port.downstream.len();
        }

        let (levels, order) = self.compute_levels()?;
        for (reaction, level) in levels {
            self.reactions[reaction.0 as usize].level = level;
        }
        self.assign_chains(&order);

        let timers: Vec<TriggerId> = self
            .triggers
            .iter()
            .filter(|t| matches!(t.kind, TriggerKind::Timer { .. }))
            .map(|t| t.id)
            .collect();
        let has_physical_actions = self.triggers.iter().any(|t| t.kind.is_physical());

        debug!(
            reactions = self.reactions.len(),
            triggers = self.triggers.len(),
            ports = self.ports.len(),
            "reactor graph built"
        );

        Ok(ReactorGraph {
            reactors: self.reactors,
            reactions: self.reactions,
            triggers: self.triggers,
            ports: self.ports,
            startup: self.startup,
            shutdown: self.shutdown,
            timers,
            has_physical_actions,
        })
    }

    fn add_trigger(
        &mut self,
        reactor: ReactorId,
        name: &str,
        kind: TriggerKind,
        min_delay: Interval,
        element_size: usize,
    ) -> TriggerId {
        let id = TriggerId(self.triggers.len() as u32);
        self.triggers.push(Trigger {
            id,
            name: name.to_string(),
            kind,
            reactor,
            min_delay,
            min_spacing: 0,
            policy: SpacingPolicy::default(),
            element_size,
            reactions: Vec::new(),
        });
        id
    }

    /// Dependency edges: port writer -> reader, plus declaration order
    /// within each reactor.
    fn edges(&self) -> Vec<(ReactionId, ReactionId)> {
        let mut edges = Vec::new();
        for (writer, port) in &self.writes {
            for reader in &self.ports[port.0 as usize].downstream {
                edges.push((*writer, *reader));
            }
        }
        let mut last_of: IndexMap<ReactorId, ReactionId> = IndexMap::new();
        for reaction in &self.reactions {
            if let Some(prev) = last_of.insert(reaction.reactor, reaction.id) {
                edges.push((prev, reaction.id));
            }
        }
        edges
    }

    /// Kahn's algorithm over the reaction edges. Returns per-reaction
    /// levels and a topological visit order; a cycle is a build error.
    fn compute_levels(&self) -> Result<(Vec<(ReactionId, u32)>, Vec<ReactionId>)> {
        let edges = self.edges();
        let mut in_degree: IndexMap<ReactionId, usize> =
            self.reactions.iter().map(|r| (r.id, 0)).collect();
        let mut successors: IndexMap<ReactionId, Vec<ReactionId>> = IndexMap::new();
        for (from, to) in &edges {
            *in_degree.get_mut(to).expect("edge to unknown reaction") += 1;
            successors.entry(*from).or_default().push(*to);
        }

        let mut levels = Vec::with_capacity(self.reactions.len());
        let mut order = Vec::with_capacity(self.reactions.len());
        let mut wave: Vec<ReactionId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut depth = 0u32;

        while !wave.is_empty() {
            wave.sort();
            let mut next = Vec::new();
            for id in wave {
                levels.push((id, depth));
                order.push(id);
                if let Some(succ) = successors.get(&id) {
                    for s in succ {
                        let d = in_degree.get_mut(s).unwrap();
                        *d -= 1;
                        if *d == 0 {
                            next.push(*s);
                        }
                    }
                }
            }
            wave = next;
            depth += 1;
        }

        if levels.len() != self.reactions.len() {
            let stuck: Vec<ReactionId> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(Error::DependencyCycle(stuck));
        }
        Ok((levels, order))
    }

    /// Chain masks in topological order: own bit OR every predecessor's
    /// mask. Disjoint masks prove two reactions share no chain.
    fn assign_chains(&mut self, order: &[ReactionId]) {
        let edges = self.edges();
        let mut predecessors: IndexMap<ReactionId, Vec<ReactionId>> = IndexMap::new();
        for (from, to) in &edges {
            predecessors.entry(*to).or_default().push(*from);
        }
        for id in order {
            let mut mask = 1u64 << (id.0 % 64);
            if let Some(preds) = predecessors.get(id) {
                for p in preds {
                    mask |= self.reactions[p.0 as usize].chain_mask;
                }
            }
            self.reactions[id.0 as usize].chain_mask = mask;
        }
    }
}
