//! The execution engine.
//!
//! Orchestrates a reactor program: seeds timer and startup events,
//! drives tag advancement, and dispatches reactions to a pool of worker
//! threads. All mutable scheduler state lives behind one mutex (the
//! critical section); reaction bodies run outside it.
//!
//! Module layout mirrors the execution surfaces:
//!
//! - this module: [`Runtime`], scheduler state, tag advancement, stop
//! - [`schedule`]: the schedule family and spacing policies
//! - [`workers`]: the worker loop, level barrier, EDF dispatch
//! - [`context`]: what a reaction body sees while it runs

mod context;
mod schedule;
mod workers;

pub use context::{AsyncScheduler, ReactionContext};
pub use schedule::{DropReason, ScheduleResult};

use std::sync::Arc;
use std::sync::OnceLock;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument, trace, warn};

use crate::clock::{MonotonicClock, PhysicalClock};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::event::{Event, EventHandle, EventKind};
use crate::federation::FederationAdapter;
use crate::graph::{PortId, ReactorGraph, ReactionId, TriggerId, TriggerKind};
use crate::queue::{EventQueue, ReactionKey, ReactionQueue};
use crate::tag::{Interval, Tag, TimePoint};
use crate::token::{CopyConstructor, Destructor, TokenId, TokenPool};
use crate::trace::{TraceEvent, TraceRecord, Tracer};

/// Per-run mutable side of a trigger.
pub(crate) struct TriggerState {
    /// Tag of the most recently scheduled event; spacing enforcement
    /// measures from here. `NEVER` until first scheduled.
    pub last_scheduled: Tag,
    /// Fired at the current tag.
    pub is_present: bool,
    /// Payload of the current firing, owned by the presence until the
    /// tag advances.
    pub token: Option<TokenId>,
}

/// Execution status of a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReactionStatus {
    Inactive,
    Queued,
    Running,
}

/// Per-run mutable side of a port.
#[derive(Default)]
pub(crate) struct PortState {
    pub is_present: bool,
    pub token: Option<TokenId>,
    /// References the port publish added; removed again at tag advance.
    pub published_refs: u32,
    /// Runtime overrides of the port's default destructor/copy ctor.
    pub destructor: Option<Destructor>,
    pub copy_constructor: Option<CopyConstructor>,
}

/// Everything behind the critical section.
pub(crate) struct SchedulerState {
    pub current_tag: Tag,
    pub event_q: EventQueue,
    pub reaction_q: ReactionQueue,
    pub tokens: TokenPool,
    pub triggers: Vec<TriggerState>,
    pub reactions: Vec<ReactionStatus>,
    pub ports: Vec<PortState>,
    /// Ports set at the current tag, reset on advance.
    pub ports_set: Vec<PortId>,
    /// Triggers fired at the current tag, reset on advance.
    pub triggers_present: Vec<TriggerId>,
    /// Monotonic schedule handle counter; 0 is never returned.
    pub next_handle: EventHandle,
    pub stop_requested: bool,
    /// `FOREVER` until a stop is resolved (timeout, request, or drain).
    pub stop_tag: Tag,
    /// Shutdown reactions have been enqueued at the stop tag.
    pub shutdown_scheduled: bool,
    pub terminated: bool,
    /// A worker currently owns the advancement role.
    pub advancing: bool,
    pub stp_offset: Interval,
    /// Level of the reactions currently running (valid while
    /// `running_count > 0`).
    pub executing_level: u32,
    pub running_count: usize,
    /// Union of chain masks of running reactions.
    pub running_chains: u64,
    /// Same-level reactions set aside because their chain overlaps a
    /// running one; retried as reactions complete.
    pub deferred: Vec<ReactionKey>,
    pub tags_processed: u64,
    pub reactions_executed: u64,
}

/// State shared by workers, contexts, and cross-thread handles.
pub(crate) struct Shared {
    pub graph: ReactorGraph,
    pub state: Mutex<SchedulerState>,
    /// Signaled on event-queue changes from outside the scheduler:
    /// physical-action schedules and stop requests.
    pub event_q_changed: Condvar,
    /// Signaled when reactions are enqueued or complete.
    pub reaction_q_changed: Condvar,
    pub clock: Box<dyn PhysicalClock>,
    pub config: RuntimeConfig,
    pub federation: Option<Box<dyn FederationAdapter>>,
    pub tracer: OnceLock<Tracer>,
    pub user_trace_events: Mutex<IndexMap<u64, String>>,
    /// First trace object id for triggers (reactions start at 1).
    pub trigger_obj_base: u64,
    /// First trace object id for user events.
    pub user_obj_base: u64,
}

impl Shared {
    pub fn trace(&self, record: TraceRecord) {
        if let Some(tracer) = self.tracer.get() {
            tracer.record(record);
        }
    }

    pub fn reaction_obj(&self, id: ReactionId) -> u64 {
        1 + reaction_index(id) as u64
    }

    pub fn trigger_obj(&self, id: TriggerId) -> u64 {
        self.trigger_obj_base + trigger_index(id) as u64
    }
}

pub(crate) fn reaction_index(id: ReactionId) -> usize {
    id.0 as usize
}

pub(crate) fn trigger_index(id: TriggerId) -> usize {
    id.0 as usize
}

pub(crate) fn port_index(id: PortId) -> usize {
    id.0 as usize
}

/// Summary returned by [`Runtime::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Distinct tags the scheduler advanced through.
    pub tags_processed: u64,
    /// Reaction invocations.
    pub reactions_executed: u64,
    /// The tag execution stopped at.
    pub final_tag: Tag,
    /// Tokens still holding references after teardown. Zero on a clean
    /// run.
    pub live_tokens: usize,
}

/// A reactor program ready to execute.
///
/// Owns the graph and all scheduler state. `run` drives the program to
/// completion; [`Runtime::handle`] hands out a cloneable cross-thread
/// scheduler for physical actions.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Build a runtime over `graph` with a wall-clock physical clock.
    pub fn new(graph: ReactorGraph, config: RuntimeConfig) -> Self {
        Self::with_clock(graph, config, Box::new(MonotonicClock::new(0)))
    }

    /// Build a runtime with a caller-supplied physical clock.
    pub fn with_clock(
        graph: ReactorGraph,
        config: RuntimeConfig,
        clock: Box<dyn PhysicalClock>,
    ) -> Self {
        Self::assemble(graph, config, clock, None)
    }

    /// Build a federated runtime; tag advancement defers to `adapter`.
    pub fn with_federation(
        graph: ReactorGraph,
        config: RuntimeConfig,
        clock: Box<dyn PhysicalClock>,
        adapter: Box<dyn FederationAdapter>,
    ) -> Self {
        Self::assemble(graph, config, clock, Some(adapter))
    }

    fn assemble(
        graph: ReactorGraph,
        config: RuntimeConfig,
        clock: Box<dyn PhysicalClock>,
        federation: Option<Box<dyn FederationAdapter>>,
    ) -> Self {
        let state = SchedulerState {
            current_tag: Tag::new(0, 0),
            event_q: EventQueue::new(),
            reaction_q: ReactionQueue::new(),
            tokens: TokenPool::new(),
            triggers: (0..graph.trigger_count())
                .map(|_| TriggerState {
                    last_scheduled: Tag::NEVER,
                    is_present: false,
                    token: None,
                })
                .collect(),
            reactions: vec![ReactionStatus::Inactive; graph.reaction_count()],
            ports: (0..graph.port_count()).map(|_| PortState::default()).collect(),
            ports_set: Vec::new(),
            triggers_present: Vec::new(),
            next_handle: 1,
            stop_requested: false,
            stop_tag: Tag::FOREVER,
            shutdown_scheduled: false,
            terminated: false,
            advancing: false,
            stp_offset: config.stp_offset,
            executing_level: 0,
            running_count: 0,
            running_chains: 0,
            deferred: Vec::new(),
            tags_processed: 0,
            reactions_executed: 0,
        };
        let trigger_obj_base = 1 + graph.reaction_count() as u64;
        let user_obj_base = trigger_obj_base + graph.trigger_count() as u64;
        Runtime {
            shared: Arc::new(Shared {
                graph,
                state: Mutex::new(state),
                event_q_changed: Condvar::new(),
                reaction_q_changed: Condvar::new(),
                clock,
                config,
                federation,
                tracer: OnceLock::new(),
                user_trace_events: Mutex::new(IndexMap::new()),
                trigger_obj_base,
                user_obj_base,
            }),
        }
    }

    /// Cross-thread handle for physical actions and stop requests.
    pub fn handle(&self) -> AsyncScheduler {
        AsyncScheduler::new(Arc::clone(&self.shared))
    }

    /// Register a user-defined trace event before the run; the returned
    /// id is passed to `ReactionContext::user_event`.
    pub fn register_user_trace_event(&self, description: &str) -> u64 {
        let mut events = self.shared.user_trace_events.lock();
        let id = self.shared.user_obj_base + events.len() as u64;
        events.insert(id, description.to_string());
        id
    }

    /// The safe-to-process offset applied in federated advancement.
    pub fn stp_offset(&self) -> Interval {
        self.shared.state.lock().stp_offset
    }

    /// Set the safe-to-process offset.
    pub fn set_stp_offset(&self, offset: Interval) {
        self.shared.state.lock().stp_offset = offset.max(0);
    }

    /// Log a snapshot of both queues (debugging aid).
    pub fn print_snapshot(&self) {
        let st = self.shared.state.lock();
        info!(
            current_tag = %st.current_tag,
            events = st.event_q.len(),
            reactions = st.reaction_q.len(),
            "queue snapshot"
        );
        for event in st.event_q.iter() {
            let trigger = self.shared.graph.trigger(event.trigger);
            let spacer = event.kind == EventKind::Spacer;
            info!(tag = %event.tag, trigger = %trigger.name, spacer, "queued event");
        }
    }

    /// Execute the program to completion.
    ///
    /// Spawns the configured worker count, drives tags until the stop
    /// tag is reached or the event queue drains, fires shutdown
    /// reactions at the final tag, and joins all workers.
    #[instrument(skip(self), fields(workers = self.shared.config.worker_count()))]
    pub fn run(&mut self) -> Result<RunReport> {
        let shared = &*self.shared;
        let start_time = shared.clock.now();

        if let Some(path) = &shared.config.trace_path {
            let tracer = Tracer::create(path, start_time, &self.trace_objects())?;
            let _ = shared.tracer.set(tracer);
        }

        self.seed_initial_events();
        info!(
            timeout = ?shared.config.timeout,
            fast = shared.config.fast,
            "starting execution"
        );

        let worker_count = shared.config.worker_count();
        std::thread::scope(|scope| {
            for worker in 0..worker_count {
                scope.spawn(move || workers::worker_loop(shared, worker));
            }
        });

        let report = self.finalize();
        info!(
            tags = report.tags_processed,
            reactions = report.reactions_executed,
            final_tag = %report.final_tag,
            "execution finished"
        );
        Ok(report)
    }

    /// Trace object table: reactions, triggers, then user events.
    fn trace_objects(&self) -> IndexMap<u64, String> {
        let shared = &self.shared;
        let mut objects = IndexMap::new();
        for reaction in shared.graph.reactions() {
            let reactor = shared.graph.reactor(reaction.reactor);
            objects.insert(
                shared.reaction_obj(reaction.id),
                format!("{}.{}", reactor.name, reaction.name),
            );
        }
        for trigger in shared.graph.triggers() {
            let reactor = shared.graph.reactor(trigger.reactor);
            objects.insert(
                shared.trigger_obj(trigger.id),
                format!("{}.{}", reactor.name, trigger.name),
            );
        }
        let user_events = self.shared.user_trace_events.lock();
        for (id, description) in user_events.iter() {
            objects.insert(*id, description.clone());
        }
        objects
    }

    /// Queue the startup event and first firing of every timer, and
    /// derive the stop tag from the configured timeout.
    fn seed_initial_events(&self) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if let Some(timeout) = shared.config.timeout {
            st.stop_tag = Tag::new(timeout, 0);
        }
        if let Some(startup) = shared.graph.startup_trigger() {
            st.event_q.push(Event::new(Tag::new(0, 0), startup, None));
        }
        for &timer in &shared.graph.timers {
            if let TriggerKind::Timer { offset, .. } = shared.graph.trigger(timer).kind {
                let first = Tag::new(offset.max(0), 0);
                if first <= st.stop_tag {
                    st.event_q.push(Event::new(first, timer, None));
                }
            }
        }
        debug!(events = st.event_q.len(), stop_tag = %st.stop_tag, "initial events seeded");
    }

    /// Release presences and drain leftover queue entries so the token
    /// pool settles; collect the report.
    fn finalize(&self) -> RunReport {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        reset_presence(&mut st);
        // Cancel anything still queued (a stop can land between enqueue
        // and dispatch) and release the references of leftover events.
        let cancelled = st.reaction_q.remove_matching(|_| true);
        for key in cancelled {
            st.reactions[reaction_index(key.reaction)] = ReactionStatus::Inactive;
        }
        let leftovers: Vec<Event> = st.event_q.iter().copied().collect();
        for event in leftovers {
            if let Some(token) = event.token {
                st.tokens.dec_ref(token);
            }
        }
        if let Some(tracer) = shared.tracer.get() {
            if let Err(err) = tracer.shutdown() {
                warn!(%err, "trace shutdown failed");
            }
        }
        RunReport {
            tags_processed: st.tags_processed,
            reactions_executed: st.reactions_executed,
            final_tag: st.current_tag,
            live_tokens: st.tokens.live(),
        }
    }
}

/// What the advancing worker should do next, decided under the lock.
pub(crate) enum Plan {
    /// Commit the advance to `tag` now.
    Advance { tag: Tag, is_final: bool },
    /// Wait for the physical clock to reach `until` (interruptible).
    Sleep { until: TimePoint },
    /// Event queue empty but external events are possible; block.
    WaitForEvents,
    /// Nothing left to do.
    Terminate,
}

/// Decide the next advancement step. Requires a drained reaction queue
/// and no running reactions.
pub(crate) fn plan_advance(shared: &Shared, st: &mut SchedulerState) -> Plan {
    debug_assert!(st.reaction_q.is_empty() && st.running_count == 0);

    if st.stop_requested && st.stop_tag == Tag::FOREVER {
        resolve_stop_tag(shared, st);
    }

    let head = st.event_q.peek_head_tag();
    let (target, is_final) = match head {
        Some(h) if h < st.stop_tag => (h, false),
        Some(_) => (st.stop_tag, true),
        None => {
            if st.stop_tag != Tag::FOREVER {
                (st.stop_tag, true)
            } else if shared.config.keepalive || shared.graph.has_physical_actions {
                return Plan::WaitForEvents;
            } else {
                // Nothing can ever arrive: stop at the next microstep.
                (st.current_tag.next_microstep(), true)
            }
        }
    };

    if is_final && st.shutdown_scheduled {
        return Plan::Terminate;
    }

    if !shared.config.fast && target.time > 0 {
        let stp = if shared.federation.is_some() { st.stp_offset } else { 0 };
        let wake_at = target.time.saturating_add(stp);
        if shared.clock.now() < wake_at {
            return Plan::Sleep { until: wake_at };
        }
    }

    Plan::Advance { tag: target, is_final }
}

/// Resolve the stop tag after a stop request: coordinated when
/// federated, otherwise one microstep past the current tag.
fn resolve_stop_tag(shared: &Shared, st: &mut SchedulerState) {
    let local = st.current_tag.next_microstep();
    let resolved = match &shared.federation {
        Some(adapter) => {
            shared.trace(federated_record(TraceEvent::FederatedSend, local, shared.clock.now()));
            adapter.send_stop_request(local);
            match adapter.await_stop_granted() {
                Ok(granted) => {
                    shared.trace(federated_record(
                        TraceEvent::FederatedReceive,
                        granted,
                        shared.clock.now(),
                    ));
                    granted.max(local)
                }
                Err(err) => {
                    warn!(%err, "federation lost during stop negotiation");
                    local
                }
            }
        }
        None => local,
    };
    st.stop_tag = st.stop_tag.min(resolved);
    debug!(stop_tag = %st.stop_tag, "stop tag resolved");
}

/// Advance the logical clock to `tag`: reset presences, pop every event
/// at the tag, enqueue enabled reactions, re-arm timers. With
/// `is_final`, also fire shutdown reactions and mark the run ending.
pub(crate) fn commit_advance(shared: &Shared, st: &mut SchedulerState, tag: Tag, is_final: bool) {
    if tag < st.current_tag {
        tracing::error!(tag = %tag, current = %st.current_tag, "event queue head behind current tag");
        panic!("attempted to advance backwards from {} to {}", st.current_tag, tag);
    }
    let physical = shared.clock.now();
    shared.trace(TraceRecord {
        event: TraceEvent::SchedulerAdvancingTimeStarts,
        object: 0,
        src: -1,
        dst: -1,
        tag: st.current_tag,
        physical_time: physical,
        trigger: 0,
        extra_delay: 0,
    });

    reset_presence(st);
    st.current_tag = tag;
    st.tags_processed += 1;
    trace!(tag = %tag, "advancing");

    while let Some(event) = st.event_q.pop_at(tag) {
        match event.kind {
            EventKind::Spacer => {
                // Held a microstep slot; nothing fires.
                if let Some(token) = event.token {
                    st.tokens.dec_ref(token);
                }
            }
            EventKind::Triggering => fire_trigger(shared, st, event),
        }
    }

    if is_final {
        if let Some(shutdown) = shared.graph.shutdown_trigger() {
            fire_trigger(shared, st, Event::new(tag, shutdown, None));
        }
        st.shutdown_scheduled = true;
        debug!(tag = %tag, "final tag reached");
    }

    shared.trace(TraceRecord {
        event: TraceEvent::SchedulerAdvancingTimeEnds,
        object: 0,
        src: -1,
        dst: -1,
        tag,
        physical_time: shared.clock.now(),
        trigger: 0,
        extra_delay: 0,
    });
}

/// Trace record for a federation adapter exchange.
pub(crate) fn federated_record(event: TraceEvent, tag: Tag, physical_time: TimePoint) -> TraceRecord {
    TraceRecord {
        event,
        object: 0,
        src: -1,
        dst: -1,
        tag,
        physical_time,
        trigger: 0,
        extra_delay: 0,
    }
}

/// Mark a popped event's trigger present and enqueue its reactions.
fn fire_trigger(shared: &Shared, st: &mut SchedulerState, event: Event) {
    let trigger = shared.graph.trigger(event.trigger);
    let ts = &mut st.triggers[trigger_index(event.trigger)];
    ts.is_present = true;
    // The event's token reference transfers to the presence.
    ts.token = event.token;
    st.triggers_present.push(event.trigger);

    if let TriggerKind::Timer { period, .. } = trigger.kind {
        if period > 0 {
            let next = event.tag.add_interval(period);
            if next <= st.stop_tag {
                st.event_q.push(Event::new(next, event.trigger, None));
            }
        }
    }

    for &reaction in &trigger.reactions {
        enqueue_reaction(shared, st, reaction);
    }
}

/// Put a reaction on the reaction queue unless it is already queued or
/// running at this tag.
pub(crate) fn enqueue_reaction(shared: &Shared, st: &mut SchedulerState, id: ReactionId) {
    let status = &mut st.reactions[reaction_index(id)];
    if *status != ReactionStatus::Inactive {
        return;
    }
    *status = ReactionStatus::Queued;
    let reaction = shared.graph.reaction(id);
    st.reaction_q.push(ReactionKey {
        level: reaction.level,
        deadline: reaction.deadline.unwrap_or(TimePoint::MAX),
        reaction: id,
    });
}

/// Clear all trigger and port presences from the finished tag,
/// releasing the token references they held.
fn reset_presence(st: &mut SchedulerState) {
    let triggers = std::mem::take(&mut st.triggers_present);
    for id in triggers {
        let ts = &mut st.triggers[trigger_index(id)];
        ts.is_present = false;
        if let Some(token) = ts.token.take() {
            st.tokens.dec_ref(token);
        }
    }
    let ports = std::mem::take(&mut st.ports_set);
    for id in ports {
        let ps = &mut st.ports[port_index(id)];
        ps.is_present = false;
        let refs = ps.published_refs;
        ps.published_refs = 0;
        if let Some(token) = ps.token.take() {
            for _ in 0..refs {
                st.tokens.dec_ref(token);
            }
        }
    }
}
