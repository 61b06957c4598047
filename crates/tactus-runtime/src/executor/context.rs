//! What a reaction sees while it runs.
//!
//! A [`ReactionContext`] is handed to every reaction body. It carries
//! the current tag and exposes the scheduling primitives, the typed
//! port capability surface, deadline checking, and stop requests. The
//! body itself runs outside the critical section; each context call
//! that touches scheduler state takes the lock for just that call.
//!
//! [`AsyncScheduler`] is the cross-thread face of the same surface,
//! restricted to physical actions and stop requests.

use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::graph::{PortId, ReactionId, TriggerId};
use crate::tag::{Interval, Tag, TimePoint};
use crate::token::{CopyConstructor, Destructor, TokenId};
use crate::trace::{TraceEvent, TraceRecord};

use super::schedule;
use super::{
    enqueue_reaction, port_index, trigger_index, ScheduleResult, Shared, SchedulerState,
};

/// Execution context of one reaction invocation.
pub struct ReactionContext<'a> {
    shared: &'a Shared,
    reaction: ReactionId,
    tag: Tag,
    worker: usize,
}

impl<'a> ReactionContext<'a> {
    pub(crate) fn new(shared: &'a Shared, reaction: ReactionId, tag: Tag, worker: usize) -> Self {
        ReactionContext {
            shared,
            reaction,
            tag,
            worker,
        }
    }

    /// The logical tag this invocation runs at.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Current physical clock reading.
    pub fn physical_time(&self) -> TimePoint {
        self.shared.clock.now()
    }

    /// Physical lag behind the logical instant.
    pub fn lag(&self) -> Interval {
        self.shared.clock.now().saturating_sub(self.tag.time)
    }

    /// Borrow the owning reactor's state, downcast to its concrete type.
    ///
    /// Panics on a type mismatch; that is a wiring bug, not a runtime
    /// condition.
    pub fn with_state<S: 'static, R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let reactor = self.shared.graph.reaction(self.reaction).reactor;
        let mut guard = self.shared.graph.reactor(reactor).state.lock();
        let state = guard
            .as_mut()
            .downcast_mut::<S>()
            .expect("reactor state downcast to wrong type");
        f(state)
    }

    // ---- scheduling -----------------------------------------------------

    /// Schedule an action with no payload.
    pub fn schedule(&self, trigger: TriggerId, offset: Interval) -> Result<ScheduleResult> {
        let mut st = self.shared.state.lock();
        schedule::schedule(self.shared, &mut st, trigger, offset)
    }

    /// Schedule an action carrying an integer.
    pub fn schedule_int(
        &self,
        trigger: TriggerId,
        extra_delay: Interval,
        value: i64,
    ) -> Result<ScheduleResult> {
        let mut st = self.shared.state.lock();
        schedule::schedule_int(self.shared, &mut st, trigger, extra_delay, value)
    }

    /// Schedule an action with a copy of `bytes` (`length` elements).
    pub fn schedule_copy(
        &self,
        trigger: TriggerId,
        offset: Interval,
        bytes: &[u8],
        length: usize,
    ) -> Result<ScheduleResult> {
        let mut st = self.shared.state.lock();
        schedule::schedule_copy(self.shared, &mut st, trigger, offset, bytes, length)
    }

    /// Schedule an action taking ownership of an allocated payload.
    pub fn schedule_value(
        &self,
        trigger: TriggerId,
        extra_delay: Interval,
        value: Box<[u8]>,
        length: usize,
    ) -> Result<ScheduleResult> {
        let mut st = self.shared.state.lock();
        schedule::schedule_value(self.shared, &mut st, trigger, extra_delay, value, length)
    }

    /// Schedule an action forwarding an existing token (typically one
    /// obtained from [`ReactionContext::action_token`]). The queued
    /// event takes its own reference.
    pub fn schedule_token(
        &self,
        trigger: TriggerId,
        extra_delay: Interval,
        token: TokenId,
    ) -> Result<ScheduleResult> {
        let mut st = self.shared.state.lock();
        schedule::schedule_trigger(self.shared, &mut st, trigger, extra_delay, Some(token))
    }

    // ---- action reads ---------------------------------------------------

    /// Whether `trigger` fired at the current tag.
    pub fn action_is_present(&self, trigger: TriggerId) -> bool {
        let st = self.shared.state.lock();
        st.triggers[trigger_index(trigger)].is_present
    }

    /// Copy of the payload `trigger` fired with, if any.
    pub fn action_value(&self, trigger: TriggerId) -> Option<Box<[u8]>> {
        let st = self.shared.state.lock();
        let token = st.triggers[trigger_index(trigger)].token?;
        st.tokens.get(token).value().map(Into::into)
    }

    /// The payload token `trigger` fired with, for forwarding. The
    /// presence keeps its own reference; forward with
    /// [`ReactionContext::schedule_token`] or
    /// [`ReactionContext::set_token`].
    pub fn action_token(&self, trigger: TriggerId) -> Option<TokenId> {
        let st = self.shared.state.lock();
        st.triggers[trigger_index(trigger)].token
    }

    // ---- port capability surface ----------------------------------------

    /// Mark a port present with no payload.
    pub fn set_present(&self, port: PortId) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.check_port(port)?;
        publish(self.shared, &mut st, port, None);
        Ok(())
    }

    /// Set a port to a copy of `bytes`.
    pub fn set_value(&self, port: PortId, bytes: &[u8]) -> Result<()> {
        let mut st = self.shared.state.lock();
        let descriptor = self.check_port(port)?;
        let length = checked_length(descriptor.element_size, bytes.len())?;
        let token = st.tokens.create_token(descriptor.element_size);
        let token = st.tokens.initialize_with_value(token, bytes.into(), length);
        publish(self.shared, &mut st, port, Some(token));
        Ok(())
    }

    /// Allocate a zeroed payload of `length` elements on the port and
    /// let `fill` populate it.
    pub fn set_new(&self, port: PortId, length: usize, fill: impl FnOnce(&mut [u8])) -> Result<()> {
        let element_size = self.check_port(port)?.element_size;
        let mut bytes = vec![0u8; element_size * length].into_boxed_slice();
        fill(&mut bytes);
        let mut st = self.shared.state.lock();
        let token = st.tokens.create_token(element_size);
        let token = st.tokens.initialize_with_value(token, bytes, length);
        publish(self.shared, &mut st, port, Some(token));
        Ok(())
    }

    /// Forward an existing token to a port without copying; the port
    /// adds one reference per destination.
    pub fn set_token(&self, port: PortId, token: TokenId) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.check_port(port)?;
        publish(self.shared, &mut st, port, Some(token));
        Ok(())
    }

    /// Override the destructor for tokens published on `port`.
    pub fn set_destructor(&self, port: PortId, destructor: Destructor) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.check_port(port)?;
        st.ports[port_index(port)].destructor = Some(destructor);
        Ok(())
    }

    /// Override the copy constructor for tokens published on `port`.
    pub fn set_copy_constructor(&self, port: PortId, ctor: CopyConstructor) -> Result<()> {
        let mut st = self.shared.state.lock();
        self.check_port(port)?;
        st.ports[port_index(port)].copy_constructor = Some(ctor);
        Ok(())
    }

    /// Whether `port` is present at the current tag.
    pub fn port_is_present(&self, port: PortId) -> bool {
        let st = self.shared.state.lock();
        st.ports[port_index(port)].is_present
    }

    /// Copy of the port's payload, honoring its copy constructor.
    pub fn port_value(&self, port: PortId) -> Option<Box<[u8]>> {
        let st = self.shared.state.lock();
        let token = st.ports[port_index(port)].token?;
        st.tokens.copy_value(token)
    }

    // ---- deadline, stop, federation -------------------------------------

    /// Check this reaction's physical-time deadline.
    ///
    /// Computes the lag of physical time behind the current logical
    /// instant; on a miss, records a trace event, optionally invokes
    /// the deadline handler, and returns `true`.
    pub fn check_deadline(&mut self, invoke_handler: bool) -> bool {
        let reaction = self.shared.graph.reaction(self.reaction);
        let deadline = match reaction.deadline {
            Some(d) => d,
            None => return false,
        };
        let lag = self.lag();
        if lag <= deadline {
            return false;
        }
        trace!(reaction = %reaction.name, lag, deadline, "deadline missed");
        self.shared.trace(TraceRecord {
            event: TraceEvent::ReactionDeadlineMissed,
            object: self.shared.reaction_obj(self.reaction),
            src: self.worker as i32,
            dst: super::reaction_index(self.reaction) as i32,
            tag: self.tag,
            physical_time: self.shared.clock.now(),
            trigger: 0,
            extra_delay: 0,
        });
        if invoke_handler {
            if let Some(handler) = &reaction.deadline_handler {
                handler(self);
            }
        }
        true
    }

    /// Request a cooperative stop: reactions at the current tag finish,
    /// then execution winds down at the resolved stop tag.
    pub fn request_stop(&self) {
        request_stop(self.shared);
    }

    /// The safe-to-process offset for federated advancement.
    pub fn get_stp_offset(&self) -> Interval {
        self.shared.state.lock().stp_offset
    }

    /// Set the safe-to-process offset.
    pub fn set_stp_offset(&self, offset: Interval) {
        self.shared.state.lock().stp_offset = offset.max(0);
    }

    // ---- user tracing ----------------------------------------------------

    /// Record a user-defined trace event registered before the run.
    pub fn user_event(&self, event_id: u64) {
        self.trace_user(TraceEvent::UserEvent, event_id, 0);
    }

    /// Record a user-defined valued trace event.
    pub fn user_value(&self, event_id: u64, value: i64) {
        self.trace_user(TraceEvent::UserValue, event_id, value);
    }

    fn trace_user(&self, event: TraceEvent, object: u64, value: i64) {
        self.shared.trace(TraceRecord {
            event,
            object,
            src: self.worker as i32,
            dst: -1,
            tag: self.tag,
            physical_time: self.shared.clock.now(),
            trigger: 0,
            extra_delay: value,
        });
    }

    fn check_port(&self, port: PortId) -> Result<&crate::graph::Port> {
        if port_index(port) >= self.shared.graph.port_count() {
            return Err(Error::UnknownPort(port));
        }
        Ok(self.shared.graph.port(port))
    }
}

/// Publish a token on a port: mark present, install default
/// destructor/copy-constructor, add one reference per destination, and
/// enqueue the downstream reactions at the current tag.
fn publish(shared: &Shared, st: &mut SchedulerState, port: PortId, token: Option<TokenId>) {
    let descriptor = shared.graph.port(port);
    let idx = port_index(port);

    // Overwrite within the same tag releases the previous publish.
    if st.ports[idx].is_present {
        let refs = st.ports[idx].published_refs;
        st.ports[idx].published_refs = 0;
        if let Some(old) = st.ports[idx].token.take() {
            for _ in 0..refs {
                st.tokens.dec_ref(old);
            }
        }
    } else {
        st.ports[idx].is_present = true;
        st.ports_set.push(port);
    }

    if let Some(token) = token {
        // Only install what the port configures; a forwarded token
        // keeps its own destructor otherwise.
        if let Some(destructor) = st.ports[idx]
            .destructor
            .clone()
            .or_else(|| descriptor.destructor.clone())
        {
            st.tokens.set_destructor(token, Some(destructor));
        }
        if let Some(ctor) = st.ports[idx]
            .copy_constructor
            .clone()
            .or_else(|| descriptor.copy_constructor.clone())
        {
            st.tokens.set_copy_constructor(token, Some(ctor));
        }

        // The port owns at least one reference even with no readers.
        let refs = descriptor.num_destinations.max(1) as u32;
        st.tokens.inc_ref_by(token, refs);
        st.ports[idx].token = Some(token);
        st.ports[idx].published_refs = refs;
    }

    for &reaction in &descriptor.downstream {
        enqueue_reaction(shared, st, reaction);
    }
}

/// Flag the stop request and wake both the advancer and the workers.
pub(crate) fn request_stop(shared: &Shared) {
    let mut st = shared.state.lock();
    if !st.stop_requested {
        st.stop_requested = true;
        tracing::debug!(tag = %st.current_tag, "stop requested");
    }
    shared.event_q_changed.notify_all();
    shared.reaction_q_changed.notify_all();
}

fn checked_length(element_size: usize, bytes: usize) -> Result<usize> {
    if element_size == 0 || bytes % element_size != 0 {
        return Err(Error::PayloadSizeMismatch {
            element_size,
            length: if element_size == 0 { 0 } else { bytes / element_size },
            got: bytes,
        });
    }
    Ok(bytes / element_size)
}

/// Cross-thread scheduling handle.
///
/// Cloneable and `Send`; valid for the lifetime of the runtime. Only
/// physical actions may be scheduled from outside a reaction: logical
/// time belongs to reaction invocations, so logical schedules are
/// rejected with [`Error::AsyncLogicalSchedule`].
#[derive(Clone)]
pub struct AsyncScheduler {
    shared: Arc<Shared>,
}

impl AsyncScheduler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        AsyncScheduler { shared }
    }

    /// Schedule a physical action with no payload.
    pub fn schedule(&self, trigger: TriggerId, extra_delay: Interval) -> Result<ScheduleResult> {
        self.guard(trigger)?;
        let mut st = self.shared.state.lock();
        let result = schedule::schedule(&self.shared, &mut st, trigger, extra_delay);
        drop(st);
        self.shared.event_q_changed.notify_all();
        result
    }

    /// Schedule a physical action carrying an integer.
    pub fn schedule_int(
        &self,
        trigger: TriggerId,
        extra_delay: Interval,
        value: i64,
    ) -> Result<ScheduleResult> {
        self.guard(trigger)?;
        let mut st = self.shared.state.lock();
        let result = schedule::schedule_int(&self.shared, &mut st, trigger, extra_delay, value);
        drop(st);
        self.shared.event_q_changed.notify_all();
        result
    }

    /// Schedule a physical action with a copy of `bytes`.
    pub fn schedule_copy(
        &self,
        trigger: TriggerId,
        extra_delay: Interval,
        bytes: &[u8],
        length: usize,
    ) -> Result<ScheduleResult> {
        self.guard(trigger)?;
        let mut st = self.shared.state.lock();
        let result =
            schedule::schedule_copy(&self.shared, &mut st, trigger, extra_delay, bytes, length);
        drop(st);
        self.shared.event_q_changed.notify_all();
        result
    }

    /// Schedule a physical action taking ownership of a payload.
    pub fn schedule_value(
        &self,
        trigger: TriggerId,
        extra_delay: Interval,
        value: Box<[u8]>,
        length: usize,
    ) -> Result<ScheduleResult> {
        self.guard(trigger)?;
        let mut st = self.shared.state.lock();
        let result =
            schedule::schedule_value(&self.shared, &mut st, trigger, extra_delay, value, length);
        drop(st);
        self.shared.event_q_changed.notify_all();
        result
    }

    /// Request a cooperative stop from any thread.
    pub fn request_stop(&self) {
        request_stop(&self.shared);
    }

    fn guard(&self, trigger: TriggerId) -> Result<()> {
        if trigger_index(trigger) >= self.shared.graph.trigger_count() {
            return Err(Error::UnknownTrigger(trigger));
        }
        let descriptor = self.shared.graph.trigger(trigger);
        if !descriptor.kind.is_action() {
            return Err(Error::NotAnAction(trigger));
        }
        if !descriptor.kind.is_physical() {
            return Err(Error::AsyncLogicalSchedule(trigger));
        }
        Ok(())
    }
}
