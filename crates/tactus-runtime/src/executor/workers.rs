//! Worker threads.
//!
//! Each worker loops: acquire a runnable reaction under the critical
//! section, execute its body outside the lock, repeat. When the
//! reaction queue drains and nothing is running, exactly one worker
//! takes the advancement role (sleeping until physical time or external
//! events as needed); the rest park on `reaction_q_changed`.
//!
//! Dispatch discipline: only reactions at the minimum queued level run
//! (the level barrier); within that level the earliest deadline goes
//! first; two same-level reactions run concurrently only when their
//! chain masks are disjoint.

use std::time::Duration;

use tracing::{debug, trace};

use crate::queue::ReactionKey;
use crate::trace::{TraceEvent, TraceRecord};

use super::context::ReactionContext;
use super::{
    commit_advance, plan_advance, reaction_index, Plan, ReactionStatus, Shared, SchedulerState,
};

pub(crate) fn worker_loop(shared: &Shared, worker: usize) {
    let mut st = shared.state.lock();
    debug!(worker, "worker started");
    loop {
        if st.terminated {
            break;
        }

        if let Some(key) = next_runnable(shared, &mut st) {
            let chain = shared.graph.reaction(key.reaction).chain_mask;
            st.reactions[reaction_index(key.reaction)] = ReactionStatus::Running;
            st.executing_level = key.level;
            st.running_count += 1;
            st.running_chains |= chain;
            let tag = st.current_tag;
            drop(st);

            execute_reaction(shared, worker, key, tag);

            st = shared.state.lock();
            st.reactions[reaction_index(key.reaction)] = ReactionStatus::Inactive;
            st.running_count -= 1;
            st.running_chains &= !chain;
            st.reactions_executed += 1;
            // Chain-blocked reactions get another look now.
            let deferred = std::mem::take(&mut st.deferred);
            for k in deferred {
                st.reaction_q.push(k);
            }
            shared.reaction_q_changed.notify_all();
            continue;
        }

        if st.running_count > 0 || st.advancing {
            // Either the level barrier holds or another worker is
            // advancing; park until the queue changes.
            wait_for_work(shared, &mut st, worker);
            continue;
        }

        // Drained and idle: this worker advances the tag.
        advance(shared, &mut st, worker);
    }
    debug!(worker, "worker stopped");
    drop(st);
}

/// Pick the next reaction this worker may run, honoring the level
/// barrier and chain disjointness. Chain-overlapped reactions move to
/// the deferred list and are requeued when a reaction completes.
fn next_runnable(shared: &Shared, st: &mut SchedulerState) -> Option<ReactionKey> {
    loop {
        let head = st.reaction_q.peek()?;
        if st.running_count > 0 && head.level > st.executing_level {
            // Level barrier: wait for the lower level to drain.
            return None;
        }
        let key = st.reaction_q.pop().expect("peeked head");
        let chain = shared.graph.reaction(key.reaction).chain_mask;
        if chain & st.running_chains != 0 {
            st.deferred.push(key);
            continue;
        }
        return Some(key);
    }
}

/// Run a reaction body outside the critical section, with trace hooks.
fn execute_reaction(shared: &Shared, worker: usize, key: ReactionKey, tag: crate::tag::Tag) {
    let reaction = shared.graph.reaction(key.reaction);
    trace!(worker, reaction = %reaction.name, tag = %tag, "reaction starts");
    shared.trace(TraceRecord {
        event: TraceEvent::ReactionStarts,
        object: shared.reaction_obj(key.reaction),
        src: worker as i32,
        dst: reaction_index(key.reaction) as i32,
        tag,
        physical_time: shared.clock.now(),
        trigger: 0,
        extra_delay: 0,
    });

    let mut ctx = ReactionContext::new(shared, key.reaction, tag, worker);
    (reaction.body)(&mut ctx);

    shared.trace(TraceRecord {
        event: TraceEvent::ReactionEnds,
        object: shared.reaction_obj(key.reaction),
        src: worker as i32,
        dst: reaction_index(key.reaction) as i32,
        tag,
        physical_time: shared.clock.now(),
        trigger: 0,
        extra_delay: 0,
    });
    trace!(worker, reaction = %reaction.name, "reaction ends");
}

/// Park on `reaction_q_changed` with worker-wait trace hooks.
fn wait_for_work(
    shared: &Shared,
    st: &mut parking_lot::MutexGuard<'_, SchedulerState>,
    worker: usize,
) {
    shared.trace(TraceRecord {
        event: TraceEvent::WorkerWaitStarts,
        object: 0,
        src: worker as i32,
        dst: -1,
        tag: st.current_tag,
        physical_time: shared.clock.now(),
        trigger: 0,
        extra_delay: 0,
    });
    shared.reaction_q_changed.wait(st);
    shared.trace(TraceRecord {
        event: TraceEvent::WorkerWaitEnds,
        object: 0,
        src: worker as i32,
        dst: -1,
        tag: st.current_tag,
        physical_time: shared.clock.now(),
        trigger: 0,
        extra_delay: 0,
    });
}

/// Take the advancement role: plan, sleep as needed, commit, wake
/// everyone. Sleeps are interruptible by `event_q_changed` (physical
/// schedules and stop requests), after which the plan is recomputed.
fn advance(shared: &Shared, st: &mut parking_lot::MutexGuard<'_, SchedulerState>, worker: usize) {
    st.advancing = true;
    loop {
        if st.terminated {
            break;
        }
        match plan_advance(shared, st) {
            Plan::Advance { tag, is_final } => {
                let tag = match negotiate_with_federation(shared, st, tag) {
                    Some(t) => t,
                    // The queue changed while unlocked; plan again.
                    None => continue,
                };
                commit_advance(shared, st, tag, is_final);
                break;
            }
            Plan::Sleep { until } => {
                let now = shared.clock.now();
                if now >= until {
                    continue;
                }
                let timeout = Duration::from_nanos((until - now) as u64);
                trace!(worker, until, "sleeping until physical time");
                let _ = shared.event_q_changed.wait_for(st, timeout);
            }
            Plan::WaitForEvents => {
                trace!(worker, "event queue empty; waiting for external events");
                shared.event_q_changed.wait(st);
            }
            Plan::Terminate => {
                st.terminated = true;
                debug!(worker, "termination");
                break;
            }
        }
    }
    st.advancing = false;
    shared.reaction_q_changed.notify_all();
    shared.event_q_changed.notify_all();
}

/// Ask the federation adapter (if any) for permission to advance.
///
/// The adapter call blocks, so the critical section is released around
/// it. Returns `None` when the event queue head moved meanwhile (the
/// caller must re-plan); a coordinator failure is coerced into a stop
/// request.
fn negotiate_with_federation(
    shared: &Shared,
    st: &mut parking_lot::MutexGuard<'_, SchedulerState>,
    tag: crate::tag::Tag,
) -> Option<crate::tag::Tag> {
    let adapter = match shared.federation.as_ref() {
        Some(adapter) => adapter,
        None => return Some(tag),
    };

    let head_before = st.event_q.peek_head_tag();
    shared.trace(super::federated_record(
        TraceEvent::FederatedSend,
        tag,
        shared.clock.now(),
    ));
    adapter.notify_next_event(tag);
    let granted = parking_lot::MutexGuard::unlocked(st, || adapter.wait_for_tag(tag));
    if st.event_q.peek_head_tag() != head_before {
        return None;
    }
    match granted {
        Ok(granted) => {
            shared.trace(super::federated_record(
                TraceEvent::FederatedReceive,
                granted,
                shared.clock.now(),
            ));
            Some(granted.min(tag).max(st.current_tag))
        }
        Err(err) => {
            tracing::warn!(%err, "federation adapter failed; requesting stop");
            st.stop_requested = true;
            None
        }
    }
}
