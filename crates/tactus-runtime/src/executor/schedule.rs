//! The schedule family.
//!
//! Every schedule variant funnels into [`schedule_trigger`]: timestamp
//! selection, stop-condition drops, minimum-spacing enforcement, and
//! same-tag FIFO chaining all live here. Callers hold the critical
//! section; reference-count bookkeeping follows the convention that a
//! successful insertion adds one reference for the queued event, and a
//! creating wrapper releases its own reference before returning.

use tracing::trace;

use crate::error::{Error, Result};
use crate::event::{Event, EventHandle};
use crate::graph::{SpacingPolicy, TriggerId};
use crate::tag::{Interval, Tag};
use crate::token::TokenId;
use crate::trace::{TraceEvent, TraceRecord};

use super::{trigger_index, Shared, SchedulerState};

/// Why a schedule call intentionally produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Stop was requested and the effective offset is positive.
    StopRequested,
    /// The event's tag would land beyond the stop tag.
    BeyondStopTag,
    /// Minimum spacing with the drop policy rejected the event.
    MinSpacing,
}

/// Outcome of a schedule call that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// An event was queued; the handle is a nonzero monotonic counter.
    Scheduled(EventHandle),
    /// The event was intentionally dropped.
    Dropped(DropReason),
}

impl ScheduleResult {
    /// The event handle, if one was scheduled.
    pub fn handle(&self) -> Option<EventHandle> {
        match self {
            ScheduleResult::Scheduled(h) => Some(*h),
            ScheduleResult::Dropped(_) => None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, ScheduleResult::Scheduled(_))
    }
}

/// Schedule `trigger` with no payload.
pub(crate) fn schedule(
    shared: &Shared,
    st: &mut SchedulerState,
    trigger: TriggerId,
    offset: Interval,
) -> Result<ScheduleResult> {
    schedule_trigger(shared, st, trigger, offset, None)
}

/// Schedule with an integer payload wrapped in a fresh token.
pub(crate) fn schedule_int(
    shared: &Shared,
    st: &mut SchedulerState,
    trigger: TriggerId,
    extra_delay: Interval,
    value: i64,
) -> Result<ScheduleResult> {
    let bytes: Box<[u8]> = Box::new(value.to_le_bytes());
    schedule_value(shared, st, trigger, extra_delay, bytes, 1)
}

/// Schedule with a copy of `bytes` (`length` elements).
pub(crate) fn schedule_copy(
    shared: &Shared,
    st: &mut SchedulerState,
    trigger: TriggerId,
    offset: Interval,
    bytes: &[u8],
    length: usize,
) -> Result<ScheduleResult> {
    schedule_value(shared, st, trigger, offset, bytes.into(), length)
}

/// Schedule taking ownership of an already-allocated payload.
pub(crate) fn schedule_value(
    shared: &Shared,
    st: &mut SchedulerState,
    trigger: TriggerId,
    extra_delay: Interval,
    value: Box<[u8]>,
    length: usize,
) -> Result<ScheduleResult> {
    let descriptor = lookup(shared, trigger)?;
    if value.len() != descriptor.element_size * length {
        return Err(Error::PayloadSizeMismatch {
            element_size: descriptor.element_size,
            length,
            got: value.len(),
        });
    }
    let token = st.tokens.create_token(descriptor.element_size);
    let token = st.tokens.initialize_with_value(token, value, length);
    st.tokens.inc_ref(token);
    let result = schedule_trigger(shared, st, trigger, extra_delay, Some(token));
    // Release the creation reference; a drop frees the payload here.
    st.tokens.dec_ref(token);
    result
}

/// The primitive all schedule variants funnel into.
///
/// On success the queued event owns one fresh reference on `token`.
/// A drop leaves the caller's references untouched.
pub(crate) fn schedule_trigger(
    shared: &Shared,
    st: &mut SchedulerState,
    trigger: TriggerId,
    extra_delay: Interval,
    token: Option<TokenId>,
) -> Result<ScheduleResult> {
    let descriptor = lookup(shared, trigger)?;
    if !descriptor.kind.is_action() {
        return Err(Error::NotAnAction(trigger));
    }

    let total_delay = descriptor.min_delay.saturating_add(extra_delay.max(0));
    if st.stop_requested && total_delay > 0 {
        trace!(trigger = %descriptor.name, "schedule dropped: stop requested");
        return Ok(ScheduleResult::Dropped(DropReason::StopRequested));
    }

    let mut tag = if descriptor.kind.is_physical() {
        // Physical actions are stamped against the later of the clock
        // and the logical instant, plus the delays.
        let base = shared.clock.now().max(st.current_tag.time);
        Tag::new(base.saturating_add(total_delay), 0)
    } else {
        st.current_tag.delay(total_delay)
    };

    // Minimum inter-arrival time enforcement.
    let ts = &st.triggers[trigger_index(trigger)];
    if descriptor.min_spacing > 0 && ts.last_scheduled != Tag::NEVER {
        let earliest = ts.last_scheduled.delay(descriptor.min_spacing);
        if tag < earliest {
            match descriptor.policy {
                SpacingPolicy::Drop => {
                    trace!(trigger = %descriptor.name, tag = %tag, earliest = %earliest,
                        "schedule dropped: minimum spacing");
                    return Ok(ScheduleResult::Dropped(DropReason::MinSpacing));
                }
                SpacingPolicy::Defer => {
                    tag = earliest;
                }
                SpacingPolicy::Replace => {
                    tag = tag.max(earliest);
                    if let Some(old) = st.event_q.remove_for_trigger(trigger, st.current_tag) {
                        if let Some(old_token) = old.token {
                            st.tokens.dec_ref(old_token);
                        }
                        // Keep the vacated slot occupied so later
                        // same-instant schedules stay FIFO-ordered.
                        if old.tag != tag {
                            st.event_q.push(Event::spacer(old.tag, trigger));
                        }
                    }
                }
            }
        }
    }

    // Same-tag race: chain behind any queued event, one microstep later.
    while st.event_q.occupied(trigger, tag) {
        tag = tag.next_microstep();
    }

    if tag > st.stop_tag {
        trace!(trigger = %descriptor.name, tag = %tag, stop = %st.stop_tag,
            "schedule dropped: beyond stop tag");
        return Ok(ScheduleResult::Dropped(DropReason::BeyondStopTag));
    }

    if let Some(token) = token {
        st.tokens.inc_ref(token);
    }
    st.event_q.push(Event::new(tag, trigger, token));
    st.triggers[trigger_index(trigger)].last_scheduled = tag;
    let handle = st.next_handle;
    st.next_handle += 1;

    shared.trace(TraceRecord {
        event: TraceEvent::ScheduleCalled,
        object: shared.trigger_obj(trigger),
        src: -1,
        dst: -1,
        tag,
        physical_time: shared.clock.now(),
        trigger: shared.trigger_obj(trigger),
        extra_delay,
    });
    trace!(trigger = %descriptor.name, tag = %tag, handle, "event scheduled");
    Ok(ScheduleResult::Scheduled(handle))
}

fn lookup<'a>(shared: &'a Shared, trigger: TriggerId) -> Result<&'a crate::graph::Trigger> {
    if trigger_index(trigger) >= shared.graph.trigger_count() {
        return Err(Error::UnknownTrigger(trigger));
    }
    Ok(shared.graph.trigger(trigger))
}
