//! Event records.
//!
//! An [`Event`] is one entry on the event queue: a trigger firing at a
//! tag, optionally carrying a payload token. Spacer events reserve a
//! microstep slot for minimum-spacing bookkeeping and enable no
//! reactions when popped.

use crate::graph::TriggerId;
use crate::tag::Tag;
use crate::token::TokenId;

/// Handle returned for a successfully scheduled event.
///
/// A monotonic per-runtime counter starting at 1; useful for log
/// correlation, never reused.
pub type EventHandle = u64;

/// Whether an event fires reactions or merely holds a queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A real firing: enables the trigger's reactions at the tag.
    Triggering,
    /// A spacer reserving a (tag, trigger) slot; popped and discarded.
    Spacer,
}

/// A record on the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tag: Tag,
    pub trigger: TriggerId,
    pub token: Option<TokenId>,
    pub kind: EventKind,
}

impl Event {
    /// A triggering event.
    pub fn new(tag: Tag, trigger: TriggerId, token: Option<TokenId>) -> Self {
        Event {
            tag,
            trigger,
            token,
            kind: EventKind::Triggering,
        }
    }

    /// A payload-free spacer at the given slot.
    pub fn spacer(tag: Tag, trigger: TriggerId) -> Self {
        Event {
            tag,
            trigger,
            token: None,
            kind: EventKind::Spacer,
        }
    }
}
