//! Federation adapter seam.
//!
//! Coordinated execution across multiple runtimes is an external
//! concern: the core only knows the four calls below. A runtime built
//! without an adapter advances tags on its own authority.

use thiserror::Error;

use crate::tag::Tag;

/// Failure surfaced by a federation adapter.
///
/// A lost coordinator connection is coerced into a stop request by the
/// runtime; it is not fatal to the local program.
#[derive(Debug, Error)]
pub enum FederationError {
    /// The coordinator connection dropped.
    #[error("federation coordinator disconnected")]
    Disconnected,
}

/// Interface the runtime calls when federated execution is enabled.
pub trait FederationAdapter: Send + Sync {
    /// Inform the coordinator of the earliest event this runtime could
    /// produce next.
    fn notify_next_event(&self, tag: Tag);

    /// Block until advancing to `tag` is safe. The granted tag may be
    /// earlier than requested; the runtime advances no further than the
    /// grant.
    fn wait_for_tag(&self, tag: Tag) -> Result<Tag, FederationError>;

    /// Forward a stop request to the coordinator.
    fn send_stop_request(&self, tag: Tag);

    /// Block until the coordinator grants a coordinated stop tag.
    fn await_stop_granted(&self) -> Result<Tag, FederationError>;
}

/// Adapter that grants everything immediately: the non-federated case.
pub struct NoFederation;

impl FederationAdapter for NoFederation {
    fn notify_next_event(&self, _tag: Tag) {}

    fn wait_for_tag(&self, tag: Tag) -> Result<Tag, FederationError> {
        Ok(tag)
    }

    fn send_stop_request(&self, _tag: Tag) {}

    fn await_stop_granted(&self) -> Result<Tag, FederationError> {
        Ok(Tag::NEVER)
    }
}
