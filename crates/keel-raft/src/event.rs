//! Status and role change events.

use crate::types::{RoleType, Status};

/// An observable state transition of the replica.
///
/// Listeners observe events in the order the serialized state mutations
/// emitted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Status(Status),
    Role(RoleType),
}

/// A registered event listener.
pub type EventSink = Box<dyn Fn(Event) + Send + Sync>;
