//! Change notifications emitted by the entity store.
//!
//! The store stays passive: mutations append events to an internal buffer,
//! and the engine runtime forwards them to subscribers. Notifications are a
//! view over the same mutations, never a second source of truth.

use crate::entity::EntityState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    /// Stayed stale past the retention window
    Expired,
    /// Removed to respect the capacity bound
    Evicted,
    /// Explicitly withdrawn, deleted on the following sweep
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityEvent {
    Created { uid: String },
    Updated { uid: String },
    StateChanged { uid: String, from: EntityState, to: EntityState },
    Removed { uid: String, reason: RemovalReason },
}

impl EntityEvent {
    pub fn uid(&self) -> &str {
        match self {
            EntityEvent::Created { uid }
            | EntityEvent::Updated { uid }
            | EntityEvent::StateChanged { uid, .. }
            | EntityEvent::Removed { uid, .. } => uid,
        }
    }
}
