//! Identifier and report types for the dispatch subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;

/// Unique identifier of one live stream incarnation.
///
/// A reappearing identity gets a fresh `StreamId`; the old one is never reused.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Create a new random stream id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier of one consumer attachment to a stream.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// What one `process_snapshot` round did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    /// Sequence number of the processed snapshot.
    pub sequence: u64,
    /// When the round finished.
    pub processed_at: DateTime<Utc>,
    /// Identities that got a new live stream, in snapshot order.
    pub created: Vec<EntityId>,
    /// Identities whose existing stream received an update, in snapshot order.
    pub updated: Vec<EntityId>,
    /// Identities whose stream was closed, ascending.
    pub retired: Vec<EntityId>,
    /// Present entries repeating an identity already seen in the round.
    pub duplicates: usize,
    /// Entries ignored because their tracking state does not count as present.
    pub skipped: usize,
}

impl RoundReport {
    pub(crate) fn new(sequence: u64) -> Self {
        Self {
            sequence,
            processed_at: Utc::now(),
            created: Vec::new(),
            updated: Vec::new(),
            retired: Vec::new(),
            duplicates: 0,
            skipped: 0,
        }
    }

    /// True when nothing was born, updated or retired.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.retired.is_empty()
    }
}
