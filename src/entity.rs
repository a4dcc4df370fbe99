//! Tracked entity types.
//!
//! An entity is one subject observed by the sensor across time. The
//! dispatcher only needs two facts about it: the stable identity that
//! correlates it between snapshots, and whether it is currently tracked.
//! Everything else is payload and stays opaque.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PresencePolicy;

/// Stable integer identity of a tracked entity.
///
/// Unique among currently alive entities. The sensor may hand the same value
/// to an unrelated entity once the previous holder has been retired.
///
/// # Examples
///
/// ```
/// use trackstream::EntityId;
///
/// let id = EntityId::new(7);
/// assert_eq!(id.get(), 7);
/// assert_eq!(id.to_string(), "7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Wraps a raw tracking id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw tracking id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Presence state reported by the sensor for one entity in one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// Slot is reported but nobody is there.
    #[default]
    NotTracked,
    /// Only a coarse position is known.
    PositionOnly,
    /// Fully tracked.
    Tracked,
}

impl TrackingState {
    /// Whether an entity in this state counts as present under `policy`.
    #[must_use]
    pub const fn is_present(self, policy: PresencePolicy) -> bool {
        match (self, policy) {
            (Self::Tracked, _) => true,
            (Self::PositionOnly, PresencePolicy::AnyPresence) => true,
            (Self::PositionOnly, PresencePolicy::TrackedOnly) | (Self::NotTracked, _) => false,
        }
    }
}

/// Anything the dispatcher can demultiplex.
///
/// Implemented by [`Entity`], and by sensor-specific frame types that want
/// to flow through the dispatcher without being wrapped.
pub trait TrackedEntity: Clone + Send + Sync + 'static {
    /// Identity used to correlate this entity across snapshots.
    fn identity(&self) -> EntityId;

    /// Presence state in the snapshot this value came from.
    fn tracking_state(&self) -> TrackingState;
}

/// A tracked entity carrying an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<P> {
    /// Stable identity.
    pub identity: EntityId,
    /// Presence state for this snapshot.
    pub tracking_state: TrackingState,
    /// Per-snapshot data.
    pub payload: P,
}

impl<P> Entity<P> {
    /// Creates an entity with an explicit tracking state.
    #[must_use]
    pub fn new(identity: impl Into<EntityId>, tracking_state: TrackingState, payload: P) -> Self {
        Self {
            identity: identity.into(),
            tracking_state,
            payload,
        }
    }

    /// Creates a fully tracked entity.
    #[must_use]
    pub fn tracked(identity: impl Into<EntityId>, payload: P) -> Self {
        Self::new(identity, TrackingState::Tracked, payload)
    }

    /// Creates an entity that is reported but not tracked.
    #[must_use]
    pub fn not_tracked(identity: impl Into<EntityId>, payload: P) -> Self {
        Self::new(identity, TrackingState::NotTracked, payload)
    }

    /// Creates an entity with only a coarse position.
    #[must_use]
    pub fn position_only(identity: impl Into<EntityId>, payload: P) -> Self {
        Self::new(identity, TrackingState::PositionOnly, payload)
    }
}

impl<P> TrackedEntity for Entity<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn identity(&self) -> EntityId {
        self.identity
    }

    fn tracking_state(&self) -> TrackingState {
        self.tracking_state
    }
}
