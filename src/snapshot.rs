//! Snapshots: one complete observation frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All entities observed at one point in time.
///
/// A snapshot is a full picture, not a delta: an identity missing from it is
/// considered gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// Producer-assigned frame number.
    pub sequence: u64,
    /// When the frame was captured.
    pub captured_at: DateTime<Utc>,
    /// Entities in this frame. Order is preserved during dispatch.
    pub entities: Vec<T>,
}

impl<T> Snapshot<T> {
    /// Creates a snapshot captured now.
    #[must_use]
    pub fn new(sequence: u64, entities: Vec<T>) -> Self {
        Self::captured_at(sequence, Utc::now(), entities)
    }

    /// Creates a snapshot with an explicit capture time.
    #[must_use]
    pub fn captured_at(sequence: u64, captured_at: DateTime<Utc>, entities: Vec<T>) -> Self {
        Self {
            sequence,
            captured_at,
            entities,
        }
    }

    /// Creates a snapshot with no entities.
    #[must_use]
    pub fn empty(sequence: u64) -> Self {
        Self::new(sequence, Vec::new())
    }

    /// Number of entities, present or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when the frame carries no entities at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterates the entities in frame order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entities.iter()
    }
}

impl<T> IntoIterator for Snapshot<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn test_snapshot_basics() {
        let snap = Snapshot::new(1, vec![Entity::tracked(1u64, ()), Entity::tracked(2u64, ())]);
        assert_eq!(snap.sequence, 1);
        assert_eq!(snap.len(), 2);
        assert!(!snap.is_empty());
        assert!(Snapshot::<Entity<()>>::empty(2).is_empty());
    }

    #[test]
    fn test_snapshot_serde() {
        let snap = Snapshot::new(9, vec![Entity::tracked(5u64, 1.5f32)]);
        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot<Entity<f32>> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
