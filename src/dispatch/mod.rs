//! Entity lifecycle dispatch.
//!
//! Snapshots go in, one live stream per tracked entity comes out. The
//! dispatcher announces every stream on the new-entities stream in the round
//! the entity is first seen, forwards each later sighting to it, and ends it
//! in the round the entity disappears. The worker drives a dispatcher from an
//! external snapshot source on its own thread.

/// Multi-consumer fan-out channel.
pub(crate) mod broadcast;
/// Identity → live stream state and lifecycle transitions.
pub mod dispatcher;
/// Consumer-facing stream handles.
pub mod stream;
/// Identifier and report types.
pub mod types;
/// Snapshot ingestion thread.
pub mod worker;

pub use dispatcher::EntityDispatcher;
pub use stream::{EntityBatch, LiveStream, Subscription};
pub use types::{RoundReport, StreamId, SubscriptionId};
pub use worker::{
    snapshot_channel, DispatcherSystem, SnapshotReceiver, SnapshotSender, SnapshotSource,
    WorkerExit,
};
