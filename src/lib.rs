//! # trackstream - entity lifecycle demultiplexing
//!
//! A tracking sensor reports, once per frame, the full set of entities it
//! currently sees. trackstream turns that periodic picture into one
//! long-lived stream per entity: the stream is born when the entity is first
//! tracked, receives every later sighting, and ends when the entity is gone.
//!
//! ## Core Concepts
//!
//! - **Snapshot**: one full observation of all tracked entities
//! - **EntityDispatcher**: keeps identity → stream state and drives births,
//!   updates and deaths
//! - **LiveStream**: the per-entity stream, from birth to death
//! - **EventHub / FilteredStream**: a shared recognition event source and a
//!   subscriber's interest-filtered view of it
//! - **SharedEngine**: ref-counted manager for the engine feeding a hub
//!
//! ## Usage
//!
//! ```rust
//! use trackstream::{DispatcherConfig, Entity, EntityDispatcher, Snapshot};
//!
//! let dispatcher = EntityDispatcher::new(DispatcherConfig::default())?;
//! let births = dispatcher.new_entities();
//!
//! dispatcher.process_snapshot(Snapshot::new(1, vec![Entity::tracked(1u64, "head")]))?;
//!
//! let batch = births.recv()?;
//! let body = batch.streams[0].subscribe();
//! assert_eq!(body.recv()?.payload, "head");
//! # Ok::<(), trackstream::StreamError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod entity;
pub mod error;
pub mod snapshot;

pub mod dispatch;
pub mod engine;
pub mod router;

// Re-export primary types at crate root for convenience
pub use config::{DispatcherConfig, PresencePolicy, RouterConfig, SourceConfig};
pub use entity::{Entity, EntityId, TrackedEntity, TrackingState};
pub use error::{ExecutionError, StreamError, StreamResult, ValidationError};
pub use snapshot::Snapshot;

pub use dispatch::{
    snapshot_channel, DispatcherSystem, EntityBatch, EntityDispatcher, LiveStream, RoundReport,
    SnapshotReceiver, SnapshotSender, SnapshotSource, StreamId, Subscription, SubscriptionId,
    WorkerExit,
};
pub use engine::{EngineDriver, EngineLease, EventPublisher, SharedEngine};
pub use router::{
    for_subscriber, ClassifiedEvent, EventHub, FilteredStream, InterestId, InterestSet,
};
