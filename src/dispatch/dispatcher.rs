//! Entity lifecycle dispatcher.
//!
//! This module owns the identity → live stream mapping. Every snapshot is
//! processed under one mutex, so rounds never interleave: payloads are
//! forwarded first, vanished entities are retired next, and the streams born
//! in the round are announced last as a single batch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DispatcherConfig;
use crate::entity::{EntityId, TrackedEntity};
use crate::error::{ExecutionError, StreamError, StreamResult};
use crate::snapshot::Snapshot;

use super::broadcast::Broadcast;
use super::stream::{EntityBatch, LiveStream, LiveStreamWriter, Subscription};
use super::types::RoundReport;

#[derive(Debug)]
struct DispatcherState<T> {
    live: HashMap<EntityId, LiveStreamWriter<T>>,
    shut_down: bool,
}

/// Demultiplexes snapshots into one live stream per tracked entity.
///
/// `process_snapshot` may be called from any thread; calls are serialized
/// internally. Consumers attach to [`EntityDispatcher::new_entities`] to learn
/// about births, and to each announced [`LiveStream`] for its payloads.
#[derive(Debug)]
pub struct EntityDispatcher<T: TrackedEntity> {
    cfg: DispatcherConfig,
    state: Mutex<DispatcherState<T>>,
    new_entities: Arc<Broadcast<EntityBatch<T>>>,
    dropped_events: Arc<AtomicU64>,
    rounds: AtomicU64,
}

impl<T: TrackedEntity> EntityDispatcher<T> {
    /// Creates a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `cfg` is invalid.
    pub fn new(cfg: DispatcherConfig) -> StreamResult<Self> {
        cfg.validate()?;

        let dropped_events = Arc::new(AtomicU64::new(0));
        let new_entities = Arc::new(Broadcast::new(
            "new_entities",
            cfg.batch_capacity,
            false,
            Arc::clone(&dropped_events),
        ));

        Ok(Self {
            cfg,
            state: Mutex::new(DispatcherState {
                live: HashMap::new(),
                shut_down: false,
            }),
            new_entities,
            dropped_events,
            rounds: AtomicU64::new(0),
        })
    }

    /// The configuration this dispatcher runs with.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    fn lock_state(&self) -> StreamResult<MutexGuard<'_, DispatcherState<T>>> {
        self.state
            .lock()
            .map_err(|_| StreamError::internal("dispatcher state lock poisoned"))
    }

    fn peek_state(&self) -> MutexGuard<'_, DispatcherState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to batches of newly born streams.
    ///
    /// Only batches published after this call are delivered. After shutdown
    /// the subscription is already at end-of-stream.
    #[must_use]
    pub fn new_entities(&self) -> Subscription<EntityBatch<T>> {
        self.new_entities.subscribe()
    }

    /// Process one snapshot.
    ///
    /// Entities whose tracking state does not count as present are ignored.
    /// An identity repeated among present entities has every copy forwarded in
    /// snapshot order; the first copy opens or updates the stream.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::ShutDown` after [`EntityDispatcher::shutdown`],
    /// or an internal error if the state lock was poisoned.
    pub fn process_snapshot(&self, snapshot: Snapshot<T>) -> StreamResult<RoundReport> {
        let mut state = self.lock_state()?;
        if state.shut_down {
            return Err(ExecutionError::ShutDown {
                component: "dispatcher".to_string(),
            }
            .into());
        }

        let Snapshot { sequence, entities, .. } = snapshot;
        let mut report = RoundReport::new(sequence);

        let mut alive: HashSet<EntityId> = HashSet::with_capacity(entities.len());
        let mut born = Vec::new();
        for entity in entities {
            if !entity.tracking_state().is_present(self.cfg.presence) {
                report.skipped += 1;
                continue;
            }

            let identity = entity.identity();
            let first_sighting = alive.insert(identity);
            if !first_sighting {
                report.duplicates += 1;
            }

            if let Some(writer) = state.live.get(&identity) {
                writer.push(entity)?;
                if first_sighting {
                    report.updated.push(identity);
                }
            } else {
                let writer = LiveStreamWriter::open(
                    identity,
                    sequence,
                    self.cfg.stream_capacity,
                    Arc::clone(&self.dropped_events),
                );
                writer.push(entity)?;
                born.push(writer.handle());
                state.live.insert(identity, writer);
                report.created.push(identity);
                tracing::debug!(entity = %identity, sequence, "live stream opened");
            }
        }

        let mut dead: Vec<EntityId> = state
            .live
            .keys()
            .filter(|identity| !alive.contains(identity))
            .copied()
            .collect();
        dead.sort_unstable();

        for identity in dead {
            if let Some(writer) = state.live.remove(&identity) {
                writer.finish()?;
                report.retired.push(identity);
                tracing::debug!(entity = %identity, sequence, "live stream closed");
            }
        }

        if !born.is_empty() {
            self.new_entities.publish(EntityBatch {
                sequence,
                streams: born,
            })?;
        }

        self.rounds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            sequence,
            created = report.created.len(),
            updated = report.updated.len(),
            retired = report.retired.len(),
            duplicates = report.duplicates,
            "snapshot processed"
        );

        Ok(report)
    }

    /// Close every live stream and the new-entities stream.
    ///
    /// Idempotent. Returns how many live streams were closed by this call.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock was poisoned.
    pub fn shutdown(&self) -> StreamResult<usize> {
        let mut state = self.lock_state()?;
        if state.shut_down {
            return Ok(0);
        }
        state.shut_down = true;

        let mut live: Vec<(EntityId, LiveStreamWriter<T>)> = state.live.drain().collect();
        live.sort_unstable_by_key(|(identity, _)| *identity);
        let closed = live.len();
        for (_, writer) in live {
            writer.finish()?;
        }
        self.new_entities.close()?;

        tracing::info!(
            closed,
            rounds = self.rounds_processed(),
            "entity dispatcher shut down"
        );
        Ok(closed)
    }

    /// True after [`EntityDispatcher::shutdown`].
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.peek_state().shut_down
    }

    /// Read handle for the live stream of `identity`, if it is alive.
    #[must_use]
    pub fn stream(&self, identity: EntityId) -> Option<LiveStream<T>> {
        self.peek_state().live.get(&identity).map(LiveStreamWriter::handle)
    }

    /// Identities that currently have a live stream, ascending.
    #[must_use]
    pub fn live_identities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.peek_state().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live streams.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.peek_state().live.len()
    }

    /// Snapshots processed so far.
    #[must_use]
    pub fn rounds_processed(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Events lost to full bounded subscriber buffers, across all streams.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn poison_state(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.state.lock();
            panic!("poisoning dispatcher state");
        }));
    }
}

impl<T: TrackedEntity> Drop for EntityDispatcher<T> {
    fn drop(&mut self) {
        // Best-effort: consumers must not hang on streams nobody will close.
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresencePolicy;
    use crate::entity::Entity;

    type Body = Entity<&'static str>;

    fn dispatcher() -> EntityDispatcher<Body> {
        EntityDispatcher::new(DispatcherConfig::default()).unwrap()
    }

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    #[test]
    fn test_first_sighting_creates_and_announces() {
        let d = dispatcher();
        let births = d.new_entities();

        let report = d
            .process_snapshot(Snapshot::new(1, vec![Entity::tracked(1u64, "a")]))
            .unwrap();

        assert_eq!(report.created, vec![id(1)]);
        assert!(report.updated.is_empty());

        let batch = births.try_recv().unwrap().unwrap();
        assert_eq!(batch.sequence, 1);
        assert_eq!(batch.identities(), vec![id(1)]);
        assert_eq!(batch.streams[0].payloads_published(), 1);
        assert_eq!(d.live_identities(), vec![id(1)]);
    }

    #[test]
    fn test_not_tracked_entities_are_ignored() {
        let d = dispatcher();
        let report = d
            .process_snapshot(Snapshot::new(
                1,
                vec![Entity::not_tracked(1u64, "a"), Entity::position_only(2u64, "b")],
            ))
            .unwrap();

        assert_eq!(report.skipped, 2);
        assert!(report.is_idle());
        assert_eq!(d.live_count(), 0);
    }

    #[test]
    fn test_any_presence_policy_admits_position_only() {
        let d: EntityDispatcher<Body> = EntityDispatcher::new(DispatcherConfig {
            presence: PresencePolicy::AnyPresence,
            ..DispatcherConfig::default()
        })
        .unwrap();

        let report = d
            .process_snapshot(Snapshot::new(1, vec![Entity::position_only(2u64, "b")]))
            .unwrap();
        assert_eq!(report.created, vec![id(2)]);
    }

    #[test]
    fn test_not_tracked_kills_live_stream() {
        let d = dispatcher();
        d.process_snapshot(Snapshot::new(1, vec![Entity::tracked(1u64, "a")])).unwrap();
        let stream = d.stream(id(1)).unwrap();

        let report = d
            .process_snapshot(Snapshot::new(2, vec![Entity::not_tracked(1u64, "a")]))
            .unwrap();

        assert_eq!(report.retired, vec![id(1)]);
        assert!(stream.is_closed());
        assert!(d.stream(id(1)).is_none());
    }

    #[test]
    fn test_duplicate_identity_forwards_every_copy_in_order() {
        let d = dispatcher();
        d.process_snapshot(Snapshot::new(1, vec![Entity::tracked(1u64, "a")])).unwrap();
        let sub = d.stream(id(1)).unwrap().subscribe();
        assert_eq!(sub.recv().unwrap().payload, "a");

        let report = d
            .process_snapshot(Snapshot::new(
                2,
                vec![Entity::tracked(1u64, "x"), Entity::tracked(1u64, "y")],
            ))
            .unwrap();

        assert_eq!(report.updated, vec![id(1)]);
        assert!(report.created.is_empty());
        assert_eq!(report.duplicates, 1);
        let payloads: Vec<&str> = sub.drain().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["x", "y"]);
    }

    #[test]
    fn test_duplicate_identity_in_birth_round() {
        let d = dispatcher();
        let births = d.new_entities();
        let report = d
            .process_snapshot(Snapshot::new(
                1,
                vec![Entity::tracked(1u64, "first"), Entity::tracked(1u64, "second")],
            ))
            .unwrap();

        assert_eq!(report.created, vec![id(1)]);
        assert!(report.updated.is_empty());
        assert_eq!(report.duplicates, 1);

        let batch = births.try_recv().unwrap().unwrap();
        assert_eq!(batch.identities(), vec![id(1)]);
        let stream = d.stream(id(1)).unwrap();
        assert_eq!(stream.payloads_published(), 2);
        assert_eq!(stream.latest().unwrap().payload, "second");
    }

    #[test]
    fn test_duplicate_not_tracked_does_not_override_tracked() {
        let d = dispatcher();
        let report = d
            .process_snapshot(Snapshot::new(
                1,
                vec![Entity::tracked(1u64, "a"), Entity::not_tracked(1u64, "ghost")],
            ))
            .unwrap();

        assert_eq!(report.created, vec![id(1)]);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_empty_round_publishes_no_batch() {
        let d = dispatcher();
        d.process_snapshot(Snapshot::new(1, vec![Entity::tracked(1u64, "a")])).unwrap();

        let births = d.new_entities();
        d.process_snapshot(Snapshot::new(2, vec![Entity::tracked(1u64, "a")])).unwrap();
        assert_eq!(births.try_recv().unwrap().map(|b| b.len()), None);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let d = dispatcher();
        let births = d.new_entities();
        d.process_snapshot(Snapshot::new(
            1,
            vec![Entity::tracked(1u64, "a"), Entity::tracked(2u64, "b")],
        ))
        .unwrap();
        let s1 = d.stream(id(1)).unwrap();
        let s2 = d.stream(id(2)).unwrap();

        assert_eq!(d.shutdown().unwrap(), 2);
        assert_eq!(d.shutdown().unwrap(), 0);
        assert!(d.is_shut_down());
        assert!(s1.is_closed() && s2.is_closed());
        assert_eq!(d.live_count(), 0);

        assert!(births.try_recv().unwrap().is_some());
        assert!(births.try_recv().unwrap_err().is_disconnected());

        let err = d
            .process_snapshot(Snapshot::new(2, vec![Entity::tracked(1u64, "a")]))
            .unwrap_err();
        assert!(matches!(err, StreamError::Execution(ExecutionError::ShutDown { .. })));
    }

    #[test]
    fn test_drop_closes_streams() {
        let d = dispatcher();
        d.process_snapshot(Snapshot::new(1, vec![Entity::tracked(1u64, "a")])).unwrap();
        let stream = d.stream(id(1)).unwrap();
        let sub = stream.subscribe();

        drop(d);

        assert_eq!(sub.recv().unwrap().payload, "a");
        assert!(sub.recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = EntityDispatcher::<Body>::new(DispatcherConfig {
            batch_capacity: Some(0),
            ..DispatcherConfig::default()
        })
        .unwrap_err();
        assert!(err.is_validation());
    }
}
