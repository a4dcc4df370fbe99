//! Reference-counted shared recognition engine.
//!
//! One engine instance (a speech recognizer, a skeleton tracker, ...) is
//! shared by every subscriber in the process. It is started when the first
//! lease is acquired and stopped when the last lease is released. Leases are
//! guards: release happens on drop, on every exit path.
//!
//! The engine publishes its classified events into an [`EventHub`] owned by
//! the manager; lease holders read them through per-subscriber filtered
//! streams.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::RouterConfig;
use crate::error::{ExecutionError, StreamError, StreamResult};
use crate::router::{ClassifiedEvent, EventHub, FilteredStream, InterestId, InterestSet};

/// Start/stop hooks of the underlying engine.
pub trait EngineDriver: Send + 'static {
    /// Payload type of the classified events the engine emits.
    type Payload: Clone + Send + Sync + 'static;

    /// Start producing events into `publisher`.
    ///
    /// # Errors
    ///
    /// Any error keeps the engine stopped and fails the acquiring call.
    fn start(&mut self, publisher: EventPublisher<Self::Payload>) -> StreamResult<()>;

    /// Stop producing events. Called once per successful `start`.
    fn stop(&mut self);
}

/// Handle the driver uses to emit events.
pub struct EventPublisher<P> {
    hub: EventHub<P>,
}

impl<P> Clone for EventPublisher<P> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
        }
    }
}

impl<P> fmt::Debug for EventPublisher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher").field("hub", &self.hub).finish()
    }
}

impl<P: Clone + Send + Sync + 'static> EventPublisher<P> {
    /// Publish a recognition result.
    ///
    /// Returns `false` once the engine manager has been shut down.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the hub lock was poisoned.
    pub fn publish(
        &self,
        interest: impl Into<InterestId>,
        payload: P,
        confidence: f32,
    ) -> StreamResult<bool> {
        self.hub.publish(ClassifiedEvent::new(interest, payload, confidence))
    }
}

struct EngineState<D> {
    driver: D,
    ref_count: usize,
    shut_down: bool,
}

struct EngineInner<D: EngineDriver> {
    name: String,
    state: Mutex<EngineState<D>>,
    hub: EventHub<D::Payload>,
}

/// Shared-resource manager around one [`EngineDriver`].
///
/// Cheap to clone; every clone manages the same engine.
pub struct SharedEngine<D: EngineDriver> {
    inner: Arc<EngineInner<D>>,
}

impl<D: EngineDriver> Clone for SharedEngine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: EngineDriver> fmt::Debug for SharedEngine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEngine")
            .field("name", &self.inner.name)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl<D: EngineDriver> SharedEngine<D> {
    /// Wraps `driver`. The engine stays stopped until the first lease.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `cfg` is invalid.
    pub fn new(name: impl Into<String>, driver: D, cfg: &RouterConfig) -> StreamResult<Self> {
        Ok(Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                state: Mutex::new(EngineState {
                    driver,
                    ref_count: 0,
                    shut_down: false,
                }),
                hub: EventHub::new(cfg)?,
            }),
        })
    }

    fn lock(&self) -> StreamResult<MutexGuard<'_, EngineState<D>>> {
        self.inner
            .state
            .lock()
            .map_err(|_| StreamError::internal("engine state lock poisoned"))
    }

    /// Take a lease, starting the engine if this is the first one.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::EngineStart` if the driver fails to start
    /// (the count is left untouched), or `ExecutionError::ShutDown` after
    /// [`SharedEngine::shutdown`].
    pub fn acquire(&self) -> StreamResult<EngineLease<D>> {
        let mut state = self.lock()?;
        if state.shut_down {
            return Err(ExecutionError::ShutDown {
                component: self.inner.name.clone(),
            }
            .into());
        }

        if state.ref_count == 0 {
            let publisher = EventPublisher {
                hub: self.inner.hub.clone(),
            };
            state.driver.start(publisher).map_err(|e| {
                tracing::warn!(engine = %self.inner.name, error = %e, "engine failed to start");
                StreamError::Execution(ExecutionError::EngineStart {
                    message: e.to_string(),
                })
            })?;
            tracing::info!(engine = %self.inner.name, "engine started");
        }
        state.ref_count += 1;

        Ok(EngineLease {
            engine: self.clone(),
        })
    }

    fn release(&self) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if state.ref_count == 0 {
            return;
        }
        state.ref_count -= 1;
        if state.ref_count == 0 {
            state.driver.stop();
            tracing::info!(engine = %self.inner.name, "engine stopped");
        }
    }

    /// Number of outstanding leases.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.ref_count).unwrap_or(0)
    }

    /// True while at least one lease is held.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ref_count() > 0
    }

    /// Stop the engine regardless of outstanding leases and end the event hub.
    ///
    /// Later `acquire` calls fail; dropping old leases is harmless.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock was poisoned.
    pub fn shutdown(&self) -> StreamResult<()> {
        let mut state = self.lock()?;
        if state.shut_down {
            return Ok(());
        }
        state.shut_down = true;
        if state.ref_count > 0 {
            state.ref_count = 0;
            state.driver.stop();
        }
        drop(state);

        self.inner.hub.close()?;
        tracing::info!(engine = %self.inner.name, "engine manager shut down");
        Ok(())
    }
}

/// Scoped hold on a [`SharedEngine`]. Releases on drop.
pub struct EngineLease<D: EngineDriver> {
    engine: SharedEngine<D>,
}

impl<D: EngineDriver> fmt::Debug for EngineLease<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLease").field("engine", &self.engine).finish()
    }
}

impl<D: EngineDriver> EngineLease<D> {
    /// Events matching `interests`, from now on.
    #[must_use]
    pub fn subscribe(&self, interests: InterestSet) -> FilteredStream<D::Payload> {
        self.engine.inner.hub.for_subscriber(interests)
    }

    /// The engine this lease holds.
    #[must_use]
    pub const fn engine(&self) -> &SharedEngine<D> {
        &self.engine
    }
}

impl<D: EngineDriver> Drop for EngineLease<D> {
    fn drop(&mut self) {
        self.engine.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct FakeRecognizer {
        counters: Arc<Counters>,
        publisher: Option<EventPublisher<String>>,
        fail_start: bool,
    }

    impl EngineDriver for FakeRecognizer {
        type Payload = String;

        fn start(&mut self, publisher: EventPublisher<String>) -> StreamResult<()> {
            if self.fail_start {
                return Err(StreamError::internal("no audio device"));
            }
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            self.publisher = Some(publisher);
            Ok(())
        }

        fn stop(&mut self) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            self.publisher = None;
        }
    }

    fn engine(fail_start: bool) -> (SharedEngine<FakeRecognizer>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let driver = FakeRecognizer {
            counters: Arc::clone(&counters),
            publisher: None,
            fail_start,
        };
        (
            SharedEngine::new("speech", driver, &RouterConfig::default()).unwrap(),
            counters,
        )
    }

    #[test]
    fn test_starts_on_first_and_stops_on_last_lease() {
        let (e, counters) = engine(false);
        assert!(!e.is_running());

        let l1 = e.acquire().unwrap();
        let l2 = e.acquire().unwrap();
        assert_eq!(e.ref_count(), 2);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);

        drop(l1);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
        drop(l2);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(!e.is_running());

        let _l3 = e.acquire().unwrap();
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_start_leaves_count_untouched() {
        let (e, counters) = engine(true);
        let err = e.acquire().unwrap_err();
        assert!(matches!(err, StreamError::Execution(ExecutionError::EngineStart { .. })));
        assert_eq!(e.ref_count(), 0);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lease_released_on_error_path() {
        let (e, counters) = engine(false);

        fn work(e: &SharedEngine<FakeRecognizer>) -> StreamResult<()> {
            let _lease = e.acquire()?;
            Err(StreamError::internal("recognition aborted"))
        }

        assert!(work(&e).is_err());
        assert_eq!(e.ref_count(), 0);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_subscription_filters_driver_events() {
        let (e, _) = engine(false);
        let lease = e.acquire().unwrap();
        let colors = lease.subscribe(InterestSet::new(["colors"]).unwrap());

        let publisher = EventPublisher {
            hub: e.inner.hub.clone(),
        };
        publisher.publish("colors", "red".to_string(), 0.8).unwrap();
        publisher.publish("commands", "stop".to_string(), 0.9).unwrap();

        assert_eq!(colors.try_recv().unwrap(), Some("red".to_string()));
        assert_eq!(colors.try_recv().unwrap(), None);
    }

    #[test]
    fn test_shutdown_stops_engine_and_ends_streams() {
        let (e, counters) = engine(false);
        let lease = e.acquire().unwrap();
        let stream = lease.subscribe(InterestSet::new(["colors"]).unwrap());

        e.shutdown().unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert!(stream.recv().unwrap_err().is_disconnected());
        assert!(e.acquire().is_err());

        drop(lease);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }
}
