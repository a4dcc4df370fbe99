//! Snapshot ingestion worker.
//!
//! A snapshot source is pulled on a dedicated thread and every snapshot is
//! handed to the dispatcher in arrival order. When the source ends or fails,
//! the dispatcher is shut down so no live stream outlives its producer.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::config::SourceConfig;
use crate::entity::TrackedEntity;
use crate::error::{ExecutionError, StreamError, StreamResult};
use crate::snapshot::Snapshot;

use super::dispatcher::EntityDispatcher;
use super::stream::{EntityBatch, Subscription};

/// Produces snapshots for a dispatcher worker.
///
/// `None` means the source is exhausted; `Some(Err(_))` is an upstream
/// failure. Either one ends the worker.
pub trait SnapshotSource<T>: Send + 'static {
    /// Block until the next snapshot is available.
    fn next_snapshot(&mut self) -> Option<StreamResult<Snapshot<T>>>;
}

impl<T, I> SnapshotSource<T> for I
where
    I: Iterator<Item = StreamResult<Snapshot<T>>> + Send + 'static,
{
    fn next_snapshot(&mut self) -> Option<StreamResult<Snapshot<T>>> {
        self.next()
    }
}

/// Producer half of a snapshot queue. Clone it to feed from several threads;
/// the queue serializes them into one arrival order.
#[derive(Debug)]
pub struct SnapshotSender<T> {
    sensor_index: i32,
    tx: Sender<StreamResult<Snapshot<T>>>,
}

impl<T> Clone for SnapshotSender<T> {
    fn clone(&self) -> Self {
        Self {
            sensor_index: self.sensor_index,
            tx: self.tx.clone(),
        }
    }
}

impl<T> SnapshotSender<T> {
    /// Sensor the snapshots are attributed to.
    #[must_use]
    pub const fn sensor_index(&self) -> i32 {
        self.sensor_index
    }

    /// Enqueue a snapshot, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` once the consumer is gone.
    pub fn send(&self, snapshot: Snapshot<T>) -> StreamResult<()> {
        self.tx
            .send(Ok(snapshot))
            .map_err(|_| StreamError::disconnected("snapshot_queue"))
    }

    /// Enqueue a snapshot without blocking.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::QueueFull` or `ExecutionError::Disconnected`.
    pub fn try_send(&self, snapshot: Snapshot<T>) -> StreamResult<()> {
        match self.tx.try_send(Ok(snapshot)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                path: "snapshot_queue".to_string(),
                capacity: self.tx.capacity().unwrap_or(0),
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(StreamError::disconnected("snapshot_queue")),
        }
    }

    /// Report an upstream failure. The worker shuts the dispatcher down when
    /// it reaches this entry.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` once the consumer is gone.
    pub fn fail(&self, message: impl Into<String>) -> StreamResult<()> {
        let err = ExecutionError::SourceFailed {
            message: message.into(),
        };
        self.tx
            .send(Err(err.into()))
            .map_err(|_| StreamError::disconnected("snapshot_queue"))
    }
}

/// Consumer half of a snapshot queue. Ends when every sender is dropped.
#[derive(Debug)]
pub struct SnapshotReceiver<T> {
    rx: Receiver<StreamResult<Snapshot<T>>>,
}

impl<T> Iterator for SnapshotReceiver<T> {
    type Item = StreamResult<Snapshot<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Create a bounded snapshot queue for the sensor described by `cfg`.
///
/// # Errors
///
/// Returns a validation error if `cfg` is invalid.
pub fn snapshot_channel<T>(
    cfg: &SourceConfig,
) -> StreamResult<(SnapshotSender<T>, SnapshotReceiver<T>)> {
    cfg.validate()?;
    let (tx, rx) = bounded(cfg.queue_capacity);
    Ok((
        SnapshotSender {
            sensor_index: cfg.sensor_index,
            tx,
        },
        SnapshotReceiver { rx },
    ))
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The source ran out of snapshots.
    SourceExhausted {
        /// Snapshots processed by the dispatcher.
        rounds: u64,
    },
    /// The dispatcher was shut down from elsewhere.
    DispatcherShutDown {
        /// Snapshots processed by the dispatcher.
        rounds: u64,
    },
}

/// Dispatcher driven by its own ingestion thread.
#[derive(Debug)]
pub struct DispatcherSystem<T: TrackedEntity> {
    dispatcher: Arc<EntityDispatcher<T>>,
    join: Mutex<Option<JoinHandle<StreamResult<WorkerExit>>>>,
}

impl<T: TrackedEntity> DispatcherSystem<T> {
    /// Start pulling `source` into `dispatcher`.
    pub fn spawn<S>(dispatcher: Arc<EntityDispatcher<T>>, source: S) -> Self
    where
        S: SnapshotSource<T>,
    {
        let worker_dispatcher = Arc::clone(&dispatcher);
        let join = thread::Builder::new()
            .name("trackstream-dispatch".to_string())
            .spawn(move || worker_loop(&worker_dispatcher, source))
            .expect("failed to spawn trackstream dispatch worker");

        Self {
            dispatcher,
            join: Mutex::new(Some(join)),
        }
    }

    /// The dispatcher fed by this worker.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<EntityDispatcher<T>> {
        &self.dispatcher
    }

    /// Shorthand for `dispatcher().new_entities()`.
    #[must_use]
    pub fn new_entities(&self) -> Subscription<EntityBatch<T>> {
        self.dispatcher.new_entities()
    }

    /// Wait for the worker to finish.
    ///
    /// # Errors
    ///
    /// Returns the upstream failure that ended the worker, or an internal
    /// error if it panicked or was already joined.
    pub fn join(&self) -> StreamResult<WorkerExit> {
        let handle = self
            .join
            .lock()
            .map_err(|_| StreamError::internal("dispatch worker handle lock poisoned"))?
            .take()
            .ok_or_else(|| StreamError::internal("dispatch worker already joined"))?;

        handle
            .join()
            .map_err(|_| StreamError::internal("dispatch worker panicked"))?
    }
}

fn worker_loop<T, S>(dispatcher: &EntityDispatcher<T>, mut source: S) -> StreamResult<WorkerExit>
where
    T: TrackedEntity,
    S: SnapshotSource<T>,
{
    loop {
        match source.next_snapshot() {
            Some(Ok(snapshot)) => {
                if dispatcher.is_shut_down() {
                    return Ok(WorkerExit::DispatcherShutDown {
                        rounds: dispatcher.rounds_processed(),
                    });
                }
                if let Err(err) = dispatcher.process_snapshot(snapshot) {
                    if dispatcher.is_shut_down() {
                        return Ok(WorkerExit::DispatcherShutDown {
                            rounds: dispatcher.rounds_processed(),
                        });
                    }
                    tracing::warn!(error = %err, "snapshot processing failed, stopping dispatcher");
                    if let Err(shutdown_err) = dispatcher.shutdown() {
                        tracing::warn!(error = %shutdown_err, "dispatcher shutdown failed");
                    }
                    return Err(err);
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "snapshot source failed, stopping dispatcher");
                if let Err(shutdown_err) = dispatcher.shutdown() {
                    tracing::warn!(error = %shutdown_err, "dispatcher shutdown failed");
                }
                return Err(match err {
                    StreamError::Execution(ExecutionError::SourceFailed { .. }) => err,
                    other => ExecutionError::SourceFailed {
                        message: other.to_string(),
                    }
                    .into(),
                });
            }
            None => {
                tracing::info!("snapshot source exhausted");
                if let Err(shutdown_err) = dispatcher.shutdown() {
                    tracing::warn!(error = %shutdown_err, "dispatcher shutdown failed");
                }
                return Ok(WorkerExit::SourceExhausted {
                    rounds: dispatcher.rounds_processed(),
                });
            }
        }
    }
}
