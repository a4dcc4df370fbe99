use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::entity::{EntityId, TrackedEntity};
use crate::error::{ExecutionError, StreamError, StreamResult};

use super::broadcast::Broadcast;
use super::types::{StreamId, SubscriptionId};

/// One consumer's view of a stream.
///
/// Events arrive in production order. Once the producer closes the stream,
/// buffered events are still delivered and every call after that reports
/// `ExecutionError::Disconnected`.
///
/// Dropping the subscription detaches it from the producer.
pub struct Subscription<E> {
    id: SubscriptionId,
    path: &'static str,
    rx: Receiver<E>,
    source: Weak<Broadcast<E>>,
    unsubscribed: AtomicBool,
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("queued", &self.rx.len())
            .finish()
    }
}

impl<E> Subscription<E> {
    pub(crate) fn new(
        id: SubscriptionId,
        path: &'static str,
        rx: Receiver<E>,
        source: Weak<Broadcast<E>>,
    ) -> Self {
        Self {
            id,
            path,
            rx,
            source,
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// The id of this attachment.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Number of events buffered and not yet received.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Detach from the producer. Idempotent.
    ///
    /// Events already buffered can still be received, after which the
    /// subscription reports end-of-stream. Other consumers are unaffected.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(source) = self.source.upgrade() {
            source.unsubscribe(self.id);
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> StreamResult<E> {
        self.rx.recv().map_err(|_| StreamError::disconnected(self.path))
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> StreamResult<E> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => StreamError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => StreamError::disconnected(self.path),
        })
    }

    /// Receive an already buffered event, if any.
    ///
    /// `Ok(None)` means "nothing yet", an error means the stream has ended.
    pub fn try_recv(&self) -> StreamResult<Option<E>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(StreamError::disconnected(self.path)),
        }
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<E> {
        self.rx.try_iter().collect()
    }
}

impl<E> Iterator for Subscription<E> {
    type Item = E;

    /// Blocks for the next event; `None` at end-of-stream.
    fn next(&mut self) -> Option<E> {
        self.rx.recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Read-only handle to one entity's live stream.
///
/// Cheap to clone. Every payload the dispatcher forwards for the entity is
/// fanned out to all current subscribers; end-of-stream is signalled once the
/// entity leaves the scene. A new subscriber first receives the most recent
/// payload, so the payload that created the stream is visible to consumers
/// that attach after the stream was announced.
pub struct LiveStream<T> {
    id: StreamId,
    identity: EntityId,
    born_sequence: u64,
    born_at: DateTime<Utc>,
    channel: Arc<Broadcast<T>>,
}

impl<T> Clone for LiveStream<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            identity: self.identity,
            born_sequence: self.born_sequence,
            born_at: self.born_at,
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<T> fmt::Debug for LiveStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStream")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("born_sequence", &self.born_sequence)
            .field("closed", &self.channel.is_closed())
            .finish()
    }
}

impl<T> PartialEq for LiveStream<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for LiveStream<T> {}

impl<T> LiveStream<T> {
    /// Unique id of this stream incarnation.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// Identity of the entity this stream belongs to.
    #[must_use]
    pub const fn identity(&self) -> EntityId {
        self.identity
    }

    /// Sequence number of the snapshot that created the stream.
    #[must_use]
    pub const fn born_sequence(&self) -> u64 {
        self.born_sequence
    }

    /// Creation time.
    #[must_use]
    pub const fn born_at(&self) -> DateTime<Utc> {
        self.born_at
    }

    /// True once end-of-stream has been signalled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Payloads forwarded so far, including the first one.
    #[must_use]
    pub fn payloads_published(&self) -> u64 {
        self.channel.published()
    }

    /// Currently attached consumers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }
}

impl<T: TrackedEntity> LiveStream<T> {
    /// Attach a consumer.
    ///
    /// On a closed stream the subscription reports end-of-stream immediately.
    #[must_use]
    pub fn subscribe(&self) -> Subscription<T> {
        self.channel.subscribe()
    }

    /// Most recent payload, kept after the stream closes.
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        self.channel.latest()
    }
}

/// Write side of a live stream. Owned by the dispatcher only.
#[derive(Debug)]
pub(crate) struct LiveStreamWriter<T> {
    handle: LiveStream<T>,
}

impl<T: TrackedEntity> LiveStreamWriter<T> {
    pub(crate) fn open(
        identity: EntityId,
        born_sequence: u64,
        capacity: Option<usize>,
        dropped: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        let channel = Arc::new(Broadcast::new("live_stream", capacity, true, dropped));
        Self {
            handle: LiveStream {
                id: StreamId::new(),
                identity,
                born_sequence,
                born_at: Utc::now(),
                channel,
            },
        }
    }

    pub(crate) fn handle(&self) -> LiveStream<T> {
        self.handle.clone()
    }

    pub(crate) fn push(&self, payload: T) -> StreamResult<()> {
        if self.handle.channel.publish(payload)? {
            Ok(())
        } else {
            Err(StreamError::internal(format!(
                "payload for closed stream of entity {}",
                self.handle.identity
            )))
        }
    }

    pub(crate) fn finish(self) -> StreamResult<()> {
        self.handle.channel.close().map(|_| ())
    }
}

/// Streams born in one snapshot, announced together.
#[derive(Debug)]
pub struct EntityBatch<T> {
    /// Sequence number of the snapshot that created them.
    pub sequence: u64,
    /// One stream per newly seen identity, in snapshot order.
    pub streams: Vec<LiveStream<T>>,
}

impl<T> Clone for EntityBatch<T> {
    fn clone(&self) -> Self {
        Self {
            sequence: self.sequence,
            streams: self.streams.clone(),
        }
    }
}

impl<T> EntityBatch<T> {
    /// Identities in the batch.
    #[must_use]
    pub fn identities(&self) -> Vec<EntityId> {
        self.streams.iter().map(LiveStream::identity).collect()
    }

    /// Number of new streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Always false for a published batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl<T> IntoIterator for EntityBatch<T> {
    type Item = LiveStream<T>;
    type IntoIter = std::vec::IntoIter<LiveStream<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.streams.into_iter()
    }
}
