//! Multi-consumer fan-out channel.
//!
//! Every subscriber owns its own crossbeam receiver and may carry a filter
//! that is checked before anything is queued for it. Publishing never blocks:
//! a full bounded subscriber loses the event (counted), a disconnected one is
//! pruned. Closing drops every sender, so each receiver drains what it already
//! holds and then observes disconnection, which is the end-of-stream signal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};

use crate::error::{StreamError, StreamResult};

use super::stream::Subscription;
use super::types::SubscriptionId;

type Filter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Subscriber<E> {
    id: SubscriptionId,
    tx: Sender<E>,
    filter: Option<Filter<E>>,
}

impl<E> Subscriber<E> {
    fn wants(&self, event: &E) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

struct BroadcastState<E> {
    subscribers: Vec<Subscriber<E>>,
    latest: Option<E>,
    published: u64,
    closed: bool,
}

pub(crate) struct Broadcast<E> {
    path: &'static str,
    capacity: Option<usize>,
    replay_latest: bool,
    dropped: Arc<AtomicU64>,
    state: Mutex<BroadcastState<E>>,
}

impl<E> fmt::Debug for Broadcast<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (subscribers, closed) = self
            .state
            .lock()
            .map(|s| (s.subscribers.len(), s.closed))
            .unwrap_or((0, true));
        f.debug_struct("Broadcast")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("subscribers", &subscribers)
            .field("closed", &closed)
            .finish()
    }
}

impl<E> Broadcast<E> {
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.retain(|sub| sub.id != id);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub(crate) fn published(&self) -> u64 {
        self.state.lock().map(|s| s.published).unwrap_or(0)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<E: Clone + Send + 'static> Broadcast<E> {
    /// `replay_latest` hands the most recent event to each new subscriber.
    pub(crate) fn new(
        path: &'static str,
        capacity: Option<usize>,
        replay_latest: bool,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            path,
            capacity: capacity.map(|c| c.max(1)),
            replay_latest,
            dropped,
            state: Mutex::new(BroadcastState {
                subscribers: Vec::new(),
                latest: None,
                published: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> StreamResult<std::sync::MutexGuard<'_, BroadcastState<E>>> {
        self.state
            .lock()
            .map_err(|_| StreamError::internal(format!("{} lock poisoned", self.path)))
    }

    /// Attach a new consumer.
    ///
    /// On a closed channel the subscription is already disconnected.
    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription<E> {
        self.attach(None)
    }

    /// Attach a consumer that only receives events accepted by `filter`.
    ///
    /// Rejected events never occupy the consumer's buffer.
    pub(crate) fn subscribe_filtered<F>(self: &Arc<Self>, filter: F) -> Subscription<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.attach(Some(Arc::new(filter)))
    }

    fn attach(self: &Arc<Self>, filter: Option<Filter<E>>) -> Subscription<E> {
        let (tx, rx) = match self.capacity {
            Some(n) => bounded::<E>(n),
            None => unbounded::<E>(),
        };
        let subscriber = Subscriber {
            id: SubscriptionId::new(),
            tx,
            filter,
        };
        let id = subscriber.id;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            if self.replay_latest {
                if let Some(latest) = state.latest.as_ref().filter(|e| subscriber.wants(e)) {
                    let _ = subscriber.tx.try_send(latest.clone());
                }
            }
            state.subscribers.push(subscriber);
        }
        drop(state);

        Subscription::new(id, self.path, rx, Arc::downgrade(self))
    }

    /// Deliver `event` to every attached consumer whose filter accepts it.
    ///
    /// Returns `false` without delivering anything once the channel is closed.
    pub(crate) fn publish(&self, event: E) -> StreamResult<bool> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(false);
        }

        let dropped = &self.dropped;
        let path = self.path;
        state.subscribers.retain(|sub| {
            if !sub.wants(&event) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        path,
                        subscription = ?sub.id,
                        "subscriber buffer full, event dropped"
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });

        state.published += 1;
        if self.replay_latest {
            state.latest = Some(event);
        }
        Ok(true)
    }

    /// Signal end-of-stream. Returns `true` only for the call that closed it.
    pub(crate) fn close(&self) -> StreamResult<bool> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(false);
        }
        state.closed = true;
        state.subscribers.clear();
        Ok(true)
    }

    pub(crate) fn latest(&self) -> Option<E> {
        self.state.lock().ok().and_then(|s| s.latest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: Option<usize>, replay: bool) -> (Arc<Broadcast<u32>>, Arc<AtomicU64>) {
        let dropped = Arc::new(AtomicU64::new(0));
        (
            Arc::new(Broadcast::new("test", capacity, replay, Arc::clone(&dropped))),
            dropped,
        )
    }

    #[test]
    fn fans_out_to_every_subscriber() {
        let (b, _) = channel(None, false);
        let s1 = b.subscribe();
        let s2 = b.subscribe();

        assert!(b.publish(1).unwrap());
        assert!(b.publish(2).unwrap());

        assert_eq!(s1.try_recv().unwrap(), Some(1));
        assert_eq!(s1.try_recv().unwrap(), Some(2));
        assert_eq!(s2.try_recv().unwrap(), Some(1));
        assert_eq!(s2.try_recv().unwrap(), Some(2));
        assert_eq!(b.published(), 2);
    }

    #[test]
    fn close_drains_then_disconnects() {
        let (b, _) = channel(None, false);
        let sub = b.subscribe();
        b.publish(7).unwrap();

        assert!(b.close().unwrap());
        assert!(!b.close().unwrap());
        assert!(!b.publish(8).unwrap());

        assert_eq!(sub.recv().unwrap(), 7);
        assert!(sub.recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn replay_hands_latest_to_late_subscriber() {
        let (b, _) = channel(None, true);
        b.publish(1).unwrap();
        b.publish(2).unwrap();

        let late = b.subscribe();
        assert_eq!(late.try_recv().unwrap(), Some(2));
        assert_eq!(late.try_recv().unwrap(), None);
        assert_eq!(b.latest(), Some(2));
    }

    #[test]
    fn subscribe_after_close_is_disconnected_without_replay() {
        let (b, _) = channel(None, true);
        b.publish(1).unwrap();
        b.close().unwrap();

        let sub = b.subscribe();
        assert!(sub.recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn full_subscriber_loses_events_and_counts_them() {
        let (b, dropped) = channel(Some(1), false);
        let sub = b.subscribe();
        b.publish(1).unwrap();
        b.publish(2).unwrap();

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert_eq!(sub.try_recv().unwrap(), Some(1));
        assert_eq!(sub.try_recv().unwrap(), None);
    }

    #[test]
    fn rejected_events_do_not_fill_a_filtered_buffer() {
        let (b, dropped) = channel(Some(2), false);
        let evens = b.subscribe_filtered(|n: &u32| n % 2 == 0);

        for n in [1, 3, 5, 2, 7, 4] {
            b.publish(n).unwrap();
        }
        b.close().unwrap();

        assert_eq!(dropped.load(Ordering::Relaxed), 0);
        let seen: Vec<u32> = evens.collect();
        assert_eq!(seen, vec![2, 4]);
    }

    #[test]
    fn replay_respects_filter() {
        let (b, _) = channel(None, true);
        b.publish(3).unwrap();

        let evens = b.subscribe_filtered(|n: &u32| n % 2 == 0);
        assert_eq!(evens.try_recv().unwrap(), None);
        b.publish(4).unwrap();
        assert_eq!(evens.try_recv().unwrap(), Some(4));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let (b, _) = channel(None, false);
        let keep = b.subscribe();
        let gone = b.subscribe();
        assert_eq!(b.subscriber_count(), 2);

        drop(gone);
        assert_eq!(b.subscriber_count(), 1);

        b.publish(3).unwrap();
        assert_eq!(keep.try_recv().unwrap(), Some(3));
    }
}
