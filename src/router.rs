//! Interest-filtered event routing.
//!
//! A recognition engine publishes every classified event to one shared
//! [`EventHub`]. Each subscriber derives its own [`FilteredStream`] holding an
//! immutable [`InterestSet`]; events whose matched interest is outside that
//! set are skipped for that subscriber only. The set is checked when the hub
//! publishes, so foreign events never take space in a subscriber's buffer and
//! filtered streams stay independent of each other.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RouterConfig;
use crate::dispatch::broadcast::Broadcast;
use crate::dispatch::Subscription;
use crate::error::{StreamResult, ValidationError};

/// Token identifying one interest, e.g. a grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterestId(String);

impl InterestId {
    /// Creates an interest token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InterestId {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for InterestId {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Immutable set of interests owned by one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestSet {
    tokens: Arc<HashSet<InterestId>>,
}

impl InterestSet {
    /// Builds a set from tokens.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyInterestSet` if no token is given.
    pub fn new<I, S>(tokens: I) -> StreamResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<InterestId>,
    {
        let tokens: HashSet<InterestId> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(ValidationError::EmptyInterestSet.into());
        }
        Ok(Self {
            tokens: Arc::new(tokens),
        })
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, interest: &InterestId) -> bool {
        self.tokens.contains(interest)
    }

    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Never true for a constructed set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens in ascending order.
    #[must_use]
    pub fn sorted(&self) -> Vec<InterestId> {
        let mut out: Vec<InterestId> = self.tokens.iter().cloned().collect();
        out.sort();
        out
    }
}

/// One recognition result, tagged with the interest it matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedEvent<P> {
    /// Interest the engine matched.
    pub interest: InterestId,
    /// Recognition payload.
    pub payload: P,
    /// Engine confidence in [0.0, 1.0].
    pub confidence: f32,
    /// When the event was produced.
    pub observed_at: DateTime<Utc>,
}

impl<P> ClassifiedEvent<P> {
    /// Creates an event observed now.
    #[must_use]
    pub fn new(interest: impl Into<InterestId>, payload: P, confidence: f32) -> Self {
        Self {
            interest: interest.into(),
            payload,
            confidence,
            observed_at: Utc::now(),
        }
    }
}

/// Shared, process-wide classified-event source.
///
/// Cheap to clone; clones publish to and subscribe from the same hub.
pub struct EventHub<P> {
    channel: Arc<Broadcast<ClassifiedEvent<P>>>,
}

impl<P> Clone for EventHub<P> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<P> fmt::Debug for EventHub<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub").field("channel", &self.channel).finish()
    }
}

impl<P: Clone + Send + Sync + 'static> EventHub<P> {
    /// Creates a hub.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `cfg` is invalid.
    pub fn new(cfg: &RouterConfig) -> StreamResult<Self> {
        cfg.validate()?;
        Ok(Self {
            channel: Arc::new(Broadcast::new(
                "event_hub",
                cfg.capacity,
                false,
                Arc::new(AtomicU64::new(0)),
            )),
        })
    }

    /// Publish an event to every subscriber.
    ///
    /// Returns `false` once the hub is closed.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the hub lock was poisoned.
    pub fn publish(&self, event: ClassifiedEvent<P>) -> StreamResult<bool> {
        self.channel.publish(event)
    }

    /// Unfiltered subscription to every event.
    #[must_use]
    pub fn subscribe(&self) -> Subscription<ClassifiedEvent<P>> {
        self.channel.subscribe()
    }

    /// Filtered view for one subscriber. See [`for_subscriber`].
    #[must_use]
    pub fn for_subscriber(&self, interests: InterestSet) -> FilteredStream<P> {
        for_subscriber(self, interests)
    }

    /// End the hub. Subscribers drain buffered events, then see end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the hub lock was poisoned.
    pub fn close(&self) -> StreamResult<bool> {
        self.channel.close()
    }

    /// True after [`EventHub::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Attached subscribers, filtered or not.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.channel.subscriber_count()
    }

    /// Events lost to full bounded subscriber buffers.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.channel.dropped()
    }
}

/// Narrow `shared` to the events whose matched interest is in `interests`.
///
/// Only events published after this call are seen. Termination of the hub is
/// forwarded as end-of-stream.
#[must_use]
pub fn for_subscriber<P>(shared: &EventHub<P>, interests: InterestSet) -> FilteredStream<P>
where
    P: Clone + Send + Sync + 'static,
{
    let filter = interests.clone();
    let inner = shared
        .channel
        .subscribe_filtered(move |event: &ClassifiedEvent<P>| filter.contains(&event.interest));
    FilteredStream { interests, inner }
}

/// A subscriber's private view of an [`EventHub`].
#[derive(Debug)]
pub struct FilteredStream<P> {
    interests: InterestSet,
    inner: Subscription<ClassifiedEvent<P>>,
}

impl<P> FilteredStream<P> {
    /// The interests this stream forwards.
    #[must_use]
    pub const fn interests(&self) -> &InterestSet {
        &self.interests
    }

    /// Next matching event (blocking).
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` when the hub has ended.
    pub fn recv_event(&self) -> StreamResult<ClassifiedEvent<P>> {
        self.inner.recv()
    }

    /// Next matching payload (blocking).
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` when the hub has ended.
    pub fn recv(&self) -> StreamResult<P> {
        self.recv_event().map(|e| e.payload)
    }

    /// Next matching payload, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Timeout` or `ExecutionError::Disconnected`.
    pub fn recv_timeout(&self, timeout: Duration) -> StreamResult<P> {
        self.inner.recv_timeout(timeout).map(|e| e.payload)
    }

    /// Next matching payload already buffered, if any.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` when the hub has ended and
    /// nothing matching is buffered.
    pub fn try_recv(&self) -> StreamResult<Option<P>> {
        Ok(self.inner.try_recv()?.map(|e| e.payload))
    }

    /// Matching events buffered and not yet received.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    /// Detach from the hub. Idempotent; other subscribers are unaffected.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }
}

impl<P> Iterator for FilteredStream<P> {
    type Item = P;

    fn next(&mut self) -> Option<P> {
        self.recv().ok()
    }
}
