//! Implements a topic-keyed event bus.
//!
//! A single Tokio task owns the map of topics to subscriber inboxes. The bus
//! handle communicates with that task over three channels (subscribe,
//! unsubscribe and publish), so the map is never shared behind a lock.
//!
//! Subscribing and unsubscribing are acknowledged by the owning task: once
//! [`EventBus::subscribe`] or [`Subscription::close`] returns, the change has
//! been applied and every event published afterwards observes it.
//!
//! Publishing is non-blocking. Events for a topic without subscribers are
//! dropped with a warning.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

/// A request to add a subscriber to a topic.
struct Subscribe<K, T> {
    /// The topic being subscribed to.
    topic: K,
    /// The unique identifier of the subscriber.
    id: u64,
    /// The inbox of the subscriber.
    inbox: mpsc::UnboundedSender<T>,
    /// Signalled once the subscriber has been added.
    ack: oneshot::Sender<()>,
}

/// A request to remove a subscriber from a topic.
struct Unsubscribe<K> {
    /// The topic being unsubscribed from.
    topic: K,
    /// The unique identifier of the subscriber.
    id: u64,
    /// Signalled once the subscriber has been removed.
    ///
    /// Subscriptions that are dropped without being closed do not wait.
    ack: Option<oneshot::Sender<()>>,
}

/// A publish-subscribe bus keyed by topic.
///
/// The bus is a cheap handle; clones share the same underlying task.
pub struct EventBus<K, T> {
    /// The sender for subscribe requests.
    subscribe: mpsc::UnboundedSender<Subscribe<K, T>>,
    /// The sender for unsubscribe requests.
    unsubscribe: mpsc::UnboundedSender<Unsubscribe<K>>,
    /// The sender for published events.
    publish: mpsc::UnboundedSender<(K, T)>,
    /// The next subscriber identifier.
    next_id: Arc<AtomicU64>,
}

impl<K, T> Clone for EventBus<K, T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: self.subscribe.clone(),
            unsubscribe: self.unsubscribe.clone(),
            publish: self.publish.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<K, T> fmt::Debug for EventBus<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl<K, T> EventBus<K, T>
where
    K: Clone + Eq + Hash + fmt::Display + Send + 'static,
    T: Clone + Send + 'static,
{
    /// Spawns the task that owns the bus state and returns a handle to it.
    ///
    /// The task exits once every handle and subscription has been dropped.
    pub fn spawn() -> Self {
        let (subscribe, subscribe_rx) = mpsc::unbounded_channel();
        let (unsubscribe, unsubscribe_rx) = mpsc::unbounded_channel();
        let (publish, publish_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run(subscribe_rx, unsubscribe_rx, publish_rx));

        Self {
            subscribe,
            unsubscribe,
            publish,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an event to every current subscriber of the topic.
    pub fn publish(&self, topic: K, event: T) {
        if self.publish.send((topic, event)).is_err() {
            warn!("event bus has shut down: dropping published event");
        }
    }

    /// Subscribes to a topic.
    ///
    /// The subscription receives every event published to the topic after this
    /// method returns.
    pub async fn subscribe(&self, topic: K) -> Subscription<K, T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbox, events) = mpsc::unbounded_channel();
        let (ack, acked) = oneshot::channel();

        if self
            .subscribe
            .send(Subscribe {
                topic: topic.clone(),
                id,
                inbox,
                ack,
            })
            .is_ok()
        {
            // If the bus task is gone, the subscription simply never receives
            acked.await.ok();
        }

        Subscription {
            topic,
            id,
            events,
            unsubscribe: self.unsubscribe.clone(),
            closed: false,
        }
    }

    /// Runs the task that owns the subscriber map.
    async fn run(
        mut subscribe: mpsc::UnboundedReceiver<Subscribe<K, T>>,
        mut unsubscribe: mpsc::UnboundedReceiver<Unsubscribe<K>>,
        mut publish: mpsc::UnboundedReceiver<(K, T)>,
    ) {
        let mut topics: HashMap<K, HashMap<u64, mpsc::UnboundedSender<T>>> = HashMap::new();

        loop {
            select! {
                biased;

                request = subscribe.recv() => {
                    let Some(request) = request else { break };
                    topics
                        .entry(request.topic)
                        .or_default()
                        .insert(request.id, request.inbox);
                    request.ack.send(()).ok();
                }
                request = unsubscribe.recv() => {
                    let Some(request) = request else { break };
                    if let Some(subscribers) = topics.get_mut(&request.topic) {
                        subscribers.remove(&request.id);
                        if subscribers.is_empty() {
                            topics.remove(&request.topic);
                        }
                    }

                    if let Some(ack) = request.ack {
                        ack.send(()).ok();
                    }
                }
                published = publish.recv() => {
                    let Some((topic, event)) = published else { break };
                    match topics.get(&topic) {
                        Some(subscribers) => {
                            for inbox in subscribers.values() {
                                // A closed inbox is removed by its pending unsubscribe
                                inbox.send(event.clone()).ok();
                            }
                        }
                        None => debug!("no subscribers for topic `{topic}`: dropping event"),
                    }
                }
            }
        }

        debug!("event bus has shut down");
    }
}

/// A subscription to a single topic of an [`EventBus`].
///
/// Dropping the subscription unsubscribes without waiting for the removal to
/// be applied; use [`Subscription::close`] to wait.
pub struct Subscription<K, T>
where
    K: Clone,
{
    /// The subscribed topic.
    topic: K,
    /// The subscriber identifier.
    id: u64,
    /// The inbox of the subscriber.
    events: mpsc::UnboundedReceiver<T>,
    /// The sender used to unsubscribe.
    unsubscribe: mpsc::UnboundedSender<Unsubscribe<K>>,
    /// Whether or not the subscription was closed.
    closed: bool,
}

impl<K, T> Subscription<K, T>
where
    K: Clone,
{
    /// Gets the topic of the subscription.
    pub fn topic(&self) -> &K {
        &self.topic
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the bus has shut down and all buffered events have
    /// been received.
    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }

    /// Gets the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.events.try_recv().ok()
    }

    /// Closes the subscription.
    ///
    /// No further events are delivered once this method returns.
    pub async fn close(mut self) {
        self.closed = true;

        let (ack, acked) = oneshot::channel();
        if self
            .unsubscribe
            .send(Unsubscribe {
                topic: self.topic.clone(),
                id: self.id,
                ack: Some(ack),
            })
            .is_ok()
        {
            acked.await.ok();
        }
    }
}

impl<K, T> Drop for Subscription<K, T>
where
    K: Clone,
{
    fn drop(&mut self) {
        if !self.closed {
            self.unsubscribe
                .send(Unsubscribe {
                    topic: self.topic.clone(),
                    id: self.id,
                    ack: None,
                })
                .ok();
        }
    }
}
