//! Process-wide publish/subscribe fabric.
//!
//! Producers and consumers never reference each other directly: the watch
//! engine publishes deliveries on [`Topic::Outbound`], the session forwards
//! that topic to the socket, and the client facade waits on
//! [`Topic::Correlated`] keys derived from the request it sent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::frame::Frame;
use crate::router::CorrelationKey;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Session-control frames (registration codes) after they were handled.
    Control,
    /// Frames waiting to be written to the relay connection.
    Outbound,
    /// Replies and watch deliveries for one outstanding client request.
    Correlated(CorrelationKey),
}

enum Sink {
    Persistent(mpsc::UnboundedSender<Frame>),
    Once(oneshot::Sender<Frame>),
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    topics: HashMap<Topic, Vec<Subscriber>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventBus")
            .field("topics", &inner.topics.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a persistent subscription. It lives until the returned
    /// handle is dropped or the topic is closed.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(topic.clone(), Sink::Persistent(tx));
        Subscription {
            id,
            topic,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a one-shot subscription that is removed after its first
    /// delivery, or when the returned handle is dropped undelivered.
    pub fn once(&self, topic: Topic) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let id = self.register(topic.clone(), Sink::Once(tx));
        PendingReply {
            id,
            topic,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    fn register(&self, topic: Topic, sink: Sink) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .topics
            .entry(topic)
            .or_default()
            .push(Subscriber { id, sink });
        id
    }

    /// Delivers `frame` to every live subscriber of `topic`. Returns whether
    /// anyone received it.
    pub fn publish(&self, topic: &Topic, frame: Frame) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscribers) = inner.topics.get_mut(topic) else {
            return false;
        };
        let mut delivered = false;
        let mut kept = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers.drain(..) {
            match subscriber.sink {
                Sink::Persistent(tx) => {
                    if tx.send(frame.clone()).is_ok() {
                        delivered = true;
                        kept.push(Subscriber {
                            id: subscriber.id,
                            sink: Sink::Persistent(tx),
                        });
                    }
                }
                Sink::Once(tx) => {
                    if tx.send(frame.clone()).is_ok() {
                        delivered = true;
                    }
                }
            }
        }
        if kept.is_empty() {
            inner.topics.remove(topic);
        } else {
            *subscribers = kept;
        }
        delivered
    }

    /// Publishes `frame` on every topic with live subscribers that satisfies
    /// `matches`. Returns the number of topics reached.
    pub fn publish_where(&self, matches: impl Fn(&Topic) -> bool, frame: Frame) -> usize {
        let topics: Vec<Topic> = self
            .inner
            .lock()
            .topics
            .keys()
            .filter(|topic| matches(topic))
            .cloned()
            .collect();
        topics
            .iter()
            .filter(|topic| self.publish(topic, frame.clone()))
            .count()
    }

    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|subs| !subs.is_empty())
            .unwrap_or(false)
    }

    /// Drops every subscriber of `topic`; their receivers observe end-of-stream.
    pub fn close(&self, topic: &Topic) -> usize {
        self.inner
            .lock()
            .topics
            .remove(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// Receiving side of a persistent subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<Frame>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        unregister(&self.bus, &self.topic, self.id);
    }
}

/// Receiving side of a one-shot subscription.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    topic: Topic,
    rx: oneshot::Receiver<Frame>,
    bus: Weak<Mutex<BusInner>>,
}

impl PendingReply {
    /// Waits for the delivery. `None` when the topic was closed first.
    pub async fn recv(mut self) -> Option<Frame> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        unregister(&self.bus, &self.topic, self.id);
    }
}

fn unregister(bus: &Weak<Mutex<BusInner>>, topic: &Topic, id: u64) {
    let Some(inner) = bus.upgrade() else {
        return;
    };
    let mut inner = inner.lock();
    if let Some(subs) = inner.topics.get_mut(topic) {
        subs.retain(|s| s.id != id);
        if subs.is_empty() {
            inner.topics.remove(topic);
        }
    }
}
