//! An append-only chain of immutable events.
//!
//! Producers append by consuming a one-shot [`EventEmitter`]; consumers
//! hold an `Arc` cursor into the chain and either peek synchronously
//! ([`ChainedEvent::next_now`]) or await the next link
//! ([`ChainedEvent::next`]). Nodes are immutable once linked, so any number
//! of consumers can walk the chain at their own pace while the producer
//! runs ahead.
//!
//! The emitter is moved, not copied: each node yields exactly one emitter,
//! and emitting returns the emitter for the following slot. Payload type is
//! fixed per chain by the type parameter.

use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

/// One link in an event chain.
pub struct ChainedEvent<P> {
    payload: P,
    next: OnceLock<Arc<ChainedEvent<P>>>,
    appended: Notify,
}

impl<P> ChainedEvent<P> {
    /// Creates an unlinked head node, returning it along with the emitter
    /// for the slot after it.
    pub fn new(payload: P) -> (Arc<Self>, EventEmitter<P>) {
        let node = Arc::new(Self {
            payload,
            next: OnceLock::new(),
            appended: Notify::new(),
        });
        let emitter = EventEmitter {
            node: Arc::clone(&node),
        };
        (node, emitter)
    }

    /// Creates a node already linked to a known successor. Such a node is
    /// not a producer and yields no emitter.
    pub fn with_next(payload: P, next: Arc<ChainedEvent<P>>) -> Arc<Self> {
        let node = Self {
            payload,
            next: OnceLock::new(),
            appended: Notify::new(),
        };
        let _ = node.next.set(next);
        Arc::new(node)
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// The next event, if it has been emitted. Synchronously consistent:
    /// the instant an emit completes, this returns the new node.
    pub fn next_now(&self) -> Option<Arc<ChainedEvent<P>>> {
        self.next.get().cloned()
    }

    /// Waits for the next event to be appended.
    pub async fn next(&self) -> Arc<ChainedEvent<P>> {
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();
            if let Some(next) = self.next_now() {
                return next;
            }
            appended.await;
        }
    }

    /// Walks to the last event currently in the chain.
    pub fn latest(self: &Arc<Self>) -> Arc<ChainedEvent<P>> {
        let mut node = Arc::clone(self);
        while let Some(next) = node.next_now() {
            node = next;
        }
        node
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for ChainedEvent<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedEvent")
            .field("payload", &self.payload)
            .field("linked", &self.next.get().is_some())
            .finish()
    }
}

/// The one-shot capability to append the next event to a chain.
pub struct EventEmitter<P> {
    node: Arc<ChainedEvent<P>>,
}

impl<P> EventEmitter<P> {
    /// Appends a new event, consuming this emitter and returning the one
    /// for the slot after the new event.
    pub fn emit(self, payload: P) -> EventEmitter<P> {
        let (node, emitter) = ChainedEvent::new(payload);
        // The emitter is the sole writer of this slot, so the set cannot
        // collide.
        let _ = self.node.next.set(node);
        self.node.appended.notify_waiters();
        emitter
    }

    /// The node this emitter would append after.
    pub fn event(&self) -> &Arc<ChainedEvent<P>> {
        &self.node
    }
}

impl<P> std::fmt::Debug for EventEmitter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_links_synchronously() {
        let (head, emitter) = ChainedEvent::new(1u32);
        assert!(head.next_now().is_none());

        let emitter = emitter.emit(2);
        let second = head.next_now().expect("linked after emit");
        assert_eq!(*second.payload(), 2);
        assert!(second.next_now().is_none());

        emitter.emit(3);
        assert_eq!(*second.next_now().unwrap().payload(), 3);
    }

    #[test]
    fn with_next_is_prelinked() {
        let (tail, _emitter) = ChainedEvent::new(2u32);
        let head = ChainedEvent::with_next(1u32, tail);
        assert_eq!(*head.next_now().unwrap().payload(), 2);
    }

    #[test]
    fn latest_walks_to_the_tail() {
        let (head, emitter) = ChainedEvent::new(0u32);
        let mut emitter = emitter;
        for n in 1..=5 {
            emitter = emitter.emit(n);
        }
        assert_eq!(*head.latest().payload(), 5);
    }

    #[tokio::test]
    async fn consumers_await_the_next_link() {
        let (head, emitter) = ChainedEvent::new(0u32);

        let consumer = {
            let head = Arc::clone(&head);
            tokio::spawn(async move {
                let next = head.next().await;
                *next.payload()
            })
        };
        tokio::task::yield_now().await;

        emitter.emit(42);
        assert_eq!(consumer.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn every_consumer_sees_every_event() {
        let (head, emitter) = ChainedEvent::new(0u32);

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let head = Arc::clone(&head);
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut node = head;
                for _ in 0..3 {
                    node = node.next().await;
                    seen.push(*node.payload());
                }
                seen
            }));
        }
        tokio::task::yield_now().await;

        let mut emitter = emitter;
        for n in 1..=3 {
            emitter = emitter.emit(n);
        }
        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), vec![1, 2, 3]);
        }
    }
}
