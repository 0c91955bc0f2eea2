//! Buses: named publish/subscribe channels.
//!
//! A [`Bus`] fans each published message out to its subscribers, in
//! subscription order, by calling [`Component::receive_event`]. What happens
//! next depends on the subscriber: passive components run their handler
//! immediately, queued and active components enqueue.
//!
//! The two bus kinds differ in how delivery failures reach the publisher:
//!
//! - [`BusKind::Sync`]: a full subscriber queue is returned to the publisher
//!   as [`KronosError::QueueFull`] once every subscriber was attempted.
//! - [`BusKind::Async`]: full queues are logged and counted in the returned
//!   [`Delivery`]; publishing never fails because of a subscriber.
//!
//! Buses hold weak references only. A subscriber that was dropped is skipped
//! and pruned on the next publish. Subscribing the same component twice is a
//! no-op, so a component receives each publish at most once.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{trace, warn};

use crate::component::{Component, Receipt};
use crate::error::{KronosError, Result};
use crate::message::{EventMessage, MessageHandle, Opcode, Payload};
use crate::pool::MessagePool;

/// Delivery discipline of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// Delivery failures propagate to the publisher.
    Sync,
    /// Delivery is best effort; failures are only reported.
    Async,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Subscribers that accepted the message.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Destroyed subscribers that released the message unprocessed.
    pub discarded: usize,
}

/// A named publish/subscribe channel.
#[derive(Debug)]
pub struct Bus {
    name: String,
    kind: BusKind,
    pool: Arc<MessagePool>,
    subscribers: RwLock<Vec<Weak<Component>>>,
}

impl Bus {
    /// Create a bus publishing messages from `pool`.
    ///
    /// Buses are normally created through
    /// [`Framework::create_bus`](crate::Framework::create_bus), which also
    /// enforces name uniqueness.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: BusKind, pool: Arc<MessagePool>) -> Self {
        Self {
            name: name.into(),
            kind,
            pool,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The unique bus name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The delivery discipline.
    #[must_use]
    pub fn kind(&self) -> BusKind {
        self.kind
    }

    /// The pool messages on this bus live in.
    #[must_use]
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Attach a component.
    ///
    /// Returns `false` if the component was already subscribed, in which case
    /// nothing changes.
    pub fn subscribe(&self, component: &Arc<Component>) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let target = Arc::downgrade(component);
        if subscribers.iter().any(|s| Weak::ptr_eq(s, &target)) {
            trace!(bus = %self.name, component = component.name(), "already subscribed");
            return false;
        }
        subscribers.push(target);
        true
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    /// Returns `true` if `component` is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, component: &Arc<Component>) -> bool {
        let target = Arc::downgrade(component);
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| Weak::ptr_eq(s, &target))
    }

    fn live_subscribers(&self) -> Vec<Arc<Component>> {
        let (live, stale) = {
            let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            let live: Vec<_> = subscribers.iter().filter_map(Weak::upgrade).collect();
            let stale = live.len() != subscribers.len();
            (live, stale)
        };
        if stale {
            self.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| s.strong_count() > 0);
        }
        live
    }

    /// Publish a message, taking over the caller's reference to it.
    ///
    /// Each subscriber receives its own reference under a handle of its own;
    /// the caller's reference is released once every subscriber was handed
    /// the message, so `handle` must not be used or released afterwards.
    /// With no subscribers the message is freed immediately.
    ///
    /// # Errors
    ///
    /// - [`KronosError::MissingMessage`] if `handle` is stale.
    /// - [`KronosError::QueueFull`] on a [`BusKind::Sync`] bus when at least
    ///   one subscriber queue was full.
    pub fn publish(&self, handle: MessageHandle) -> Result<Delivery> {
        let subscribers = self.live_subscribers();
        let mut delivery = Delivery::default();
        let mut first_full = None;

        for subscriber in &subscribers {
            let reference = self.pool.retain(handle)?;
            match subscriber.receive_event(reference) {
                Ok(Receipt::Accepted) => delivery.delivered += 1,
                Ok(Receipt::Discarded) => delivery.discarded += 1,
                Err(err) => {
                    delivery.dropped += 1;
                    warn!(bus = %self.name, component = subscriber.name(), %err, "delivery failed");
                    if first_full.is_none() {
                        first_full = Some(subscriber.name().to_string());
                    }
                }
            }
        }
        self.pool.release(handle)?;

        trace!(
            bus = %self.name,
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            discarded = delivery.discarded,
            "published"
        );

        match (self.kind, first_full) {
            (BusKind::Sync, Some(component)) => Err(KronosError::QueueFull(component)),
            _ => Ok(delivery),
        }
    }

    /// Create a message in this bus's pool and publish it.
    ///
    /// # Errors
    ///
    /// - [`KronosError::UnexpectedPayload`] if a well-known opcode carries
    ///   the wrong payload. Nothing is published.
    /// - Otherwise see [`Bus::publish`].
    pub fn emit(
        &self,
        opcode: Opcode,
        payload: Payload,
        reply: Option<&Arc<Bus>>,
    ) -> Result<Delivery> {
        let mut message = EventMessage::new(opcode, payload);
        if let Some(reply) = reply {
            message = message.with_reply(reply);
        }
        message.validate()?;
        let handle = self.pool.insert(message);
        self.publish(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::component::{Concurrency, from_fn};
    use crate::config::PoolConfig;

    fn pool() -> Arc<MessagePool> {
        Arc::new(MessagePool::new(PoolConfig {
            abort_on_stale_release: false,
            initial_slots: 0,
        }))
    }

    /// A passive component appending `(name, opcode)` to a shared log.
    fn logger(
        name: &'static str,
        log: &Arc<Mutex<Vec<(&'static str, Opcode)>>>,
        pool: &Arc<MessagePool>,
    ) -> Arc<Component> {
        let log = Arc::clone(log);
        Component::new(
            name,
            Concurrency::Passive,
            from_fn(move |_, message| {
                log.lock().unwrap().push((name, message.opcode));
                Ok(())
            }),
            Arc::clone(pool),
        )
    }

    #[test]
    fn test_sync_publish_reaches_all_subscribers_in_order() {
        let pool = pool();
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        let a = logger("A", &log, &pool);
        let b = logger("B", &log, &pool);
        let c = logger("C", &log, &pool);
        for component in [&a, &b, &c] {
            assert!(bus.subscribe(component));
        }

        for code in 0..4 {
            let delivery = bus.emit(Opcode::user(code), Payload::Empty, None).unwrap();
            assert_eq!(delivery.delivered, 3);
            // Everything was handled before publish returned.
            assert_eq!(log.lock().unwrap().len(), 3 * (code as usize + 1));
        }

        let log = log.lock().unwrap();
        for name in ["A", "B", "C"] {
            let seen: Vec<_> = log.iter().filter(|(n, _)| *n == name).map(|(_, op)| *op).collect();
            assert_eq!(seen, (0..4).map(Opcode::user).collect::<Vec<_>>());
        }
        // Within one publish, subscription order.
        assert_eq!(log[0].0, "A");
        assert_eq!(log[1].0, "B");
        assert_eq!(log[2].0, "C");
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_duplicate_subscription_is_idempotent() {
        let pool = pool();
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        let a = logger("A", &log, &pool);

        assert!(bus.subscribe(&a));
        assert!(!bus.subscribe(&a));
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(Opcode::user(1), Payload::Empty, None).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_frees_message() {
        let pool = pool();
        let bus = Bus::new("B_EMPTY", BusKind::Async, Arc::clone(&pool));
        let delivery = bus.emit(Opcode::user(1), Payload::Empty, None).unwrap();
        assert_eq!(delivery, Delivery::default());
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let pool = pool();
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        let a = logger("A", &log, &pool);
        let b = logger("B", &log, &pool);
        bus.subscribe(&a);
        bus.subscribe(&b);
        drop(a);

        let delivery = bus.emit(Opcode::user(1), Payload::Empty, None).unwrap();
        assert_eq!(delivery.delivered, 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(*log.lock().unwrap(), vec![("B", Opcode::user(1))]);
    }

    #[test]
    fn test_async_bus_enqueues_and_reports_full_queue() {
        let pool = pool();
        let bus = Bus::new("BA_TEST", BusKind::Async, Arc::clone(&pool));
        let queued = Component::new(
            "CQ_TEST",
            Concurrency::queued(1),
            from_fn(|_, _| Ok(())),
            Arc::clone(&pool),
        );
        bus.subscribe(&queued);

        let first = bus.emit(Opcode::user(1), Payload::Empty, None).unwrap();
        assert_eq!(first, Delivery { delivered: 1, ..Delivery::default() });
        // Enqueued, not processed.
        assert_eq!(queued.stats().processed, 0);
        assert_eq!(pool.live(), 1);

        let second = bus.emit(Opcode::user(2), Payload::Empty, None).unwrap();
        assert_eq!(second, Delivery { dropped: 1, ..Delivery::default() });
        assert_eq!(pool.live(), 1);

        assert_eq!(queued.drain(), 1);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_sync_bus_propagates_full_queue() {
        let pool = pool();
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        let queued = Component::new(
            "CQ_TEST",
            Concurrency::queued(1),
            from_fn(|_, _| Ok(())),
            Arc::clone(&pool),
        );
        let passive = logger("P", &log, &pool);
        bus.subscribe(&queued);
        bus.subscribe(&passive);

        bus.emit(Opcode::user(1), Payload::Empty, None).unwrap();
        let err = bus.emit(Opcode::user(2), Payload::Empty, None).unwrap_err();
        assert!(matches!(err, KronosError::QueueFull(ref name) if name == "CQ_TEST"));
        // The remaining subscriber was still served.
        assert_eq!(log.lock().unwrap().len(), 2);

        queued.drain();
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_emit_rejects_mismatched_payload() {
        let pool = pool();
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        assert!(matches!(
            bus.emit(Opcode::HEALTH_PONG, Payload::Empty, None),
            Err(KronosError::UnexpectedPayload { .. })
        ));
        assert_eq!(pool.stats().created, 0);
    }

    #[test]
    fn test_publisher_cannot_release_delivered_message_again() {
        let pool = pool();
        let bus = Bus::new("BA_TEST", BusKind::Async, Arc::clone(&pool));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let queued = Component::new(
            "CQ_TEST",
            Concurrency::queued(4),
            from_fn(move |_, message| {
                log.lock().unwrap().push(message.opcode);
                Ok(())
            }),
            Arc::clone(&pool),
        );
        bus.subscribe(&queued);

        let handle = pool.create(Opcode::user(7), Payload::Empty, None);
        assert_eq!(bus.publish(handle).unwrap().delivered, 1);
        assert!(matches!(
            pool.release(handle),
            Err(KronosError::MissingMessage(h)) if h == handle
        ));
        assert_eq!(pool.live(), 1);

        assert_eq!(queued.drain(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Opcode::user(7)]);
        assert_eq!(queued.stats().failed, 0);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_destroyed_subscriber_counted_as_discarded() {
        let pool = pool();
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        let alive = logger("A", &log, &pool);
        let gone = logger("G", &log, &pool);
        bus.subscribe(&alive);
        bus.subscribe(&gone);
        gone.init().unwrap();
        gone.destroy().unwrap();

        let delivery = bus.emit(Opcode::user(1), Payload::Empty, None).unwrap();
        assert_eq!(
            delivery,
            Delivery {
                delivered: 1,
                dropped: 0,
                discarded: 1,
            }
        );
        assert_eq!(*log.lock().unwrap(), vec![("A", Opcode::user(1))]);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_publish_stale_handle_fails() {
        let pool = pool();
        let bus = Bus::new("B_TEST", BusKind::Sync, Arc::clone(&pool));
        let handle = pool.create(Opcode::user(1), Payload::Empty, None);
        pool.release(handle).unwrap();
        assert!(matches!(
            bus.publish(handle),
            Err(KronosError::MissingMessage(_))
        ));
    }
}
