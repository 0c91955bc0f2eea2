//! Worker implementations run after each firing of a cadence.

use std::sync::Arc;

use kronos_core::{Component, ConcurrencyKind};
use tracing::trace;

/// Work performed over a cadence's attached components each time it fires.
///
/// Runs on the timer task, after the tick message was published on the
/// cadence's bus.
pub trait Worker: Send + Sync {
    /// Run over the components attached to the cadence `worker`.
    fn run(&self, worker: &str, components: &[Arc<Component>]);
}

/// Drains every attached queued component.
///
/// This is what gives queued components their cooperative, same-thread
/// processing: messages pile up in their queues and are handled here, one
/// component at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDrainer;

impl Worker for QueueDrainer {
    fn run(&self, worker: &str, components: &[Arc<Component>]) {
        for component in components {
            if component.kind() != ConcurrencyKind::Queued {
                continue;
            }
            let processed = component.drain();
            if processed > 0 {
                trace!(worker, component = component.name(), processed, "drained queue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kronos_core::{Concurrency, MessagePool, Opcode, Payload, PoolConfig, from_fn};

    use super::*;

    #[test]
    fn test_drainer_only_drains_queued_components() {
        let pool = Arc::new(MessagePool::new(PoolConfig {
            abort_on_stale_release: false,
            initial_slots: 0,
        }));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let queued = Component::new(
            "CQ_A",
            Concurrency::queued(4),
            from_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Arc::clone(&pool),
        );
        let passive = Component::new("CP_B", Concurrency::Passive, from_fn(|_, _| Ok(())), Arc::clone(&pool));

        for code in 0..3 {
            let handle = pool.create(Opcode::user(code), Payload::Empty, None);
            queued.receive_event(handle).unwrap();
        }
        QueueDrainer.run("main", &[Arc::clone(&passive), Arc::clone(&queued)]);

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(queued.pending(), 0);
        assert_eq!(pool.live(), 0);
    }
}
