//! Liveness monitoring of active components.
//!
//! On every firing of its worker the monitor publishes a ping on
//! [`PING_BUS`], with [`PONG_BUS`] as the reply bus, then sweeps its records.
//! Active components answer pings on their own task, so a component whose
//! task is stuck stops answering. A component that has not answered within
//! [`HealthConfig::timeout`] is reported on every sweep until it answers
//! again. Reporting is all the monitor does.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kronos_core::{
    Bus, BusKind, Component, ConcurrencyKind, Delivery, EventMessage, Framework, Handler,
    HealthConfig, KronosError, MessagePool, Opcode, Payload, Result,
};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Bus the monitor pings on.
pub const PING_BUS: &str = "B_HEALTH_PING";

/// Bus active components answer on.
pub const PONG_BUS: &str = "B_HEALTH_PONG";

#[derive(Debug, Clone, Copy)]
struct Record {
    last_response: Instant,
    missed: u64,
}

/// Tracks when each registered active component last answered a ping.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    ping_bus: Arc<Bus>,
    pong_bus: Arc<Bus>,
    records: DashMap<String, Record>,
}

impl HealthMonitor {
    /// Create a monitor and its two buses in `pool`.
    #[must_use]
    pub fn new(config: HealthConfig, pool: &Arc<MessagePool>) -> Self {
        Self {
            config,
            ping_bus: Arc::new(Bus::new(PING_BUS, BusKind::Async, Arc::clone(pool))),
            pong_bus: Arc::new(Bus::new(PONG_BUS, BusKind::Async, Arc::clone(pool))),
            records: DashMap::new(),
        }
    }

    /// The monitor configuration.
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// The bus pings are published on.
    #[must_use]
    pub fn ping_bus(&self) -> &Arc<Bus> {
        &self.ping_bus
    }

    /// The bus pongs are expected on.
    #[must_use]
    pub fn pong_bus(&self) -> &Arc<Bus> {
        &self.pong_bus
    }

    /// Start monitoring an active component.
    ///
    /// The component counts as having answered at registration time and is
    /// subscribed to the ping bus.
    ///
    /// # Errors
    ///
    /// - [`KronosError::NotActive`] if the component is not active.
    /// - [`KronosError::AlreadyRegistered`] if it is already monitored.
    pub fn register_active_component(&self, component: &Arc<Component>) -> Result<()> {
        if component.kind() != ConcurrencyKind::Active {
            return Err(KronosError::NotActive(component.name().to_string()));
        }

        match self.records.entry(component.name().to_string()) {
            Entry::Occupied(entry) => {
                return Err(KronosError::AlreadyRegistered(entry.key().clone()));
            }
            Entry::Vacant(entry) => {
                entry.insert(Record {
                    last_response: Instant::now(),
                    missed: 0,
                });
            }
        }

        self.ping_bus.subscribe(component);
        debug!(component = component.name(), "monitoring component");
        Ok(())
    }

    /// Register every active component of `framework`.
    ///
    /// Returns how many components were registered.
    ///
    /// # Errors
    ///
    /// See [`HealthMonitor::register_active_component`].
    pub fn register_active_components(&self, framework: &Framework) -> Result<usize> {
        for component in framework.active_components() {
            self.register_active_component(component)?;
        }
        Ok(framework.active_components().len())
    }

    /// Returns `true` if `name` is monitored.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Number of monitored components.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.records.len()
    }

    /// How many sweeps have reported `name` since it last answered.
    #[must_use]
    pub fn missed(&self, name: &str) -> Option<u64> {
        self.records.get(name).map(|r| r.missed)
    }

    /// Publish a ping to every monitored component.
    ///
    /// # Errors
    ///
    /// Only pool errors; delivery to the asynchronous ping bus never fails.
    pub fn ping_components(&self) -> Result<Delivery> {
        let delivery = self
            .ping_bus
            .emit(Opcode::HEALTH_PING, Payload::Empty, Some(&self.pong_bus))?;
        trace!(delivered = delivery.delivered, dropped = delivery.dropped, "pinged components");
        Ok(delivery)
    }

    /// Record an answer from `name`.
    ///
    /// Returns `false` if `name` is not monitored.
    pub fn record_pong(&self, name: &str) -> bool {
        let Some(mut record) = self.records.get_mut(name) else {
            warn!(component = name, "pong from unmonitored component");
            return false;
        };
        if record.missed > 0 {
            debug!(component = name, missed = record.missed, "component responsive again");
        }
        record.last_response = Instant::now();
        record.missed = 0;
        true
    }

    /// Report every component that has not answered within the timeout.
    ///
    /// Returns their names, sorted.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let timeout = self.config.timeout();

        let mut unresponsive = Vec::new();
        for mut record in self.records.iter_mut() {
            let silent = now.duration_since(record.last_response);
            if silent < timeout {
                continue;
            }
            record.missed += 1;
            error!(
                component = record.key().as_str(),
                silent_ms = u64::try_from(silent.as_millis()).unwrap_or(u64::MAX),
                missed = record.missed,
                "component unresponsive"
            );
            unresponsive.push(record.key().clone());
        }
        unresponsive.sort();
        unresponsive
    }
}

impl Handler for HealthMonitor {
    fn process_event(&self, _component: &Component, message: &EventMessage) -> Result<()> {
        match message.opcode {
            Opcode::HEALTH_PONG => {
                self.record_pong(message.component()?);
            }
            Opcode::SCHEDULER_TICK => {
                self.ping_components()?;
                self.sweep();
            }
            opcode => trace!(%opcode, "ignoring event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kronos_core::{Concurrency, PoolConfig, from_fn};

    use super::*;

    fn pool() -> Arc<MessagePool> {
        Arc::new(MessagePool::new(PoolConfig {
            abort_on_stale_release: false,
            initial_slots: 0,
        }))
    }

    fn active(name: &str, pool: &Arc<MessagePool>) -> Arc<Component> {
        Component::new(name, Concurrency::active(4), from_fn(|_, _| Ok(())), Arc::clone(pool))
    }

    #[test]
    fn test_registration_rules() {
        let pool = pool();
        let monitor = HealthMonitor::new(HealthConfig::default(), &pool);
        let worker = active("CA_WORKER", &pool);

        monitor.register_active_component(&worker).unwrap();
        assert!(monitor.is_registered("CA_WORKER"));
        assert!(monitor.ping_bus().is_subscribed(&worker));
        assert!(matches!(
            monitor.register_active_component(&worker),
            Err(KronosError::AlreadyRegistered(name)) if name == "CA_WORKER"
        ));

        let passive = Component::new("CP_X", Concurrency::Passive, from_fn(|_, _| Ok(())), Arc::clone(&pool));
        assert!(matches!(
            monitor.register_active_component(&passive),
            Err(KronosError::NotActive(_))
        ));
        assert_eq!(monitor.registered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reports_only_silent_components() {
        let pool = pool();
        let monitor = HealthMonitor::new(HealthConfig::default(), &pool);
        let alive = active("CA_ALIVE", &pool);
        let silent = active("CA_SILENT", &pool);
        monitor.register_active_component(&alive).unwrap();
        monitor.register_active_component(&silent).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(monitor.sweep().is_empty());
        assert!(monitor.record_pong("CA_ALIVE"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(monitor.sweep(), vec!["CA_SILENT"]);
        assert_eq!(monitor.missed("CA_SILENT"), Some(1));
        assert_eq!(monitor.missed("CA_ALIVE"), Some(0));

        // Reported once per sweep while it stays silent.
        assert_eq!(monitor.sweep(), vec!["CA_SILENT"]);
        assert_eq!(monitor.missed("CA_SILENT"), Some(2));

        assert!(monitor.record_pong("CA_SILENT"));
        assert!(monitor.sweep().is_empty());
        assert_eq!(monitor.missed("CA_SILENT"), Some(0));
    }

    #[test]
    fn test_pong_from_unknown_component_ignored() {
        let pool = pool();
        let monitor = HealthMonitor::new(HealthConfig::default(), &pool);
        assert!(!monitor.record_pong("CA_GHOST"));
        assert_eq!(monitor.registered(), 0);
    }

    #[test]
    fn test_ping_carries_pong_bus_as_reply() {
        let pool = pool();
        let monitor = HealthMonitor::new(HealthConfig::default(), &pool);
        let worker = active("CA_WORKER", &pool);
        monitor.register_active_component(&worker).unwrap();

        // Not started, so the ping waits in the queue.
        let delivery = monitor.ping_components().unwrap();
        assert_eq!(delivery.delivered, 1);
        assert_eq!(worker.pending(), 1);
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_dispatches_on_opcode() {
        let pool = pool();
        let monitor = Arc::new(HealthMonitor::new(HealthConfig::default(), &pool));
        let component = Component::new("CQ_MON", Concurrency::queued(8), Arc::clone(&monitor), Arc::clone(&pool));
        let worker = active("CA_WORKER", &pool);
        monitor.register_active_component(&worker).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let pong = pool.create(Opcode::HEALTH_PONG, Payload::Component("CA_WORKER".into()), None);
        component.receive_event(pong).unwrap();
        let tick = pool.create(
            Opcode::SCHEDULER_TICK,
            Payload::Tick(kronos_core::TickInfo {
                worker: "2s".into(),
                count: 3,
            }),
            None,
        );
        component.receive_event(tick).unwrap();

        assert_eq!(component.drain(), 2);
        // The pong was handled before the sweep.
        assert_eq!(monitor.missed("CA_WORKER"), Some(0));
        assert_eq!(worker.pending(), 1);
        assert_eq!(component.stats().failed, 0);
    }
}
