//! Multi-rate tick scheduler.
//!
//! A single base timer drives every periodic activity. Each registered
//! worker (cadence) fires once every `tick_rate` base ticks:
//!
//! 1. Its counter is reset and a tick message carrying [`TickInfo`] is
//!    published on the worker's asynchronous bus.
//! 2. The worker's [`Worker`] implementation runs over the components
//!    attached to it.
//!
//! Scheduled events are the one-shot-per-interval counterpart: a message
//! delivered straight to one component every N base ticks.
//!
//! Worker and event tables are mutex-guarded so cadences can be attached
//! while the timer runs. The locks are released before anything is published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use kronos_core::{
    Bus, BusKind, Component, KronosError, MessagePool, Opcode, Payload, Result, SchedulerConfig,
    TickInfo, WorkerConfig,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::worker::Worker;

/// Name of the bus a worker publishes its ticks on.
#[must_use]
pub fn worker_bus_name(worker: &str) -> String {
    format!("BA_WORKER_{}", worker.to_uppercase())
}

struct ScheduledWorker {
    name: String,
    tick_rate: u16,
    counter: u16,
    fired: u64,
    opcode: Opcode,
    bus: Arc<Bus>,
    components: Vec<Arc<Component>>,
    worker: Arc<dyn Worker>,
}

struct ScheduledEvent {
    interval: u64,
    counter: u64,
    opcode: Opcode,
    component: Weak<Component>,
}

/// A worker that is due, copied out of the table so the lock can be dropped.
struct Firing {
    name: String,
    count: u64,
    opcode: Opcode,
    bus: Arc<Bus>,
    components: Vec<Arc<Component>>,
    worker: Arc<dyn Worker>,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// Worker name.
    pub name: String,
    /// Base ticks between firings.
    pub tick_rate: u16,
    /// Times the worker has fired.
    pub fired: u64,
    /// Number of attached components.
    pub components: usize,
}

/// The base-tick scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: Arc<MessagePool>,
    workers: Mutex<Vec<ScheduledWorker>>,
    events: Mutex<Vec<ScheduledEvent>>,
    ticks: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("base_interval_ms", &self.config.base_interval_ms)
            .field("ticks", &self.tick_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    /// Create a scheduler with no workers. Ticks and events are created in
    /// `pool`.
    #[must_use]
    pub fn new(config: SchedulerConfig, pool: Arc<MessagePool>) -> Self {
        Self {
            config,
            pool,
            workers: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
            timer: Mutex::new(None),
        }
    }

    /// The scheduler configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Base ticks processed so far.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Register a cadence publishing [`Opcode::SCHEDULER_TICK`].
    ///
    /// Returns the worker's bus, named by [`worker_bus_name`].
    ///
    /// # Errors
    ///
    /// See [`Scheduler::register_worker_config`].
    pub fn register_worker(
        &self,
        id: impl Into<String>,
        tick_rate: u16,
        worker: impl Worker + 'static,
    ) -> Result<Arc<Bus>> {
        self.register_worker_config(&WorkerConfig::new(id, tick_rate), worker)
    }

    /// Register a cadence from its configuration.
    ///
    /// # Errors
    ///
    /// - [`KronosError::AlreadyRegistered`] if the id is taken.
    /// - [`KronosError::InvalidConfig`] for a zero tick rate.
    pub fn register_worker_config(
        &self,
        config: &WorkerConfig,
        worker: impl Worker + 'static,
    ) -> Result<Arc<Bus>> {
        if config.tick_rate == 0 {
            return Err(KronosError::InvalidConfig(format!(
                "worker '{}' has a zero tick rate",
                config.name
            )));
        }

        let mut workers = lock(&self.workers);
        if workers.iter().any(|w| w.name == config.name) {
            return Err(KronosError::AlreadyRegistered(config.name.clone()));
        }

        let bus = Arc::new(Bus::new(
            worker_bus_name(&config.name),
            BusKind::Async,
            Arc::clone(&self.pool),
        ));
        workers.push(ScheduledWorker {
            name: config.name.clone(),
            tick_rate: config.tick_rate,
            counter: 0,
            fired: 0,
            opcode: config.opcode,
            bus: Arc::clone(&bus),
            components: Vec::new(),
            worker: Arc::new(worker),
        });
        debug!(worker = %config.name, tick_rate = config.tick_rate, "worker registered");
        Ok(bus)
    }

    /// Attach a component to a worker's cadence.
    ///
    /// The component is subscribed to the worker's bus and handed to the
    /// worker on every firing. Attaching twice has no further effect.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::UnknownWorker`] if `worker` was never
    /// registered.
    pub fn register_component(&self, worker: &str, component: &Arc<Component>) -> Result<()> {
        let mut workers = lock(&self.workers);
        let entry = workers
            .iter_mut()
            .find(|w| w.name == worker)
            .ok_or_else(|| KronosError::UnknownWorker(worker.to_string()))?;

        entry.bus.subscribe(component);
        if !entry.components.iter().any(|c| Arc::ptr_eq(c, component)) {
            entry.components.push(Arc::clone(component));
        }
        debug!(worker, component = component.name(), "component attached");
        Ok(())
    }

    /// The bus a worker publishes its ticks on.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::UnknownWorker`] if `worker` was never
    /// registered.
    pub fn worker_bus(&self, worker: &str) -> Result<Arc<Bus>> {
        lock(&self.workers)
            .iter()
            .find(|w| w.name == worker)
            .map(|w| Arc::clone(&w.bus))
            .ok_or_else(|| KronosError::UnknownWorker(worker.to_string()))
    }

    /// Status of every worker, in registration order.
    #[must_use]
    pub fn status(&self) -> Vec<WorkerStatus> {
        lock(&self.workers)
            .iter()
            .map(|w| WorkerStatus {
                name: w.name.clone(),
                tick_rate: w.tick_rate,
                fired: w.fired,
                components: w.components.len(),
            })
            .collect()
    }

    /// Deliver `opcode` to `component` every `interval`.
    ///
    /// The interval is rounded up to whole base ticks. Returns that number of
    /// ticks. The event stops once the component is dropped.
    pub fn schedule_event(
        &self,
        interval: Duration,
        opcode: Opcode,
        component: &Arc<Component>,
    ) -> u64 {
        let ticks = self.config.ticks_for(interval);
        lock(&self.events).push(ScheduledEvent {
            interval: ticks,
            counter: 0,
            opcode,
            component: Arc::downgrade(component),
        });
        debug!(component = component.name(), %opcode, ticks, "event scheduled");
        ticks
    }

    /// Process one base tick.
    ///
    /// Returns the names of the workers that fired, in registration order.
    pub fn tick(&self) -> Vec<String> {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let due: Vec<Firing> = lock(&self.workers)
            .iter_mut()
            .filter_map(|w| {
                w.counter += 1;
                if w.counter < w.tick_rate {
                    return None;
                }
                w.counter = 0;
                w.fired += 1;
                Some(Firing {
                    name: w.name.clone(),
                    count: w.fired,
                    opcode: w.opcode,
                    bus: Arc::clone(&w.bus),
                    components: w.components.clone(),
                    worker: Arc::clone(&w.worker),
                })
            })
            .collect();

        for firing in &due {
            let payload = Payload::Tick(TickInfo {
                worker: firing.name.clone(),
                count: firing.count,
            });
            if let Err(err) = firing.bus.emit(firing.opcode, payload, None) {
                warn!(worker = %firing.name, %err, "failed to publish tick");
            }
            firing.worker.run(&firing.name, &firing.components);
        }

        self.fire_events();
        due.into_iter().map(|f| f.name).collect()
    }

    fn fire_events(&self) {
        let due: Vec<(Opcode, Arc<Component>)> = {
            let mut events = lock(&self.events);
            events.retain(|e| e.component.strong_count() > 0);
            events
                .iter_mut()
                .filter_map(|e| {
                    e.counter += 1;
                    if e.counter < e.interval {
                        return None;
                    }
                    e.counter = 0;
                    e.component.upgrade().map(|c| (e.opcode, c))
                })
                .collect()
        };

        for (opcode, component) in due {
            let handle = self.pool.create(opcode, Payload::Empty, None);
            if let Err(err) = component.receive_event(handle) {
                warn!(component = component.name(), %opcode, %err, "scheduled event dropped");
            }
        }
    }

    /// Start the base timer on the current tokio runtime.
    ///
    /// Calls [`Scheduler::tick`] every base interval until
    /// [`Scheduler::stop_timer`] is called or the scheduler is dropped.
    /// Starting a running timer does nothing.
    ///
    /// # Errors
    ///
    /// - [`KronosError::TaskCreateFailed`] outside a tokio runtime.
    /// - [`KronosError::InvalidConfig`] for a zero base interval.
    pub fn spawn_timer(self: &Arc<Self>) -> Result<()> {
        let period = self.config.base_interval();
        if period.is_zero() {
            return Err(KronosError::InvalidConfig(
                "scheduler base interval must be at least 1 ms".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            KronosError::TaskCreateFailed {
                name: "scheduler timer".into(),
                reason: err.to_string(),
            }
        })?;

        let mut timer = lock(&self.timer);
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("scheduler timer already running");
            return Ok(());
        }

        let scheduler = Arc::downgrade(self);
        *timer = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.tick();
            }
        }));

        info!(interval_ms = self.config.base_interval_ms, "scheduler timer started");
        Ok(())
    }

    /// Stop the base timer, if running.
    pub fn stop_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
            info!(ticks = self.tick_count(), "scheduler timer stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use kronos_core::{Concurrency, EventMessage, PoolConfig, from_fn};

    use super::*;
    use crate::worker::QueueDrainer;

    fn pool() -> Arc<MessagePool> {
        Arc::new(MessagePool::new(PoolConfig {
            abort_on_stale_release: false,
            initial_slots: 0,
        }))
    }

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(SchedulerConfig::default(), pool()))
    }

    /// A passive component collecting the tick infos it receives.
    fn tick_sink(pool: &Arc<MessagePool>) -> (Arc<Component>, Arc<Mutex<Vec<TickInfo>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let component = Component::new(
            "CP_SINK",
            Concurrency::Passive,
            from_fn(move |_, message: &EventMessage| {
                sink.lock().unwrap().push(message.tick()?.clone());
                Ok(())
            }),
            Arc::clone(pool),
        );
        (component, seen)
    }

    #[test]
    fn test_rate_ten_fires_ten_times_in_hundred_ticks() {
        let scheduler = scheduler();
        scheduler.register_worker("fast", 10, QueueDrainer).unwrap();
        let (sink, seen) = tick_sink(&scheduler.pool);
        scheduler.register_component("fast", &sink).unwrap();

        let fired = (0..100).filter(|_| !scheduler.tick().is_empty()).count();
        assert_eq!(fired, 10);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], TickInfo { worker: "fast".into(), count: 1 });
        assert_eq!(seen[9].count, 10);
        assert_eq!(scheduler.pool.live(), 0);
    }

    #[test]
    fn test_workers_fire_at_their_own_rate() {
        let scheduler = scheduler();
        scheduler.register_worker("main", 1, QueueDrainer).unwrap();
        scheduler.register_worker("third", 3, QueueDrainer).unwrap();

        assert_eq!(scheduler.tick(), vec!["main"]);
        assert_eq!(scheduler.tick(), vec!["main"]);
        assert_eq!(scheduler.tick(), vec!["main", "third"]);
        assert_eq!(scheduler.tick_count(), 3);

        let status = scheduler.status();
        assert_eq!(status[0].fired, 3);
        assert_eq!(status[1].fired, 1);
    }

    #[test]
    fn test_registration_errors() {
        let scheduler = scheduler();
        let bus = scheduler.register_worker("2s", 40, QueueDrainer).unwrap();
        assert_eq!(bus.name(), "BA_WORKER_2S");
        assert_eq!(bus.kind(), BusKind::Async);

        assert!(matches!(
            scheduler.register_worker("2s", 40, QueueDrainer),
            Err(KronosError::AlreadyRegistered(name)) if name == "2s"
        ));
        assert!(matches!(
            scheduler.register_worker("never", 0, QueueDrainer),
            Err(KronosError::InvalidConfig(_))
        ));

        let (sink, _) = tick_sink(&scheduler.pool);
        assert!(matches!(
            scheduler.register_component("1h", &sink),
            Err(KronosError::UnknownWorker(name)) if name == "1h"
        ));
        assert!(scheduler.worker_bus("1h").is_err());
    }

    #[test]
    fn test_attached_queued_component_drained_on_firing() {
        let scheduler = scheduler();
        scheduler.register_worker("pair", 2, QueueDrainer).unwrap();
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let queued = Component::new(
            "CQ_WORK",
            Concurrency::queued(4),
            from_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Arc::clone(&scheduler.pool),
        );
        scheduler.register_component("pair", &queued).unwrap();
        scheduler.register_component("pair", &queued).unwrap();
        assert_eq!(scheduler.status()[0].components, 1);

        scheduler.tick();
        assert_eq!(processed.load(Ordering::SeqCst), 0);
        scheduler.tick();
        // The tick was enqueued and drained within the same firing.
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert_eq!(queued.pending(), 0);
    }

    #[test]
    fn test_scheduled_event_rounds_up_to_base_ticks() {
        let scheduler = scheduler();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&hits);
        let component = Component::new(
            "CP_PRM",
            Concurrency::Passive,
            from_fn(move |_, message: &EventMessage| {
                sink.lock().unwrap().push(message.opcode);
                Ok(())
            }),
            Arc::clone(&scheduler.pool),
        );

        let ticks = scheduler.schedule_event(Duration::from_millis(120), Opcode::SCHEDULED_EVENT, &component);
        assert_eq!(ticks, 3);
        for _ in 0..9 {
            scheduler.tick();
        }
        assert_eq!(*hits.lock().unwrap(), vec![Opcode::SCHEDULED_EVENT; 3]);

        drop(component);
        scheduler.tick();
        assert!(lock(&scheduler.events).is_empty());
    }

    #[test]
    fn test_timer_requires_runtime() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.spawn_timer(),
            Err(KronosError::TaskCreateFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_at_base_interval() {
        let scheduler = scheduler();
        scheduler.register_worker("main", 1, QueueDrainer).unwrap();
        scheduler.spawn_timer().unwrap();
        scheduler.spawn_timer().unwrap();

        tokio::time::sleep(Duration::from_millis(525)).await;
        let ticks = scheduler.tick_count();
        assert!((9..=11).contains(&ticks), "unexpected tick count {ticks}");

        scheduler.stop_timer();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.tick_count(), ticks);
    }
}
