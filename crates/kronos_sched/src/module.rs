//! The scheduler as a framework module.

use std::sync::Arc;

use kronos_core::{
    Component, Concurrency, EventMessage, Framework, Handler, Module, ModuleId, Result,
};
use tracing::trace;

use crate::scheduler::Scheduler;
use crate::worker::QueueDrainer;

/// Id of [`SchedModule`].
pub const SCHED_MODULE: ModuleId = ModuleId::new("sched");

/// Name of the scheduler's component.
pub const SCHEDULER_COMPONENT: &str = "CP_SCHEDULER";

/// Registers the scheduler component and the configured workers.
///
/// The timer starts in the component's `post_init`, once every component
/// exists, and stops when the component is destroyed.
#[derive(Debug)]
pub struct SchedModule {
    scheduler: Arc<Scheduler>,
}

impl SchedModule {
    /// Wrap a scheduler. Keep a clone of `scheduler` to attach components
    /// once the module is initialized.
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl Module for SchedModule {
    fn id(&self) -> ModuleId {
        SCHED_MODULE
    }

    fn name(&self) -> String {
        "Scheduler".into()
    }

    fn init(&self, framework: &mut Framework) -> Result<()> {
        framework.create_component(
            SCHEDULER_COMPONENT,
            Concurrency::Passive,
            SchedulerHandler {
                scheduler: Arc::clone(&self.scheduler),
            },
        )?;

        for worker in &self.scheduler.config().workers {
            let bus = self.scheduler.register_worker_config(worker, QueueDrainer)?;
            framework.add_bus(bus)?;
        }
        Ok(())
    }

    fn exported_components(&self) -> Vec<&str> {
        vec![SCHEDULER_COMPONENT]
    }
}

struct SchedulerHandler {
    scheduler: Arc<Scheduler>,
}

impl Handler for SchedulerHandler {
    fn post_init(&self, _component: &Component) -> Result<()> {
        self.scheduler.spawn_timer()
    }

    fn destroy(&self, _component: &Component) -> Result<()> {
        self.scheduler.stop_timer();
        Ok(())
    }

    fn process_event(&self, component: &Component, message: &EventMessage) -> Result<()> {
        trace!(component = component.name(), opcode = %message.opcode, "ignoring event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kronos_core::{KronosConfig, LifecycleState, PoolConfig};

    use super::*;
    use crate::scheduler::worker_bus_name;

    fn framework() -> Framework {
        Framework::new(KronosConfig {
            pool: PoolConfig {
                abort_on_stale_release: false,
                initial_slots: 0,
            },
            ..KronosConfig::default()
        })
    }

    #[test]
    fn test_init_registers_component_and_default_workers() {
        let mut fw = framework();
        let scheduler = Arc::new(Scheduler::new(
            fw.config().scheduler.clone(),
            Arc::clone(fw.pool()),
        ));
        fw.add_module(SchedModule::new(Arc::clone(&scheduler))).unwrap();
        fw.init_modules().unwrap();

        assert!(fw.component(SCHEDULER_COMPONENT).is_ok());
        for (name, rate) in [("main", 1), ("2s", 40), ("10s", 200)] {
            assert!(fw.bus(&worker_bus_name(name)).is_ok());
            assert!(scheduler.status().iter().any(|s| s.name == name && s.tick_rate == rate));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_spawns_timer_and_shutdown_stops_it() {
        let mut fw = framework();
        let scheduler = Arc::new(Scheduler::new(
            fw.config().scheduler.clone(),
            Arc::clone(fw.pool()),
        ));
        fw.add_module(SchedModule::new(Arc::clone(&scheduler))).unwrap();
        fw.init_modules().unwrap();
        fw.start().unwrap();

        tokio::time::sleep(Duration::from_millis(2_010)).await;
        let ticks = scheduler.tick_count();
        assert!(ticks >= 39, "only {ticks} ticks");
        // `main` fires on every base tick.
        assert_eq!(scheduler.status()[0].fired, ticks);

        fw.shutdown();
        assert_eq!(
            fw.component(SCHEDULER_COMPONENT).unwrap().state(),
            LifecycleState::Destroyed
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.tick_count(), ticks);
    }
}
