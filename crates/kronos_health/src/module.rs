//! The health monitor as a framework module.

use std::sync::Arc;

use kronos_core::{Concurrency, Framework, Module, ModuleId, Result};
use kronos_sched::{SCHED_MODULE, Scheduler};

use crate::monitor::HealthMonitor;

/// Id of [`HealthModule`].
pub const HEALTH_MODULE: ModuleId = ModuleId::new("health");

/// Name of the monitor's component.
pub const HEALTH_MONITOR_COMPONENT: &str = "CQ_HEALTH_MONITOR";

/// Registers the monitor component and its buses, and attaches the monitor
/// to its configured worker.
///
/// Active components are registered with the monitor separately, usually
/// with [`HealthMonitor::register_active_components`] once every module is
/// initialized.
#[derive(Debug)]
pub struct HealthModule {
    monitor: Arc<HealthMonitor>,
    scheduler: Arc<Scheduler>,
}

impl HealthModule {
    /// Wire `monitor` to `scheduler`.
    #[must_use]
    pub fn new(monitor: Arc<HealthMonitor>, scheduler: Arc<Scheduler>) -> Self {
        Self { monitor, scheduler }
    }
}

impl Module for HealthModule {
    fn id(&self) -> ModuleId {
        HEALTH_MODULE
    }

    fn name(&self) -> String {
        "Health monitor".into()
    }

    fn init(&self, framework: &mut Framework) -> Result<()> {
        framework.add_bus(Arc::clone(self.monitor.ping_bus()))?;
        framework.add_bus(Arc::clone(self.monitor.pong_bus()))?;

        let queue = framework.config().queue;
        let component = framework.create_component(
            HEALTH_MONITOR_COMPONENT,
            Concurrency::Queued(queue),
            Arc::clone(&self.monitor),
        )?;
        self.monitor.pong_bus().subscribe(&component);
        self.scheduler
            .register_component(&self.monitor.config().worker, &component)
    }

    fn dependencies(&self) -> Vec<ModuleId> {
        vec![SCHED_MODULE]
    }

    fn exported_components(&self) -> Vec<&str> {
        vec![HEALTH_MONITOR_COMPONENT]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kronos_core::{Component, KronosConfig, KronosError, PoolConfig, from_fn};
    use kronos_sched::SchedModule;

    use super::*;
    use crate::monitor::{PING_BUS, PONG_BUS};

    struct Boot {
        fw: Framework,
        scheduler: Arc<Scheduler>,
        monitor: Arc<HealthMonitor>,
    }

    fn boot() -> Boot {
        let mut fw = Framework::new(KronosConfig {
            pool: PoolConfig {
                abort_on_stale_release: false,
                initial_slots: 0,
            },
            ..KronosConfig::default()
        });
        let scheduler = Arc::new(Scheduler::new(
            fw.config().scheduler.clone(),
            Arc::clone(fw.pool()),
        ));
        let monitor = Arc::new(HealthMonitor::new(fw.config().health.clone(), fw.pool()));
        // Registered before its dependency on purpose.
        fw.add_module(HealthModule::new(Arc::clone(&monitor), Arc::clone(&scheduler)))
            .unwrap();
        fw.add_module(SchedModule::new(Arc::clone(&scheduler))).unwrap();
        Boot {
            fw,
            scheduler,
            monitor,
        }
    }

    #[test]
    fn test_init_after_scheduler() {
        let Boot { mut fw, scheduler, .. } = boot();
        fw.init_modules().unwrap();

        assert_eq!(fw.module_order(), &[SCHED_MODULE, HEALTH_MODULE]);
        assert!(fw.bus(PING_BUS).is_ok());
        assert!(fw.bus(PONG_BUS).is_ok());
        let status = scheduler.status();
        let two_seconds = status.iter().find(|s| s.name == "2s").unwrap();
        assert_eq!(two_seconds.components, 1);
    }

    #[test]
    fn test_without_scheduler_module_fails() {
        let mut fw = Framework::new(KronosConfig::default());
        let scheduler = Arc::new(Scheduler::new(
            fw.config().scheduler.clone(),
            Arc::clone(fw.pool()),
        ));
        let monitor = Arc::new(HealthMonitor::new(fw.config().health.clone(), fw.pool()));
        fw.add_module(HealthModule::new(monitor, scheduler)).unwrap();
        assert!(matches!(
            fw.init_modules(),
            Err(KronosError::MissingModule(id)) if id == SCHED_MODULE
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_component_reported_responder_not() {
        let Boot {
            mut fw,
            scheduler,
            monitor,
        } = boot();
        fw.init_modules().unwrap();
        let alive = fw
            .create_component("CA_ALIVE", Concurrency::active(4), from_fn(|_, _| Ok(())))
            .unwrap();
        // Initialized but never started, so its task never answers.
        let stalled = Component::new(
            "CA_STALLED",
            Concurrency::active(4),
            from_fn(|_, _| Ok(())),
            Arc::clone(fw.pool()),
        );

        fw.start().unwrap();
        stalled.init().unwrap();
        assert_eq!(monitor.register_active_components(&fw).unwrap(), 1);
        monitor.register_active_component(&stalled).unwrap();

        // Sweeps run at 2 s, 4 s, 6 s, 8 s and 10 s.
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(monitor.missed("CA_ALIVE"), Some(0));
        assert_eq!(monitor.missed("CA_STALLED"), Some(3));
        assert!(alive.stats().processed >= 4);

        fw.shutdown();
        stalled.destroy().unwrap();
        assert!(scheduler.tick_count() >= 200);
    }
}
