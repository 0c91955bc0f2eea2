//! The command dispatcher as a framework module.

use std::sync::Arc;

use kronos_core::config::WORKER_MAIN;
use kronos_core::{Concurrency, Framework, Module, ModuleId, Result};
use kronos_sched::{SCHED_MODULE, Scheduler};

use crate::dispatcher::CommandDispatcher;

/// Id of [`CmdModule`].
pub const CMD_MODULE: ModuleId = ModuleId::new("cmd");

/// Name of the dispatcher's component.
pub const COMMAND_DISPATCHER_COMPONENT: &str = "CQ_COMMAND_DISPATCHER";

/// Registers the command bus and a queued dispatcher component drained on
/// every base tick.
#[derive(Debug)]
pub struct CmdModule {
    dispatcher: Arc<CommandDispatcher>,
    scheduler: Arc<Scheduler>,
}

impl CmdModule {
    /// Wire `dispatcher` to the `main` worker of `scheduler`.
    #[must_use]
    pub fn new(dispatcher: Arc<CommandDispatcher>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            dispatcher,
            scheduler,
        }
    }
}

impl Module for CmdModule {
    fn id(&self) -> ModuleId {
        CMD_MODULE
    }

    fn name(&self) -> String {
        "Command dispatcher".into()
    }

    fn init(&self, framework: &mut Framework) -> Result<()> {
        framework.add_bus(Arc::clone(self.dispatcher.command_bus()))?;

        let queue = framework.config().queue;
        let component = framework.create_component(
            COMMAND_DISPATCHER_COMPONENT,
            Concurrency::Queued(queue),
            Arc::clone(&self.dispatcher),
        )?;
        self.dispatcher.command_bus().subscribe(&component);
        self.scheduler.register_component(WORKER_MAIN, &component)
    }

    fn dependencies(&self) -> Vec<ModuleId> {
        vec![SCHED_MODULE]
    }

    fn exported_components(&self) -> Vec<&str> {
        vec![COMMAND_DISPATCHER_COMPONENT]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use kronos_core::{KronosConfig, PoolConfig};
    use kronos_sched::SchedModule;

    use super::*;
    use crate::dispatcher::{COMMAND_BUS, Command, CommandId};

    #[tokio::test(start_paused = true)]
    async fn test_commands_run_on_base_tick() {
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
        let dispatcher = Arc::new(CommandDispatcher::new(fw.pool()));
        fw.add_module(CmdModule::new(Arc::clone(&dispatcher), Arc::clone(&scheduler)))
            .unwrap();
        fw.add_module(SchedModule::new(Arc::clone(&scheduler))).unwrap();
        fw.init_modules().unwrap();

        assert_eq!(fw.module_order(), &[SCHED_MODULE, CMD_MODULE]);
        assert!(fw.bus(COMMAND_BUS).is_ok());

        let total = Arc::new(AtomicU32::new(0));
        let sum = Arc::clone(&total);
        dispatcher
            .register_command(CommandId(7), move |command| {
                sum.fetch_add(command.parameter::<u32>()?, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        fw.start().unwrap();
        dispatcher
            .submit(&Command::with_parameter(CommandId(7), &5_u32).unwrap())
            .unwrap();
        dispatcher
            .submit(&Command::with_parameter(CommandId(7), &6_u32).unwrap())
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(total.load(Ordering::SeqCst), 11);

        fw.shutdown();
        assert_eq!(fw.pool().live(), 0);
    }
}
