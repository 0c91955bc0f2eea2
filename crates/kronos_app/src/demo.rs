//! Demo module: a telemetry producer and a queued logger.
//!
//! `CA_TELEMETRY` (active) samples on every `2s` tick and publishes the
//! sample on `B_TELEMETRY`. `CQ_LOGGER` (queued, drained by the `2s` worker)
//! logs each sample and, on a scheduled event, submits the `SUMMARY` command
//! that prints pool usage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kronos_core::{
    Bus, BusKind, Component, Concurrency, EventMessage, Framework, Handler, Module, ModuleId, Opcode,
    Payload, Result,
};
use kronos_cmd::{CMD_MODULE, Command, CommandDispatcher, CommandId};
use kronos_core::config::WORKER_2S;
use kronos_sched::{SCHED_MODULE, Scheduler};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const DEMO_MODULE: ModuleId = ModuleId::new("demo");
const TELEMETRY_COMPONENT: &str = "CA_TELEMETRY";
const LOGGER_COMPONENT: &str = "CQ_LOGGER";
const TELEMETRY_BUS: &str = "B_TELEMETRY";

/// Opcode of a telemetry sample.
const SAMPLE: Opcode = Opcode::user(1);

/// Logs pool usage; the parameter is the number of samples received.
const SUMMARY: CommandId = CommandId(1);

const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct Sample {
    seq: u64,
    tick: u64,
}

pub struct DemoModule {
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<CommandDispatcher>,
}

impl DemoModule {
    pub fn new(scheduler: Arc<Scheduler>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            scheduler,
            dispatcher,
        }
    }
}

impl Module for DemoModule {
    fn id(&self) -> ModuleId {
        DEMO_MODULE
    }

    fn init(&self, framework: &mut Framework) -> Result<()> {
        let queue = framework.config().queue;
        let bus = framework.create_bus(TELEMETRY_BUS, BusKind::Sync)?;

        let pool = Arc::clone(framework.pool());
        self.dispatcher.register_command(SUMMARY, move |command| {
            let stats = pool.stats();
            info!(
                received = command.parameter::<u64>()?,
                live_messages = stats.live,
                created = stats.created,
                "summary"
            );
            Ok(())
        })?;

        let telemetry = framework.create_component(
            TELEMETRY_COMPONENT,
            Concurrency::active(queue.capacity),
            Telemetry {
                bus,
                seq: AtomicU64::new(0),
            },
        )?;
        let logger = framework.create_component(
            LOGGER_COMPONENT,
            Concurrency::Queued(queue),
            Logger {
                dispatcher: Arc::clone(&self.dispatcher),
                received: AtomicU64::new(0),
            },
        )?;
        framework.subscribe(TELEMETRY_BUS, LOGGER_COMPONENT)?;

        self.scheduler.register_component(WORKER_2S, &telemetry)?;
        self.scheduler.register_component(WORKER_2S, &logger)?;
        self.scheduler
            .schedule_event(SUMMARY_INTERVAL, Opcode::SCHEDULED_EVENT, &logger);
        Ok(())
    }

    fn dependencies(&self) -> Vec<ModuleId> {
        vec![SCHED_MODULE, CMD_MODULE]
    }

    fn exported_components(&self) -> Vec<&str> {
        vec![TELEMETRY_COMPONENT, LOGGER_COMPONENT]
    }
}

struct Telemetry {
    bus: Arc<Bus>,
    seq: AtomicU64,
}

impl Handler for Telemetry {
    fn process_event(&self, component: &Component, message: &EventMessage) -> Result<()> {
        if message.opcode != Opcode::SCHEDULER_TICK {
            return Ok(());
        }
        let sample = Sample {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            tick: message.tick()?.count,
        };
        debug!(component = component.name(), seq = sample.seq, "sampling");
        self.bus.emit(SAMPLE, Payload::encode(&sample)?, None)?;
        Ok(())
    }
}

struct Logger {
    dispatcher: Arc<CommandDispatcher>,
    received: AtomicU64,
}

impl Handler for Logger {
    fn process_event(&self, component: &Component, message: &EventMessage) -> Result<()> {
        match message.opcode {
            SAMPLE => {
                let sample: Sample = message.decode()?;
                self.received.fetch_add(1, Ordering::Relaxed);
                info!(component = component.name(), seq = sample.seq, tick = sample.tick, "telemetry sample");
            }
            Opcode::SCHEDULED_EVENT => {
                let received = self.received.load(Ordering::Relaxed);
                self.dispatcher
                    .submit(&Command::with_parameter(SUMMARY, &received)?)?;
            }
            _ => {}
        }
        Ok(())
    }
}
