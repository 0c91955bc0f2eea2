//! # kronos_core
//!
//! Orchestration kernel of the Kronos component framework.
//!
//! This crate provides:
//!
//! - [`framework`]: the [`Framework`] context holding every registry.
//! - [`module`]: the [`Module`] contract and dependency ordering.
//! - [`component`]: the component state machine and concurrency strategies.
//! - [`bus`]: named publish/subscribe channels.
//! - [`message`]: opcodes, payloads and event messages.
//! - [`pool`]: the reference-counted message pool.
//! - [`driver`]: the byte-oriented [`IoDriver`] contract.
//! - [`config`]: configuration sections with stock defaults.
//! - [`error`]: the [`KronosError`] taxonomy.
//!
//! The scheduler and the health monitor live in `kronos_sched` and
//! `kronos_health` and plug in as ordinary modules.

pub mod bus;
pub mod component;
pub mod config;
pub mod driver;
pub mod error;
pub mod framework;
pub mod message;
pub mod module;
pub mod pool;

pub use bus::{Bus, BusKind, Delivery};
pub use component::{
    Component, ComponentStats, Concurrency, ConcurrencyKind, FnHandler, Handler, LifecycleState,
    Receipt, from_fn,
};
pub use config::{
    ActiveConfig, HealthConfig, KronosConfig, PoolConfig, QueueConfig, SchedulerConfig,
    WorkerConfig,
};
pub use driver::{IoDriver, LoopbackDriver};
pub use error::{KronosError, Result};
pub use framework::Framework;
pub use message::{EventMessage, MessageHandle, Opcode, Payload, TickInfo};
pub use module::{Module, ModuleId, resolve_order};
pub use pool::{MessagePool, PoolStats};
