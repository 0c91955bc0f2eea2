//! # kronos_sched
//!
//! Multi-rate scheduling for the Kronos component framework.
//!
//! One base timer (50 ms by default) drives named cadences ("workers") that
//! fire every N base ticks, plus per-component scheduled events. The stock
//! cadences are `main` (every tick), `2s` and `10s`.
//!
//! - [`scheduler`]: the [`Scheduler`] and its timer task.
//! - [`worker`]: the [`Worker`] contract and the default [`QueueDrainer`].
//! - [`module`]: [`SchedModule`], which wires the scheduler into a framework.

pub mod module;
pub mod scheduler;
pub mod worker;

pub use module::{SCHED_MODULE, SCHEDULER_COMPONENT, SchedModule};
pub use scheduler::{Scheduler, WorkerStatus, worker_bus_name};
pub use worker::{QueueDrainer, Worker};
