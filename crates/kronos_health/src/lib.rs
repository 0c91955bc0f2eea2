//! # kronos_health
//!
//! Liveness monitoring for the Kronos component framework.
//!
//! The [`HealthMonitor`] pings every registered active component on a
//! scheduler cadence and reports the ones that stop answering. Detection
//! only: nothing is restarted.
//!
//! - [`monitor`]: the monitor, its records and its buses.
//! - [`module`]: [`HealthModule`], which wires the monitor into a framework.

pub mod module;
pub mod monitor;

pub use module::{HEALTH_MODULE, HEALTH_MONITOR_COMPONENT, HealthModule};
pub use monitor::{HealthMonitor, PING_BUS, PONG_BUS};
