//! # kronos_cmd
//!
//! Command dispatch for the Kronos component framework.
//!
//! Services register callbacks under numeric [`CommandId`]s; anyone holding
//! the [`CommandDispatcher`] (or its bus) can then submit a [`Command`],
//! which runs on the dispatcher's queued component.
//!
//! - [`dispatcher`]: the command registry, the wire type and the handler.
//! - [`module`]: [`CmdModule`], which wires the dispatcher into a framework.

pub mod dispatcher;
pub mod module;

pub use dispatcher::{COMMAND_BUS, Command, CommandDispatcher, CommandId};
pub use module::{CMD_MODULE, COMMAND_DISPATCHER_COMPONENT, CmdModule};
