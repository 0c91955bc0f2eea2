//! Numbered commands and their dispatcher.
//!
//! A [`Command`] travels on [`COMMAND_BUS`] as an
//! [`Opcode::COMMAND_DISPATCH`] message whose payload is the
//! MessagePack-encoded command. The [`CommandDispatcher`] decodes it, looks
//! the id up and runs the registered callback on whichever thread drains its
//! component.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kronos_core::{
    Bus, BusKind, Component, Delivery, EventMessage, Handler, KronosError, MessagePool, Opcode,
    Payload, Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

/// Bus commands are submitted on.
pub const COMMAND_BUS: &str = "B_COMMAND";

/// Identifies a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u16);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A command and its MessagePack-encoded parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Which callback to run.
    pub id: CommandId,
    /// Encoded parameter; empty for commands without one.
    pub parameter: Vec<u8>,
}

impl Command {
    /// A command without a parameter.
    #[must_use]
    pub fn new(id: CommandId) -> Self {
        Self {
            id,
            parameter: Vec::new(),
        }
    }

    /// A command carrying `parameter`.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::Encode`] if serialisation fails.
    pub fn with_parameter<T: Serialize>(id: CommandId, parameter: &T) -> Result<Self> {
        Ok(Self {
            id,
            parameter: rmp_serde::to_vec_named(parameter)?,
        })
    }

    /// Decode the parameter.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::Decode`] if the bytes do not match `T`.
    pub fn parameter<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.parameter)?)
    }
}

type Callback = Arc<dyn Fn(&Command) -> Result<()> + Send + Sync>;

/// Registry of command callbacks.
pub struct CommandDispatcher {
    bus: Arc<Bus>,
    commands: DashMap<CommandId, Callback>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("bus", &self.bus.name())
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher and its asynchronous command bus in `pool`.
    #[must_use]
    pub fn new(pool: &Arc<MessagePool>) -> Self {
        Self {
            bus: Arc::new(Bus::new(COMMAND_BUS, BusKind::Async, Arc::clone(pool))),
            commands: DashMap::new(),
        }
    }

    /// The bus commands are submitted on.
    #[must_use]
    pub fn command_bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Register the callback run for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::AlreadyRegistered`] if `id` already has one.
    pub fn register_command<F>(&self, id: CommandId, callback: F) -> Result<()>
    where
        F: Fn(&Command) -> Result<()> + Send + Sync + 'static,
    {
        match self.commands.entry(id) {
            Entry::Occupied(_) => Err(KronosError::AlreadyRegistered(format!("command {id}"))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(callback));
                debug!(command = %id, "command registered");
                Ok(())
            }
        }
    }

    /// Returns `true` if `id` has a callback.
    #[must_use]
    pub fn is_registered(&self, id: CommandId) -> bool {
        self.commands.contains_key(&id)
    }

    /// Number of registered commands.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.commands.len()
    }

    /// Run the callback registered for `command.id` on the calling thread.
    ///
    /// # Errors
    ///
    /// - [`KronosError::UnknownCommand`] if nothing is registered for the id.
    /// - Any error returned by the callback.
    pub fn dispatch(&self, command: &Command) -> Result<()> {
        // Cloned out so a callback may register further commands.
        let callback = self.commands.get(&command.id).map(|c| Arc::clone(c.value()));
        let Some(callback) = callback else {
            error!(command = %command.id, "unknown command");
            return Err(KronosError::UnknownCommand(command.id.0));
        };
        trace!(command = %command.id, "dispatching command");
        callback(command)
    }

    /// Publish `command` on the command bus.
    ///
    /// # Errors
    ///
    /// Only encoding and pool errors; the command bus is asynchronous.
    pub fn submit(&self, command: &Command) -> Result<Delivery> {
        self.bus
            .emit(Opcode::COMMAND_DISPATCH, Payload::encode(command)?, None)
    }
}

impl Handler for CommandDispatcher {
    fn process_event(&self, _component: &Component, message: &EventMessage) -> Result<()> {
        match message.opcode {
            Opcode::COMMAND_DISPATCH => {
                let command: Command = message.decode()?;
                self.dispatch(&command)
            }
            opcode => {
                trace!(%opcode, "ignoring event");
                Ok(())
            }
        }
    }
}
