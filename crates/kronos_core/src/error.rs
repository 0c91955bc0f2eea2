//! Kernel error types.
//!
//! Every fallible framework operation returns [`KronosError`]. The taxonomy is
//! closed: registration problems (duplicates, missing entities, dependency
//! cycles) are raised while the system boots, delivery problems
//! ([`KronosError::QueueFull`]) while it runs.
//!
//! | Error | Raised by | Fatal |
//! |-------|-----------|-------|
//! | `Duplicate*` / `Missing*` | registries, module init | Yes |
//! | `CyclicDependency` | [`Framework::init_modules`](crate::Framework::init_modules) | Yes |
//! | `TaskCreateFailed` | active component init, timer spawn | Yes |
//! | `QueueFull` | queued/active `receive_event` | No |
//! | `MissingMessage` | message pool | No (programming defect) |
//! | `UnknownWorker` / `AlreadyRegistered` | scheduler, health monitor, command dispatcher | Yes |
//! | `UnknownCommand` | command dispatch | No |

use crate::component::LifecycleState;
use crate::message::{MessageHandle, Opcode};
use crate::module::ModuleId;

/// Convenience alias used throughout the Kronos crates.
pub type Result<T, E = KronosError> = std::result::Result<T, E>;

/// Errors raised by the Kronos kernel and its built-in modules.
#[derive(Debug, thiserror::Error)]
pub enum KronosError {
    /// A module with the same id was already added.
    #[error("module '{0}' already exists")]
    DuplicateModule(ModuleId),

    /// A component with the same name was already created.
    #[error("component '{0}' already exists")]
    DuplicateComponent(String),

    /// A bus with the same name was already created.
    #[error("bus '{0}' already exists")]
    DuplicateBus(String),

    /// A driver with the same name was already created.
    #[error("driver '{0}' already exists")]
    DuplicateDriver(String),

    /// A module id was referenced but never added.
    #[error("module '{0}' not found")]
    MissingModule(ModuleId),

    /// A component name was referenced but never created.
    #[error("component '{0}' not found")]
    MissingComponent(String),

    /// A bus name was referenced but never created.
    #[error("bus '{0}' not found")]
    MissingBus(String),

    /// A driver name was referenced but never created.
    #[error("driver '{0}' not found")]
    MissingDriver(String),

    /// The module dependency graph contains at least one cycle.
    #[error("cyclic module dependency between: {}", format_ids(.unresolved))]
    CyclicDependency {
        /// Modules whose dependencies could not be resolved.
        unresolved: Vec<ModuleId>,
    },

    /// [`Framework::init_modules`](crate::Framework::init_modules) was called twice.
    #[error("modules have already been initialized")]
    ModulesAlreadyInitialized,

    /// The substrate could not allocate a task.
    #[error("failed to create task for '{name}': {reason}")]
    TaskCreateFailed {
        /// The component or service that requested the task.
        name: String,
        /// Why the substrate refused.
        reason: String,
    },

    /// A component queue was full; the message was dropped.
    #[error("queue of component '{0}' is full")]
    QueueFull(String),

    /// The handle does not refer to a live message (double release or use
    /// after release).
    #[error("message {0} not found")]
    MissingMessage(MessageHandle),

    /// A worker id was referenced but never registered with the scheduler.
    #[error("worker '{0}' not registered")]
    UnknownWorker(String),

    /// No callback is registered for the command id.
    #[error("command {0:#06x} not registered")]
    UnknownCommand(u16),

    /// The entity was already registered with the receiving service.
    #[error("'{0}' is already registered")]
    AlreadyRegistered(String),

    /// A lifecycle method was called in a state that does not allow it.
    #[error("component '{component}' cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        /// The component name.
        component: String,
        /// The state the component was in.
        from: LifecycleState,
        /// The state the call tried to reach.
        to: LifecycleState,
    },

    /// The component is not an active (dedicated-task) component.
    #[error("component '{0}' is not active")]
    NotActive(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to encode a payload to MessagePack.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a payload from MessagePack.
    #[error("failed to decode payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The message carried a payload variant its opcode does not allow.
    #[error("opcode {opcode} expects a {expected} payload, got {found}")]
    UnexpectedPayload {
        /// The message opcode.
        opcode: Opcode,
        /// The payload tag the opcode requires.
        expected: &'static str,
        /// The payload tag that was found.
        found: &'static str,
    },

    /// A component handler reported a failure.
    #[error("component '{component}' failed: {message}")]
    Handler {
        /// The failing component.
        component: String,
        /// Handler-provided description.
        message: String,
    },
}

impl KronosError {
    /// Convenience constructor for handler failures.
    pub fn handler(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the error should abort boot.
    ///
    /// Registration-time errors describe a module graph that is fixed ahead of
    /// time, so nothing can be retried. Delivery errors and handler failures
    /// are recoverable at runtime.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::QueueFull(_)
                | Self::MissingMessage(_)
                | Self::UnknownCommand(_)
                | Self::Encode(_)
                | Self::Decode(_)
                | Self::UnexpectedPayload { .. }
                | Self::Handler { .. }
        )
    }
}

fn format_ids(ids: &[ModuleId]) -> String {
    ids.iter()
        .map(ModuleId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
