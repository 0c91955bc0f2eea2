//! Event messages: the envelopes carried by buses.
//!
//! An [`EventMessage`] pairs an [`Opcode`] with a tagged [`Payload`] and an
//! optional reply bus. Messages live in the
//! [`MessagePool`](crate::pool::MessagePool) and are passed around by
//! [`MessageHandle`].
//!
//! ## Payloads
//!
//! Payloads are a closed tagged union rather than type-erased bytes. Kernel
//! opcodes use dedicated variants; application data is MessagePack-encoded
//! into [`Payload::Encoded`] and checked on the way out by
//! [`EventMessage::decode`].

use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::error::{KronosError, Result};

/// Identifies what an event message means to its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Periodic tick published by a scheduler worker.
    pub const SCHEDULER_TICK: Opcode = Opcode(0x0001);

    /// Event delivered by a scheduler timed event.
    pub const SCHEDULED_EVENT: Opcode = Opcode(0x0002);

    /// Liveness request sent by the health monitor.
    pub const HEALTH_PING: Opcode = Opcode(0x0010);

    /// Liveness answer sent by active components.
    pub const HEALTH_PONG: Opcode = Opcode(0x0011);

    /// Command for the command dispatcher, with an encoded payload.
    pub const COMMAND_DISPATCH: Opcode = Opcode(0x0020);

    /// First opcode available to applications.
    pub const USER_BASE: u16 = 0x0100;

    /// Largest code accepted by [`Opcode::user`].
    pub const USER_MAX: u16 = u16::MAX - Self::USER_BASE;

    /// Build an application opcode, offset from [`Opcode::USER_BASE`].
    ///
    /// # Panics
    ///
    /// Panics if `code` exceeds [`Opcode::USER_MAX`]. In a `const` this is a
    /// compile error. Use [`Opcode::checked_user`] for runtime codes.
    #[must_use]
    pub const fn user(code: u16) -> Self {
        match Self::checked_user(code) {
            Some(opcode) => opcode,
            None => panic!("user opcode out of range"),
        }
    }

    /// Build an application opcode, or `None` if `code` exceeds
    /// [`Opcode::USER_MAX`].
    #[must_use]
    pub const fn checked_user(code: u16) -> Option<Self> {
        match Self::USER_BASE.checked_add(code) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns `true` for opcodes reserved by the kernel.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::USER_BASE
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Metadata of a scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickInfo {
    /// Name of the worker (cadence) that fired.
    pub worker: String,
    /// How many times this worker has fired, starting at 1.
    pub count: u64,
}

/// Tagged message payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    /// No data.
    #[default]
    Empty,
    /// Scheduler tick metadata.
    Tick(TickInfo),
    /// A component name (e.g. the sender of a pong).
    Component(String),
    /// An application value encoded as MessagePack.
    Encoded(Vec<u8>),
}

impl Payload {
    /// Encode an application value.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::Encode`] if serialisation fails.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Encoded(rmp_serde::to_vec_named(value)?))
    }

    /// Short name of the variant, used in diagnostics.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Tick(_) => "tick",
            Self::Component(_) => "component",
            Self::Encoded(_) => "encoded",
        }
    }
}

/// A generation-checked reference to a message in the pool.
///
/// Handles are cheap to copy, but each one stands for exactly one pool
/// reference: [`MessagePool::retain`](crate::MessagePool::retain) issues a new
/// handle with its own lease instead of sharing the caller's. A handle that
/// was released, or whose slot was reused, no longer resolves, which turns
/// double releases into [`KronosError::MissingMessage`] instead of freeing a
/// message someone else still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    pub(crate) lease: u32,
}

impl MessageHandle {
    /// Slot index inside the pool.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Which reference to the message this handle stands for.
    #[must_use]
    pub const fn lease(self) -> u32 {
        self.lease
    }
}

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}v{}.{}", self.index, self.generation, self.lease)
    }
}

/// The envelope carried over a bus.
#[derive(Debug)]
pub struct EventMessage {
    /// What the message means.
    pub opcode: Opcode,
    /// The data carried.
    pub payload: Payload,
    /// Where a receiver should answer, if anywhere.
    pub reply: Option<Weak<Bus>>,
}

impl EventMessage {
    /// Create a message without a reply bus.
    #[must_use]
    pub fn new(opcode: Opcode, payload: Payload) -> Self {
        Self {
            opcode,
            payload,
            reply: None,
        }
    }

    /// Attach a reply bus. Only a weak reference is kept.
    #[must_use]
    pub fn with_reply(mut self, bus: &Arc<Bus>) -> Self {
        self.reply = Some(Arc::downgrade(bus));
        self
    }

    /// The reply bus, if one was attached and it still exists.
    #[must_use]
    pub fn reply_bus(&self) -> Option<Arc<Bus>> {
        self.reply.as_ref().and_then(Weak::upgrade)
    }

    /// Check that well-known opcodes carry the payload variant they require.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::UnexpectedPayload`] on a mismatch.
    pub fn validate(&self) -> Result<()> {
        let expected = match self.opcode {
            Opcode::SCHEDULER_TICK => "tick",
            Opcode::HEALTH_PONG => "component",
            Opcode::COMMAND_DISPATCH => "encoded",
            _ => return Ok(()),
        };
        if self.payload.tag() == expected {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    /// The tick metadata of a tick message.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::UnexpectedPayload`] for other payloads.
    pub fn tick(&self) -> Result<&TickInfo> {
        match &self.payload {
            Payload::Tick(info) => Ok(info),
            _ => Err(self.unexpected("tick")),
        }
    }

    /// The component name carried by the message.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::UnexpectedPayload`] for other payloads.
    pub fn component(&self) -> Result<&str> {
        match &self.payload {
            Payload::Component(name) => Ok(name),
            _ => Err(self.unexpected("component")),
        }
    }

    /// Decode an application value from an [`Payload::Encoded`] payload.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::UnexpectedPayload`] if the payload is not
    /// encoded, or [`KronosError::Decode`] if the bytes do not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.payload {
            Payload::Encoded(bytes) => Ok(rmp_serde::from_slice(bytes)?),
            _ => Err(self.unexpected("encoded")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> KronosError {
        KronosError::UnexpectedPayload {
            opcode: self.opcode,
            expected,
            found: self.payload.tag(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SetParam {
        key: String,
        value: i32,
    }

    #[test]
    fn test_user_opcode_range_is_checked() {
        assert_eq!(Opcode::user(Opcode::USER_MAX), Opcode(u16::MAX));
        assert_eq!(Opcode::checked_user(Opcode::USER_MAX + 1), None);
        assert_eq!(Opcode::checked_user(0), Some(Opcode(Opcode::USER_BASE)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_user_opcode_overflow_panics() {
        let code = std::hint::black_box(0xFF00);
        let _ = Opcode::user(code);
    }

    #[test]
    fn test_user_opcodes_are_not_reserved() {
        assert!(Opcode::HEALTH_PING.is_reserved());
        assert!(!Opcode::user(3).is_reserved());
        assert_eq!(Opcode::user(3), Opcode(0x0103));
    }

    #[test]
    fn test_decode_encoded_payload() {
        let param = SetParam {
            key: "LED".to_string(),
            value: 7,
        };
        let message = EventMessage::new(Opcode::user(1), Payload::encode(&param).unwrap());
        assert_eq!(message.decode::<SetParam>().unwrap(), param);
    }

    #[test]
    fn test_decode_rejects_wrong_variant() {
        let message = EventMessage::new(Opcode::user(1), Payload::Component("CA_X".into()));
        let err = message.decode::<SetParam>().unwrap_err();
        assert!(matches!(
            err,
            KronosError::UnexpectedPayload {
                expected: "encoded",
                found: "component",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_mismatched_type() {
        let message = EventMessage::new(Opcode::user(1), Payload::encode(&42u8).unwrap());
        assert!(matches!(
            message.decode::<SetParam>(),
            Err(KronosError::Decode(_))
        ));
    }

    #[test]
    fn test_validate_well_known_opcodes() {
        let tick = EventMessage::new(
            Opcode::SCHEDULER_TICK,
            Payload::Tick(TickInfo {
                worker: "main".into(),
                count: 1,
            }),
        );
        assert!(tick.validate().is_ok());
        assert_eq!(tick.tick().unwrap().count, 1);

        let bad_pong = EventMessage::new(Opcode::HEALTH_PONG, Payload::Empty);
        assert!(bad_pong.validate().is_err());

        let bare_command = EventMessage::new(Opcode::COMMAND_DISPATCH, Payload::Empty);
        assert!(bare_command.validate().is_err());

        let custom = EventMessage::new(Opcode::user(9), Payload::Empty);
        assert!(custom.validate().is_ok());
    }

    #[test]
    fn test_handle_display() {
        let handle = MessageHandle {
            index: 3,
            generation: 2,
            lease: 1,
        };
        assert_eq!(handle.to_string(), "#3v2.1");
    }
}
