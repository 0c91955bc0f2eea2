//! Message pool: a generation-checked slot table.
//!
//! Every [`EventMessage`] is owned by the pool from creation until its last
//! reference is released. Publishers and consumers only exchange
//! [`MessageHandle`]s; each delivery of a message holds one reference.
//!
//! Slots carry a generation counter that is bumped whenever a slot is freed,
//! so a handle that outlived its message can never resolve to the next
//! occupant of the slot. Within a live slot, every reference is a distinct
//! lease: releasing one handle twice fails even while other holders keep the
//! message alive. Any component may create or release messages once the
//! framework has started, so the table sits behind a mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, trace};

use crate::bus::Bus;
use crate::config::PoolConfig;
use crate::error::{KronosError, Result};
use crate::message::{EventMessage, MessageHandle, Opcode, Payload};

#[derive(Debug)]
struct Entry {
    message: Arc<EventMessage>,
    /// Outstanding leases, one per reference.
    leases: Vec<u32>,
    next_lease: u32,
}

impl Entry {
    fn holds(&self, lease: u32) -> bool {
        self.leases.contains(&lease)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    created: u64,
    freed: u64,
}

impl SlotTable {
    fn entry_mut(&mut self, handle: MessageHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .filter(|entry| entry.holds(handle.lease))
    }
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Messages currently alive.
    pub live: usize,
    /// Messages created since the pool was built.
    pub created: u64,
    /// Messages freed since the pool was built.
    pub freed: u64,
    /// Slots allocated, live or free.
    pub slots: usize,
}

/// Shared owner of all in-flight event messages.
#[derive(Debug)]
pub struct MessagePool {
    config: PoolConfig,
    table: Mutex<SlotTable>,
}

impl MessagePool {
    /// Create a pool with the given configuration.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let table = SlotTable {
            slots: Vec::with_capacity(config.initial_slots),
            ..SlotTable::default()
        };
        Self {
            config,
            table: Mutex::new(table),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a message and return a handle holding one reference.
    pub fn insert(&self, message: EventMessage) -> MessageHandle {
        let mut table = self.lock();
        let entry = Entry {
            message: Arc::new(message),
            leases: vec![0],
            next_lease: 1,
        };
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                table.slots.push(Slot::default());
                (table.slots.len() - 1) as u32
            }
        };
        let slot = &mut table.slots[index as usize];
        slot.entry = Some(entry);
        let handle = MessageHandle {
            index,
            generation: slot.generation,
            lease: 0,
        };
        table.created += 1;
        trace!(%handle, "message created");
        handle
    }

    /// Create a message and return a handle holding one reference.
    pub fn create(
        &self,
        opcode: Opcode,
        payload: Payload,
        reply: Option<&Arc<Bus>>,
    ) -> MessageHandle {
        let message = EventMessage {
            opcode,
            payload,
            reply: reply.map(Arc::downgrade),
        };
        self.insert(message)
    }

    /// Resolve a handle to its message.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingMessage`] if the handle is stale.
    pub fn get(&self, handle: MessageHandle) -> Result<Arc<EventMessage>> {
        self.lock()
            .entry_mut(handle)
            .map(|entry| Arc::clone(&entry.message))
            .ok_or(KronosError::MissingMessage(handle))
    }

    /// Add a reference for one more consumer.
    ///
    /// Returns a new handle for that reference. `handle` stays valid and
    /// still has to be released by its own holder.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingMessage`] if the handle is stale.
    pub fn retain(&self, handle: MessageHandle) -> Result<MessageHandle> {
        let mut table = self.lock();
        let entry = table
            .entry_mut(handle)
            .ok_or(KronosError::MissingMessage(handle))?;
        let lease = entry.next_lease;
        entry.next_lease = entry.next_lease.wrapping_add(1);
        entry.leases.push(lease);
        Ok(MessageHandle { lease, ..handle })
    }

    /// Drop the reference `handle` stands for, freeing the message when none
    /// remain.
    ///
    /// Returns `true` if this call freed the message.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::MissingMessage`] if the handle is stale or was
    /// already released.
    ///
    /// # Panics
    ///
    /// Panics on a stale handle when
    /// [`PoolConfig::abort_on_stale_release`] is set.
    pub fn release(&self, handle: MessageHandle) -> Result<bool> {
        let mut table = self.lock();
        let remaining = table.entry_mut(handle).map(|entry| {
            entry.leases.retain(|&lease| lease != handle.lease);
            entry.leases.len()
        });
        let Some(remaining) = remaining else {
            drop(table);
            error!(%handle, "release of unknown message");
            if self.config.abort_on_stale_release {
                panic!("message {handle} released twice or never created");
            }
            return Err(KronosError::MissingMessage(handle));
        };
        if remaining > 0 {
            return Ok(false);
        }

        let slot = &mut table.slots[handle.index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(handle.index);
        table.freed += 1;
        trace!(%handle, "message freed");
        Ok(true)
    }

    /// Number of messages currently alive.
    #[must_use]
    pub fn live(&self) -> usize {
        let table = self.lock();
        (table.created - table.freed) as usize
    }

    /// Usage counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let table = self.lock();
        PoolStats {
            live: (table.created - table.freed) as usize,
            created: table.created,
            freed: table.freed,
            slots: table.slots.len(),
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
