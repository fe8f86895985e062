//! Locomotive slot cache.
//!
//! A command station owns up to 120 locomotive "slots"; throttle traffic
//! is addressed by slot number, not decoder address. The kernel keeps a
//! dense table of slot shadows, a reverse index from decoder address to
//! slot number, and per-address queues of messages composed before the
//! slot for that address was known. The shadows are only updated from
//! confirmed bus traffic (echoes and slot data), never speculatively.

use heapless::{FnvIndexMap, Vec};

use crate::message::Message;
use crate::traits::{Direction, TriState, FUNCTION_COUNT};

/// Number of table entries (slot numbers 0..=127; usable locomotive
/// slots are 1..=119, 0 is dispatch and 120+ are system slots).
pub const SLOT_COUNT: usize = 128;

/// Highest usable locomotive slot number.
pub const MAX_LOCO_SLOT: u8 = 119;

/// Capacity of one address's pending-message queue.
pub const PENDING_PER_ADDRESS: usize = 8;

const PENDING_ADDRESSES: usize = 16;
const ADDRESS_INDEX_CAPACITY: usize = 128;

/// Shadow of one command-station slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocoSlot {
    /// Decoder address, or [`INVALID_ADDRESS`](Self::INVALID_ADDRESS).
    pub address: u16,
    /// Raw speed byte, or [`INVALID_SPEED`](Self::INVALID_SPEED).
    pub speed: u8,
    /// Confirmed direction.
    pub direction: Direction,
    /// Confirmed function states F0..=F28.
    pub functions: [TriState; FUNCTION_COUNT],
}

impl LocoSlot {
    /// Address marker for an unused slot shadow.
    pub const INVALID_ADDRESS: u16 = 0xFFFF;
    /// Speed marker for an unknown speed.
    pub const INVALID_SPEED: u8 = 0xFF;

    /// True when this shadow tracks a real decoder address.
    #[inline]
    pub fn is_address_valid(&self) -> bool {
        self.address != Self::INVALID_ADDRESS
    }

    /// Reset to the unknown state.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

impl Default for LocoSlot {
    fn default() -> Self {
        Self {
            address: Self::INVALID_ADDRESS,
            speed: Self::INVALID_SPEED,
            direction: Direction::Unknown,
            functions: [TriState::Undefined; FUNCTION_COUNT],
        }
    }
}

/// Slot shadows plus the reverse address index and pending queues.
///
/// Invariant: for every `address -> slot` edge in the reverse index, the
/// forward table entry for `slot` carries exactly that address.
pub struct SlotTable {
    slots: [LocoSlot; SLOT_COUNT],
    address_to_slot: FnvIndexMap<u16, u8, ADDRESS_INDEX_CAPACITY>,
    pending: FnvIndexMap<u16, Vec<Message, PENDING_PER_ADDRESS>, PENDING_ADDRESSES>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            slots: [LocoSlot::default(); SLOT_COUNT],
            address_to_slot: FnvIndexMap::new(),
            pending: FnvIndexMap::new(),
        }
    }
}

impl SlotTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shadow for a slot number, if in range.
    pub fn slot(&self, number: u8) -> Option<&LocoSlot> {
        self.slots.get(number as usize)
    }

    /// Mutable shadow for a slot number, if in range.
    pub fn slot_mut(&mut self, number: u8) -> Option<&mut LocoSlot> {
        self.slots.get_mut(number as usize)
    }

    /// Slot number currently owning a decoder address.
    pub fn slot_for_address(&self, address: u16) -> Option<u8> {
        self.address_to_slot.get(&address).copied()
    }

    /// Bind a slot to a decoder address, breaking any stale edges.
    ///
    /// Clears a previous owner of the address and the slot's previous
    /// address so both indices stay consistent.
    pub fn assign(&mut self, number: u8, address: u16) {
        let Some(old_address) = self.slots.get(number as usize).map(|s| s.address) else {
            return;
        };
        if old_address != LocoSlot::INVALID_ADDRESS {
            self.address_to_slot.remove(&old_address);
        }
        if let Some(previous_owner) = self.address_to_slot.remove(&address) {
            self.slots[previous_owner as usize].invalidate();
        }
        self.slots[number as usize].invalidate();
        self.slots[number as usize].address = address;
        // The index is as large as the table; insertion cannot fail.
        let _ = self.address_to_slot.insert(address, number);
    }

    /// Drop a slot shadow and its reverse edge.
    pub fn clear_slot(&mut self, number: u8) {
        let Some(slot) = self.slots.get_mut(number as usize) else {
            return;
        };
        if slot.is_address_valid() {
            self.address_to_slot.remove(&slot.address);
        }
        slot.invalidate();
    }

    /// Queue a message for an address whose slot is not yet known.
    ///
    /// Returns `false` when the per-address queue is full (the message
    /// is dropped) or too many addresses are awaiting slots.
    #[must_use]
    pub fn push_pending(&mut self, address: u16, message: Message) -> bool {
        if let Some(queue) = self.pending.get_mut(&address) {
            return queue.push(message).is_ok();
        }
        let mut queue = Vec::new();
        // Capacity is at least one.
        queue.push(message).unwrap();
        self.pending.insert(address, queue).is_ok()
    }

    /// True when messages are already waiting on a slot for this address
    /// (meaning a slot request is in flight).
    pub fn has_pending(&self, address: u16) -> bool {
        self.pending.contains_key(&address)
    }

    /// Take the queued messages for an address, in insertion order.
    pub fn take_pending(&mut self, address: u16) -> Vec<Message, PENDING_PER_ADDRESS> {
        self.pending.remove(&address).unwrap_or_default()
    }
}
