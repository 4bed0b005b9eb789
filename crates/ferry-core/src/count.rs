//! Slot counters limiting the number of simultaneous transfers.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Slots {
    count: u64,
    limit: u64,
}

/// Concurrency-safe counter with an optional ceiling.
///
/// A limit of `0` means unlimited. All operations take the same lock, so
/// [`SlotCounter::add`], [`SlotCounter::sub`] and [`SlotCounter::available`]
/// are linearizable with respect to each other.
#[derive(Debug, Default)]
pub struct SlotCounter {
    slots: Mutex<Slots>,
}

impl SlotCounter {
    /// Create a counter with the given limit (`0` = unlimited)
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            slots: Mutex::new(Slots { count: 0, limit }),
        }
    }

    /// Take a slot. Returns `false`, without mutating the counter, when the
    /// limit is already reached.
    pub fn add(&self) -> bool {
        let mut slots = self.lock();
        if slots.limit != 0 && slots.count >= slots.limit {
            return false;
        }
        slots.count += 1;
        true
    }

    /// Release a slot. Releasing from an empty counter is a no-op.
    pub fn sub(&self) {
        let mut slots = self.lock();
        slots.count = slots.count.saturating_sub(1);
    }

    /// Number of free slots, or `None` when the counter is unlimited
    #[must_use]
    pub fn available(&self) -> Option<u64> {
        let slots = self.lock();
        if slots.limit == 0 {
            None
        } else {
            Some(slots.limit.saturating_sub(slots.count))
        }
    }

    /// Number of slots currently taken
    #[must_use]
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    /// Current limit (`0` = unlimited)
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.lock().limit
    }

    /// Change the limit. Slots already taken are kept even if the new limit
    /// is lower; no new slot is granted until enough of them are released.
    pub fn set_limit(&self, limit: u64) {
        self.lock().limit = limit;
    }

    /// Drop every taken slot (tests and shutdown only)
    pub fn reset(&self) {
        self.lock().count = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Inbound and outbound slot counters of a gateway
#[derive(Debug, Default)]
pub struct TransferLimits {
    /// Transfers receiving data
    pub inbound: SlotCounter,
    /// Transfers sending data
    pub outbound: SlotCounter,
}

impl TransferLimits {
    /// Create limits with the given ceilings (`0` = unlimited)
    #[must_use]
    pub fn new(max_incoming: u64, max_outgoing: u64) -> Self {
        Self {
            inbound: SlotCounter::new(max_incoming),
            outbound: SlotCounter::new(max_outgoing),
        }
    }

    /// Counter for the given direction
    #[must_use]
    pub fn for_direction(&self, is_send: bool) -> &SlotCounter {
        if is_send {
            &self.outbound
        } else {
            &self.inbound
        }
    }
}
