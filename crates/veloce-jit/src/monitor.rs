//! Global exclusive monitor shared between engines.
//!
//! Models the architecture's global monitor at reservation-granule
//! precision: each processor slot holds at most one marked address range,
//! an exclusive store succeeds only if the slot still covers the access,
//! and any incompatible write clears every overlapping reservation.

use std::sync::Mutex;

/// Reservation granule in bytes. Exclusive marks are rounded out to this
/// alignment, as the architecture permits.
pub const RESERVATION_GRANULE: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct Reservation {
    start: u64,
    end: u64,
}

/// Shared exclusive monitor. Construct one with the processor count and
/// hand clones of the `Arc` to each engine's config; engines built without
/// one get a private single-processor monitor.
#[derive(Debug)]
pub struct ExclusiveMonitor {
    count: usize,
    slots: Mutex<Vec<Option<Reservation>>>,
}

impl ExclusiveMonitor {
    pub fn new(processor_count: usize) -> ExclusiveMonitor {
        ExclusiveMonitor {
            count: processor_count,
            slots: Mutex::new(vec![None; processor_count]),
        }
    }

    pub fn processor_count(&self) -> usize {
        self.count
    }

    fn granule(addr: u64, bytes: u64) -> Reservation {
        let start = addr & !(RESERVATION_GRANULE - 1);
        // Round the end of the access up to the next granule boundary. The
        // address is guest-controlled and may sit at the top of the address
        // space; the end of the top granule clamps to u64::MAX.
        let end = addr
            .checked_add(bytes + RESERVATION_GRANULE - 1)
            .map_or(u64::MAX, |e| e & !(RESERVATION_GRANULE - 1));
        Reservation { start, end }
    }

    /// Record an exclusive reservation for `processor_id` covering the
    /// granule(s) of `[addr, addr + bytes)`. Replaces any previous
    /// reservation held by the same processor.
    pub fn mark_exclusive(&self, processor_id: usize, addr: u64, bytes: u64) {
        let mut slots = self.slots.lock().expect("exclusive monitor poisoned");
        let slot = slots
            .get_mut(processor_id)
            .expect("processor id out of range for exclusive monitor");
        *slot = Some(Self::granule(addr, bytes));
    }

    /// Exclusive-store check: returns true (and consumes the reservation)
    /// if `processor_id` still holds a reservation covering the access.
    /// On success every other processor's overlapping reservation is also
    /// cleared, so a racing STXR elsewhere fails.
    pub fn check_and_clear(&self, processor_id: usize, addr: u64, bytes: u64) -> bool {
        let want = Self::granule(addr, bytes);
        let mut slots = self.slots.lock().expect("exclusive monitor poisoned");
        let held = match slots
            .get(processor_id)
            .expect("processor id out of range for exclusive monitor")
        {
            Some(r) => r.start <= want.start && want.end <= r.end,
            None => false,
        };
        if !held {
            slots[processor_id] = None;
            return false;
        }
        for (id, slot) in slots.iter_mut().enumerate() {
            let clear = id == processor_id
                || matches!(slot, Some(r) if r.start < want.end && want.start < r.end);
            if clear {
                *slot = None;
            }
        }
        true
    }

    /// Drop `processor_id`'s reservation (CLREX, exception entry).
    pub fn clear_processor(&self, processor_id: usize) {
        let mut slots = self.slots.lock().expect("exclusive monitor poisoned");
        *slots
            .get_mut(processor_id)
            .expect("processor id out of range for exclusive monitor") = None;
    }

    /// An ordinary (non-exclusive) write by `processor_id` touched
    /// `[addr, addr + bytes)`: clear every other processor's overlapping
    /// reservation. The writer's own reservation survives, matching the
    /// architecture's local-monitor behavior for stores to the marked
    /// address.
    pub fn notify_incompatible_access(&self, processor_id: usize, addr: u64, bytes: u64) {
        let touched = Self::granule(addr, bytes);
        let mut slots = self.slots.lock().expect("exclusive monitor poisoned");
        for (id, slot) in slots.iter_mut().enumerate() {
            if id == processor_id {
                continue;
            }
            if matches!(slot, Some(r) if r.start < touched.end && touched.start < r.end) {
                *slot = None;
            }
        }
    }

    #[cfg(test)]
    fn holds_reservation(&self, processor_id: usize) -> bool {
        self.slots.lock().expect("exclusive monitor poisoned")[processor_id].is_some()
    }
}
