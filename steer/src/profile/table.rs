//! The per-rank profile table.
//!
//! Each application rank owns one table in shared memory: a single
//! producer (the rank) records region entries, exits, and progress; a
//! single consumer (the controller) drains the events recorded since its
//! previous visit. Slots are keyed by region id with linear probing and
//! hold the most recent entry/exit pair per region; every field is an
//! atomic word so torn reads cannot occur across the process boundary.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes per table slot.
pub const SLOT_SIZE: usize = 64;

#[repr(C)]
struct TableSlot {
    region_id: AtomicU64,
    entry_time: AtomicU64,  // f64 bits
    exit_time: AtomicU64,   // f64 bits
    progress: AtomicU64,    // f64 bits
    entry_count: AtomicU64,
    exit_count: AtomicU64,
    progress_count: AtomicU64,
    _pad: AtomicU64,
}

/// One profile record drained from a rank's table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileMessage {
    /// The reporting rank; filled by the sampler.
    pub rank: i32,
    /// Region id, flags included.
    pub region_id: u64,
    /// Event wall time in the application's clock.
    pub timestamp: f64,
    /// 0.0 at entry, 1.0 at exit, in between for progress reports.
    pub progress: f64,
}

/// Producer/consumer view over a rank's slot array.
pub struct ProfileTable {
    slots: *const TableSlot,
    capacity: usize,
}

// Slots are all atomics.
unsafe impl Send for ProfileTable {}

impl ProfileTable {
    /// Wraps `size` bytes of mapped memory as a table.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size` bytes of live zero-initialized
    /// shared memory outliving the returned handle.
    pub unsafe fn from_ptr(ptr: *mut u8, size: usize) -> ProfileTable {
        ProfileTable { slots: ptr.cast(), capacity: size / SLOT_SIZE }
    }

    /// Number of distinct regions the table can track.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records a region entry (producer side). Returns false when the
    /// table is full and the event was dropped.
    pub fn enter(&self, region_id: u64, timestamp: f64) -> bool {
        self.with_slot(region_id, |slot| {
            slot.entry_time.store(timestamp.to_bits(), Ordering::Release);
            slot.progress.store(0.0f64.to_bits(), Ordering::Release);
            slot.entry_count.fetch_add(1, Ordering::Release);
        })
    }

    /// Records a region exit (producer side).
    pub fn exit(&self, region_id: u64, timestamp: f64) -> bool {
        self.with_slot(region_id, |slot| {
            slot.exit_time.store(timestamp.to_bits(), Ordering::Release);
            slot.progress.store(1.0f64.to_bits(), Ordering::Release);
            slot.exit_count.fetch_add(1, Ordering::Release);
        })
    }

    /// Records fractional progress through a region (producer side).
    pub fn progress(&self, region_id: u64, fraction: f64) -> bool {
        self.with_slot(region_id, |slot| {
            slot.progress.store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Release);
            slot.progress_count.fetch_add(1, Ordering::Release);
        })
    }

    fn with_slot(&self, region_id: u64, update: impl FnOnce(&TableSlot)) -> bool {
        debug_assert!(region_id != 0, "the null region cannot be recorded");
        let slots = unsafe { std::slice::from_raw_parts(self.slots, self.capacity) };
        let start = (region_id as usize) % self.capacity;
        for probe in 0..self.capacity {
            let slot = &slots[(start + probe) % self.capacity];
            let current = slot.region_id.load(Ordering::Acquire);
            if current == region_id {
                update(slot);
                return true;
            }
            if current == 0 {
                // Claim the empty slot; the single producer cannot race
                // itself.
                slot.region_id.store(region_id, Ordering::Release);
                update(slot);
                return true;
            }
        }
        false
    }
}

/// The consumer's cursor over one rank's table.
pub struct ProfileTableReader {
    table: ProfileTable,
    rank: i32,
    seen_entry: Vec<u64>,
    seen_exit: Vec<u64>,
}

impl ProfileTableReader {
    /// Wraps a table for draining on behalf of `rank`.
    pub fn new(table: ProfileTable, rank: i32) -> ProfileTableReader {
        let capacity = table.capacity();
        ProfileTableReader {
            table,
            rank,
            seen_entry: vec![0; capacity],
            seen_exit: vec![0; capacity],
        }
    }

    /// The rank this reader drains.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Appends every event recorded since the previous drain.
    ///
    /// When several entries (or exits) of one region landed between
    /// drains, only the most recent timestamp survives; the event count
    /// still reflects every occurrence.
    pub fn dump(&mut self, into: &mut Vec<ProfileMessage>) {
        let slots =
            unsafe { std::slice::from_raw_parts(self.table.slots, self.table.capacity) };
        for (index, slot) in slots.iter().enumerate() {
            let region_id = slot.region_id.load(Ordering::Acquire);
            if region_id == 0 {
                continue;
            }
            let entries = slot.entry_count.load(Ordering::Acquire);
            while self.seen_entry[index] < entries {
                self.seen_entry[index] += 1;
                into.push(ProfileMessage {
                    rank: self.rank,
                    region_id,
                    timestamp: f64::from_bits(slot.entry_time.load(Ordering::Acquire)),
                    progress: 0.0,
                });
            }
            let exits = slot.exit_count.load(Ordering::Acquire);
            while self.seen_exit[index] < exits {
                self.seen_exit[index] += 1;
                into.push(ProfileMessage {
                    rank: self.rank,
                    region_id,
                    timestamp: f64::from_bits(slot.exit_time.load(Ordering::Acquire)),
                    progress: 1.0,
                });
            }
        }
    }
}
