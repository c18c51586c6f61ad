//! Fixed-capacity pools for port records.
//!
//! A pool is a compile-time-sized array of slots living in the broker
//! segment. Slots move through `Free -> Live -> Retiring -> Free`: `Retiring`
//! is the tombstone-observed phase that keeps a record mapped for one more
//! discovery pass so no other process dereferences reclaimed storage. Slot
//! states are only ever advanced by the daemon-side Port Manager; other
//! processes read records but never touch occupancy.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no free slots remain in the pool")]
    Exhausted,
}

const STATE_FREE: u8 = 0;
const STATE_LIVE: u8 = 1;
const STATE_RETIRING: u8 = 2;

#[repr(C)]
pub struct PortSlot<T> {
    state: AtomicU8,
    data: UnsafeCell<T>,
}

// Records are shared across process mappings. The contained data is only
// written while the slot is not observable as Live (allocation on the
// manager thread); afterwards all mutation goes through the record's own
// atomics.
unsafe impl<T: Sync> Sync for PortSlot<T> {}
unsafe impl<T: Send> Send for PortSlot<T> {}

impl<T: Default> PortSlot<T> {
    fn vacant() -> PortSlot<T> {
        PortSlot {
            state: AtomicU8::new(STATE_FREE),
            data: UnsafeCell::new(T::default()),
        }
    }
}

#[repr(C)]
pub struct PortPool<T, const N: usize> {
    slots: [PortSlot<T>; N],
}

impl<T: Default, const N: usize> PortPool<T, N> {
    pub(crate) fn new() -> PortPool<T, N> {
        PortPool {
            slots: std::array::from_fn(|_| PortSlot::vacant()),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Claims a free slot, writes the record and publishes it. Allocation
    /// order among free slots is not observable by callers.
    pub(crate) fn allocate(&self, init: T) -> Result<&T, PoolError> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.state.load(Ordering::Acquire) == STATE_FREE)
            .ok_or(PoolError::Exhausted)?;
        // Not yet Live, so no other mapping reads the storage here.
        unsafe { *slot.data.get() = init };
        slot.state.store(STATE_LIVE, Ordering::Release);
        Ok(unsafe { &*slot.data.get() })
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.iter().filter_map(|slot| {
            (slot.state.load(Ordering::Acquire) == STATE_LIVE)
                .then(|| unsafe { &*slot.data.get() })
        })
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        let slot = self.slots.get(index)?;
        (slot.state.load(Ordering::Acquire) == STATE_LIVE).then(|| unsafe { &*slot.data.get() })
    }

    pub fn index_of(&self, record: &T) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| ptr::eq(slot.data.get() as *const T, record))
    }

    /// Takes a live record out of circulation without reclaiming its storage.
    pub(crate) fn retire(&self, record: &T) {
        if let Some(index) = self.index_of(record) {
            self.slots[index].state.store(STATE_RETIRING, Ordering::Release);
        }
    }

    /// Returns all retiring slots to the free set. Only called from the
    /// discovery pass, one full pass after the tombstone was observed.
    pub(crate) fn release_retired(&self) -> usize {
        let mut released = 0;
        for slot in &self.slots {
            if slot.state.load(Ordering::Acquire) == STATE_RETIRING {
                slot.state.store(STATE_FREE, Ordering::Release);
                released += 1;
            }
        }
        released
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == STATE_LIVE)
            .count()
    }
}
