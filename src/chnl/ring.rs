//! Lock-free SPSC rings over the mapped slots.
//!
//! RequestRing: client produces, daemon consumes. ResponseRing: daemon
//! produces, client consumes. Indexes live in the slot control block so
//! both processes share them.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ShmError;

use super::protocol::{RequestEntry, ResponseEntry};
use super::shm::SharedMemoryRegion;

macro_rules! spsc_ring {
    ($name:ident, $entry:ty, $ring_ptr:ident, $head:ident, $tail:ident) => {
        pub struct $name<'a> {
            entries: *mut $entry,
            capacity: u32,
            mask: u32,
            head: &'a AtomicU32,
            tail: &'a AtomicU32,
        }

        impl<'a> $name<'a> {
            pub fn new(shm: &'a SharedMemoryRegion, slot_id: u32) -> Result<Self, ShmError> {
                let slot_control = shm.slot_control(slot_id)?;
                let entries = shm.$ring_ptr(slot_id)?;
                let capacity = shm.config().ring_size;

                debug_assert!(capacity.is_power_of_two());

                Ok(Self {
                    entries,
                    capacity,
                    mask: capacity - 1,
                    head: &slot_control.$head,
                    tail: &slot_control.$tail,
                })
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
            }

            #[inline]
            pub fn len(&self) -> u32 {
                let head = self.head.load(Ordering::Acquire);
                let tail = self.tail.load(Ordering::Acquire);
                head.wrapping_sub(tail)
            }

            /// Push an entry (producer side). Returns false when full.
            pub fn push(&self, entry: &$entry) -> bool {
                let head = self.head.load(Ordering::Relaxed);
                let tail = self.tail.load(Ordering::Acquire);

                if head.wrapping_sub(tail) >= self.capacity {
                    return false;
                }

                let idx = (head & self.mask) as usize;
                unsafe {
                    std::ptr::write_volatile(self.entries.add(idx), *entry);
                }

                // Release makes the entry visible before the index moves.
                self.head.store(head.wrapping_add(1), Ordering::Release);
                true
            }

            /// Pop an entry (consumer side). Returns None when empty.
            pub fn try_pop(&self) -> Option<$entry> {
                let tail = self.tail.load(Ordering::Relaxed);
                let head = self.head.load(Ordering::Acquire);

                if tail == head {
                    return None;
                }

                let idx = (tail & self.mask) as usize;
                let entry = unsafe { std::ptr::read_volatile(self.entries.add(idx)) };

                self.tail.store(tail.wrapping_add(1), Ordering::Release);
                Some(entry)
            }
        }

        // SAFETY: synchronization is carried entirely by the atomics.
        unsafe impl Send for $name<'_> {}
        unsafe impl Sync for $name<'_> {}
    };
}

spsc_ring!(
    RequestRing,
    RequestEntry,
    request_ring_ptr,
    request_head,
    request_tail
);

spsc_ring!(
    ResponseRing,
    ResponseEntry,
    response_ring_ptr,
    response_head,
    response_tail
);

impl ResponseRing<'_> {
    /// Pop the head entry only if it answers `request_id`.
    pub fn try_pop_by_id(&self, request_id: u64) -> Option<ResponseEntry> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let idx = (tail & self.mask) as usize;
        let entry_ptr = unsafe { self.entries.add(idx) };
        if unsafe { (*entry_ptr).request_id } != request_id {
            return None;
        }

        let entry = unsafe { std::ptr::read_volatile(entry_ptr) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(entry)
    }
}
