//! Per-domain bitmap of pages with stale instructions.
//!
//! Each bit is a "slot". Pages are assigned to slots by their page index modulo the number of
//! slots, so one slot stands in for every page which aliases onto it. This is exact enough for an
//! index-addressed instruction cache: syncing the index range of a slot synchronizes every page
//! which can occupy it.
//!
//! The bitmap never allocates and is safe to modify from any context.

use core::sync::atomic::{AtomicU64, Ordering};

/// The widest bitmap supported.
pub const MAX_SLOTS: u32 = u64::BITS;

/// Describes how page indices are assigned to bitmap slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotGeometry {
    page_shift: u32,
    slots: u32,
}

impl SlotGeometry {
    /// Creates a geometry with an explicit slot count.
    ///
    /// Returns `None` if `slots` is not within `1..=64` or `page_shift` is too large for the
    /// slot addresses to fit in a `usize`.
    pub const fn new(page_shift: u32, slots: u32) -> Option<Self> {
        if slots == 0 || slots > MAX_SLOTS {
            return None;
        }
        // the highest slot base must be addressable
        let top_bit = 32 - (slots - 1).leading_zeros();
        if page_shift >= usize::BITS || page_shift + top_bit >= usize::BITS {
            return None;
        }
        Some(Self { page_shift, slots })
    }

    /// Derives the slot count from the size of one way of the instruction cache.
    ///
    /// One slot is used for each page which fits into a cache way, clamped to `1..=64`.
    pub const fn from_icache(way_size: usize, page_shift: u32) -> Option<Self> {
        if page_shift >= usize::BITS {
            return None;
        }
        let pages = way_size >> page_shift;
        let slots = if pages == 0 {
            1
        } else if pages > MAX_SLOTS as usize {
            MAX_SLOTS
        } else {
            pages as u32
        };
        Self::new(page_shift, slots)
    }

    pub const fn slots(&self) -> u32 {
        self.slots
    }

    pub const fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Returns the slot `page_index` is tracked by.
    pub const fn slot_of(&self, page_index: u64) -> u32 {
        (page_index % self.slots as u64) as u32
    }

    /// Returns the bit `page_index` is tracked by.
    pub const fn slot_mask(&self, page_index: u64) -> u64 {
        1 << self.slot_of(page_index)
    }

    /// Returns the mask with every slot set.
    pub const fn full_mask(&self) -> u64 {
        if self.slots == MAX_SLOTS {
            u64::MAX
        } else {
            (1 << self.slots) - 1
        }
    }

    /// Start of the cache index range covered by `slot`.
    pub const fn slot_base(&self, slot: u32) -> usize {
        (slot as usize) << self.page_shift
    }

    /// Length of the cache index range covered by a single slot.
    pub const fn slot_len(&self) -> usize {
        1 << self.page_shift
    }
}

/// Result of [PendingBitmap::mark].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mark {
    /// The bit was already set, nothing was changed.
    Duplicate,
    /// The bitmap was empty before this mark. The caller must wake the domain.
    Armed,
    /// Other bits were already set. Whoever armed the bitmap is responsible for waking it.
    Joined,
}

#[derive(Debug, Default)]
pub struct PendingBitmap {
    bits: AtomicU64,
}

impl PendingBitmap {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// Sets `mask` in the bitmap.
    ///
    /// Returns how the bitmap changed along with the value after the update.
    pub fn mark(&self, mask: u64) -> (Mark, u64) {
        debug_assert_ne!(mask, 0, "Tried to mark an empty mask");
        let mut old = self.bits.load(Ordering::Acquire);
        loop {
            if old & mask == mask {
                return (Mark::Duplicate, old);
            }
            match self.bits.compare_exchange_weak(
                old,
                old | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if old == 0 => return (Mark::Armed, mask),
                Ok(_) => return (Mark::Joined, old | mask),
                Err(v) => old = v,
            }
        }
    }

    /// Clears the bitmap returning its previous contents.
    pub fn take(&self) -> u64 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    pub fn load(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_clean(&self) -> bool {
        self.load() == 0
    }
}

/// Iterates over the set slots of a bitmap snapshot.
pub(crate) struct SlotIter(pub(crate) u64);

impl Iterator for SlotIter {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            None
        } else {
            let slot = self.0.trailing_zeros();
            self.0 &= self.0 - 1;
            Some(slot)
        }
    }
}
