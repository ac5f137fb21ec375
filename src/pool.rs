//! Buffer pool & copy-break (`SPEC_FULL.md` §4.3).
//!
//! Each size class is an intrusive singly-linked free list in the
//! distilled spec; here it is a fixed-capacity [`Slab`] with a free-index
//! stack, protected by a brief interrupt mask on the task side
//! (`hermit_sync::without_interrupts`) since the ISR never touches it
//! directly but the bottom half and the ring do.

use hermit_sync::without_interrupts;
use log::warn;

use crate::buffer::{BufferState, BufferType, FrameBuffer, SizeClass, FREE_MAGIC};
use crate::clock::Clock;
use crate::error::DriverError;
use crate::slab::{Slab, SlabIndex};

/// Per-NIC capacity for each size class. Conservative defaults; a real
/// binding sizes these to its descriptor ring depth plus headroom.
pub const POOL_CAPACITY: usize = 64;

pub struct SizeClassPool {
    pool_id: u8,
    class: SizeClass,
    slab: Slab<FrameBuffer, POOL_CAPACITY>,
    double_free_count: u32,
    cross_pool_free_count: u32,
}

impl SizeClassPool {
    pub fn new(pool_id: u8, class: SizeClass) -> Self {
        Self {
            pool_id,
            class,
            slab: Slab::new(),
            double_free_count: 0,
            cross_pool_free_count: 0,
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn in_use(&self) -> usize {
        self.slab.len()
    }

    /// `alloc(class)` contract from §4.3: returns a buffer with
    /// `state = Allocated`, `used = 0`, a valid magic.
    pub fn alloc(
        &mut self,
        kind: BufferType,
        clock: &dyn Clock,
    ) -> Result<SlabIndex, DriverError> {
        let buf = FrameBuffer::new(self.class, kind, self.pool_id, clock.now_ms());
        self.slab.insert(buf).map_err(|_| DriverError::NoResources)
    }

    pub fn get(&self, handle: SlabIndex) -> Option<&FrameBuffer> {
        self.slab.get(handle)
    }

    pub fn get_mut(&mut self, handle: SlabIndex) -> Option<&mut FrameBuffer> {
        self.slab.get_mut(handle)
    }

    /// `free(buf)` contract from §4.3: zero the magic, mark `Free`, relink.
    /// Double-free and cross-pool free are detected via the magic word and
    /// the buffer's embedded pool id; both are reported (non-fatal) and
    /// the second free is dropped rather than corrupting the slab.
    pub fn free(&mut self, handle: SlabIndex) -> FreeOutcome {
        let Some(buf) = self.slab.get_mut(handle) else {
            // Handle's generation is stale: this is exactly a double-free
            // (the slot may already have been reallocated).
            self.double_free_count += 1;
            warn!("pool: double free on pool {} (stale generation)", self.pool_id);
            return FreeOutcome::DoubleFree;
        };

        if buf.pool_id != self.pool_id {
            self.cross_pool_free_count += 1;
            warn!("pool: cross-pool free, buffer belongs to pool {}, freed via pool {}", buf.pool_id, self.pool_id);
            return FreeOutcome::CrossPoolFree;
        }

        if !buf.is_valid() {
            self.double_free_count += 1;
            warn!("pool: double free on pool {} (bad magic)", self.pool_id);
            return FreeOutcome::DoubleFree;
        }

        buf.magic = FREE_MAGIC;
        buf.state = BufferState::Free;
        self.slab.remove(handle);
        FreeOutcome::Freed
    }

    pub fn double_free_count(&self) -> u32 {
        self.double_free_count
    }

    pub fn cross_pool_free_count(&self) -> u32 {
        self.cross_pool_free_count
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FreeOutcome {
    Freed,
    DoubleFree,
    CrossPoolFree,
}

/// The full size-classed pool set for one NIC, plus the copy-break
/// threshold that decides which class an RX completion lands in.
pub struct BufferPools {
    classes: [SizeClassPool; 4],
    copy_break_threshold: usize,
}

impl BufferPools {
    pub fn new(copy_break_threshold: usize) -> Self {
        let mut pool_id = 0u8;
        let classes = SizeClass::ALL.map(|class| {
            let pool = SizeClassPool::new(pool_id, class);
            pool_id += 1;
            pool
        });
        Self {
            classes,
            copy_break_threshold,
        }
    }

    fn pool_for_mut(&mut self, class: SizeClass) -> &mut SizeClassPool {
        self.classes
            .iter_mut()
            .find(|p| p.class == class)
            .expect("SizeClass::ALL covers every pool")
    }

    /// Allocates from the smallest class that fits `len`, masking
    /// interrupts for the duration (`§4.3`, §5 "brief interrupt mask").
    pub fn alloc_for_len(
        &mut self,
        len: usize,
        kind: BufferType,
        clock: &dyn Clock,
    ) -> Result<(SizeClass, SlabIndex), DriverError> {
        let class = SizeClass::smallest_fit(len).ok_or(DriverError::InvalidParam)?;
        without_interrupts(|| {
            let pool = self.pool_for_mut(class);
            pool.alloc(kind, clock).map(|handle| (class, handle))
        })
    }

    pub fn free(&mut self, class: SizeClass, handle: SlabIndex) -> FreeOutcome {
        without_interrupts(|| self.pool_for_mut(class).free(handle))
    }

    pub fn get(&self, class: SizeClass, handle: SlabIndex) -> Option<&FrameBuffer> {
        self.classes.iter().find(|p| p.class == class)?.get(handle)
    }

    pub fn get_mut(&mut self, class: SizeClass, handle: SlabIndex) -> Option<&mut FrameBuffer> {
        self.pool_for_mut(class).get_mut(handle)
    }

    pub fn copy_break_threshold(&self) -> usize {
        self.copy_break_threshold
    }

    /// Whether an RX frame of `len` bytes should be copy-broken into a
    /// small buffer (`§4.3`).
    pub fn should_copy_break(&self, len: usize) -> bool {
        len <= self.copy_break_threshold
    }

    pub fn double_free_total(&self) -> u32 {
        self.classes.iter().map(SizeClassPool::double_free_count).sum()
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(crate::buffer::DEFAULT_COPY_BREAK_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::VirtualClock;

    #[test]
    fn alloc_picks_smallest_fitting_class() {
        let mut pools = BufferPools::default();
        let clock = VirtualClock::new();
        let (class, _) = pools.alloc_for_len(40, BufferType::Rx, &clock).unwrap();
        assert_eq!(class, SizeClass::C64);
    }

    #[test]
    fn double_free_is_reported_not_fatal() {
        let mut pools = BufferPools::default();
        let clock = VirtualClock::new();
        let (class, handle) = pools.alloc_for_len(40, BufferType::Rx, &clock).unwrap();
        assert_eq!(pools.free(class, handle), FreeOutcome::Freed);
        assert_eq!(pools.free(class, handle), FreeOutcome::DoubleFree);
        assert_eq!(pools.double_free_total(), 1);
    }

    #[test]
    fn copy_break_threshold_is_inclusive() {
        let pools = BufferPools::new(200);
        assert!(pools.should_copy_break(200));
        assert!(!pools.should_copy_break(201));
    }

    proptest! {
        /// §8 invariant 2: a buffer's magic is valid for exactly one
        /// `alloc` -> `free` cycle; every extra `free` against the same
        /// handle is reported as `DoubleFree`, never silently accepted.
        #[test]
        fn repeated_free_is_always_reported_as_double_free(extra_frees in 0usize..5) {
            let mut pools = BufferPools::default();
            let clock = VirtualClock::new();
            let (class, handle) = pools.alloc_for_len(40, BufferType::Rx, &clock).unwrap();

            prop_assert_eq!(pools.get(class, handle).unwrap().state, BufferState::Allocated);
            prop_assert_eq!(pools.free(class, handle), FreeOutcome::Freed);

            for _ in 0..extra_frees {
                prop_assert_eq!(pools.free(class, handle), FreeOutcome::DoubleFree);
            }
            prop_assert_eq!(pools.double_free_total(), extra_frees as u32);
        }
    }
}
