//! Bounce buffer pool (`SPEC_FULL.md` §4.2, §9).
//!
//! Backed by a bitmap over a fixed number of fixed-size blocks, all
//! pre-locked at construction so no lock/translate call is needed on the
//! data path. A block's physical address is computed once, at
//! construction, from the pool's own base address — which a real binding
//! obtains from a conventional-memory allocator below the 16MB ISA DMA
//! ceiling.

use crate::buffer::Direction;
use crate::error::DriverError;

pub const BOUNCE_BLOCK_LEN: u32 = 2048;

/// A fixed-capacity bitmap allocator over `N` blocks of a bounce region.
/// Must never be invoked from ISR context (`§4.2` "ISR safety"); callers
/// prove this with a [`crate::isr::Task`] token.
pub struct BouncePool<const N: usize> {
    base_phys: u32,
    free_bitmap: [bool; N],
    free_count: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BounceHandle {
    index: u16,
    pub phys_addr: u32,
    pub direction: Direction,
}

impl<const N: usize> BouncePool<N> {
    /// `base_phys` must already satisfy the owning device's constraints:
    /// below its `addr_bits` ceiling, and the whole region must not cross
    /// a no-cross boundary block-by-block. A real binding carves this
    /// region out of a conventional-memory arena reserved at driver init.
    pub fn new(base_phys: u32) -> Self {
        Self {
            base_phys,
            free_bitmap: [true; N],
            free_count: N,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn capacity(&self) -> usize {
        N
    }

    fn block_phys(&self, index: usize) -> u32 {
        self.base_phys + (index as u32) * BOUNCE_BLOCK_LEN
    }

    /// `_task` proves this isn't running from the ISR; the bitmap scan and
    /// mutation below would otherwise be the "allocator invoked from
    /// interrupt context" the spec forbids.
    pub fn alloc(
        &mut self,
        direction: Direction,
        _task: crate::isr::Task,
    ) -> Result<BounceHandle, DriverError> {
        let index = self
            .free_bitmap
            .iter()
            .position(|free| *free)
            .ok_or(DriverError::NoResources)?;
        self.free_bitmap[index] = false;
        self.free_count -= 1;
        Ok(BounceHandle {
            index: index as u16,
            phys_addr: self.block_phys(index),
            direction,
        })
    }

    pub fn free(&mut self, handle: BounceHandle, _task: crate::isr::Task) {
        let index = handle.index as usize;
        if !self.free_bitmap[index] {
            self.free_bitmap[index] = true;
            self.free_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isr::Task;

    #[test]
    fn alloc_free_round_trip_preserves_free_count() {
        let mut pool: BouncePool<4> = BouncePool::new(0x1000);
        let before = pool.free_count();
        let handle = pool.alloc(Direction::TxOnly, Task::enter().unwrap()).unwrap();
        assert_eq!(pool.free_count(), before - 1);
        pool.free(handle, Task::enter().unwrap());
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn exhausted_pool_refuses_with_no_resources() {
        let mut pool: BouncePool<1> = BouncePool::new(0x2000);
        pool.alloc(Direction::RxOnly, Task::enter().unwrap()).unwrap();
        let err = pool
            .alloc(Direction::RxOnly, Task::enter().unwrap())
            .unwrap_err();
        assert!(matches!(err, DriverError::NoResources));
    }

    #[test]
    fn blocks_stay_within_64kb_boundary_by_construction() {
        let pool: BouncePool<4> = BouncePool::new(0x1_0000 - (BOUNCE_BLOCK_LEN * 4));
        for i in 0..4 {
            let addr = pool.block_phys(i);
            let crosses = crate::dma::constraints::Constraints::ISA
                .crosses_boundary(addr, BOUNCE_BLOCK_LEN);
            assert!(!crosses);
        }
    }
}
