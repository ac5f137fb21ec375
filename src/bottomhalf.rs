//! Bottom-half worker (`SPEC_FULL.md` §4.5, component E).
//!
//! Runs in task context: drains the TX reclaim list (unmap, return to
//! pool), drains the SPSC handoff queue (copy-break already done in the
//! ISR; here the frame goes through the router and either upward or to a
//! peer NIC's TX path), refills RX when the ISR flagged it, batch-bounded
//! so one worker invocation can't starve other NICs.

use heapless::Vec as HVec;

use crate::buffer::{BufferType, SizeClass};
use crate::clock::Clock;
use crate::dma::BouncePool;
use crate::handoff::HandoffQueue;
use crate::hal::NicOps;
use crate::isr::Task;
use crate::pool::BufferPools;
use crate::ring::DescriptorRing;
use crate::slab::SlabIndex;

/// Upper bound on frames drained from the handoff queue per invocation
/// (`§4.5` "batch-bounded").
pub const DEFAULT_BOTTOMHALF_BATCH: usize = 16;

/// What the bottom half does with one delivered frame, decided by the
/// router (`§4.7`) one layer up — the worker itself is router-agnostic so
/// it can be unit-tested without constructing a full `Driver`.
#[derive(Debug)]
pub enum Delivery {
    Upward { class: SizeClass, handle: SlabIndex, len: u16 },
    ForwardTo { nic: u8, class: SizeClass, handle: SlabIndex, len: u16 },
    Dropped,
}

pub struct BottomHalf {
    batch: usize,
}

impl BottomHalf {
    pub fn new(batch: usize) -> Self {
        Self { batch }
    }

    /// Drains the TX reclaim list: unmaps every completed buffer and
    /// returns it to its pool. Bounce buffers release their block here,
    /// not in the ISR.
    pub fn drain_tx_reclaim<const TX_N: usize, const RX_N: usize, const BOUNCE_N: usize>(
        &self,
        ring: &mut DescriptorRing<TX_N, RX_N>,
        pools: &mut BufferPools,
        bounce_pool: &mut BouncePool<BOUNCE_N>,
        task: Task,
    ) -> usize {
        let reclaimed = ring.take_reclaimed();
        let count = reclaimed.len();
        for item in reclaimed {
            if let Some(handle) = item.bounce {
                bounce_pool.free(handle, task);
            }
            pools.free(item.class, item.handle);
        }
        count
    }

    /// Drains up to `self.batch` entries from the handoff queue, handing
    /// each to `decide` (the router) and applying the resulting
    /// [`Delivery`].
    pub fn drain_handoff<const HQ: usize>(
        &self,
        handoff: &HandoffQueue<HQ>,
        pools: &mut BufferPools,
        mut decide: impl FnMut(SlabIndex, SizeClass, u16, u8) -> Delivery,
        mut deliver_upward: impl FnMut(SizeClass, SlabIndex, u16),
        mut forward: impl FnMut(u8, SizeClass, SlabIndex, u16),
    ) -> usize {
        let mut processed = 0;
        while processed < self.batch {
            let Some(entry) = handoff.dequeue() else {
                break;
            };
            match decide(entry.handle, entry.class, entry.len, entry.source_nic) {
                Delivery::Upward { class, handle, len } => deliver_upward(class, handle, len),
                Delivery::ForwardTo { nic, class, handle, len } => {
                    forward(nic, class, handle, len)
                }
                Delivery::Dropped => pools.free(entry.class, entry.handle),
            }
            processed += 1;
        }
        processed
    }

    /// Refills the RX ring when the ISR set the flag (`§4.4`/`§4.5`),
    /// allocating a fresh buffer per free descriptor slot up to `count`.
    pub fn refill_rx<const TX_N: usize, const RX_N: usize>(
        &self,
        ring: &mut DescriptorRing<TX_N, RX_N>,
        nic: &mut dyn NicOps,
        pools: &mut BufferPools,
        clock: &dyn Clock,
        count: usize,
    ) -> Result<usize, crate::error::DriverError> {
        if !ring.rx_refill_needed() {
            return Ok(0);
        }
        let mut refilled = 0;
        for _ in 0..count {
            let (class, handle) = pools.alloc_for_len(SizeClass::C1518.bytes(), BufferType::Rx, clock)?;
            let phys = pools
                .get(class, handle)
                .and_then(|buf| buf.phys_addr)
                .unwrap_or(0);
            ring.rx_prime(nic, class, handle, phys)?;
            refilled += 1;
        }
        ring.clear_rx_refill_needed();
        Ok(refilled)
    }

    /// Deterministic shutdown drain (`§4.5`, `§5`): consume everything
    /// still queued and return every buffer to its pool, with no partial
    /// in-flight state left behind.
    pub fn shutdown_drain<const HQ: usize>(&self, handoff: &HandoffQueue<HQ>, pools: &mut BufferPools) {
        handoff.drain(|entry| pools.free(entry.class, entry.handle));
    }
}
