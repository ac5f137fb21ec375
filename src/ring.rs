//! Descriptor ring & ISR contract (`SPEC_FULL.md` §3 "Descriptor ring",
//! §4.4, component D).
//!
//! The ring only tracks descriptor ownership and drives [`crate::hal::NicOps`]
//! through its trait surface; it never pokes real device registers. The
//! ISR entry point, [`DescriptorRing::on_interrupt`], never allocates,
//! never blocks, and never calls the mapping layer's task-only operations —
//! it can't, because those take a [`crate::isr::Task`] it cannot construct
//! while its own [`crate::isr::IsrGuard`] is live.

use heapless::Vec as HVec;
use log::warn;

use crate::buffer::{BufferType, SizeClass};
use crate::dma::BounceHandle;
use crate::error::DriverError;
use crate::handoff::{HandoffEntry, HandoffQueue};
use crate::hal::{NicOps, StatusEvent};
use crate::isr::IsrGuard;
use crate::pool::BufferPools;
use crate::slab::SlabIndex;

/// Default per-interrupt completion budget (`§4.4`).
pub const DEFAULT_ISR_BUDGET: u16 = 32;

/// A buffer still owned by the device or in flight, tracked by the ring
/// rather than the pool (`§3` ownership invariant: a buffer is referenced
/// by at most one owner at a time).
#[derive(Debug, Copy, Clone)]
struct InFlight {
    class: SizeClass,
    handle: SlabIndex,
}

/// A reclaimed TX descriptor, carrying the bounce handle (if any) so the
/// bottom half can `unmap` it before returning the buffer to its pool
/// (`§4.5` "drain the TX reclaim list: ... call unmap").
#[derive(Debug, Copy, Clone)]
pub struct ReclaimedTx {
    pub class: SizeClass,
    pub handle: SlabIndex,
    pub bounce: Option<BounceHandle>,
}

struct TxInFlight {
    inner: InFlight,
    bounce: Option<BounceHandle>,
}

pub struct DescriptorRing<const TX_N: usize, const RX_N: usize> {
    tx_in_flight: HVec<TxInFlight, TX_N>,
    rx_in_flight: HVec<InFlight, RX_N>,
    reclaim: HVec<ReclaimedTx, TX_N>,
    rx_refill_needed: bool,
    isr_budget: u16,
}

/// Outcome of one ISR invocation, for the bottom half and counters. Carries
/// no buffer data itself — those moved to the handoff queue or the reclaim
/// list during the call.
#[derive(Debug, Default)]
pub struct IsrOutcome {
    pub tx_reclaimed: u16,
    pub rx_delivered: u16,
    pub rx_refill_needed: bool,
    pub fatal: Option<crate::error::HardwareErrorKind>,
    pub soft_errors: u16,
    pub budget_exhausted: bool,
}

impl<const TX_N: usize, const RX_N: usize> DescriptorRing<TX_N, RX_N> {
    pub fn new(isr_budget: u16) -> Self {
        Self {
            tx_in_flight: HVec::new(),
            rx_in_flight: HVec::new(),
            reclaim: HVec::new(),
            rx_refill_needed: false,
            isr_budget,
        }
    }

    pub fn tx_in_flight_len(&self) -> usize {
        self.tx_in_flight.len()
    }

    pub fn reclaim_len(&self) -> usize {
        self.reclaim.len()
    }

    /// `tx_push_ring` (`§4.4`): install descriptors for an already-mapped
    /// buffer and ring the doorbell. `Backpressure` if the device ring (as
    /// reported by `NicOps::tx_ring_push`) or the in-flight tracker is full.
    pub fn tx_push_ring(
        &mut self,
        nic: &mut dyn NicOps,
        class: SizeClass,
        handle: SlabIndex,
        segments: &[(u32, u16)],
        bounce: Option<BounceHandle>,
    ) -> Result<(), DriverError> {
        if self.tx_in_flight.len() == TX_N {
            return Err(DriverError::Backpressure);
        }
        if !nic.tx_ring_push(segments) {
            return Err(DriverError::Backpressure);
        }
        self.tx_in_flight
            .push(TxInFlight {
                inner: InFlight { class, handle },
                bounce,
            })
            .map_err(|_| DriverError::Backpressure)?;
        Ok(())
    }

    /// Pre-populates every RX descriptor at init (`§3` "RX path").
    pub fn rx_prime(
        &mut self,
        nic: &mut dyn NicOps,
        class: SizeClass,
        handle: SlabIndex,
        phys: u32,
    ) -> Result<(), DriverError> {
        if !nic.rx_refill(phys, class.bytes() as u16) {
            return Err(DriverError::Backpressure);
        }
        self.rx_in_flight
            .push(InFlight { class, handle })
            .map_err(|_| DriverError::Backpressure)?;
        Ok(())
    }

    /// The ISR entry point (`§4.4`). Reads and acknowledges status via
    /// `NicOps::read_status`, moves completed TX descriptors to the
    /// reclaim list, copy-breaks or hands off completed RX, and stops
    /// after `isr_budget` completions, setting `budget_exhausted` so the
    /// caller knows more work remains for the next interrupt.
    pub fn on_interrupt<const HQ: usize>(
        &mut self,
        nic: &mut dyn NicOps,
        pools: &mut BufferPools,
        handoff: &HandoffQueue<HQ>,
        source_nic: u8,
    ) -> IsrOutcome {
        let _isr = IsrGuard::enter();
        let event: StatusEvent = nic.read_status();
        let mut outcome = IsrOutcome {
            fatal: event.fatal,
            soft_errors: event.soft_errors.len() as u16,
            ..Default::default()
        };

        if let Some(kind) = event.fatal {
            warn!("ring: nic {source_nic} fatal status {kind:?}, disabling irq");
            nic.disable_irq();
            return outcome;
        }

        let mut budget = self.isr_budget;

        for &desc_index in event.tx_completions.iter() {
            if budget == 0 {
                outcome.budget_exhausted = true;
                break;
            }
            if (desc_index as usize) < self.tx_in_flight.len() {
                let done = self.tx_in_flight.swap_remove(desc_index as usize);
                let reclaimed = ReclaimedTx {
                    class: done.inner.class,
                    handle: done.inner.handle,
                    bounce: done.bounce,
                };
                if self.reclaim.push(reclaimed).is_ok() {
                    outcome.tx_reclaimed += 1;
                }
            }
            budget -= 1;
        }

        for &(desc_index, len) in event.rx_completions.iter() {
            if budget == 0 {
                outcome.budget_exhausted = true;
                break;
            }
            if (desc_index as usize) >= self.rx_in_flight.len() {
                budget -= 1;
                continue;
            }
            let slot = self.rx_in_flight.swap_remove(desc_index as usize);

            let delivered = if pools.should_copy_break(len as usize) {
                // Copy-break: stage into a small buffer, return the large
                // DMA buffer to its pool immediately.
                match pools.alloc_for_len(len as usize, BufferType::Rx, &NullClock) {
                    Ok((small_class, small_handle)) => {
                        let entry =
                            HandoffEntry::new(small_class, small_handle, len, source_nic);
                        let ok = handoff.enqueue(entry);
                        pools.free(slot.class, slot.handle);
                        ok
                    }
                    Err(_) => false,
                }
            } else {
                let entry = HandoffEntry::new(slot.class, slot.handle, len, source_nic);
                handoff.enqueue(entry)
            };

            if delivered {
                outcome.rx_delivered += 1;
            }
            self.rx_refill_needed = true;
            budget -= 1;
        }

        outcome.rx_refill_needed = self.rx_refill_needed;
        outcome
    }

    pub fn take_reclaimed(&mut self) -> HVec<ReclaimedTx, TX_N> {
        let mut out = HVec::new();
        while let Some(item) = self.reclaim.pop() {
            let _ = out.push(item);
        }
        out
    }

    pub fn clear_rx_refill_needed(&mut self) {
        self.rx_refill_needed = false;
    }

    pub fn rx_refill_needed(&self) -> bool {
        self.rx_refill_needed
    }
}

/// The ISR never needs a real clock for the copy-break allocation path
/// above (buffers don't carry a meaningful timestamp mid-interrupt beyond
/// "now"); this stands in for one without requiring a `&dyn Clock` plumbed
/// through every `NicOps` call site.
struct NullClock;

impl crate::clock::Clock for NullClock {
    fn now_ms(&self) -> crate::clock::Instant {
        crate::clock::Instant(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::hal::fake::FakeNic;

    #[test]
    fn budget_caps_completions_in_one_interrupt() {
        let mut ring: DescriptorRing<64, 64> = DescriptorRing::new(32);
        let mut pools = BufferPools::default();
        let handoff: HandoffQueue<64> = HandoffQueue::new();
        let clock = VirtualClock::new();
        let mut nic = FakeNic::default();

        for _ in 0..40 {
            let (class, handle) = pools.alloc_for_len(1000, BufferType::Rx, &clock).unwrap();
            ring.rx_prime(&mut nic, class, handle, 0x1000).unwrap();
        }

        let mut event = StatusEvent::default();
        for i in 0..40u16 {
            let _ = event.rx_completions.push((i, 1000));
        }
        nic.next_status = event;

        let outcome = ring.on_interrupt(&mut nic, &mut pools, &handoff, 0);
        assert!(outcome.budget_exhausted);
        assert_eq!(outcome.rx_delivered, 32);
        assert_eq!(handoff.len(), 32);
    }

    #[test]
    fn fatal_status_disables_irq_without_processing_completions() {
        let mut ring: DescriptorRing<8, 8> = DescriptorRing::new(32);
        let mut pools = BufferPools::default();
        let handoff: HandoffQueue<8> = HandoffQueue::new();
        let mut nic = FakeNic::default();
        nic.irq_enabled = true;
        nic.next_status = StatusEvent {
            fatal: Some(crate::error::HardwareErrorKind::Rx(
                crate::error::RxErrorKind::Overrun,
            )),
            ..Default::default()
        };

        let outcome = ring.on_interrupt(&mut nic, &mut pools, &handoff, 0);
        assert!(outcome.fatal.is_some());
        assert!(!nic.irq_enabled);
    }
}
