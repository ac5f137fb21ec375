//! Software bindings of the `hal` traits, used only by this crate's own
//! tests. Never shipped as a real chip binding.

use alloc::vec::Vec;

use super::{LinkState, MemoryTranslator, MiiTransceiver, NicOps, PciBios, StatusEvent};
use crate::error::HardwareErrorKind;

/// A `NicOps` double that records pushed TX segments and lets a test feed
/// it a canned [`StatusEvent`] to return from the next `read_status`.
#[derive(Default)]
pub struct FakeNic {
    pub irq_enabled: bool,
    pub reset_count: u32,
    pub tx_pushes: Vec<Vec<(u32, u16)>>,
    pub rx_refills: Vec<(u32, u16)>,
    pub next_status: StatusEvent,
    pub link: LinkState,
    pub promiscuous: bool,
    pub multicast: Vec<[u8; 6]>,
    pub tx_ring_full: bool,
    pub rx_ring_full: bool,
}

impl NicOps for FakeNic {
    fn reset(&mut self, _hard: bool) -> Result<(), HardwareErrorKind> {
        self.reset_count += 1;
        Ok(())
    }

    fn enable_irq(&mut self) {
        self.irq_enabled = true;
    }

    fn disable_irq(&mut self) {
        self.irq_enabled = false;
    }

    fn read_status(&mut self) -> StatusEvent {
        core::mem::take(&mut self.next_status)
    }

    fn program_rx_filter(&mut self, promiscuous: bool, multicast: &[[u8; 6]]) {
        self.promiscuous = promiscuous;
        self.multicast = multicast.to_vec();
    }

    fn tx_ring_push(&mut self, segments: &[(u32, u16)]) -> bool {
        if self.tx_ring_full {
            return false;
        }
        self.tx_pushes.push(segments.to_vec());
        true
    }

    fn rx_refill(&mut self, phys: u32, len: u16) -> bool {
        if self.rx_ring_full {
            return false;
        }
        self.rx_refills.push((phys, len));
        true
    }

    fn mii_read(&mut self, _reg: u8) -> u16 {
        0
    }

    fn mii_write(&mut self, _reg: u8, _value: u16) {}

    fn link_state(&mut self) -> LinkState {
        self.link
    }
}

/// A `MemoryTranslator` that models a flat, identity-mapped address space
/// with an optional "hole" range that fails translation (for exercising
/// `UnsafeEnvironment`/scatter-across-boundary scenarios).
#[derive(Default)]
pub struct FlatMemory {
    pub lock_service_present: bool,
}

impl MemoryTranslator for FlatMemory {
    fn linear_to_physical(&self, linear: usize) -> Option<u32> {
        u32::try_from(linear).ok()
    }

    fn lock_pages(&mut self, _linear: usize, _len: usize) -> bool {
        self.lock_service_present
    }

    fn unlock_pages(&mut self, _linear: usize, _len: usize) {}
}

#[derive(Default)]
pub struct FakeMii {
    pub registers: [u16; 32],
}

impl MiiTransceiver for FakeMii {
    fn read(&mut self, _phy: u8, reg: u8) -> u16 {
        self.registers[reg as usize & 0x1f]
    }

    fn write(&mut self, _phy: u8, reg: u8, value: u16) {
        self.registers[reg as usize & 0x1f] = value;
    }
}

#[derive(Default)]
pub struct FakePciBios;

impl PciBios for FakePciBios {
    fn read_config(&self, _bus: u8, _device: u8, _function: u8, _offset: u8) -> u32 {
        0xFFFF_FFFF
    }

    fn write_config(&mut self, _bus: u8, _device: u8, _function: u8, _offset: u8, _value: u32) {}
}
