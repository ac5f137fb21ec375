//! Narrow capability traits for every external collaborator named in
//! `SPEC_FULL.md` §1/§4.10. The core is generic over these; it ships no
//! concrete binding for real ISA hardware, only the fakes used by its own
//! tests (see `hal::fake`).

use bitflags::bitflags;

use crate::buffer::Direction;
use crate::error::{HardwareErrorKind, RxErrorKind, TxErrorKind};

bitflags! {
    /// Mode bits of the MII status register `NicOps::link_state` decodes
    /// (`SPEC_FULL.md` §4.8 link polling, §4.10).
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct LinkFlags: u8 {
        const UP = 1 << 0;
        const FULL_DUPLEX = 1 << 1;
        const FLOW_CONTROL = 1 << 2;
    }
}

/// Decoded link state, as read back through [`NicOps::link_state`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct LinkState {
    pub flags: LinkFlags,
    pub speed_mbps: u16,
}

impl LinkState {
    pub fn up(&self) -> bool {
        self.flags.contains(LinkFlags::UP)
    }

    pub fn full_duplex(&self) -> bool {
        self.flags.contains(LinkFlags::FULL_DUPLEX)
    }

    pub fn flow_control(&self) -> bool {
        self.flags.contains(LinkFlags::FLOW_CONTROL)
    }
}

/// Outcome of an ISR status-register read, decoded at the boundary into
/// tagged completions rather than raw bits (`SPEC_FULL.md` §9).
#[derive(Debug, Clone, Default)]
pub struct StatusEvent {
    /// Descriptor/FIFO indices of TX completions (own-bit cleared).
    pub tx_completions: heapless::Vec<u16, 32>,
    /// Descriptor indices of RX completions, paired with received length.
    pub rx_completions: heapless::Vec<(u16, u16), 32>,
    /// A fatal error was latched; the ISR must disable the interrupt
    /// source and hand off to the bottom half for recovery (`§4.4` step 2).
    pub fatal: Option<HardwareErrorKind>,
    /// Non-fatal errors observed this read, for counters.
    pub soft_errors: heapless::Vec<HardwareErrorKind, 8>,
}

/// The per-chip capability trait the core drives (`§4.10`, `§9`).
///
/// Two concrete bindings exist outside this crate: a PIO binding for the
/// 3C509B and a bus-master DMA binding for the 3C515-TX. Both expose only
/// this surface to the core.
pub trait NicOps {
    /// Hard/soft reset depending on `hard`. Must be idempotent if retried.
    fn reset(&mut self, hard: bool) -> Result<(), HardwareErrorKind>;

    fn enable_irq(&mut self);
    fn disable_irq(&mut self);

    /// Read and acknowledge the device status word(s), decoding into
    /// [`StatusEvent`]. Must not allocate or block; called from ISR context.
    fn read_status(&mut self) -> StatusEvent;

    fn program_rx_filter(&mut self, promiscuous: bool, multicast: &[[u8; 6]]);

    /// Install `len` bytes at `phys` (or each segment of a scatter list) as
    /// the next TX descriptor and ring the doorbell. Returns `false` if no
    /// descriptor slot is free (`Backpressure` at the ring layer).
    fn tx_ring_push(&mut self, segments: &[(u32, u16)]) -> bool;

    /// Post a fresh RX buffer's physical address/len into the next free RX
    /// descriptor slot. Returns `false` if the ring is full.
    fn rx_refill(&mut self, phys: u32, len: u16) -> bool;

    fn mii_read(&mut self, reg: u8) -> u16;
    fn mii_write(&mut self, reg: u8, value: u16);

    fn link_state(&mut self) -> LinkState;
}

/// The INT 2Fh PCI BIOS multiplex surface (`§1`, out of scope beyond this
/// trait).
pub trait PciBios {
    fn read_config(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32;
    fn write_config(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32);
}

/// The DPMI-like linear→physical translation and page-lock service the
/// platform probe (`§4.1`) depends on.
pub trait MemoryTranslator {
    fn linear_to_physical(&self, linear: usize) -> Option<u32>;
    fn lock_pages(&mut self, linear: usize, len: usize) -> bool;
    fn unlock_pages(&mut self, linear: usize, len: usize);
}

/// Bit-banged MII access, backing [`NicOps::mii_read`]/`mii_write` and the
/// failover supervisor's independent link reads.
pub trait MiiTransceiver {
    fn read(&mut self, phy: u8, reg: u8) -> u16;
    fn write(&mut self, phy: u8, reg: u8, value: u16);
}

/// A bounced mapping's remembered direction, so `sync_for_cpu`/TX copy-in
/// fail closed instead of silently reusing a bounce block across
/// directions (the open question resolved in `SPEC_FULL.md` §4.2).
pub fn direction_allows_cpu_sync(direction: Direction) -> bool {
    matches!(direction, Direction::RxOnly)
}

pub fn direction_allows_tx_copy_in(direction: Direction) -> bool {
    matches!(direction, Direction::TxOnly)
}

pub(crate) fn classify_rx(bit: RxErrorKind) -> HardwareErrorKind {
    HardwareErrorKind::Rx(bit)
}

pub(crate) fn classify_tx(bit: TxErrorKind) -> HardwareErrorKind {
    HardwareErrorKind::Tx(bit)
}

#[cfg(test)]
pub mod fake;
