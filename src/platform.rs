//! Platform probe (`SPEC_FULL.md` §4.1).
//!
//! Produces a [`DmaPolicy`] once at driver construction; the decision is
//! never revisited, so every downstream component branches on the policy
//! value rather than re-probing the environment (`§9`).

use crate::error::DriverError;
use crate::hal::MemoryTranslator;

/// Whether the device a policy is being chosen for needs bus-master DMA.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceClass {
    /// 3C509B: programmed I/O only, never touches physical addresses.
    PioOnly,
    /// 3C515-TX: bus-master DMA.
    BusMaster,
}

/// CPU addressing mode, as observed by the probe.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CpuMode {
    /// Real mode, no memory manager: linear addresses are physical.
    Real,
    /// Virtual-8086 mode under a memory manager (EMM386, QEMM, Windows
    /// enhanced mode, ...): linear addresses may be remapped at any time.
    Virtual8086 { translator_present: bool },
}

/// The chosen DMA strategy for a NIC binding (`§4.1`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DmaPolicy {
    /// No memory manager: DMA straight from conventional memory.
    Direct,
    /// V86 with a translation+lock service: direct DMA is safe once a
    /// buffer's pages are locked and translated.
    CommonBuffer,
    /// V86 without a reliable lock service: every DMA transfer must stage
    /// through a pre-locked bounce pool.
    BounceAlways,
    /// The device does not DMA at all.
    PioOnly,
}

/// Probes the host environment and selects a [`DmaPolicy`] for one device
/// class. Pure function of its inputs so it is unit-testable without a
/// real V86/DPMI host.
pub fn select_dma_policy(
    class: DeviceClass,
    cpu: CpuMode,
    translator: &dyn MemoryTranslator,
) -> Result<DmaPolicy, DriverError> {
    if class == DeviceClass::PioOnly {
        return Ok(DmaPolicy::PioOnly);
    }

    match cpu {
        CpuMode::Real => Ok(DmaPolicy::Direct),
        CpuMode::Virtual8086 {
            translator_present: true,
        } => {
            // A present service is not necessarily a *locking* service;
            // probe it the same way the real driver would before init.
            if translator.linear_to_physical(0).is_some() {
                Ok(DmaPolicy::CommonBuffer)
            } else {
                Ok(DmaPolicy::BounceAlways)
            }
        }
        CpuMode::Virtual8086 {
            translator_present: false,
        } => {
            // No translation service under V86 and the device needs DMA:
            // bouncing through a pre-locked common buffer is still safe
            // because that buffer was locked once, at probe time, by
            // construction of the bounce pool — but if the platform can't
            // even guarantee *that* lock, it's unsafe outright.
            Err(DriverError::UnsafeEnvironment)
        }
    }
}
