//! The error taxonomy shared across every module (`SPEC_FULL.md` §7).
//!
//! Nothing on the data path panics or aborts. Local recovery is attempted
//! for [`DriverError::Backpressure`], [`DriverError::ConstraintViolation`]
//! and [`DriverError::HardwareError`] up to [`Severity::Warning`]; anything
//! more severe surfaces to the failover supervisor.

use core::fmt;

/// Severity attached to a classified hardware error (`§4.9`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

/// RX-side error classes decoded from the device status word (`§4.9`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RxErrorKind {
    Overrun,
    Crc,
    Frame,
    Length,
    Alignment,
    LateCollision,
    Timeout,
    Dma,
}

/// TX-side error classes decoded from the device status word (`§4.9`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TxErrorKind {
    Collision,
    Underrun,
    Timeout,
    ExcessiveCollisions,
    CarrierLost,
    Heartbeat,
    Window,
    Dma,
}

/// Either side of the RX/TX error classification, so a single
/// [`DriverError::HardwareError`] variant can carry both.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HardwareErrorKind {
    Rx(RxErrorKind),
    Tx(TxErrorKind),
}

impl fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx(kind) => write!(f, "rx/{kind:?}"),
            Self::Tx(kind) => write!(f, "tx/{kind:?}"),
        }
    }
}

/// The crate-wide error type (`SPEC_FULL.md` §7).
#[derive(Debug, Copy, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("invalid parameter")]
    InvalidParam,

    /// Queue or ring full; retryable by the caller.
    #[error("backpressure")]
    Backpressure,

    /// Buffer pool exhausted; the scheduler may drop per admission policy.
    #[error("no resources")]
    NoResources,

    /// The selected NIC requires DMA but no translation/lock service is
    /// present under a memory manager. Fatal for that NIC at init.
    #[error("unsafe environment for DMA")]
    UnsafeEnvironment,

    /// A task-only API was invoked while the ISR-nesting counter is nonzero.
    #[error("called from ISR context")]
    CalledFromIsr,

    /// A buffer failed the device's DMA constraints and all three recovery
    /// tiers (`§4.2`) were exhausted or inapplicable.
    #[error("DMA constraint violation")]
    ConstraintViolation,

    /// Decoded from the device status register (`§4.9`).
    #[error("hardware error: {0} ({1:?})")]
    HardwareError(HardwareErrorKind, Severity),

    /// The recovery ladder (`§4.9`) ran to `disable` without success.
    #[error("recovery failed, NIC disabled")]
    RecoveryFailed,
}

impl DriverError {
    /// Whether this error is recoverable in place, without escalating to
    /// the failover supervisor (`§7`).
    pub fn is_locally_recoverable(&self) -> bool {
        match self {
            Self::Backpressure | Self::ConstraintViolation => true,
            Self::HardwareError(_, sev) => *sev <= Severity::Warning,
            _ => false,
        }
    }
}
