//! Error classification & recovery ladder (`SPEC_FULL.md` §4.9, component I).
//!
//! [`ErrorTracker`] keeps a 60 one-second bucket rolling window per NIC so
//! "consecutive ≥10" and "rate ≥20% over 60s" can both be answered in O(1)
//! per event without an unbounded timestamp log. [`RecoveryLadder`] then
//! walks the four-attempt strategy ladder, rate-limited between attempts.

use log::{debug, warn};

use crate::clock::Instant;
use crate::error::{HardwareErrorKind, RxErrorKind, Severity, TxErrorKind};

pub const DEFAULT_WINDOW_MS: u32 = 60_000;
pub const CONSECUTIVE_THRESHOLD: u32 = 10;
pub const RATE_THRESHOLD_PCT: u32 = 20;
pub const DEFAULT_RECOVERY_RETRY_DELAY_MS: u32 = 1_000;

const MAX_WINDOW_SECONDS: usize = 60;

/// What to try next to clear a hardware error, attached per-kind (`§4.9`:
/// "e.g., raise FIFO threshold on Overrun").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RemediationHint {
    RaiseFifoThreshold,
    RenegotiateLink,
    RescheduleAfterTimeout,
    RestartDma,
    None,
}

pub fn severity_of(kind: HardwareErrorKind) -> Severity {
    match kind {
        HardwareErrorKind::Rx(RxErrorKind::Dma) | HardwareErrorKind::Tx(TxErrorKind::Dma) => {
            Severity::Fatal
        }
        HardwareErrorKind::Rx(RxErrorKind::Timeout)
        | HardwareErrorKind::Tx(TxErrorKind::Timeout)
        | HardwareErrorKind::Tx(TxErrorKind::CarrierLost) => Severity::Critical,
        HardwareErrorKind::Rx(RxErrorKind::Overrun)
        | HardwareErrorKind::Rx(RxErrorKind::Crc)
        | HardwareErrorKind::Rx(RxErrorKind::Frame)
        | HardwareErrorKind::Rx(RxErrorKind::Length)
        | HardwareErrorKind::Rx(RxErrorKind::Alignment)
        | HardwareErrorKind::Rx(RxErrorKind::LateCollision)
        | HardwareErrorKind::Tx(TxErrorKind::Underrun)
        | HardwareErrorKind::Tx(TxErrorKind::ExcessiveCollisions)
        | HardwareErrorKind::Tx(TxErrorKind::Window) => Severity::Warning,
        HardwareErrorKind::Tx(TxErrorKind::Collision) | HardwareErrorKind::Tx(TxErrorKind::Heartbeat) => {
            Severity::Info
        }
    }
}

pub fn remediation_hint(kind: HardwareErrorKind) -> RemediationHint {
    match kind {
        HardwareErrorKind::Rx(RxErrorKind::Overrun) | HardwareErrorKind::Tx(TxErrorKind::Underrun) => {
            RemediationHint::RaiseFifoThreshold
        }
        HardwareErrorKind::Rx(RxErrorKind::LateCollision)
        | HardwareErrorKind::Tx(TxErrorKind::ExcessiveCollisions)
        | HardwareErrorKind::Tx(TxErrorKind::CarrierLost) => RemediationHint::RenegotiateLink,
        HardwareErrorKind::Rx(RxErrorKind::Timeout) | HardwareErrorKind::Tx(TxErrorKind::Timeout) => {
            RemediationHint::RescheduleAfterTimeout
        }
        HardwareErrorKind::Rx(RxErrorKind::Dma) | HardwareErrorKind::Tx(TxErrorKind::Dma) => {
            RemediationHint::RestartDma
        }
        _ => RemediationHint::None,
    }
}

#[derive(Debug, Copy, Clone)]
struct Bucket {
    second: u32,
    errors: u16,
    total: u16,
}

impl Default for Bucket {
    fn default() -> Self {
        Self { second: 0, errors: 0, total: 0 }
    }
}

/// Rolling error-rate tracker for one NIC (`§4.9` "Thresholds").
pub struct ErrorTracker {
    consecutive_errors: u32,
    buckets: [Bucket; MAX_WINDOW_SECONDS],
    window_ms: u32,
}

impl ErrorTracker {
    pub fn new(window_ms: u32) -> Self {
        Self {
            consecutive_errors: 0,
            buckets: [Bucket::default(); MAX_WINDOW_SECONDS],
            window_ms,
        }
    }

    fn window_seconds(&self) -> u32 {
        (self.window_ms / 1_000).clamp(1, MAX_WINDOW_SECONDS as u32)
    }

    /// Records one observation: an RX/TX attempt that either succeeded or
    /// failed. A success resets the consecutive-error counter; a failure
    /// extends it and counts toward the windowed rate.
    pub fn record(&mut self, now: Instant, is_error: bool) {
        let second = now.0 / 1_000;
        let idx = (second as usize) % MAX_WINDOW_SECONDS;
        if self.buckets[idx].second != second || self.buckets[idx].total == 0 {
            self.buckets[idx] = Bucket { second, errors: 0, total: 0 };
        }
        self.buckets[idx].total = self.buckets[idx].total.saturating_add(1);
        if is_error {
            self.buckets[idx].errors = self.buckets[idx].errors.saturating_add(1);
            self.consecutive_errors += 1;
            if self.consecutive_errors == CONSECUTIVE_THRESHOLD {
                warn!("recovery: consecutive error threshold reached ({CONSECUTIVE_THRESHOLD})");
            }
        } else {
            self.consecutive_errors = 0;
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Error rate over the configured window, as an integer percentage.
    pub fn error_rate_pct(&self, now: Instant) -> u32 {
        let window_seconds = self.window_seconds();
        let current_second = now.0 / 1_000;
        let mut errors = 0u32;
        let mut total = 0u32;
        for bucket in self.buckets.iter() {
            if bucket.total > 0 && current_second.wrapping_sub(bucket.second) < window_seconds {
                errors += bucket.errors as u32;
                total += bucket.total as u32;
            }
        }
        if total == 0 {
            0
        } else {
            (errors * 100) / total
        }
    }

    /// Whether recovery should be triggered (`§4.9`: consecutive ≥10 or
    /// rate ≥20%).
    pub fn should_recover(&self, now: Instant) -> bool {
        self.consecutive_errors >= CONSECUTIVE_THRESHOLD || self.error_rate_pct(now) >= RATE_THRESHOLD_PCT
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.buckets = [Bucket::default(); MAX_WINDOW_SECONDS];
    }
}

/// The four-attempt strategy ladder (`§4.9`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecoveryAction {
    SoftReset,
    HardReset,
    Reinitialize,
    Disable,
}

pub struct RecoveryLadder {
    attempt: u8,
    last_attempt: Option<Instant>,
    retry_delay_ms: u32,
    pub disabled: bool,
}

impl RecoveryLadder {
    pub fn new(retry_delay_ms: u32) -> Self {
        Self { attempt: 0, last_attempt: None, retry_delay_ms, disabled: false }
    }

    /// Returns the next action to attempt, or `None` if rate-limited
    /// (`recovery_retry_delay_ms` hasn't elapsed since the last attempt).
    pub fn next_action(&mut self, now: Instant) -> Option<RecoveryAction> {
        if self.disabled {
            return None;
        }
        if let Some(last) = self.last_attempt {
            if now.elapsed_since(last) < self.retry_delay_ms {
                return None;
            }
        }
        self.attempt += 1;
        self.last_attempt = Some(now);
        let action = match self.attempt {
            1 => RecoveryAction::SoftReset,
            2 => RecoveryAction::HardReset,
            3 => RecoveryAction::Reinitialize,
            _ => {
                self.disabled = true;
                warn!("recovery: ladder exhausted, disabling nic");
                RecoveryAction::Disable
            }
        };
        debug!("recovery: attempt {} -> {action:?}", self.attempt);
        Some(action)
    }

    /// A successful recovery resets the attempt counter (`§4.9`).
    pub fn record_success(&mut self) {
        if self.attempt > 0 {
            debug!("recovery: succeeded after {} attempt(s), resetting ladder", self.attempt);
        }
        self.attempt = 0;
        self.last_attempt = None;
    }

    pub fn attempt(&self) -> u8 {
        self.attempt
    }
}

/// Post-reset validation via status-register polling: `0xFFFF` reads back
/// as "still failed" on ISA bus-float (`§4.9`).
pub fn validate_reset(status: u16) -> bool {
    status != 0xFFFF
}
