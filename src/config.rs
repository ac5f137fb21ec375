//! Driver-wide configuration (`SPEC_FULL.md` §10 "Ambient stack").
//!
//! A single [`DriverConfig`] composes each module's own `*Config`/default
//! constants and is validated once, at construction, before any NIC is
//! touched (`§10`: "invalid configuration is rejected with `InvalidParam`
//! before any NIC is touched").

use crate::error::DriverError;
use crate::failover::FailoverConfig;
use crate::ring::DEFAULT_ISR_BUDGET;
use crate::router::RouterConfig;
use crate::scheduler::SchedulerConfig;

/// Tunables not already owned by another module's own config type.
#[derive(Debug, Copy, Clone)]
pub struct PipelineConfig {
    pub copy_break_threshold: usize,
    pub isr_budget: u16,
    pub bottomhalf_batch: usize,
    pub recovery_window_ms: u32,
    pub recovery_retry_delay_ms: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            copy_break_threshold: crate::buffer::DEFAULT_COPY_BREAK_THRESHOLD,
            isr_budget: DEFAULT_ISR_BUDGET,
            bottomhalf_batch: crate::bottomhalf::DEFAULT_BOTTOMHALF_BATCH,
            recovery_window_ms: crate::recovery::DEFAULT_WINDOW_MS,
            recovery_retry_delay_ms: crate::recovery::DEFAULT_RECOVERY_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct DriverConfig {
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub router: RouterConfig,
    pub failover: FailoverConfig,
}

impl DriverConfig {
    /// Validates every numeric tunable named in `§4`. Rejects anything that
    /// would make a bounded collection's capacity math degenerate (a zero
    /// budget, an inverted watermark pair, and so on).
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.pipeline.copy_break_threshold == 0 {
            return Err(DriverError::InvalidParam);
        }
        if self.pipeline.isr_budget == 0 {
            return Err(DriverError::InvalidParam);
        }
        if self.pipeline.bottomhalf_batch == 0 {
            return Err(DriverError::InvalidParam);
        }
        if self.pipeline.recovery_window_ms == 0 {
            return Err(DriverError::InvalidParam);
        }

        if self.scheduler.high_watermark_pct <= self.scheduler.low_watermark_pct {
            return Err(DriverError::InvalidParam);
        }
        if self.scheduler.high_watermark_pct > 100 {
            return Err(DriverError::InvalidParam);
        }
        if self.scheduler.max_urgent_evictions == 0 {
            return Err(DriverError::InvalidParam);
        }

        if self.router.max_bridge_entries == 0 {
            return Err(DriverError::InvalidParam);
        }
        if self.router.aging_ms == 0 {
            return Err(DriverError::InvalidParam);
        }

        if self.failover.link_stable_ms == 0 || self.failover.failback_ms == 0 {
            return Err(DriverError::InvalidParam);
        }
        if self.failover.loss_threshold == 0 {
            return Err(DriverError::InvalidParam);
        }

        Ok(())
    }
}
