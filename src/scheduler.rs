//! Priority TX scheduler (`SPEC_FULL.md` §4.6, component F).
//!
//! Four fixed-capacity priority queues serviced strict-priority,
//! FIFO-within-class. Admission follows the ladder in `§4.6` exactly:
//! `Urgent` may evict entries from the lowest non-empty lower queue before
//! giving up; `High`/`Normal` drop the incoming frame above a usage
//! watermark; `Low` always backpressures once full.

use heapless::Vec as HVec;
use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buffer::SizeClass;
use crate::clock::Instant;
use crate::error::DriverError;
use crate::slab::SlabIndex;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    const ORDER: [Priority; 4] = [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

    /// Decodes a priority level received as a raw byte across an external
    /// call boundary (`§6` `send(nic_id, frame, priority)`), e.g. from a
    /// TSR's IOCTL-style entry point that can't pass a native Rust enum.
    pub fn from_byte(value: u8) -> Result<Self, DriverError> {
        Priority::try_from(value).map_err(|_| DriverError::InvalidParam)
    }

    /// Lower-priority classes than `self`, lowest first — the eviction
    /// preference order `§4.6` calls for ("drop ... from the lowest
    /// non-empty lower-priority queue").
    fn lower_than(self) -> impl Iterator<Item = Priority> {
        Self::ORDER.into_iter().rev().filter(move |&p| p < self)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct QueuedFrame {
    pub class: SizeClass,
    pub handle: SlabIndex,
    pub len: u16,
    pub enqueued_at: Instant,
}

/// Diagnostic and backpressure thresholds (`§4.6`).
#[derive(Debug, Copy, Clone)]
pub struct SchedulerConfig {
    pub high_watermark_pct: u8,
    pub low_watermark_pct: u8,
    pub max_urgent_evictions: usize,
    pub stale_after_ms: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_watermark_pct: 80,
            low_watermark_pct: 20,
            max_urgent_evictions: 5,
            stale_after_ms: 5_000,
        }
    }
}

pub struct PriorityScheduler<const CAP: usize> {
    urgent: HVec<QueuedFrame, CAP>,
    high: HVec<QueuedFrame, CAP>,
    normal: HVec<QueuedFrame, CAP>,
    low: HVec<QueuedFrame, CAP>,
    config: SchedulerConfig,
    flow_control_active: bool,
    pub priority_drops: u32,
    pub stale_frames_seen: u32,
}

impl<const CAP: usize> PriorityScheduler<CAP> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            urgent: HVec::new(),
            high: HVec::new(),
            normal: HVec::new(),
            low: HVec::new(),
            config,
            flow_control_active: false,
            priority_drops: 0,
            stale_frames_seen: 0,
        }
    }

    fn queue(&self, p: Priority) -> &HVec<QueuedFrame, CAP> {
        match p {
            Priority::Urgent => &self.urgent,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    fn queue_mut(&mut self, p: Priority) -> &mut HVec<QueuedFrame, CAP> {
        match p {
            Priority::Urgent => &mut self.urgent,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn total_len(&self) -> usize {
        self.urgent.len() + self.high.len() + self.normal.len() + self.low.len()
    }

    /// `CAP` is a single shared budget across all four classes (the
    /// underlying descriptor/frame resource the admission ladder in
    /// `§4.6` is actually rationing), not four independent per-class
    /// capacities — the only reading under which an `Urgent` admission
    /// evicting a `Normal` entry (`§11` scenario 4) makes sense. Each
    /// class's backing `HVec` is sized `CAP` for storage convenience; the
    /// shared budget is enforced by `total_len() < CAP` at push time.
    pub fn total_capacity(&self) -> usize {
        CAP
    }

    fn usage_pct(&self) -> u32 {
        (self.total_len() as u32 * 100) / self.total_capacity() as u32
    }

    /// Whether the scheduler is currently applying the cooperative enqueue
    /// delay (`§4.6` "flow control").
    pub fn flow_control_active(&self) -> bool {
        self.flow_control_active
    }

    fn update_flow_control(&mut self) {
        let usage = self.usage_pct();
        if usage >= self.config.high_watermark_pct as u32 {
            if !self.flow_control_active {
                warn!("scheduler: flow control engaged at {usage}% usage");
            }
            self.flow_control_active = true;
        } else if usage <= self.config.low_watermark_pct as u32 {
            if self.flow_control_active {
                debug!("scheduler: flow control cleared at {usage}% usage");
            }
            self.flow_control_active = false;
        }
    }

    /// Enqueues `frame` at `priority`. Returns `Ok(Some(handle))` if the
    /// frame was dropped (caller must free the buffer), `Ok(None)` if
    /// admitted, or `Err(Backpressure)` if the caller should retry without
    /// having lost the frame (`§4.6`: `Low` always backpressures once full;
    /// `High`/`Normal` drop the incoming frame only once usage crosses
    /// 95%/90% respectively, otherwise backpressure; `Urgent` evicts before
    /// giving up).
    pub fn enqueue(
        &mut self,
        priority: Priority,
        frame: QueuedFrame,
    ) -> Result<Option<(SizeClass, SlabIndex)>, DriverError> {
        if self.total_len() < CAP {
            self.queue_mut(priority)
                .push(frame)
                .map_err(|_| DriverError::Backpressure)?;
            self.update_flow_control();
            return Ok(None);
        }

        match priority {
            Priority::Low => Err(DriverError::Backpressure),
            Priority::High => {
                if self.usage_pct() >= 95 {
                    self.priority_drops += 1;
                    debug!("scheduler: dropping High frame, usage >= 95%");
                    Ok(Some((frame.class, frame.handle)))
                } else {
                    Err(DriverError::Backpressure)
                }
            }
            Priority::Normal => {
                if self.usage_pct() >= 90 {
                    self.priority_drops += 1;
                    debug!("scheduler: dropping Normal frame, usage >= 90%");
                    Ok(Some((frame.class, frame.handle)))
                } else {
                    Err(DriverError::Backpressure)
                }
            }
            Priority::Urgent => {
                if self.evict_from_lowest_nonempty() {
                    self.queue_mut(priority)
                        .push(frame)
                        .map_err(|_| DriverError::Backpressure)?;
                    self.update_flow_control();
                    Ok(None)
                } else {
                    self.priority_drops += 1;
                    warn!("scheduler: Urgent frame dropped, eviction ladder exhausted");
                    Ok(Some((frame.class, frame.handle)))
                }
            }
        }
    }

    /// Evicts entries from the lowest non-empty lower-priority queue,
    /// stopping once room exists or `max_urgent_evictions` entries have
    /// been dropped (`§4.6`: "try to drop up to 5 entries ...; on second
    /// failure, drop incoming"). Returns whether room was made.
    fn evict_from_lowest_nonempty(&mut self) -> bool {
        let mut evicted = 0;
        while self.total_len() >= CAP && evicted < self.config.max_urgent_evictions {
            let mut dropped_one = false;
            for lower in Priority::Urgent.lower_than() {
                if !self.queue(lower).is_empty() {
                    self.queue_mut(lower).remove(0);
                    self.priority_drops += 1;
                    evicted += 1;
                    dropped_one = true;
                    debug!("scheduler: evicted one {lower:?} (level {}) frame to admit Urgent", u8::from(lower));
                    break;
                }
            }
            if !dropped_one {
                break;
            }
        }
        self.total_len() < CAP
    }

    /// Pops the next frame to transmit: strict priority, FIFO within a
    /// class.
    pub fn dequeue(&mut self) -> Option<(Priority, QueuedFrame)> {
        for p in Priority::ORDER {
            let q = self.queue_mut(p);
            if !q.is_empty() {
                return Some((p, q.remove(0)));
            }
        }
        None
    }

    /// Diagnostic sweep (`§4.6` "stale-frame detection"): logs and counts
    /// frames older than `stale_after_ms` without dropping them.
    pub fn count_stale(&mut self, now: Instant) -> u32 {
        let mut count = 0;
        for p in Priority::ORDER {
            for frame in self.queue(p).iter() {
                if now.elapsed_since(frame.enqueued_at) > self.config.stale_after_ms {
                    count += 1;
                    warn!(
                        "scheduler: {p:?} frame stale ({}ms old, threshold {}ms)",
                        now.elapsed_since(frame.enqueued_at),
                        self.config.stale_after_ms
                    );
                }
            }
        }
        self.stale_frames_seen += count;
        count
    }
}
