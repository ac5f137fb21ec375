//! Link-failover supervisor (`SPEC_FULL.md` §4.8, component H).
//!
//! Polls link state for a `(primary, secondary)` pair once per tick and
//! decides `Degraded` entry/exit, failover, and failback. Every mutation to
//! `active`/`failover_active`/`storm_prevention` happens inside one
//! `hermit_sync::without_interrupts` critical section so the data path never
//! observes a torn snapshot (`§4.8`, `§5`).

use hermit_sync::without_interrupts;
use log::{debug, warn};

use crate::clock::Instant;
use crate::hal::{LinkFlags, LinkState};

pub const DEFAULT_LOSS_THRESHOLD: u8 = 3;
pub const DEFAULT_LINK_STABLE_MS: u32 = 2_000;
pub const DEFAULT_STORM_MS: u32 = 5_000;
pub const DEFAULT_FAILBACK_MS: u32 = 10_000;
pub const GRATUITOUS_ARP_COUNT: u8 = 3;
pub const GRATUITOUS_ARP_SPACING_MS: u32 = 100;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FailoverConfig {
    pub loss_threshold: u8,
    pub link_stable_ms: u32,
    pub storm_ms: u32,
    pub failback_ms: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            link_stable_ms: DEFAULT_LINK_STABLE_MS,
            storm_ms: DEFAULT_STORM_MS,
            failback_ms: DEFAULT_FAILBACK_MS,
        }
    }
}

/// What happened on this tick. At most one event fires per call; the
/// caller (`driver.rs`) reacts by flushing bridge entries, adjusting the
/// router's default decision, and queuing the gratuitous-ARP burst.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum FailoverEvent {
    #[default]
    None,
    EnteredDegraded,
    ExitedDegraded { active: u8 },
    FailedOver { from: u8, to: u8 },
    FailedBack { from: u8, to: u8 },
}

#[derive(Debug, Copy, Clone, Default)]
struct NicLinkTrack {
    consecutive_loss: u8,
    up_since: Option<Instant>,
}

pub struct FailoverSupervisor {
    config: FailoverConfig,
    primary: u8,
    secondary: u8,
    active: u8,
    degraded: bool,
    pub failover_active: bool,
    pub storm_prevention: bool,
    last_failover: Option<Instant>,
    tracks: [NicLinkTrack; crate::MAX_NICS],
}

impl FailoverSupervisor {
    pub fn new(primary: u8, secondary: u8, config: FailoverConfig) -> Self {
        Self {
            config,
            primary,
            secondary,
            active: primary,
            degraded: false,
            failover_active: false,
            storm_prevention: false,
            last_failover: None,
            tracks: [NicLinkTrack::default(); crate::MAX_NICS],
        }
    }

    pub fn active(&self) -> u8 {
        self.active
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn other_of(&self, nic: u8) -> u8 {
        if nic == self.primary {
            self.secondary
        } else {
            self.primary
        }
    }

    /// One polling tick (default interval 1s, driven by the caller's own
    /// clock, not this module). `links` is indexed by NIC id.
    pub fn tick(&mut self, now: Instant, links: [LinkState; crate::MAX_NICS]) -> FailoverEvent {
        without_interrupts(|| self.tick_inner(now, links))
    }

    fn tick_inner(&mut self, now: Instant, links: [LinkState; crate::MAX_NICS]) -> FailoverEvent {
        for (i, track) in self.tracks.iter_mut().enumerate() {
            if links[i].up() {
                if track.up_since.is_none() {
                    track.up_since = Some(now);
                }
                track.consecutive_loss = 0;
            } else {
                track.up_since = None;
                track.consecutive_loss = track.consecutive_loss.saturating_add(1);
            }
        }

        let both_down = !links[self.primary as usize].up() && !links[self.secondary as usize].up();
        if both_down {
            if !self.degraded {
                self.degraded = true;
                warn!("failover: both links down, entering degraded mode");
                return FailoverEvent::EnteredDegraded;
            }
            return FailoverEvent::None;
        }

        if self.degraded {
            self.degraded = false;
            self.active = if links[self.primary as usize].up() {
                self.primary
            } else {
                self.secondary
            };
            self.failover_active = self.active != self.primary;
            debug!("failover: exited degraded mode, active nic {}", self.active);
            return FailoverEvent::ExitedDegraded { active: self.active };
        }

        let was_storm_prevented = self.storm_prevention;
        self.storm_prevention = self
            .last_failover
            .is_some_and(|t| now.elapsed_since(t) < self.config.storm_ms);
        if self.storm_prevention {
            if !was_storm_prevented {
                debug!("failover: storm prevention engaged, blocking further failovers");
            }
            return FailoverEvent::None;
        }

        let other = self.other_of(self.active);
        if self.tracks[self.active as usize].consecutive_loss >= self.config.loss_threshold {
            if let Some(up_since) = self.tracks[other as usize].up_since {
                if now.elapsed_since(up_since) >= self.config.link_stable_ms {
                    let from = self.active;
                    self.active = other;
                    self.failover_active = true;
                    self.last_failover = Some(now);
                    warn!("failover: switching active nic {from} -> {other}");
                    return FailoverEvent::FailedOver { from, to: other };
                }
            }
        }

        if self.active == self.secondary {
            if let Some(up_since) = self.tracks[self.primary as usize].up_since {
                if now.elapsed_since(up_since) >= self.config.failback_ms {
                    let from = self.active;
                    self.active = self.primary;
                    self.failover_active = false;
                    self.last_failover = Some(now);
                    debug!("failover: failing back {from} -> {}", self.primary);
                    return FailoverEvent::FailedBack { from, to: self.primary };
                }
            }
        }

        FailoverEvent::None
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn up() -> LinkState {
        LinkState { flags: LinkFlags::UP | LinkFlags::FULL_DUPLEX, speed_mbps: 100 }
    }

    fn down() -> LinkState {
        LinkState::default()
    }

    #[test]
    fn both_links_down_enters_degraded_once() {
        let mut sup = FailoverSupervisor::new(0, 1, FailoverConfig::default());
        assert_eq!(sup.tick(Instant(0), [down(), down()]), FailoverEvent::EnteredDegraded);
        assert!(sup.is_degraded());
        assert_eq!(sup.tick(Instant(1), [down(), down()]), FailoverEvent::None);
    }

    #[test]
    fn recovery_from_degraded_switches_active() {
        let mut sup = FailoverSupervisor::new(0, 1, FailoverConfig::default());
        sup.tick(Instant(0), [down(), down()]);
        let event = sup.tick(Instant(1), [down(), up()]);
        assert_eq!(event, FailoverEvent::ExitedDegraded { active: 1 });
        assert_eq!(sup.active(), 1);
        assert!(!sup.is_degraded());
    }

    #[test]
    fn failover_after_loss_threshold_and_stable_peer() {
        let mut sup = FailoverSupervisor::new(0, 1, FailoverConfig::default());
        // Secondary has been up since t=0.
        sup.tick(Instant(0), [up(), up()]);
        // Primary starts dropping; needs 3 consecutive-loss ticks.
        sup.tick(Instant(100), [down(), up()]);
        sup.tick(Instant(200), [down(), up()]);
        let event = sup.tick(Instant(2_300), [down(), up()]);
        assert_eq!(event, FailoverEvent::FailedOver { from: 0, to: 1 });
        assert_eq!(sup.active(), 1);
        assert!(sup.failover_active);
    }

    #[test]
    fn storm_prevention_blocks_second_failover() {
        let mut sup = FailoverSupervisor::new(0, 1, FailoverConfig::default());
        sup.tick(Instant(0), [up(), up()]);
        sup.tick(Instant(100), [down(), up()]);
        sup.tick(Instant(200), [down(), up()]);
        sup.tick(Instant(2_300), [down(), up()]);
        assert_eq!(sup.active(), 1);

        // Flip back immediately: within storm_ms, a second failover must
        // not occur even though the active (secondary) link now drops too.
        sup.tick(Instant(2_400), [up(), up()]);
        sup.tick(Instant(2_500), [up(), down()]);
        sup.tick(Instant(2_600), [up(), down()]);
        let event = sup.tick(Instant(2_700), [up(), down()]);
        assert_eq!(event, FailoverEvent::None);
        assert_eq!(sup.active(), 1);
    }

    #[test]
    fn failback_after_primary_stable_long_enough() {
        let mut sup = FailoverSupervisor::new(0, 1, FailoverConfig::default());
        sup.tick(Instant(0), [up(), up()]);
        sup.tick(Instant(100), [down(), up()]);
        sup.tick(Instant(200), [down(), up()]);
        sup.tick(Instant(2_300), [down(), up()]);
        assert_eq!(sup.active(), 1);

        // Primary comes back up at t=10_000 and stays up past storm_ms and
        // failback_ms before failback is attempted.
        let event = sup.tick(Instant(10_000), [up(), up()]);
        assert_eq!(event, FailoverEvent::None);
        let event = sup.tick(Instant(20_001), [up(), up()]);
        assert_eq!(event, FailoverEvent::FailedBack { from: 1, to: 0 });
        assert_eq!(sup.active(), 0);
        assert!(!sup.failover_active);
    }

    proptest! {
        /// §8 invariant 7: once the primary has lost `loss_threshold`
        /// consecutive ticks and the secondary has been stable for
        /// `link_stable_ms`, exactly one failover happens and the
        /// secondary becomes active — and not a second one within
        /// `storm_ms` of it, no matter how many extra down-ticks follow.
        #[test]
        fn failover_fires_exactly_once_past_threshold_then_storm_blocks_more(
            loss_threshold in 1u8..6,
            extra_down_ticks in 0u8..4,
        ) {
            let config = FailoverConfig { loss_threshold, ..FailoverConfig::default() };
            let mut sup = FailoverSupervisor::new(0, 1, config);

            // Secondary has been up since t=0, stable well past link_stable_ms
            // by the time the primary has dropped `loss_threshold` ticks.
            sup.tick(Instant(0), [up(), up()]);

            let mut events = alloc::vec::Vec::new();
            for i in 0..loss_threshold {
                let t = Instant(100 + i as u32 * 100 + config.link_stable_ms);
                events.push(sup.tick(t, [down(), up()]));
            }
            let failovers = events.iter().filter(|e| matches!(e, FailoverEvent::FailedOver { .. })).count();
            prop_assert_eq!(failovers, 1);
            prop_assert_eq!(sup.active(), 1);

            let last_tick = 100 + (loss_threshold - 1) as u32 * 100 + config.link_stable_ms;
            for i in 0..extra_down_ticks {
                let t = Instant(last_tick + 1 + i as u32);
                let event = sup.tick(t, [down(), up()]);
                prop_assert!(!matches!(event, FailoverEvent::FailedOver { .. }));
            }
            prop_assert_eq!(sup.active(), 1);
        }
    }
}
