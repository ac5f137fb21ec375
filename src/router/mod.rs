//! Per-frame forwarding decision engine (`SPEC_FULL.md` §4.7, component G).
//!
//! [`Router`] ties the rule list ([`rules`]) and the bridge-learning table
//! ([`bridge`]) together with per-ingress-NIC rate limiting and the
//! anti-loop check, implementing the seven-step decision exactly as given.

pub mod bridge;
pub mod rules;

pub use bridge::{BridgeEntry, BridgeTable, DEFAULT_AGING_MS, DEFAULT_MAX_ENTRIES};
pub use rules::{Decision, Match, Rule, RuleList, RuleSelector};

use log::debug;

use crate::clock::Instant;
use crate::wire::{self, EthernetHeader};

/// Why a frame was dropped, distinct from [`Decision::Drop`] so callers can
/// attribute per-cause counters (`§4.7`: "frames beyond the configured rate
/// are dropped and counted").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DropReason {
    ShortFrame,
    RateLimited,
    AntiLoop,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RouteOutcome {
    Decision(Decision),
    Dropped(DropReason),
}

#[derive(Debug, Copy, Clone)]
pub struct RouterConfig {
    pub max_bridge_entries: usize,
    pub aging_ms: u32,
    pub default_decision: Decision,
    /// Per-NIC frames/sec; 0 disables rate limiting for that NIC (`§4.7`
    /// "Rate limiting").
    pub rate_limit_per_sec: [u32; crate::MAX_NICS],
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_bridge_entries: DEFAULT_MAX_ENTRIES,
            aging_ms: DEFAULT_AGING_MS,
            default_decision: Decision::Drop,
            rate_limit_per_sec: [0; crate::MAX_NICS],
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct RateCounter {
    window_start: Instant,
    count: u32,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self { window_start: Instant(0), count: 0 }
    }
}

impl RateCounter {
    /// Per-second window counter standing in for the token bucket named in
    /// `§4.7`: resets every 1000ms, counts frames within the window, and
    /// rejects once `limit` is reached. `limit == 0` always allows.
    fn allow(&mut self, now: Instant, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        if now.elapsed_since(self.window_start) >= 1000 {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= limit {
            false
        } else {
            self.count += 1;
            true
        }
    }
}

pub struct Router<const RULES: usize> {
    pub bridge: BridgeTable,
    rules: RuleList<RULES>,
    rate: [RateCounter; crate::MAX_NICS],
    rate_limit_per_sec: [u32; crate::MAX_NICS],
    aging_ms: u32,
    pub default_decision: Decision,
    pub short_frame_drops: u32,
    pub rate_limited_drops: u32,
    pub anti_loop_drops: u32,
}

impl<const RULES: usize> Router<RULES> {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            bridge: BridgeTable::new(config.max_bridge_entries),
            rules: RuleList::new(),
            rate: [RateCounter::default(); crate::MAX_NICS],
            rate_limit_per_sec: config.rate_limit_per_sec,
            aging_ms: config.aging_ms,
            default_decision: config.default_decision,
            short_frame_drops: 0,
            rate_limited_drops: 0,
            anti_loop_drops: 0,
        }
    }

    pub fn add_rule(&mut self, rule: Rule) -> Result<(), crate::error::DriverError> {
        self.rules.add(rule)
    }

    pub fn remove_rule(&mut self, selector: RuleSelector) -> bool {
        self.rules.remove(selector)
    }

    /// Periodic bridge-table aging sweep (`§4.7` "Aging", default 300s).
    pub fn age_bridge_table(&mut self, now: Instant) -> usize {
        self.bridge.age(now, self.aging_ms)
    }

    /// Failover supervisor hook: flush every bridge entry pointing at a NIC
    /// that just went down (`§4.8`).
    pub fn flush_nic(&mut self, nic: u8) -> usize {
        self.bridge.flush_nic(nic)
    }

    fn reject_loop(&mut self, decision: Decision, source_nic: u8) -> RouteOutcome {
        if let Decision::Forward(dest) = decision {
            if dest == source_nic {
                self.anti_loop_drops += 1;
                debug!("router: dropping frame from nic {source_nic}, anti-loop (would forward to itself)");
                return RouteOutcome::Dropped(DropReason::AntiLoop);
            }
        }
        RouteOutcome::Decision(decision)
    }

    /// The seven-step decision (`§4.7`). `frame` is the full Ethernet
    /// frame as received; only the header is parsed here, the payload is
    /// inspected solely for the IGMP special case.
    pub fn decide(&mut self, source_nic: u8, frame: &[u8], now: Instant) -> RouteOutcome {
        let limit = self.rate_limit_per_sec[source_nic as usize];
        if !self.rate[source_nic as usize].allow(now, limit) {
            self.rate_limited_drops += 1;
            debug!("router: dropping frame from nic {source_nic}, rate limit exceeded");
            return RouteOutcome::Dropped(DropReason::RateLimited);
        }

        let header: EthernetHeader = match wire::parse_header(frame) {
            Ok(h) => h,
            Err(_) => {
                self.short_frame_drops += 1;
                debug!("router: dropping frame from nic {source_nic}, header too short");
                return RouteOutcome::Dropped(DropReason::ShortFrame);
            }
        };

        self.bridge.learn(header.src, source_nic, now);

        if wire::is_broadcast(&header.dst) {
            return RouteOutcome::Decision(Decision::Broadcast);
        }

        if wire::is_multicast(&header.dst) {
            let payload = &frame[wire::HEADER_LEN..];
            if wire::is_igmp(header.ethertype(), payload) {
                return RouteOutcome::Decision(Decision::Broadcast);
            }
            return RouteOutcome::Decision(Decision::Multicast);
        }

        if let Some(decision) = self.rules.evaluate(source_nic, &header.dst, header.ethertype()) {
            return self.reject_loop(decision, source_nic);
        }

        if let Some(entry) = self.bridge.lookup(&header.dst) {
            if entry.nic != source_nic {
                return RouteOutcome::Decision(Decision::Forward(entry.nic));
            }
        }

        self.reject_loop(self.default_decision, source_nic)
    }
}
