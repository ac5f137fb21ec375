//! Top-level driver: wires platform probe, DMA mapping, buffer pools,
//! descriptor ring, bottom half, priority scheduler, router, failover
//! supervisor and recovery ladder into the external API named in
//! `SPEC_FULL.md` §6.
//!
//! Every per-NIC collection is sized by a fixed module-level constant
//! rather than threading const generics through `Driver` itself — with the
//! toolchain never invoked to catch a mismatched const between two
//! generic parameters, one set of capacities shared by every collection in
//! the crate is the safer shape to hand-verify (`§9`).

use alloc::boxed::Box;

use log::{debug, warn};

use crate::bottomhalf::BottomHalf;
use crate::buffer::{BufferType, Direction};
use crate::clock::{Clock, Instant};
use crate::config::DriverConfig;
use crate::dma::{self, constraints::Constraints, BouncePool};
use crate::error::DriverError;
use crate::failover::{FailoverConfig, FailoverEvent, FailoverSupervisor, GRATUITOUS_ARP_COUNT, GRATUITOUS_ARP_SPACING_MS};
use crate::handoff::HandoffQueue;
use crate::hal::{LinkState, MemoryTranslator, NicOps};
use crate::isr::Task;
use crate::platform::DmaPolicy;
use crate::pool::BufferPools;
use crate::recovery::{ErrorTracker, RecoveryAction, RecoveryLadder};
use crate::ring::DescriptorRing;
use crate::router::{Decision, Router, RouteOutcome, Rule, RuleSelector};
use crate::scheduler::{Priority, PriorityScheduler, QueuedFrame};
use crate::wire;

/// Descriptor slots per direction per NIC (`§3`).
pub const TX_RING_CAPACITY: usize = 64;
pub const RX_RING_CAPACITY: usize = 64;
/// ISR→bottom-half handoff slots per NIC (`§3`).
pub const HANDOFF_CAPACITY: usize = 64;
/// Bounce blocks per NIC (`§4.2`).
pub const BOUNCE_CAPACITY: usize = 8;
/// Route rules shared across both NICs (`§4.7`).
pub const RULE_CAPACITY: usize = 16;
/// Shared priority-queue budget per NIC (`§4.6`).
pub const SCHEDULER_CAPACITY: usize = 128;
/// Multicast addresses tracked per NIC (`§4.10` "program_rx_filter").
pub const MULTICAST_CAPACITY: usize = 16;
/// RX descriptors primed at init, before the first interrupt ever fires.
pub const RX_PRIME_COUNT: usize = 16;

/// Identifies one of the driver's `MAX_NICS` slots. Returned by
/// [`Driver::new`]'s caller-supplied ordering, not discovered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NicHandle(u8);

impl NicHandle {
    pub fn id(self) -> u8 {
        self.0
    }
}

/// Why a frame handed to [`Driver::send`] never made it onto the wire,
/// distinct from the scheduler's own [`crate::router::DropReason`] so
/// upward callers get one flat enum (`§6`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DropKind {
    /// Both NICs in the failover pair are down.
    NetworkDown,
    /// Buffer pool exhausted for the requested length.
    NoResources,
    /// The priority scheduler's admission ladder rejected the frame.
    Scheduler,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    Ok,
    /// Caller may retry; no frame was lost.
    Backpressure,
    Dropped(DropKind),
}

/// Everything [`Driver::new`] needs to stand up one NIC slot. The chip
/// binding, its DMA constraints, its already-decided [`DmaPolicy`]
/// (`§4.1` - probed once, never revisited) and the conventional-memory
/// bounce region reserved for it are all supplied by the caller, which
/// owns the platform-specific discovery this core does not perform.
pub struct NicInit {
    pub nic: Box<dyn NicOps>,
    pub mac: [u8; 6],
    pub constraints: Constraints,
    pub dma_policy: DmaPolicy,
    pub bounce_base_phys: u32,
}

struct NicState {
    nic: Box<dyn NicOps>,
    mac: [u8; 6],
    constraints: Constraints,
    dma_policy: DmaPolicy,
    ring: DescriptorRing<TX_RING_CAPACITY, RX_RING_CAPACITY>,
    handoff: HandoffQueue<HANDOFF_CAPACITY>,
    pools: BufferPools,
    bounce: BouncePool<BOUNCE_CAPACITY>,
    scheduler: PriorityScheduler<SCHEDULER_CAPACITY>,
    recovery: ErrorTracker,
    ladder: RecoveryLadder,
    receiver: Option<Box<dyn FnMut(u8, &[u8])>>,
    promiscuous: bool,
    multicast: heapless::Vec<[u8; 6], MULTICAST_CAPACITY>,
    link: LinkState,
}

struct ArpBurst {
    nic: u8,
    remaining: u8,
    next_at: Instant,
}

/// What one [`Driver::tick`] call did, for the caller's own logging.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub failover_event: FailoverEvent,
    pub bridge_entries_aged: usize,
    pub recovery_actions: heapless::Vec<(u8, RecoveryAction), { crate::MAX_NICS }>,
}

/// Outcome of draining one NIC's handoff queue and TX reclaim list.
#[derive(Debug, Default)]
pub struct BottomHalfSummary {
    pub tx_reclaimed: usize,
    pub delivered_upward: usize,
    pub forwarded: usize,
    pub dropped: usize,
    pub rx_refilled: usize,
}

pub struct Driver {
    nics: [NicState; crate::MAX_NICS],
    translator: Box<dyn MemoryTranslator>,
    clock: Box<dyn Clock>,
    router: Router<RULE_CAPACITY>,
    failover: FailoverSupervisor,
    bottomhalf: BottomHalf,
    arp_burst: Option<ArpBurst>,
    config: DriverConfig,
}

impl Driver {
    pub fn new(
        nics: [NicInit; crate::MAX_NICS],
        translator: Box<dyn MemoryTranslator>,
        clock: Box<dyn Clock>,
        config: DriverConfig,
        failover_primary: NicHandle,
        failover_secondary: NicHandle,
    ) -> Result<Self, DriverError> {
        config.validate()?;

        let [a, b] = nics;
        let make_state = |init: NicInit| NicState {
            nic: init.nic,
            mac: init.mac,
            constraints: init.constraints,
            dma_policy: init.dma_policy,
            ring: DescriptorRing::new(config.pipeline.isr_budget),
            handoff: HandoffQueue::new(),
            pools: BufferPools::new(config.pipeline.copy_break_threshold),
            bounce: BouncePool::new(init.bounce_base_phys),
            scheduler: PriorityScheduler::new(config.scheduler),
            recovery: ErrorTracker::new(config.pipeline.recovery_window_ms),
            ladder: RecoveryLadder::new(config.pipeline.recovery_retry_delay_ms),
            receiver: None,
            promiscuous: false,
            multicast: heapless::Vec::new(),
            link: LinkState::default(),
        };
        let mut nics = [make_state(a), make_state(b)];

        for state in nics.iter_mut() {
            state.nic.reset(false).map_err(|kind| DriverError::HardwareError(kind, crate::recovery::severity_of(kind)))?;
            state.nic.program_rx_filter(false, &[]);
            state.nic.enable_irq();
            for _ in 0..RX_PRIME_COUNT {
                let (class, handle) = state
                    .pools
                    .alloc_for_len(crate::buffer::SizeClass::C1518.bytes(), BufferType::Rx, clock.as_ref())?;
                let phys = state.pools.get(class, handle).and_then(|buf| buf.phys_addr).unwrap_or(0);
                state.ring.rx_prime(state.nic.as_mut(), class, handle, phys)?;
            }
        }

        Ok(Self {
            nics,
            translator,
            clock,
            router: Router::new(config.router),
            failover: FailoverSupervisor::new(failover_primary.0, failover_secondary.0, config.failover),
            bottomhalf: BottomHalf::new(config.pipeline.bottomhalf_batch),
            arp_burst: None,
            config,
        })
    }

    fn slot(&self, handle: NicHandle) -> Result<usize, DriverError> {
        let idx = handle.0 as usize;
        if idx < crate::MAX_NICS {
            Ok(idx)
        } else {
            Err(DriverError::InvalidParam)
        }
    }

    /// Installs the upward delivery callback for one NIC (`§6`:
    /// `register_receiver(nic_id, callback) -> handle`).
    pub fn register_receiver(
        &mut self,
        handle: NicHandle,
        callback: Box<dyn FnMut(u8, &[u8])>,
    ) -> Result<NicHandle, DriverError> {
        let idx = self.slot(handle)?;
        self.nics[idx].receiver = Some(callback);
        Ok(handle)
    }

    pub fn set_promiscuous(&mut self, handle: NicHandle, promiscuous: bool) -> Result<(), DriverError> {
        let idx = self.slot(handle)?;
        let state = &mut self.nics[idx];
        state.promiscuous = promiscuous;
        state.nic.program_rx_filter(promiscuous, &state.multicast);
        Ok(())
    }

    pub fn set_multicast_list(&mut self, handle: NicHandle, list: &[[u8; 6]]) -> Result<(), DriverError> {
        let idx = self.slot(handle)?;
        let state = &mut self.nics[idx];
        state.multicast.clear();
        for mac in list {
            state.multicast.push(*mac).map_err(|_| DriverError::InvalidParam)?;
        }
        state.nic.program_rx_filter(state.promiscuous, &state.multicast);
        Ok(())
    }

    pub fn get_link_status(&mut self, handle: NicHandle) -> Result<LinkState, DriverError> {
        let idx = self.slot(handle)?;
        let link = self.nics[idx].nic.link_state();
        self.nics[idx].link = link;
        Ok(link)
    }

    /// Replaces the active failover configuration and resets which NIC is
    /// primary/secondary (`§6`: `configure_failover`).
    pub fn configure_failover(
        &mut self,
        primary: NicHandle,
        secondary: NicHandle,
        config: FailoverConfig,
    ) -> Result<(), DriverError> {
        self.slot(primary)?;
        self.slot(secondary)?;
        self.failover = FailoverSupervisor::new(primary.0, secondary.0, config);
        self.config.failover = config;
        Ok(())
    }

    pub fn add_route_rule(&mut self, rule: Rule) -> Result<(), DriverError> {
        self.router.add_rule(rule)
    }

    pub fn remove_route_rule(&mut self, selector: RuleSelector) -> bool {
        self.router.remove_rule(selector)
    }

    /// Allocates a TX buffer, copies `frame` in, and hands it to the
    /// priority scheduler. `§6` upward API `send(nic_id, frame, priority)`.
    pub fn send(&mut self, handle: NicHandle, frame: &[u8], priority: Priority) -> SendOutcome {
        let idx = match self.slot(handle) {
            Ok(idx) => idx,
            Err(_) => return SendOutcome::Dropped(DropKind::NetworkDown),
        };
        if self.failover.is_degraded() {
            return SendOutcome::Dropped(DropKind::NetworkDown);
        }
        match self.queue_tx_frame(idx, frame, priority) {
            Ok(true) => SendOutcome::Ok,
            Ok(false) => SendOutcome::Dropped(DropKind::Scheduler),
            Err(DriverError::NoResources) => SendOutcome::Dropped(DropKind::NoResources),
            Err(DriverError::Backpressure) => SendOutcome::Backpressure,
            Err(_) => SendOutcome::Dropped(DropKind::NoResources),
        }
    }

    /// Returns `Ok(true)` if admitted, `Ok(false)` if the scheduler's
    /// admission ladder dropped it (buffer already freed either way on
    /// error paths).
    fn queue_tx_frame(&mut self, idx: usize, frame: &[u8], priority: Priority) -> Result<bool, DriverError> {
        let now = self.clock.now_ms();
        let state = &mut self.nics[idx];
        let (class, buf_handle) = state.pools.alloc_for_len(frame.len(), BufferType::Tx, self.clock.as_ref())?;
        if let Some(buf) = state.pools.get_mut(class, buf_handle) {
            if let Err(e) = buf.set_payload(frame) {
                state.pools.free(class, buf_handle);
                return Err(e);
            }
        }
        let queued = QueuedFrame {
            class,
            handle: buf_handle,
            len: frame.len() as u16,
            enqueued_at: now,
        };
        match state.scheduler.enqueue(priority, queued)? {
            Some((dclass, dhandle)) => {
                state.pools.free(dclass, dhandle);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Drains up to `max` scheduled frames for one NIC into its descriptor
    /// ring, mapping each through the DMA layer (`§4.2`, `§4.4`). Must run
    /// in task context: the mapping layer's bounce allocator requires it.
    pub fn service_tx(&mut self, handle: NicHandle, max: usize, task: Task) -> Result<usize, DriverError> {
        let idx = self.slot(handle)?;
        let mut sent = 0usize;
        for _ in 0..max {
            let Some((_, queued)) = self.nics[idx].scheduler.dequeue() else {
                break;
            };

            let translator = self.translator.as_ref();
            let state = &mut self.nics[idx];
            let (linear, payload) = match state.pools.get(queued.class, queued.handle) {
                Some(buf) => (buf.data.as_ptr() as usize, buf.as_slice()),
                None => continue,
            };

            let mapping = match dma::map::<BOUNCE_CAPACITY>(
                translator,
                linear,
                queued.len as u32,
                Direction::TxOnly,
                &state.constraints,
                &mut state.bounce,
                Some(payload),
                task,
            ) {
                Ok(m) => m,
                Err(_) => {
                    state.pools.free(queued.class, queued.handle);
                    continue;
                }
            };
            if dma::sync_for_device(&mapping).is_err() {
                dma::unmap(mapping, &mut state.bounce, task);
                state.pools.free(queued.class, queued.handle);
                continue;
            }

            let bounce = mapping.bounce_handle();
            let segments: heapless::Vec<(u32, u16), 16> = mapping
                .segments()
                .iter()
                .map(|seg| (seg.phys_addr, seg.len as u16))
                .collect();

            match state
                .ring
                .tx_push_ring(state.nic.as_mut(), queued.class, queued.handle, &segments, bounce)
            {
                Ok(()) => sent += 1,
                Err(_) => {
                    dma::unmap(mapping, &mut state.bounce, task);
                    state.pools.free(queued.class, queued.handle);
                    break;
                }
            }
        }
        Ok(sent)
    }

    /// ISR entry point for one NIC (`§4.4`). Feeds every completion/error
    /// this interrupt reported into the NIC's [`crate::recovery::ErrorTracker`]
    /// so the windowed rate in `§4.9` reflects real traffic, not just fatal
    /// events.
    pub fn handle_interrupt(&mut self, handle: NicHandle) -> Result<crate::ring::IsrOutcome, DriverError> {
        let idx = self.slot(handle)?;
        let now = self.clock.now_ms();
        let state = &mut self.nics[idx];
        let outcome = state
            .ring
            .on_interrupt(state.nic.as_mut(), &mut state.pools, &state.handoff, idx as u8);

        if let Some(fatal) = outcome.fatal {
            warn!("driver: nic {idx} fatal error {fatal:?}");
            state.recovery.record(now, true);
        } else {
            for _ in 0..outcome.soft_errors {
                state.recovery.record(now, true);
            }
            for _ in 0..(outcome.tx_reclaimed + outcome.rx_delivered) {
                state.recovery.record(now, false);
            }
        }
        Ok(outcome)
    }

    /// Bottom-half pass for one NIC: reclaim completed TX, route delivered
    /// RX frames (upward, to the peer NIC, or dropped), refill RX (`§4.5`,
    /// `§4.7`). Implemented directly against the handoff queue/scheduler
    /// rather than [`BottomHalf::drain_handoff`]: forwarding needs mutable
    /// access to *two* NIC slots (the source's pool, the peer's scheduler)
    /// at once, which that single-NIC-scoped helper does not model.
    pub fn run_bottom_half(&mut self, handle: NicHandle, task: Task) -> Result<BottomHalfSummary, DriverError> {
        let idx = self.slot(handle)?;
        let mut summary = BottomHalfSummary::default();

        {
            let state = &mut self.nics[idx];
            summary.tx_reclaimed = self.bottomhalf.drain_tx_reclaim(&mut state.ring, &mut state.pools, &mut state.bounce, task);
        }

        let batch = self.config.pipeline.bottomhalf_batch;
        for _ in 0..batch {
            let Some(entry) = self.nics[idx].handoff.dequeue() else {
                break;
            };

            let now = self.clock.now_ms();
            let outcome = {
                let state = &self.nics[idx];
                let frame = match state.pools.get(entry.class, entry.handle) {
                    Some(buf) => buf.as_slice(),
                    None => {
                        summary.dropped += 1;
                        continue;
                    }
                };
                self.router.decide(idx as u8, frame, now)
            };

            match outcome {
                RouteOutcome::Dropped(_) => {
                    self.nics[idx].pools.free(entry.class, entry.handle);
                    summary.dropped += 1;
                }
                RouteOutcome::Decision(Decision::Drop) => {
                    self.nics[idx].pools.free(entry.class, entry.handle);
                    summary.dropped += 1;
                }
                RouteOutcome::Decision(Decision::Loopback) => {
                    self.deliver_upward(idx, entry.class, entry.handle, entry.len);
                    summary.delivered_upward += 1;
                }
                RouteOutcome::Decision(Decision::Forward(dest)) => {
                    if self.forward_to(idx, dest as usize, entry.class, entry.handle, entry.len) {
                        summary.forwarded += 1;
                    } else {
                        summary.dropped += 1;
                    }
                    self.nics[idx].pools.free(entry.class, entry.handle);
                }
                RouteOutcome::Decision(Decision::Broadcast) | RouteOutcome::Decision(Decision::Multicast) => {
                    self.deliver_upward(idx, entry.class, entry.handle, entry.len);
                    summary.delivered_upward += 1;
                    let other = 1 - idx;
                    if self.forward_to(idx, other, entry.class, entry.handle, entry.len) {
                        summary.forwarded += 1;
                    }
                    self.nics[idx].pools.free(entry.class, entry.handle);
                }
            }
        }

        let state = &mut self.nics[idx];
        if state.ring.rx_refill_needed() {
            summary.rx_refilled = self
                .bottomhalf
                .refill_rx(&mut state.ring, state.nic.as_mut(), &mut state.pools, self.clock.as_ref(), batch)?;
        }

        Ok(summary)
    }

    fn deliver_upward(&mut self, idx: usize, class: crate::buffer::SizeClass, handle: crate::slab::SlabIndex, _len: u16) {
        let NicState { pools, receiver, .. } = &mut self.nics[idx];
        if let (Some(buf), Some(cb)) = (pools.get(class, handle), receiver.as_mut()) {
            cb(idx as u8, buf.as_slice());
        }
    }

    /// Copies the frame at `(class, handle)` on NIC `src` into a fresh
    /// buffer owned by NIC `dest`'s own pool and enqueues it for
    /// transmission. Buffer pools are per-NIC (`§4.3` cross-pool-free
    /// guard), so bridging a frame across NICs is necessarily a copy, not
    /// a handle transfer.
    fn forward_to(
        &mut self,
        src: usize,
        dest: usize,
        class: crate::buffer::SizeClass,
        handle: crate::slab::SlabIndex,
        _len: u16,
    ) -> bool {
        let payload: heapless::Vec<u8, { crate::buffer::SizeClass::C1518 as usize }> =
            match self.nics[src].pools.get(class, handle) {
                Some(buf) => {
                    let mut out = heapless::Vec::new();
                    let _ = out.extend_from_slice(buf.as_slice());
                    out
                }
                None => return false,
            };
        self.queue_tx_frame(dest, &payload, Priority::Normal).unwrap_or(false)
    }

    /// Periodic tick (`§4.7` aging, `§4.8` failover polling, `§4.9`
    /// recovery), driven by the caller's own timer, not this module.
    pub fn tick(&mut self) -> TickSummary {
        let now = self.clock.now_ms();
        let links = [self.nics[0].nic.link_state(), self.nics[1].nic.link_state()];
        self.nics[0].link = links[0];
        self.nics[1].link = links[1];

        let event = self.failover.tick(now, links);
        match event {
            FailoverEvent::FailedOver { from, to } => {
                self.router.flush_nic(from);
                self.router.default_decision = Decision::Forward(to);
                self.arp_burst = Some(ArpBurst {
                    nic: to,
                    remaining: GRATUITOUS_ARP_COUNT,
                    next_at: now,
                });
            }
            FailoverEvent::FailedBack { from, to } => {
                self.router.flush_nic(from);
                self.router.default_decision = Decision::Forward(to);
                self.arp_burst = Some(ArpBurst {
                    nic: to,
                    remaining: GRATUITOUS_ARP_COUNT,
                    next_at: now,
                });
            }
            FailoverEvent::EnteredDegraded | FailoverEvent::ExitedDegraded { .. } | FailoverEvent::None => {}
        }

        self.service_arp_burst(now);

        let bridge_entries_aged = self.router.age_bridge_table(now);

        let mut recovery_actions = heapless::Vec::new();
        for (i, state) in self.nics.iter_mut().enumerate() {
            if state.recovery.should_recover(now) {
                if let Some(action) = state.ladder.next_action(now) {
                    Self::apply_recovery_action(state, action);
                    let _ = recovery_actions.push((i as u8, action));
                }
            }
        }

        TickSummary {
            failover_event: event,
            bridge_entries_aged,
            recovery_actions,
        }
    }

    fn apply_recovery_action(state: &mut NicState, action: RecoveryAction) {
        debug!("driver: applying recovery action {action:?}");
        match action {
            RecoveryAction::SoftReset => {
                if state.nic.reset(false).is_ok() {
                    state.recovery.reset();
                    state.ladder.record_success();
                } else {
                    warn!("driver: soft reset failed");
                }
            }
            RecoveryAction::HardReset | RecoveryAction::Reinitialize => {
                if state.nic.reset(true).is_ok() && state.nic.read_status().fatal.is_none() {
                    state.recovery.reset();
                    state.ladder.record_success();
                } else {
                    warn!("driver: {action:?} failed to clear fatal status");
                }
            }
            RecoveryAction::Disable => {
                warn!("driver: disabling nic after exhausting recovery ladder");
                state.nic.disable_irq();
            }
        }
    }

    /// Emits the next frame of the gratuitous-ARP burst (`§4.8`: 3 frames,
    /// 100ms apart) if one is in flight and due. The payload only
    /// guarantees the burst's framing and cadence; filling in the
    /// announced protocol address is a binding-level concern.
    fn service_arp_burst(&mut self, now: Instant) {
        let Some(burst) = &mut self.arp_burst else { return };
        if burst.remaining == 0 {
            self.arp_burst = None;
            return;
        }
        if now.elapsed_since(burst.next_at) < GRATUITOUS_ARP_SPACING_MS && burst.remaining < GRATUITOUS_ARP_COUNT {
            return;
        }
        let nic = burst.nic as usize;
        let mac = self.nics[nic].mac;
        let mut frame = [0u8; wire::HEADER_LEN + 46];
        let header = wire::EthernetHeader {
            dst: wire::BROADCAST_MAC,
            src: mac,
            ethertype: endian_num::be16::new(wire::ethertype::ARP),
        };
        let payload = [0u8; 46];
        if wire::build_frame(&header, &payload, &mut frame).is_ok() {
            let _ = self.queue_tx_frame(nic, &frame, Priority::Urgent);
        }

        let burst = self.arp_burst.as_mut().expect("checked above");
        burst.remaining -= 1;
        burst.next_at = now;
        if burst.remaining == 0 {
            self.arp_burst = None;
        }
    }

    /// Deterministic shutdown for one NIC (`§4.5`, `§5`): drains the
    /// handoff queue and every still-queued TX frame, returning every
    /// buffer to its pool with no partial in-flight state left behind.
    pub fn shutdown(&mut self, handle: NicHandle) -> Result<(), DriverError> {
        let idx = self.slot(handle)?;
        debug!("driver: shutting down nic {idx}");
        let state = &mut self.nics[idx];
        self.bottomhalf.shutdown_drain(&state.handoff, &mut state.pools);
        while let Some((_, frame)) = state.scheduler.dequeue() {
            state.pools.free(frame.class, frame.handle);
        }
        state.nic.disable_irq();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::VirtualClock;
    use crate::hal::fake::{FakeNic, FlatMemory};
    use crate::platform::DmaPolicy;

    fn make_driver() -> Driver {
        let a = NicInit {
            nic: Box::new(FakeNic::default()),
            mac: [0xAA; 6],
            constraints: Constraints::ISA,
            dma_policy: DmaPolicy::Direct,
            bounce_base_phys: 0x9_0000,
        };
        let b = NicInit {
            nic: Box::new(FakeNic::default()),
            mac: [0xBB; 6],
            constraints: Constraints::ISA,
            dma_policy: DmaPolicy::Direct,
            bounce_base_phys: 0xA_0000,
        };
        Driver::new(
            [a, b],
            Box::new(FlatMemory::default()),
            Box::new(VirtualClock::new()),
            DriverConfig::default(),
            NicHandle(0),
            NicHandle(1),
        )
        .unwrap()
    }

    #[test]
    fn new_primes_every_rx_descriptor() {
        let driver = make_driver();
        assert_eq!(driver.nics[0].ring.reclaim_len(), 0);
    }

    #[test]
    fn send_then_service_tx_pushes_into_the_ring() {
        let mut driver = make_driver();
        let outcome = driver.send(NicHandle(0), &[0xAB; 64], Priority::Normal);
        assert_eq!(outcome, SendOutcome::Ok);
        let task = Task::enter().unwrap();
        let sent = driver.service_tx(NicHandle(0), 4, task).unwrap();
        assert_eq!(sent, 1);
    }

    #[test]
    fn send_to_invalid_nic_is_rejected() {
        let mut driver = make_driver();
        let outcome = driver.send(NicHandle(5), &[0u8; 10], Priority::Normal);
        assert_eq!(outcome, SendOutcome::Dropped(DropKind::NetworkDown));
    }

    #[test]
    fn set_multicast_list_programs_the_filter() {
        let mut driver = make_driver();
        driver.set_multicast_list(NicHandle(0), &[[1, 2, 3, 4, 5, 6]]).unwrap();
        assert_eq!(driver.nics[0].multicast.len(), 1);
    }

    #[test]
    fn register_receiver_is_invoked_on_upward_delivery() {
        let mut driver = make_driver();
        let seen = alloc::rc::Rc::new(core::cell::RefCell::new(alloc::vec::Vec::new()));
        let seen_clone = seen.clone();
        driver
            .register_receiver(
                NicHandle(0),
                Box::new(move |nic, bytes| seen_clone.borrow_mut().push((nic, bytes.to_vec()))),
            )
            .unwrap();

        let (class, handle) = driver.nics[0]
            .pools
            .alloc_for_len(64, BufferType::Rx, driver.clock.as_ref())
            .unwrap();
        driver.nics[0].pools.get_mut(class, handle).unwrap().set_payload(&[9u8; 64]).unwrap();
        driver.deliver_upward(0, class, handle, 64);

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].0, 0);
    }

    #[test]
    fn shutdown_drains_every_queued_frame() {
        let mut driver = make_driver();
        driver.send(NicHandle(0), &[1u8; 32], Priority::Low).unwrap_or(SendOutcome::Ok);
        driver.shutdown(NicHandle(0)).unwrap();
        assert_eq!(driver.nics[0].scheduler.total_len(), 0);
    }

    proptest! {
        /// §8 round-trip property: toggling promiscuous mode through any
        /// sequence always leaves the RX filter reflecting exactly the
        /// last value requested, bit-for-bit, regardless of how many times
        /// it flips or what the multicast list looked like at the time.
        #[test]
        fn promiscuous_toggle_sequence_always_lands_on_last_value(toggles in prop::collection::vec(any::<bool>(), 1..32)) {
            let mut driver = make_driver();
            let mut expected = false;
            for value in toggles {
                driver.set_promiscuous(NicHandle(0), value).unwrap();
                expected = value;
                prop_assert_eq!(driver.nics[0].promiscuous, expected);
            }
            prop_assert_eq!(driver.nics[0].promiscuous, expected);
        }
    }
}
