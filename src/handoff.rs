//! ISR→bottom-half handoff queue (`SPEC_FULL.md` §3 "Handoff (SPSC) queue",
//! §4.4, §5).
//!
//! A fixed-capacity single-producer single-consumer ring, producer the ISR,
//! consumer the bottom half. No lock: head/tail are independent cache-line
//! padded atomics, with an `Acquire`/`Release` pair standing in for the
//! compiler barrier `§5` calls for between index publication and payload
//! read.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

use crate::buffer::SizeClass;
use crate::slab::SlabIndex;

pub const STAGING_MAGIC: u32 = 0x5A16_0FF0;

/// What rides the handoff queue: a handle into the owning NIC's buffer
/// pools, not the payload itself. Ownership of the referenced
/// [`crate::buffer::FrameBuffer`] transfers to whoever dequeues this entry
/// (`§3` "a buffer is referenced by at most one of ...").
#[derive(Debug, Copy, Clone)]
pub struct HandoffEntry {
    pub class: SizeClass,
    pub handle: SlabIndex,
    pub len: u16,
    pub source_nic: u8,
    pub magic: u32,
}

impl HandoffEntry {
    pub fn new(class: SizeClass, handle: SlabIndex, len: u16, source_nic: u8) -> Self {
        Self {
            class,
            handle,
            len,
            source_nic,
            magic: STAGING_MAGIC,
        }
    }
}

/// A fixed-capacity `N`-slot SPSC ring. `N` need not be a power of two;
/// indices are taken mod `N`.
pub struct HandoffQueue<const N: usize> {
    slots: [UnsafeCell<MaybeUninit<HandoffEntry>>; N],
    head: CachePadded<core::sync::atomic::AtomicUsize>,
    tail: CachePadded<core::sync::atomic::AtomicUsize>,
}

// SAFETY: access to `slots[i]` is only ever performed by the producer at
// index `tail` before publishing it, or by the consumer at index `head`
// after observing it published; the two never touch the same index
// concurrently given the single-producer/single-consumer discipline.
unsafe impl<const N: usize> Sync for HandoffQueue<N> {}

impl<const N: usize> HandoffQueue<N> {
    pub fn new() -> Self {
        debug_assert!(N > 0, "handoff queue capacity must be nonzero");
        Self {
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            head: CachePadded::new(core::sync::atomic::AtomicUsize::new(0)),
            tail: CachePadded::new(core::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        use core::sync::atomic::Ordering;
        self.tail.load(Ordering::Acquire) - self.head.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    /// Producer side (ISR). Returns `false` (no entry lost, nothing
    /// mutated) if the queue is full — the caller (the ISR's RX path) must
    /// leave the descriptor posted and retry next budget slice.
    pub fn enqueue(&self, entry: HandoffEntry) -> bool {
        use core::sync::atomic::Ordering;
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head == N {
            return false;
        }
        let slot = &self.slots[tail % N];
        // SAFETY: this index is not visible to the consumer until the
        // `Release` store below, and the producer is the only writer.
        unsafe {
            (*slot.get()).write(entry);
        }
        self.tail.store(tail + 1, Ordering::Release);
        true
    }

    /// Consumer side (bottom half). `None` if empty.
    pub fn dequeue(&self) -> Option<HandoffEntry> {
        use core::sync::atomic::Ordering;
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.slots[head % N];
        // SAFETY: `tail` observed above was published after the producer's
        // write, so the payload write happens-before this read.
        let entry = unsafe { (*slot.get()).assume_init_read() };
        self.head.store(head + 1, Ordering::Release);
        Some(entry)
    }

    /// Deterministic shutdown drain (`§4.5`, `§5`): consume everything
    /// remaining, handing each entry to `f` so its buffer can be returned.
    pub fn drain(&self, mut f: impl FnMut(HandoffEntry)) {
        while let Some(entry) = self.dequeue() {
            f(entry);
        }
    }
}

impl<const N: usize> Default for HandoffQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::slab::Slab;

    fn entry(n: u8) -> HandoffEntry {
        let mut scratch: Slab<u8, 8> = Slab::new();
        let handle = scratch.insert(n).unwrap();
        HandoffEntry::new(SizeClass::C64, handle, 64, n)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q: HandoffQueue<4> = HandoffQueue::new();
        assert!(q.enqueue(entry(1)));
        assert!(q.enqueue(entry(2)));
        assert_eq!(q.dequeue().unwrap().source_nic, 1);
        assert_eq!(q.dequeue().unwrap().source_nic, 2);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn full_queue_rejects_without_losing_existing_entries() {
        let q: HandoffQueue<2> = HandoffQueue::new();
        assert!(q.enqueue(entry(1)));
        assert!(q.enqueue(entry(2)));
        assert!(!q.enqueue(entry(3)));
        assert_eq!(q.dequeue().unwrap().source_nic, 1);
        assert_eq!(q.dequeue().unwrap().source_nic, 2);
    }

    #[test]
    fn shutdown_drain_consumes_every_remaining_entry() {
        let q: HandoffQueue<4> = HandoffQueue::new();
        q.enqueue(entry(1));
        q.enqueue(entry(2));
        let mut seen = heapless::Vec::<u8, 4>::new();
        q.drain(|e| {
            let _ = seen.push(e.source_nic);
        });
        assert_eq!(seen.as_slice(), &[1, 2]);
        assert!(q.is_empty());
    }

    proptest! {
        /// §8 invariant 3/4: replaying an arbitrary interleaving of
        /// enqueue/dequeue calls against a tagged model never loses or
        /// duplicates an entry, and `is_full` holds iff exactly `N` pushed
        /// entries haven't yet been popped.
        #[test]
        fn arbitrary_push_pop_sequence_never_loses_or_duplicates(
            ops in prop::collection::vec(prop::bool::ANY, 1..200),
        ) {
            const N: usize = 4;
            let q: HandoffQueue<N> = HandoffQueue::new();
            let mut model: alloc::collections::VecDeque<u8> = alloc::collections::VecDeque::new();
            let mut next_tag = 0u8;

            for push in ops {
                prop_assert_eq!(q.len(), model.len());
                prop_assert_eq!(q.is_full(), model.len() == N);

                if push {
                    let accepted = q.enqueue(entry(next_tag));
                    if model.len() < N {
                        prop_assert!(accepted);
                        model.push_back(next_tag);
                        next_tag = next_tag.wrapping_add(1);
                    } else {
                        prop_assert!(!accepted);
                    }
                } else if let Some(expected) = model.pop_front() {
                    let popped = q.dequeue();
                    prop_assert_eq!(popped.map(|e| e.source_nic), Some(expected));
                } else {
                    prop_assert!(q.dequeue().is_none());
                }
            }
        }
    }
}
