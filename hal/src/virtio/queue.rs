//! Split-ring virtqueue.
//!
//! One DMA allocation holds the three device-visible structures:
//!
//! ```text
//! +--------------------+----------------------+-----+---------------------+
//! | descriptor table   | avail ring           | pad | used ring           |
//! | 16 * size          | 6 + 2 * size         |     | 6 + 8 * size        |
//! +--------------------+----------------------+-----+---------------------+
//! ```
//!
//! Free descriptors form a singly linked list threaded through their
//! `next` fields, terminated by [`NO_NEXT`]. The device cannot tell a
//! free descriptor from a live one, so the driver keeps a
//! [`DescriptorState`] per index and refuses to free a descriptor twice.
//!
//! Producers call `alloc_descriptor` / `chain_next` / `set_buffer` /
//! `enqueue` / `notify`; the interrupt thread calls `drain_used`. Both
//! sides must hold the same lock around the queue.

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use crate::config::PAGE_SIZE;
use crate::error::{ConfigError, HalError, Result};
use crate::memory::{align_up, DmaBuffer, MemoryServices};
use crate::mmio::{Field, FieldArray, Region, Register};

/// Free-list terminator.
pub const NO_NEXT: u16 = 0xFFFF;

/// Largest queue size a split ring can have.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Device asks not to be notified (used ring flags bit 0).
const USED_F_NO_NOTIFY: u16 = 1;

bitflags::bitflags! {
    /// Descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1;
        /// Device writes, driver reads.
        const WRITE = 2;
        /// Buffer holds a table of descriptors.
        const INDIRECT = 4;
    }
}

/// A descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

unsafe impl Register for Descriptor {}

impl Descriptor {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags)
    }
}

/// A used ring entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedElement {
    /// Head of the completed chain.
    pub id: u32,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

unsafe impl Register for UsedElement {}

/// Driver-side ownership of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// On the free list.
    Free,
    /// Part of a chain owned by the driver or the device.
    InUse,
}

/// Byte offsets of the three rings inside the queue allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub desc: usize,
    pub avail: usize,
    pub used: usize,
    /// Allocation size, whole pages.
    pub total: usize,
}

impl RingLayout {
    pub fn new(size: u16) -> Self {
        let size = size as usize;
        let avail = 16 * size;
        let used = align_up(avail + 6 + 2 * size, 4);
        RingLayout {
            desc: 0,
            avail,
            used,
            total: align_up(used + 6 + 8 * size, PAGE_SIZE),
        }
    }
}

/// Device-visible views, resolved once.
struct Rings {
    desc: FieldArray<Descriptor>,
    avail_idx: Field<u16>,
    avail_ring: FieldArray<u16>,
    used_flags: Field<u16>,
    used_idx: Field<u16>,
    used_ring: FieldArray<UsedElement>,
}

impl Rings {
    fn new(region: &Region, layout: &RingLayout, size: usize) -> Result<Self> {
        Ok(Rings {
            desc: region.array(layout.desc, size)?,
            avail_idx: region.field(layout.avail + 2)?,
            avail_ring: region.array(layout.avail + 4, size)?,
            used_flags: region.field(layout.used)?,
            used_idx: region.field(layout.used + 2)?,
            used_ring: region.array(layout.used + 4, size)?,
        })
    }
}

/// The split-ring protocol engine for one queue.
pub struct Virtqueue {
    index: u16,
    size: u16,
    layout: RingLayout,
    memory: DmaBuffer,
    rings: Rings,
    notifier: Field<u16>,
    first_free: u16,
    num_free: u16,
    last_seen_used: u16,
    added_heads: u16,
    states: Vec<DescriptorState>,
}

impl Virtqueue {
    /// Allocate and initialise the rings for queue `index`.
    ///
    /// `size` is the device-reported queue size and must be a power of
    /// two; `notifier` is the queue's doorbell register.
    pub fn new(
        memory: &dyn MemoryServices,
        index: u16,
        size: u16,
        notifier: Field<u16>,
    ) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(ConfigError::QueueUnavailable(index).into());
        }

        let layout = RingLayout::new(size);
        let buffer = memory.allocate_dma(layout.total)?;
        let rings = match Rings::new(buffer.region(), &layout, size as usize) {
            Ok(rings) => rings,
            Err(e) => {
                memory.free_dma(buffer);
                return Err(e);
            }
        };

        for i in 0..size {
            let next = if i + 1 < size { i + 1 } else { NO_NEXT };
            rings.desc.write(
                i as usize,
                Descriptor {
                    next,
                    ..Descriptor::default()
                },
            )?;
        }

        log::debug!(
            "[VirtIO] queue {}: {} descriptors at {:#x}",
            index,
            size,
            buffer.phys()
        );

        Ok(Virtqueue {
            index,
            size,
            layout,
            memory: buffer,
            rings,
            notifier,
            first_free: 0,
            num_free: size,
            last_seen_used: 0,
            added_heads: 0,
            states: alloc::vec![DescriptorState::Free; size as usize],
        })
    }

    fn check_live(&self, idx: u16) -> Result<()> {
        match self.states.get(idx as usize) {
            Some(DescriptorState::InUse) => Ok(()),
            _ => Err(HalError::CorruptChain(idx)),
        }
    }

    /// Pop a descriptor off the free list.
    ///
    /// The descriptor comes back cleared. Fails with
    /// [`HalError::QueueFull`] when every descriptor is in use.
    pub fn alloc_descriptor(&mut self) -> Result<u16> {
        if self.num_free == 0 {
            return Err(HalError::QueueFull);
        }
        let idx = self.first_free;
        let desc = self.rings.desc.at(idx as usize)?;
        self.first_free = desc.read().next;
        desc.write(Descriptor::default());
        self.num_free -= 1;
        self.states[idx as usize] = DescriptorState::InUse;
        Ok(idx)
    }

    /// Allocate a descriptor and link it after `prev`.
    pub fn chain_next(&mut self, prev: u16) -> Result<u16> {
        self.check_live(prev)?;
        let next = self.alloc_descriptor()?;
        let desc = self.rings.desc.at(prev as usize)?;
        let mut d = desc.read();
        d.flags |= DescFlags::NEXT.bits();
        d.next = next;
        desc.write(d);
        Ok(next)
    }

    /// Point descriptor `idx` at a buffer. The chain link is preserved.
    pub fn set_buffer(&mut self, idx: u16, addr: u64, len: u32, writable: bool) -> Result<()> {
        self.check_live(idx)?;
        let desc = self.rings.desc.at(idx as usize)?;
        let mut d = desc.read();
        let mut flags = d.flags() & DescFlags::NEXT;
        flags.set(DescFlags::WRITE, writable);
        d.addr = addr;
        d.len = len;
        d.flags = flags.bits();
        desc.write(d);

        #[cfg(feature = "trace-queues")]
        log::trace!(
            "[VirtIO] q{} desc {}: {:#x}+{} {:?} next {}",
            self.index,
            idx,
            addr,
            len,
            flags,
            d.next
        );
        Ok(())
    }

    /// Stage `head` on the avail ring. Not visible until [`notify`].
    ///
    /// [`notify`]: Virtqueue::notify
    pub fn enqueue(&mut self, head: u16) -> Result<()> {
        self.check_live(head)?;
        let slot = self
            .rings
            .avail_idx
            .read()
            .wrapping_add(self.added_heads)
            % self.size;
        self.rings.avail_ring.write(slot as usize, head)?;
        self.added_heads += 1;
        Ok(())
    }

    /// Publish staged heads with one `avail.idx` update, then ring the
    /// doorbell unless the device suppressed notifications.
    pub fn notify(&mut self) {
        if self.added_heads == 0 {
            return;
        }
        fence(Ordering::SeqCst);
        let idx = self.rings.avail_idx.read();
        self.rings.avail_idx.write(idx.wrapping_add(self.added_heads));
        self.added_heads = 0;
        fence(Ordering::SeqCst);

        if self.rings.used_flags.read() & USED_F_NO_NOTIFY == 0 {
            self.notifier.write(self.index);
        }
    }

    /// Consume every used entry the device has published.
    ///
    /// `complete(head, len)` runs once per finished chain, then the chain
    /// returns to the free list. Entries naming an invalid or free head
    /// are logged and skipped. Returns the number of chains completed.
    pub fn drain_used(&mut self, mut complete: impl FnMut(u16, u32)) -> usize {
        fence(Ordering::SeqCst);
        let used_idx = self.rings.used_idx.read();
        let mut completed = 0;

        while self.last_seen_used != used_idx {
            let slot = (self.last_seen_used % self.size) as usize;
            let elem = match self.rings.used_ring.read(slot) {
                Ok(e) => e,
                Err(_) => break,
            };

            let walked = if elem.id < self.size as u32 {
                self.walk_chain(elem.id as u16)
            } else {
                Err(HalError::CorruptChain(elem.id as u16))
            };
            match walked {
                Ok((tail, count)) => {
                    let head = elem.id as u16;
                    #[cfg(feature = "trace-queues")]
                    log::trace!("[VirtIO] q{} used head {} len {}", self.index, head, elem.len);
                    complete(head, elem.len);
                    self.release(head, tail, count);
                    completed += 1;
                }
                Err(e) => {
                    log::error!(
                        "[VirtIO] q{}: bad used entry {} (id {}): {}",
                        self.index,
                        self.last_seen_used,
                        elem.id,
                        e
                    );
                    self.last_seen_used = self.last_seen_used.wrapping_add(1);
                }
            }
        }
        completed
    }

    /// Return a completed chain to the free list and advance the
    /// consumer cursor.
    pub fn free_chain(&mut self, head: u16) -> Result<()> {
        let (tail, count) = self.walk_chain(head)?;
        self.release(head, tail, count);
        Ok(())
    }

    /// Validate a chain without modifying it; returns `(tail, length)`.
    fn walk_chain(&self, head: u16) -> Result<(u16, u16)> {
        let mut idx = head;
        let mut count: u16 = 0;
        loop {
            match self.states.get(idx as usize) {
                None => return Err(HalError::CorruptChain(head)),
                Some(DescriptorState::Free) => return Err(HalError::DoubleFree(idx)),
                Some(DescriptorState::InUse) => {}
            }
            count += 1;
            if count > self.size {
                return Err(HalError::CorruptChain(head));
            }
            let d = self.rings.desc.read(idx as usize)?;
            if d.flags().contains(DescFlags::NEXT) {
                idx = d.next;
            } else {
                return Ok((idx, count));
            }
        }
    }

    /// Splice a validated chain onto the free list.
    fn release(&mut self, head: u16, tail: u16, count: u16) {
        let mut idx = head;
        for _ in 0..count {
            self.states[idx as usize] = DescriptorState::Free;
            if idx == tail {
                break;
            }
            idx = match self.rings.desc.read(idx as usize) {
                Ok(d) => d.next,
                Err(_) => break,
            };
        }
        if let Ok(desc) = self.rings.desc.at(tail as usize) {
            desc.write(Descriptor {
                next: self.first_free,
                ..Descriptor::default()
            });
        }
        self.first_free = head;
        self.num_free += count;
        self.last_seen_used = self.last_seen_used.wrapping_add(1);
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Consumer cursor into the used ring.
    pub fn last_seen_used(&self) -> u16 {
        self.last_seen_used
    }

    /// Heads enqueued but not yet published.
    pub fn staged(&self) -> u16 {
        self.added_heads
    }

    /// Whether the device has published entries not yet drained.
    pub fn has_used(&self) -> bool {
        fence(Ordering::SeqCst);
        self.rings.used_idx.read() != self.last_seen_used
    }

    /// Give up the queue and hand back its ring memory.
    pub fn into_buffer(self) -> DmaBuffer {
        self.memory
    }

    /// Physical address of the descriptor table.
    pub fn desc_phys(&self) -> u64 {
        self.memory.phys() + self.layout.desc as u64
    }

    /// Physical address of the avail ring.
    pub fn avail_phys(&self) -> u64 {
        self.memory.phys() + self.layout.avail as u64
    }

    /// Physical address of the used ring.
    pub fn used_phys(&self) -> u64 {
        self.memory.phys() + self.layout.used as u64
    }

    pub fn descriptor(&self, idx: u16) -> Result<Descriptor> {
        self.rings.desc.read(idx as usize)
    }

    pub fn state(&self, idx: u16) -> Option<DescriptorState> {
        self.states.get(idx as usize).copied()
    }

    /// Free list in pop order.
    pub fn free_list(&self) -> Vec<u16> {
        let mut list = Vec::with_capacity(self.num_free as usize);
        let mut idx = self.first_free;
        for _ in 0..self.num_free {
            list.push(idx);
            idx = match self.rings.desc.read(idx as usize) {
                Ok(d) => d.next,
                Err(_) => break,
            };
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sim::{SimMemory, SimRing};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn queue(size: u16) -> (SimMemory, Virtqueue, Region) {
        let mem = SimMemory::new();
        let doorbell = mem.allocate_region(PAGE_SIZE);
        let q = Virtqueue::new(&mem, 3, size, doorbell.field(0).unwrap()).unwrap();
        (mem, q, doorbell)
    }

    #[test]
    fn test_layout() {
        let l = RingLayout::new(8);
        assert_eq!(l.avail, 128);
        assert_eq!(l.used, 152);
        assert_eq!(l.total, PAGE_SIZE);
        let l = RingLayout::new(256);
        assert_eq!(l.avail, 4096);
        assert_eq!(l.used, 4096 + 6 + 512 + 2);
        assert_eq!(l.total, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let mem = SimMemory::new();
        let doorbell = mem.allocate_region(PAGE_SIZE);
        for size in [0, 3, 100] {
            assert_eq!(
                Virtqueue::new(&mem, 1, size, doorbell.field(0).unwrap()).err(),
                Some(HalError::Config(ConfigError::QueueUnavailable(1)))
            );
        }
    }

    #[test]
    fn test_initial_free_list() {
        let (_mem, q, _) = queue(4);
        assert_eq!(q.free_list(), [0, 1, 2, 3]);
        assert_eq!(q.descriptor(3).unwrap().next, NO_NEXT);
    }

    #[test]
    fn test_exhaustion_reports_queue_full() {
        let (_mem, mut q, _) = queue(8);
        let mut seen = BTreeSet::new();
        for _ in 0..8 {
            assert!(seen.insert(q.alloc_descriptor().unwrap()));
        }
        assert_eq!(q.alloc_descriptor(), Err(HalError::QueueFull));
        assert_eq!(q.num_free(), 0);
    }

    #[test]
    fn test_chain_flags() {
        let (_mem, mut q, _) = queue(8);
        let head = q.alloc_descriptor().unwrap();
        q.set_buffer(head, 0x1000, 16, false).unwrap();
        let mid = q.chain_next(head).unwrap();
        q.set_buffer(mid, 0x2000, 512, true).unwrap();
        let tail = q.chain_next(mid).unwrap();
        q.set_buffer(tail, 0x3000, 1, true).unwrap();

        let flags: Vec<_> = [head, mid, tail]
            .iter()
            .map(|&i| q.descriptor(i).unwrap().flags())
            .collect();
        assert_eq!(
            flags,
            [
                DescFlags::NEXT,
                DescFlags::NEXT | DescFlags::WRITE,
                DescFlags::WRITE
            ]
        );
        assert_eq!(q.descriptor(head).unwrap().next, mid);
        assert_eq!(q.descriptor(mid).unwrap().next, tail);
    }

    #[test]
    fn test_notify_publishes_batch() {
        let (_mem, mut q, doorbell) = queue(8);
        let ring = SimRing::attach(&q);
        let a = q.alloc_descriptor().unwrap();
        let b = q.alloc_descriptor().unwrap();
        q.enqueue(a).unwrap();
        q.enqueue(b).unwrap();
        assert_eq!(ring.avail_idx(), 0);
        assert_eq!(q.staged(), 2);

        q.notify();
        assert_eq!(ring.avail_idx(), 2);
        assert_eq!(ring.avail_entry(0), a);
        assert_eq!(ring.avail_entry(1), b);
        assert_eq!(doorbell.load::<u16>(0).unwrap(), 3);
        assert_eq!(q.staged(), 0);
    }

    #[test]
    fn test_notify_suppressed() {
        let (_mem, mut q, doorbell) = queue(8);
        let ring = SimRing::attach(&q);
        ring.set_used_flags(1);
        doorbell.store::<u16>(0, 0xAAAA).unwrap();
        let a = q.alloc_descriptor().unwrap();
        q.enqueue(a).unwrap();
        q.notify();
        assert_eq!(ring.avail_idx(), 1);
        assert_eq!(doorbell.load::<u16>(0).unwrap(), 0xAAAA);
    }

    #[test]
    fn test_drain_round_trip() {
        let (_mem, mut q, _) = queue(8);
        let ring = SimRing::attach(&q);
        let head = q.alloc_descriptor().unwrap();
        q.set_buffer(head, 0x4000, 64, true).unwrap();
        q.enqueue(head).unwrap();
        q.notify();

        ring.push_used(head as u32, 64);
        let mut calls = Vec::new();
        assert_eq!(q.drain_used(|h, len| calls.push((h, len))), 1);
        assert_eq!(calls, [(head, 64)]);
        assert_eq!(q.num_free(), 8);
        assert_eq!(q.state(head), Some(DescriptorState::Free));
        assert_eq!(q.last_seen_used(), 1);
        assert_eq!(q.drain_used(|_, _| panic!("nothing left")), 0);
    }

    #[test]
    fn test_drain_skips_bad_entries() {
        let (_mem, mut q, _) = queue(8);
        let ring = SimRing::attach(&q);
        let head = q.alloc_descriptor().unwrap();
        q.enqueue(head).unwrap();
        q.notify();

        ring.push_used(200, 0);
        ring.push_used(5, 0);
        ring.push_used(head as u32, 0);
        let mut calls = 0;
        assert_eq!(q.drain_used(|_, _| calls += 1), 1);
        assert_eq!(calls, 1);
        assert_eq!(q.last_seen_used(), 3);
        assert_eq!(q.num_free(), 8);
    }

    #[test]
    fn test_double_free_detected() {
        let (_mem, mut q, _) = queue(4);
        let head = q.alloc_descriptor().unwrap();
        let tail = q.chain_next(head).unwrap();
        q.free_chain(head).unwrap();
        let before = q.free_list();
        assert_eq!(q.free_chain(head), Err(HalError::DoubleFree(head)));
        assert_eq!(q.free_chain(tail), Err(HalError::DoubleFree(tail)));
        assert_eq!(q.free_list(), before);
        assert_eq!(q.num_free(), 4);
    }

    #[test]
    fn test_freed_chain_is_reused_first() {
        let (_mem, mut q, _) = queue(4);
        let a = q.alloc_descriptor().unwrap();
        let b = q.chain_next(a).unwrap();
        q.free_chain(a).unwrap();
        assert_eq!(q.free_list()[..2], [a, b]);
        assert_eq!(q.alloc_descriptor().unwrap(), a);
        assert_eq!(q.descriptor(a).unwrap(), Descriptor::default());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(u16),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u16..=4).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    fn check_partition(q: &Virtqueue, live: &[Vec<u16>]) {
        let free = q.free_list();
        assert_eq!(free.len(), q.num_free() as usize);
        let mut all = BTreeSet::new();
        for &i in &free {
            assert_eq!(q.state(i), Some(DescriptorState::Free));
            assert!(all.insert(i), "{} twice on the free list", i);
        }
        for chain in live {
            for &i in chain {
                assert_eq!(q.state(i), Some(DescriptorState::InUse));
                assert!(all.insert(i), "{} both free and live", i);
            }
        }
        assert_eq!(all.len(), q.size() as usize);
    }

    proptest! {
        #[test]
        fn prop_free_list_partitions_descriptors(ops in prop::collection::vec(op(), 1..64)) {
            let (_mem, mut q, _) = queue(16);
            let mut live: Vec<Vec<u16>> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc(n) => {
                        if q.num_free() < n {
                            continue;
                        }
                        let mut chain = alloc::vec![q.alloc_descriptor().unwrap()];
                        for _ in 1..n {
                            let prev = *chain.last().unwrap();
                            chain.push(q.chain_next(prev).unwrap());
                        }
                        live.push(chain);
                    }
                    Op::Free(sel) => {
                        if live.is_empty() {
                            continue;
                        }
                        let chain = live.remove(sel % live.len());
                        q.free_chain(chain[0]).unwrap();
                    }
                }
                check_partition(&q, &live);
            }
        }

        #[test]
        fn prop_allocation_exhausts_exactly_once(shift in 0u32..9) {
            let size = 1u16 << shift;
            let (_mem, mut q, _) = queue(size);
            let mut seen = BTreeSet::new();
            for _ in 0..size {
                prop_assert!(seen.insert(q.alloc_descriptor().unwrap()));
            }
            prop_assert_eq!(q.alloc_descriptor(), Err(HalError::QueueFull));
        }
    }
}
