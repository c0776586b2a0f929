//! Per-shard allocator of record slots inside the persistent region.
//!
//! ```text
//! region: [ slot | slot | slot | ......... frontier ->  (never used) ]
//!
//! free lists (one per 64-byte size class, lock-free stacks of pool nodes)
//!   128B  -> [n3] -> [n7]
//!   192B  -> []
//!   ...
//!   1088B -> [n1]
//!
//! limbo (one per epoch slot): retired slots waiting for readers to leave
//! free queue: ring of unused pool-node indices
//! ```
//!
//! In `Append` mode every allocation extends the frontier. In `Shrink` mode
//! the size classes are scanned first-fit from the requested size upwards; a
//! hit that leaves at least one minimum record of slack is split and the tail
//! goes back to the free lists. A miss falls back to the frontier.
//!
//! None of this state is persisted. After a restart the frontier comes from
//! the recovery scan and the free lists start empty.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::record::{MAX_CAPACITY, MIN_RECORD_SIZE, SLOT_ALIGN};
use crate::shard::epoch::{slot_of, EpochGate, EpochGuard, EPOCH_SLOTS};
use crate::util::align_up;

const NIL: u32 = u32::MAX;

const SIZE_CLASSES: usize = (MAX_CAPACITY / SLOT_ALIGN) as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocMode {
  /// Always extend the frontier.
  Append = 0,
  /// Reuse freed slots first, extend the frontier on a miss.
  Shrink = 1,
}

impl AllocMode {
  fn from_u8(v: u8) -> Self {
    match v {
      1 => AllocMode::Shrink,
      _ => AllocMode::Append,
    }
  }
}

/// A byte range handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
  pub offset: u64,
  pub capacity: u32,
}

#[derive(Debug)]
struct PoolNode {
  offset: AtomicU64,
  capacity: AtomicU32,
  next: AtomicU32,
}

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
  (tag as u64) << 32 | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
  ((word >> 32) as u32, word as u32)
}

/// Treiber stack of pool-node indices. The head carries a version tag that
/// changes on every successful update, so a pop cannot succeed against a head
/// that was popped and pushed back in the meantime.
#[derive(Debug)]
struct NodeStack {
  head: AtomicU64,
}

impl NodeStack {
  fn new() -> Self {
    Self {
      head: AtomicU64::new(pack(0, NIL)),
    }
  }

  fn push(&self, nodes: &[PoolNode], index: u32) {
    let mut current = self.head.load(Ordering::Acquire);
    loop {
      let (tag, head) = unpack(current);
      nodes[index as usize].next.store(head, Ordering::Relaxed);
      match self.head.compare_exchange_weak(
        current,
        pack(tag.wrapping_add(1), index),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return,
        Err(actual) => current = actual,
      }
    }
  }

  fn pop(&self, nodes: &[PoolNode]) -> Option<u32> {
    let mut current = self.head.load(Ordering::Acquire);
    loop {
      let (tag, head) = unpack(current);
      if head == NIL {
        return None;
      }
      let next = nodes[head as usize].next.load(Ordering::Relaxed);
      match self.head.compare_exchange_weak(
        current,
        pack(tag.wrapping_add(1), next),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Some(head),
        Err(actual) => current = actual,
      }
    }
  }

  /// Detaches the whole chain and returns its first index (or `NIL`).
  fn take_all(&self) -> u32 {
    let mut current = self.head.load(Ordering::Acquire);
    loop {
      let (tag, head) = unpack(current);
      if head == NIL {
        return NIL;
      }
      match self.head.compare_exchange_weak(
        current,
        pack(tag.wrapping_add(1), NIL),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return head,
        Err(actual) => current = actual,
      }
    }
  }
}

/// Bounded ring of unused pool-node indices, driven by two monotonic
/// counters. At most `capacity` indices exist, so the ring never overfills.
#[derive(Debug)]
struct FreeQueue {
  slots: Box<[AtomicU32]>,
  front: AtomicU64,
  rear: AtomicU64,
}

impl FreeQueue {
  fn new(capacity: usize) -> Self {
    Self {
      slots: (0..capacity as u32).map(AtomicU32::new).collect(),
      front: AtomicU64::new(0),
      rear: AtomicU64::new(capacity as u64),
    }
  }

  fn pop_front(&self) -> Option<u32> {
    let n = self.slots.len() as u64;
    loop {
      let front = self.front.load(Ordering::Acquire);
      if front >= self.rear.load(Ordering::Acquire) {
        return None;
      }
      if self
        .front
        .compare_exchange_weak(front, front + 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        // The pusher that reserved this position may not have stored yet.
        let slot = &self.slots[(front % n) as usize];
        loop {
          let item = slot.swap(NIL, Ordering::AcqRel);
          if item != NIL {
            return Some(item);
          }
          std::hint::spin_loop();
        }
      }
    }
  }

  fn push_back(&self, item: u32) {
    let n = self.slots.len() as u64;
    let rear = self.rear.fetch_add(1, Ordering::AcqRel);
    let slot = &self.slots[(rear % n) as usize];
    // The popper of the previous lap may still be draining this slot.
    while slot
      .compare_exchange_weak(NIL, item, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      std::hint::spin_loop();
    }
  }

  fn len(&self) -> u64 {
    let rear = self.rear.load(Ordering::Acquire);
    rear.saturating_sub(self.front.load(Ordering::Acquire))
  }
}

pub struct PmemAllocator {
  shard: usize,
  region_len: u64,
  frontier: AtomicU64,
  mode: AtomicU8,

  free_lists: Box<[NodeStack]>,
  limbo: [NodeStack; EPOCH_SLOTS],
  nodes: Box<[PoolNode]>,
  queue: FreeQueue,
  gate: EpochGate,

  free_slots: AtomicU64,
  pending: AtomicU64,
  leaked: AtomicU64,
}

impl PmemAllocator {
  /// Creates an allocator for a region of `region_len` bytes with
  /// `pool_size` free-pool nodes.
  pub fn new(shard: usize, region_len: u64, pool_size: usize) -> Self {
    Self {
      shard,
      region_len,
      frontier: AtomicU64::new(0),
      mode: AtomicU8::new(AllocMode::Append as u8),
      free_lists: (0..SIZE_CLASSES).map(|_| NodeStack::new()).collect(),
      limbo: [NodeStack::new(), NodeStack::new(), NodeStack::new()],
      nodes: (0..pool_size)
        .map(|_| PoolNode {
          offset: AtomicU64::new(0),
          capacity: AtomicU32::new(0),
          next: AtomicU32::new(NIL),
        })
        .collect(),
      queue: FreeQueue::new(pool_size),
      gate: EpochGate::new(),
      free_slots: AtomicU64::new(0),
      pending: AtomicU64::new(0),
      leaked: AtomicU64::new(0),
    }
  }

  pub fn set_frontier(&self, frontier: u64) {
    self.frontier.store(frontier, Ordering::Release);
  }

  pub fn frontier(&self) -> u64 {
    self.frontier.load(Ordering::Acquire)
  }

  pub fn region_len(&self) -> u64 {
    self.region_len
  }

  pub fn set_mode(&self, mode: AllocMode) {
    let previous = AllocMode::from_u8(self.mode.swap(mode as u8, Ordering::AcqRel));
    if previous != mode {
      tracing::debug!(
        target: "ironkv::shard",
        shard = self.shard,
        ?mode,
        "allocator mode changed"
      );
    }
  }

  pub fn mode(&self) -> AllocMode {
    AllocMode::from_u8(self.mode.load(Ordering::Acquire))
  }

  /// Pins the reclamation epoch. Slots observed while the guard is alive are
  /// not reissued until it is dropped.
  pub fn pin(&self) -> EpochGuard<'_> {
    self.gate.pin()
  }

  /// Allocates a slot of at least `size` bytes. The capacity is a multiple
  /// of 64.
  pub fn allocate(&self, size: u32) -> Result<Slot> {
    let size = align_up(size, SLOT_ALIGN);

    if self.mode() == AllocMode::Shrink {
      if let Some(slot) = self.allocate_from_free_lists(size) {
        return Ok(slot);
      }
    }
    self.append(size)
  }

  /// First-fit scan of the size classes from `size` upwards.
  fn allocate_from_free_lists(&self, size: u32) -> Option<Slot> {
    let (offset, capacity) = (size..=MAX_CAPACITY)
      .step_by(SLOT_ALIGN as usize)
      .find_map(|cap| self.try_allocate(cap).map(|offset| (offset, cap)))?;

    if capacity < size + MIN_RECORD_SIZE {
      return Some(Slot { offset, capacity });
    }
    self.deallocate(offset + size as u64, capacity - size);
    Some(Slot {
      offset,
      capacity: size,
    })
  }

  /// Pops a free slot of exactly `capacity` bytes.
  pub fn try_allocate(&self, capacity: u32) -> Option<u64> {
    let list = self.free_lists.get((capacity / SLOT_ALIGN) as usize)?;
    let index = list.pop(&self.nodes)?;
    let offset = self.nodes[index as usize].offset.load(Ordering::Acquire);
    self.queue.push_back(index);
    self.free_slots.fetch_sub(1, Ordering::Relaxed);
    Some(offset)
  }

  fn append(&self, capacity: u32) -> Result<Slot> {
    let offset = self.frontier.fetch_add(capacity as u64, Ordering::AcqRel);
    if offset + capacity as u64 > self.region_len {
      return Err(Error::RegionFull {
        shard: self.shard,
        requested: capacity as u64,
        frontier: offset,
        capacity: self.region_len,
      });
    }
    Ok(Slot { offset, capacity })
  }

  /// Returns a slot straight to its size class. Only for ranges no reader can
  /// reference, such as split remainders.
  pub fn deallocate(&self, offset: u64, capacity: u32) {
    if let Some(index) = self.fill_node(offset, capacity) {
      self.push_free(index);
    }
  }

  /// Returns a superseded slot. It becomes reusable once every reader pinned
  /// at or before the current epoch has finished.
  pub fn retire(&self, offset: u64, capacity: u32) {
    if let Some(index) = self.fill_node(offset, capacity) {
      let epoch = self.gate.current();
      self.pending.fetch_add(1, Ordering::Relaxed);
      self.limbo[slot_of(epoch)].push(&self.nodes, index);
    }
    self.advance();
  }

  /// Tries to advance the epoch until everything retired so far is reusable.
  /// Stops early if a reader is still pinned.
  pub fn reclaim(&self) {
    for _ in 0..EPOCH_SLOTS {
      if !self.advance() {
        break;
      }
    }
  }

  fn advance(&self) -> bool {
    let before = self.gate.current();
    if let Some(released) = self.gate.try_advance() {
      self.drain_limbo(slot_of(released));
    }
    self.gate.current() != before
  }

  fn drain_limbo(&self, slot: usize) {
    let mut index = self.limbo[slot].take_all();
    while index != NIL {
      let next = self.nodes[index as usize].next.load(Ordering::Acquire);
      self.pending.fetch_sub(1, Ordering::Relaxed);
      self.push_free(index);
      index = next;
    }
  }

  fn fill_node(&self, offset: u64, capacity: u32) -> Option<u32> {
    if capacity == 0 || capacity % SLOT_ALIGN != 0 || capacity > MAX_CAPACITY {
      tracing::debug!(
        target: "ironkv::shard",
        shard = self.shard,
        offset,
        capacity,
        "slot with irregular capacity left unreclaimed"
      );
      self.leaked.fetch_add(1, Ordering::Relaxed);
      return None;
    }
    let Some(index) = self.queue.pop_front() else {
      tracing::debug!(
        target: "ironkv::shard",
        shard = self.shard,
        offset,
        capacity,
        "free pool exhausted, slot left unreclaimed"
      );
      self.leaked.fetch_add(1, Ordering::Relaxed);
      return None;
    };
    let node = &self.nodes[index as usize];
    node.offset.store(offset, Ordering::Release);
    node.capacity.store(capacity, Ordering::Release);
    Some(index)
  }

  fn push_free(&self, index: u32) {
    let capacity = self.nodes[index as usize].capacity.load(Ordering::Acquire);
    // Counted before it becomes poppable.
    self.free_slots.fetch_add(1, Ordering::Relaxed);
    self.free_lists[(capacity / SLOT_ALIGN) as usize].push(&self.nodes, index);
  }

  /// Slots sitting in the size-class free lists.
  pub fn free_slots(&self) -> u64 {
    self.free_slots.load(Ordering::Relaxed)
  }

  /// Retired slots still waiting for readers to leave.
  pub fn pending_reclaim(&self) -> u64 {
    self.pending.load(Ordering::Relaxed)
  }

  /// Unused pool nodes.
  pub fn free_pool_available(&self) -> u64 {
    self.queue.len()
  }

  /// Slots that could not be tracked and are lost until the next restart.
  pub fn leaked_slots(&self) -> u64 {
    self.leaked.load(Ordering::Relaxed)
  }
}
