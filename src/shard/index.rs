//! Lock-free hash index mapping keys to record offsets within a shard.
//!
//! Every distinct key owns one identity: a permanent slot in a preallocated
//! arena holding the current record offset and an intrusive chain link. Bucket
//! heads anchor singly linked chains of identity indices; new identities are
//! prepended with a CAS and never unlinked. The key itself is not stored in
//! memory: it is compared against the record the identity points to, after a
//! one-byte tag has filtered out most mismatches.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::record::{check_intact, Key, RecordHeader, HEADER_SIZE, KEY_SIZE, RECORD_MARKER, SLOT_ALIGN};
use crate::region::ShardRegion;
use crate::util::key_hash;

const NIL: u32 = u32::MAX;
const TAG_SHIFT: u32 = 32;

/// Timestamps are 10-bit counters; anything up to half the range ahead counts
/// as newer.
const TIMESTAMP_RANGE: u16 = 1 << 10;

pub type IdentityId = u32;

/// Read access to records stored in a shard region.
pub trait RecordSource {
  fn key_at(&self, offset: u64) -> Key;
  fn header_at(&self, offset: u64) -> RecordHeader;
}

impl RecordSource for ShardRegion {
  fn key_at(&self, offset: u64) -> Key {
    let mut key = [0u8; KEY_SIZE];
    self.read_into(offset + HEADER_SIZE as u64, &mut key);
    key
  }

  fn header_at(&self, offset: u64) -> RecordHeader {
    let mut buf = [0u8; HEADER_SIZE];
    self.read_into(offset, &mut buf);
    RecordHeader::decode(&buf)
  }
}

impl RecordSource for [u8] {
  fn key_at(&self, offset: u64) -> Key {
    let start = offset as usize + HEADER_SIZE;
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&self[start..start + KEY_SIZE]);
    key
  }

  fn header_at(&self, offset: u64) -> RecordHeader {
    RecordHeader::decode(&self[offset as usize..])
  }
}

/// Returns true if timestamp `a` is strictly newer than `b`, allowing for
/// wrap-around of the 10-bit counter.
#[inline]
pub fn is_newer(a: u16, b: u16) -> bool {
  let distance = a.wrapping_sub(b) & (TIMESTAMP_RANGE - 1);
  distance != 0 && distance < TIMESTAMP_RANGE / 2
}

#[derive(Debug)]
struct Identity {
  next: AtomicU32,
  offset: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
  /// A new identity was published for the key.
  Inserted(IdentityId),
  /// Another writer published the key first; this is its identity.
  Existing(IdentityId),
}

/// Result of rebuilding the index from a region scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
  /// Intact records found, including superseded versions.
  pub records: u64,
  /// Distinct keys now present in the index.
  pub keys: usize,
  /// End of the highest recovered slot. Appends resume from here.
  pub frontier: u64,
}

pub struct HashIndex {
  shard: usize,
  identities: Box<[Identity]>,
  tags: Box<[AtomicU8]>,
  buckets: Box<[AtomicU32]>,
  reserved: AtomicUsize,
  /// Tagged stack of identities reserved by an insert that lost its race.
  spare: AtomicU64,
  published: AtomicUsize,
}

impl HashIndex {
  pub fn new(shard: usize, capacity: usize, bucket_count: usize) -> Self {
    Self {
      shard,
      identities: (0..capacity)
        .map(|_| Identity {
          next: AtomicU32::new(NIL),
          offset: AtomicU64::new(0),
        })
        .collect(),
      tags: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
      buckets: (0..bucket_count).map(|_| AtomicU32::new(NIL)).collect(),
      reserved: AtomicUsize::new(0),
      spare: AtomicU64::new(NIL as u64),
      published: AtomicUsize::new(0),
    }
  }

  #[inline]
  fn locate(&self, key: &Key) -> (usize, u8) {
    let (hash, tag) = key_hash(key);
    ((hash % self.buckets.len() as u64) as usize, tag)
  }

  #[inline]
  fn next(&self, id: IdentityId) -> IdentityId {
    self.identities[id as usize].next.load(Ordering::Acquire)
  }

  /// Walks the chain from `from` up to (not including) `until`, looking for
  /// `key`.
  fn scan<S: RecordSource + ?Sized>(
    &self,
    source: &S,
    key: &Key,
    tag: u8,
    from: IdentityId,
    until: IdentityId,
  ) -> Option<IdentityId> {
    let mut id = from;
    while id != until {
      if self.tags[id as usize].load(Ordering::Acquire) == tag && source.key_at(self.offset(id)) == *key {
        return Some(id);
      }
      id = self.next(id);
    }
    None
  }

  pub fn find<S: RecordSource + ?Sized>(&self, source: &S, key: &Key) -> Option<IdentityId> {
    let (bucket, tag) = self.locate(key);
    let head = self.buckets[bucket].load(Ordering::Acquire);
    self.scan(source, key, tag, head, NIL)
  }

  /// Publishes a new identity for `key` whose record lives at `offset`.
  ///
  /// If another writer publishes the same key first, the winner's identity is
  /// returned instead and the reservation is kept for a later insert.
  pub fn insert<S: RecordSource + ?Sized>(&self, source: &S, key: &Key, offset: u64) -> Result<InsertOutcome> {
    let (bucket, tag) = self.locate(key);
    let head_ref = &self.buckets[bucket];
    let mut head = head_ref.load(Ordering::Acquire);
    if let Some(existing) = self.scan(source, key, tag, head, NIL) {
      return Ok(InsertOutcome::Existing(existing));
    }

    let id = self.reserve()?;
    self.tags[id as usize].store(tag, Ordering::Relaxed);
    self.identities[id as usize].offset.store(offset, Ordering::Relaxed);

    loop {
      self.identities[id as usize].next.store(head, Ordering::Release);
      match head_ref.compare_exchange(head, id, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
          self.published.fetch_add(1, Ordering::Relaxed);
          return Ok(InsertOutcome::Inserted(id));
        }
        Err(actual) => {
          // Only the part of the chain published since the last look is new.
          if let Some(existing) = self.scan(source, key, tag, actual, head) {
            self.release(id);
            return Ok(InsertOutcome::Existing(existing));
          }
          head = actual;
        }
      }
    }
  }

  fn reserve(&self) -> Result<IdentityId> {
    let mut top = self.spare.load(Ordering::Acquire);
    loop {
      let id = top as u32;
      if id == NIL {
        break;
      }
      let next = self.next(id) as u64;
      let tagged = ((top >> TAG_SHIFT) + 1) << TAG_SHIFT | next;
      match self.spare.compare_exchange_weak(top, tagged, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => return Ok(id),
        Err(actual) => top = actual,
      }
    }

    let id = self.reserved.fetch_add(1, Ordering::AcqRel);
    if id >= self.identities.len() {
      return Err(Error::IndexFull {
        shard: self.shard,
        capacity: self.identities.len(),
      });
    }
    Ok(id as IdentityId)
  }

  /// Returns an identity that was reserved but never published.
  fn release(&self, id: IdentityId) {
    let mut top = self.spare.load(Ordering::Acquire);
    loop {
      self.identities[id as usize].next.store(top as u32, Ordering::Release);
      let tagged = ((top >> TAG_SHIFT) + 1) << TAG_SHIFT | id as u64;
      match self.spare.compare_exchange_weak(top, tagged, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => return,
        Err(actual) => top = actual,
      }
    }
  }

  /// Swings the identity's offset from `expected` to `offset`.
  ///
  /// On failure returns the offset that is actually current, so the caller
  /// can rebuild its record against it and retry.
  pub fn update(&self, id: IdentityId, expected: u64, offset: u64) -> std::result::Result<(), u64> {
    self.identities[id as usize]
      .offset
      .compare_exchange(expected, offset, Ordering::AcqRel, Ordering::Acquire)
      .map(|_| ())
  }

  pub fn offset(&self, id: IdentityId) -> u64 {
    self.identities[id as usize].offset.load(Ordering::Acquire)
  }

  /// Number of keys present in the index.
  pub fn unique_keys(&self) -> usize {
    self.published.load(Ordering::Relaxed)
  }

  pub fn capacity(&self) -> usize {
    self.identities.len()
  }

  /// Rebuilds the index from the shard's bytes.
  ///
  /// Every intact record is replayed as an insert, or as an update if it is
  /// newer than the version already indexed. Anything else is skipped one
  /// byte at a time. A run of zeros longer than `blank_limit` ends the scan.
  ///
  /// After an intact record the scan moves on to the next slot boundary, not
  /// past the record's capacity: a split remainder inside a stale record's
  /// slot may hold a newer record of its own.
  pub fn reconstruct(&self, bytes: &[u8], blank_limit: u64) -> Result<RecoveryReport> {
    let len = bytes.len() as u64;
    let mut report = RecoveryReport::default();
    let mut zero_run_start: Option<u64> = None;
    let mut offset = 0u64;

    while offset < len {
      let byte = bytes[offset as usize];
      if byte == 0 {
        let start = *zero_run_start.get_or_insert(offset);
        if offset > start + blank_limit {
          break;
        }
        offset += 1;
        continue;
      }
      zero_run_start = None;

      if byte == RECORD_MARKER {
        if let Some(header) = check_intact(&bytes[offset as usize..]) {
          self.replay(bytes, offset, &header)?;
          report.records += 1;

          let end = (offset + header.capacity as u64).min(len);
          report.frontier = report.frontier.max(end);
          offset += SLOT_ALIGN as u64;
          continue;
        }
      }
      offset += 1;
    }

    report.keys = self.unique_keys();
    Ok(report)
  }

  fn replay(&self, bytes: &[u8], offset: u64, header: &RecordHeader) -> Result<()> {
    let key = bytes.key_at(offset);
    match self.find(bytes, &key) {
      None => {
        self.insert(bytes, &key, offset)?;
      }
      Some(id) => {
        let current = bytes.header_at(self.offset(id));
        if is_newer(header.timestamp, current.timestamp) {
          self.identities[id as usize].offset.store(offset, Ordering::Release);
        }
      }
    }
    Ok(())
  }
}
