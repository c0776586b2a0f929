//! One partition of the keyspace: a hash index and an allocator over a
//! private window of the data file.
//!
//! # Write path
//!
//! ```text
//! set(key, value)
//!   -> allocate slot
//!   -> encode record into scratch, copy into slot, persist
//!   -> new key:  publish identity (insert)
//!      existing: CAS identity offset, retry against the winner on conflict
//!   -> retire superseded slot
//! ```
//!
//! A record is always durable before its offset becomes visible, so the
//! region scan at startup only ever sees fully persisted versions as current.

pub mod allocator;
pub mod epoch;
pub mod index;
pub mod router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::config::KvOptions;
use crate::error::{Error, Result};
use crate::record::{
  encode_record, next_timestamp, record_size, Key, HEADER_SIZE, KEY_SIZE, MAX_RECORD_SIZE, MAX_VALUE_LEN,
  MIN_VALUE_LEN,
};
use crate::region::ShardRegion;
use crate::stats::ShardStats;

use self::allocator::{AllocMode, PmemAllocator, Slot};
use self::index::{HashIndex, IdentityId, InsertOutcome, RecordSource};

/// Instants at which a shard entered each write phase.
#[derive(Debug, Default)]
struct PhaseMarks {
  first_write: OnceLock<Instant>,
  shrink: OnceLock<Instant>,
  hybrid: OnceLock<Instant>,
}

fn between(from: &OnceLock<Instant>, to: &OnceLock<Instant>) -> Option<Duration> {
  Some(to.get()?.saturating_duration_since(*from.get()?))
}

pub struct Shard {
  id: usize,
  region: ShardRegion,
  index: HashIndex,
  allocator: PmemAllocator,
  sets: AtomicU64,
  phases: PhaseMarks,
  shrink_checkpoint: u64,
  hybrid_checkpoint: u64,
  stats_interval: u64,
}

impl Shard {
  /// Builds the shard over `region` and rebuilds its index from whatever the
  /// region already holds.
  pub fn open(id: usize, mut region: ShardRegion, opts: &KvOptions) -> Result<Self> {
    let started = Instant::now();

    let index = HashIndex::new(id, opts.unique_keys_per_shard, opts.buckets_per_shard);
    let report = region.with_bytes(|bytes| index.reconstruct(bytes, opts.recovery_blank_limit))?;

    let allocator = PmemAllocator::new(id, region.len(), opts.unique_keys_per_shard);
    allocator.set_frontier(report.frontier);

    tracing::info!(
      target: "ironkv::recovery",
      shard = id,
      records = report.records,
      keys = report.keys,
      frontier = report.frontier,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "shard recovered"
    );

    Ok(Self {
      id,
      region,
      index,
      allocator,
      sets: AtomicU64::new(0),
      phases: PhaseMarks::default(),
      shrink_checkpoint: opts.shrink_checkpoint,
      hybrid_checkpoint: opts.hybrid_checkpoint,
      stats_interval: opts.stats_interval,
    })
  }

  pub fn id(&self) -> usize {
    self.id
  }

  /// Copies the current value of `key` into `out`. Returns false if the key
  /// is absent, leaving `out` untouched.
  pub fn get_into(&self, key: &Key, out: &mut Vec<u8>) -> bool {
    let _guard = self.allocator.pin();

    let Some(id) = self.index.find(&self.region, key) else {
      return false;
    };
    let offset = self.index.offset(id);
    let header = self.region.header_at(offset);

    out.resize(header.value_len as usize, 0);
    self.region.read_into(offset + (HEADER_SIZE + KEY_SIZE) as u64, out);
    true
  }

  /// Stores `value` as the new current version of `key`.
  ///
  /// # Errors
  ///
  /// - `InvalidValueLength` if `value` is outside `[80, 1024]` bytes.
  /// - `RegionFull` if no free slot fits and the frontier reached the end.
  /// - `IndexFull` if `key` is new and the identity arena is exhausted.
  /// - `Io` if the record could not be flushed.
  pub fn set(&self, key: &Key, value: &[u8]) -> Result<()> {
    if !(MIN_VALUE_LEN..=MAX_VALUE_LEN).contains(&value.len()) {
      return Err(Error::InvalidValueLength(value.len()));
    }

    let _guard = self.allocator.pin();
    let count = self.sets.fetch_add(1, Ordering::Relaxed) + 1;
    self.adjust_strategy(count);

    let slot = self.allocator.allocate(record_size(value.len()))?;
    let mut scratch = [0u8; MAX_RECORD_SIZE as usize];

    let id = match self.index.find(&self.region, key) {
      Some(id) => id,
      None => match self.insert(key, value, slot, &mut scratch) {
        Ok(InsertOutcome::Inserted(_)) => {
          self.report(count);
          return Ok(());
        }
        // Lost the race for the first insert. Our slot becomes the update.
        Ok(InsertOutcome::Existing(id)) => id,
        Err(e) => {
          self.discard(slot);
          return Err(e);
        }
      },
    };

    if let Err(e) = self.replace(id, key, value, slot, &mut scratch) {
      self.discard(slot);
      return Err(e);
    }
    self.report(count);
    Ok(())
  }

  fn insert(&self, key: &Key, value: &[u8], slot: Slot, scratch: &mut [u8]) -> Result<InsertOutcome> {
    self.write_record(slot, key, value, 0, scratch)?;
    self.index.insert(&self.region, key, slot.offset)
  }

  /// Publishes `slot` as the current version of identity `id` and retires
  /// the version it displaced.
  fn replace(&self, id: IdentityId, key: &Key, value: &[u8], slot: Slot, scratch: &mut [u8]) -> Result<()> {
    let mut current = self.index.offset(id);
    loop {
      let previous = self.region.header_at(current);
      self.write_record(slot, key, value, next_timestamp(previous.timestamp), scratch)?;

      match self.index.update(id, current, slot.offset) {
        Ok(()) => {
          self.allocator.retire(current, previous.capacity);
          return Ok(());
        }
        Err(winner) => current = winner,
      }
    }
  }

  fn write_record(&self, slot: Slot, key: &Key, value: &[u8], timestamp: u16, scratch: &mut [u8]) -> Result<()> {
    let len = encode_record(scratch, key, value, slot.capacity, timestamp);
    self.region.write(slot.offset, &scratch[..len]);
    self.region.persist(slot.offset, len as u64)
  }

  /// Gives back a slot that was never published. The header is wiped first
  /// so a restart cannot resurrect the record.
  fn discard(&self, slot: Slot) {
    self.region.write(slot.offset, &[0u8; HEADER_SIZE]);
    if let Err(e) = self.region.persist(slot.offset, HEADER_SIZE as u64) {
      tracing::warn!(
        target: "ironkv::shard",
        shard = self.id,
        offset = slot.offset,
        error = %e,
        "failed to wipe unpublished record, slot left unreclaimed"
      );
      return;
    }
    self.allocator.deallocate(slot.offset, slot.capacity);
  }

  /// Moves the allocator between phases as the write count crosses the
  /// configured checkpoints. Affects reclamation only, never correctness.
  fn adjust_strategy(&self, count: u64) {
    if count == 1 {
      let _ = self.phases.first_write.set(Instant::now());
    }
    if count == self.shrink_checkpoint {
      let _ = self.phases.shrink.set(Instant::now());
      self.allocator.set_mode(AllocMode::Shrink);
    }
    if count == self.hybrid_checkpoint {
      let _ = self.phases.hybrid.set(Instant::now());
      let append = between(&self.phases.first_write, &self.phases.shrink);
      let shrink = between(&self.phases.shrink, &self.phases.hybrid);
      tracing::info!(
        target: "ironkv::shard",
        shard = self.id,
        append_ms = append.map(|d| d.as_millis() as u64),
        shrink_ms = shrink.map(|d| d.as_millis() as u64),
        "hybrid phase reached"
      );
    }
  }

  fn report(&self, count: u64) {
    if self.stats_interval == 0 || count % self.stats_interval != 0 {
      return;
    }
    let stats = self.stats();
    tracing::debug!(
      target: "ironkv::shard",
      shard = self.id,
      sets = stats.sets,
      unique_keys = stats.unique_keys,
      frontier = stats.frontier,
      free_slots = stats.free_slots,
      pending_reclaim = stats.pending_reclaim,
      leaked_slots = stats.leaked_slots,
      "shard stats"
    );
  }

  /// Makes every slot retired so far reusable, unless a reader is still
  /// pinned.
  pub fn reclaim(&self) {
    self.allocator.reclaim();
  }

  pub fn stats(&self) -> ShardStats {
    ShardStats {
      shard: self.id,
      sets: self.sets.load(Ordering::Relaxed),
      unique_keys: self.index.unique_keys(),
      frontier: self.allocator.frontier(),
      capacity: self.allocator.region_len(),
      free_slots: self.allocator.free_slots(),
      pending_reclaim: self.allocator.pending_reclaim(),
      free_pool_available: self.allocator.free_pool_available(),
      leaked_slots: self.allocator.leaked_slots(),
      mode: self.allocator.mode(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SyncMode;
  use crate::region::PmemFile;
  use std::path::Path;
  use std::sync::Arc;
  use tempfile::TempDir;

  const REGION: u64 = 256 * 1024;

  fn opts() -> KvOptions {
    let mut opts = KvOptions::new("unused");
    opts.file_size = REGION;
    opts.shard_count = 1;
    opts.unique_keys_per_shard = 64;
    opts.buckets_per_shard = 16;
    opts.shrink_checkpoint = u64::MAX;
    opts.hybrid_checkpoint = u64::MAX;
    opts.stats_interval = 0;
    opts
  }

  fn open(path: &Path, opts: &KvOptions) -> Shard {
    let file = Arc::new(PmemFile::create_or_open(path, REGION, 1).unwrap());
    let region = ShardRegion::new(file, 0, REGION, SyncMode::OnClose);
    Shard::open(0, region, opts).unwrap()
  }

  fn key(n: u8) -> Key {
    [n; KEY_SIZE]
  }

  fn get(shard: &Shard, key: &Key) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    shard.get_into(key, &mut out).then_some(out)
  }

  fn offset_of(shard: &Shard, key: &Key) -> u64 {
    let id = shard.index.find(&shard.region, key).unwrap();
    shard.index.offset(id)
  }

  #[test]
  fn test_set_then_get() {
    let dir = TempDir::new().unwrap();
    let shard = open(&dir.path().join("s.db"), &opts());

    assert_eq!(get(&shard, &key(1)), None);
    shard.set(&key(1), &[7u8; 100]).unwrap();
    assert_eq!(get(&shard, &key(1)), Some(vec![7u8; 100]));
    assert_eq!(get(&shard, &key(2)), None);
  }

  #[test]
  fn test_update_replaces_value_and_bumps_timestamp() {
    let dir = TempDir::new().unwrap();
    let shard = open(&dir.path().join("s.db"), &opts());

    shard.set(&key(1), &[1u8; 80]).unwrap();
    shard.set(&key(1), &[2u8; 500]).unwrap();
    shard.set(&key(1), &[3u8; 1024]).unwrap();

    assert_eq!(get(&shard, &key(1)), Some(vec![3u8; 1024]));
    let header = shard.region.header_at(offset_of(&shard, &key(1)));
    assert_eq!(header.timestamp, 2);
    assert_eq!(shard.stats().unique_keys, 1);
    assert_eq!(shard.stats().sets, 3);
  }

  #[test]
  fn test_rejects_value_length_out_of_range() {
    let dir = TempDir::new().unwrap();
    let shard = open(&dir.path().join("s.db"), &opts());

    assert!(matches!(shard.set(&key(1), &[0u8; 79]), Err(Error::InvalidValueLength(79))));
    assert!(matches!(
      shard.set(&key(1), &[0u8; 1025]),
      Err(Error::InvalidValueLength(1025))
    ));
    assert_eq!(shard.stats().sets, 0);
    assert_eq!(shard.stats().frontier, 0);
  }

  #[test]
  fn test_shrink_mode_reuses_superseded_slot() {
    let dir = TempDir::new().unwrap();
    let mut opts = opts();
    opts.shrink_checkpoint = 1;
    let shard = open(&dir.path().join("s.db"), &opts);

    shard.set(&key(1), &[1u8; 100]).unwrap();
    assert_eq!(shard.stats().mode, AllocMode::Shrink);
    assert_eq!(offset_of(&shard, &key(1)), 0);

    // Nothing free yet: the update appends and retires slot 0.
    shard.set(&key(1), &[2u8; 100]).unwrap();
    assert_eq!(offset_of(&shard, &key(1)), 128);

    shard.reclaim();
    assert_eq!(shard.stats().free_slots, 1);

    shard.set(&key(1), &[3u8; 100]).unwrap();
    assert_eq!(offset_of(&shard, &key(1)), 0);
    assert_eq!(shard.stats().frontier, 256);
    assert_eq!(get(&shard, &key(1)), Some(vec![3u8; 100]));
  }

  #[test]
  fn test_append_mode_never_reuses() {
    let dir = TempDir::new().unwrap();
    let shard = open(&dir.path().join("s.db"), &opts());

    for round in 0..4u8 {
      shard.set(&key(1), &[round; 100]).unwrap();
      shard.reclaim();
    }
    assert_eq!(shard.stats().mode, AllocMode::Append);
    assert_eq!(shard.stats().frontier, 4 * 128);
  }

  #[test]
  fn test_index_full_is_reported_and_not_resurrected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s.db");
    let mut opts = opts();
    opts.unique_keys_per_shard = 2;

    {
      let shard = open(&path, &opts);
      shard.set(&key(1), &[1u8; 100]).unwrap();
      shard.set(&key(2), &[2u8; 100]).unwrap();
      let err = shard.set(&key(3), &[3u8; 100]).unwrap_err();
      assert!(matches!(err, Error::IndexFull { shard: 0, capacity: 2 }));

      // Existing keys still accept updates.
      shard.set(&key(1), &[4u8; 100]).unwrap();
    }

    let shard = open(&path, &opts);
    assert_eq!(shard.stats().unique_keys, 2);
    assert_eq!(get(&shard, &key(1)), Some(vec![4u8; 100]));
    assert_eq!(get(&shard, &key(3)), None);
  }

  #[test]
  fn test_region_full() {
    let dir = TempDir::new().unwrap();
    let shard = open(&dir.path().join("s.db"), &opts());

    // Append mode: every update takes a fresh maximum-size slot.
    for _ in 0..REGION / 1088 {
      shard.set(&key(1), &[1u8; 1024]).unwrap();
    }
    let err = shard.set(&key(1), &[1u8; 1024]).unwrap_err();
    assert!(matches!(err, Error::RegionFull { shard: 0, .. }));
  }

  #[test]
  fn test_reopen_recovers_latest_versions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s.db");

    {
      let shard = open(&path, &opts());
      for n in 0..10u8 {
        shard.set(&key(n), &[n; 90]).unwrap();
      }
      for n in 0..5u8 {
        shard.set(&key(n), &[n + 100; 200]).unwrap();
      }
    }

    let shard = open(&path, &opts());
    let stats = shard.stats();
    assert_eq!(stats.unique_keys, 10);
    assert_eq!(stats.sets, 0);
    assert_eq!(stats.frontier, 10 * 128 + 5 * 256);

    for n in 0..5u8 {
      assert_eq!(get(&shard, &key(n)), Some(vec![n + 100; 200]));
    }
    for n in 5..10u8 {
      assert_eq!(get(&shard, &key(n)), Some(vec![n; 90]));
    }
  }

  #[test]
  fn test_phase_marks_follow_checkpoints() {
    let dir = TempDir::new().unwrap();
    let mut opts = opts();
    opts.shrink_checkpoint = 2;
    opts.hybrid_checkpoint = 3;
    let shard = open(&dir.path().join("s.db"), &opts);

    shard.set(&key(1), &[1u8; 100]).unwrap();
    assert!(shard.phases.first_write.get().is_some());
    assert!(shard.phases.shrink.get().is_none());
    assert_eq!(shard.stats().mode, AllocMode::Append);

    shard.set(&key(1), &[1u8; 100]).unwrap();
    assert!(shard.phases.shrink.get().is_some());
    assert_eq!(shard.stats().mode, AllocMode::Shrink);

    shard.set(&key(1), &[1u8; 100]).unwrap();
    assert!(between(&shard.phases.shrink, &shard.phases.hybrid).is_some());
  }
}
