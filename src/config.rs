use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::record::MAX_CAPACITY;

const DEFAULT_THREADS: u64 = 16;
const DEFAULT_SHARDS: usize = 64;
const DEFAULT_TOTAL_KEYS: u64 = DEFAULT_THREADS * 24 * (1 << 20);
const DEFAULT_KEYS_PER_SHARD: u64 = DEFAULT_TOTAL_KEYS / DEFAULT_SHARDS as u64;

/// Defines how a freshly written record is pushed to the persistent medium
/// before its offset is published in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  /// Synchronously flush the record's byte range after every write.
  /// A `set` that returned has reached the medium.
  Strict,

  /// Schedule write-back of the record's byte range but do not wait for it.
  Async,

  /// No per-record flush. The whole mapping is flushed on `flush()` and
  /// when the engine is dropped. Fastest; a power failure loses recent writes.
  OnClose,
}

#[derive(Debug, Clone)]
pub struct KvOptions {
  /// Location of the data file. Parent directories are created on open.
  pub path: PathBuf,

  /// Total size of the mapped file in bytes.
  /// Default: 64 GiB.
  pub file_size: u64,

  /// Number of equal shard regions. Must be a power of two no larger than 256,
  /// since a key is routed by the low bits of its first byte.
  /// Default: 64.
  pub shard_count: usize,

  // --- Per-shard sizing ---
  /// Identity arena capacity (maximum distinct keys per shard). Also sizes
  /// the allocator's free pool.
  ///
  /// Writers racing to insert the same new key each hold an identity until
  /// the race settles, so leave headroom of one per concurrent writer.
  pub unique_keys_per_shard: usize,

  /// Number of hash bucket heads per shard.
  pub buckets_per_shard: usize,

  // --- Write phases ---
  /// Per-shard write count at which the allocator switches from append-only
  /// to reusing freed slots.
  pub shrink_checkpoint: u64,

  /// Per-shard write count marking the start of the read/write hybrid phase.
  /// Only affects logging.
  pub hybrid_checkpoint: u64,

  /// Every N-th write per shard logs shard statistics at `debug`.
  /// 0 disables the periodic report.
  pub stats_interval: u64,

  // --- Recovery / bootstrap ---
  /// Length of a run of zero bytes that ends the recovery scan of a shard.
  /// Default: 4 KiB.
  pub recovery_blank_limit: u64,

  /// Worker threads used to zero a newly created data file.
  pub zero_fill_threads: usize,

  pub sync_mode: SyncMode,
}

impl Default for KvOptions {
  fn default() -> Self {
    Self {
      path: PathBuf::from("./kv_data/pmem.db"),
      file_size: 64 * (1 << 30), // 64 GiB
      shard_count: DEFAULT_SHARDS,
      unique_keys_per_shard: (DEFAULT_KEYS_PER_SHARD as f64 * 0.6) as usize,
      buckets_per_shard: DEFAULT_KEYS_PER_SHARD as usize,
      shrink_checkpoint: 220_200_960 / DEFAULT_SHARDS as u64,
      hybrid_checkpoint: DEFAULT_KEYS_PER_SHARD,
      stats_interval: 1 << 20,
      recovery_blank_limit: 4 * 1024,
      zero_fill_threads: DEFAULT_THREADS as usize,
      sync_mode: SyncMode::Strict,
    }
  }
}

impl KvOptions {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      ..Default::default()
    }
  }

  /// Size of a single shard region in bytes.
  pub fn shard_size(&self) -> u64 {
    self.file_size / self.shard_count as u64
  }

  pub fn validate(&self) -> Result<()> {
    if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
      return Err(Error::Config(format!(
        "shard_count must be a power of two, got {}",
        self.shard_count
      )));
    }
    if self.shard_count > 256 {
      return Err(Error::Config(format!(
        "shard_count must not exceed 256, got {}",
        self.shard_count
      )));
    }
    if self.file_size % self.shard_count as u64 != 0 {
      return Err(Error::Config(format!(
        "file_size {} is not divisible by shard_count {}",
        self.file_size, self.shard_count
      )));
    }
    if self.shard_size() < MAX_CAPACITY as u64 {
      return Err(Error::Config(format!(
        "shard region of {} bytes cannot hold a single record",
        self.shard_size()
      )));
    }
    // Shard-relative offsets are kept within 32 bits.
    if self.shard_size() > u32::MAX as u64 {
      return Err(Error::Config(format!(
        "shard region of {} bytes exceeds the 4 GiB addressable limit",
        self.shard_size()
      )));
    }
    if self.unique_keys_per_shard == 0 || self.unique_keys_per_shard >= u32::MAX as usize {
      return Err(Error::Config("unique_keys_per_shard must be in 1..u32::MAX".into()));
    }
    if self.buckets_per_shard == 0 {
      return Err(Error::Config("buckets_per_shard must be greater than zero".into()));
    }
    if self.zero_fill_threads == 0 {
      return Err(Error::Config("zero_fill_threads must be greater than zero".into()));
    }
    Ok(())
  }
}
