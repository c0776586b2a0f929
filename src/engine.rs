//! Engine: the public entry point owning the data file and all shards.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::config::KvOptions;
use crate::error::{Error, Result};
use crate::record::{Key, MAX_VALUE_LEN, MIN_VALUE_LEN};
use crate::region::{PmemFile, ShardRegion};
use crate::shard::router::Router;
use crate::shard::Shard;
use crate::stats::EngineStats;

/// A sharded key-value store over a single memory-mapped file.
///
/// Keys are 16 bytes and are routed to a shard by their first byte. Values
/// are between 80 and 1024 bytes. Every shard owns a disjoint, equal-sized
/// window of the file; its index lives in memory and is rebuilt from that
/// window on open.
///
/// # Example
///
/// ```no_run
/// use ironkv::{Engine, KvOptions};
///
/// # fn main() -> ironkv::Result<()> {
/// let mut opts = KvOptions::new("/mnt/pmem/kv.db");
/// opts.file_size = 1 << 30;
/// let engine = Engine::open(opts)?;
///
/// let key = *b"user:0000000042\0";
/// engine.set(&key, &[0u8; 128])?;
/// assert_eq!(engine.get(&key).as_deref(), Some(&[0u8; 128][..]));
/// # Ok(())
/// # }
/// ```
pub struct Engine {
  file: Arc<PmemFile>,
  router: Router,
  shards: Vec<Shard>,
  opts: KvOptions,
}

impl Engine {
  /// Opens the store at `opts.path`, creating and zero-filling the file if it
  /// does not exist yet.
  ///
  /// # Behavior
  ///
  /// - Validates `opts`
  /// - Maps the file and splits it into `shard_count` equal regions
  /// - Recovers every shard in parallel by scanning its region
  ///
  /// # Errors
  ///
  /// Returns error if:
  /// - `opts` is invalid
  /// - The file exists with a different size
  /// - A shard holds more distinct keys than `unique_keys_per_shard`
  /// - I/O operations fail
  pub fn open(opts: KvOptions) -> Result<Self> {
    opts.validate()?;
    let started = Instant::now();

    let file = Arc::new(PmemFile::create_or_open(
      &opts.path,
      opts.file_size,
      opts.zero_fill_threads,
    )?);
    let router = Router::new(opts.shard_count);
    let shard_size = opts.shard_size();

    let shards = (0..opts.shard_count)
      .into_par_iter()
      .map(|id| {
        let region = ShardRegion::new(file.clone(), id as u64 * shard_size, shard_size, opts.sync_mode);
        Shard::open(id, region, &opts)
      })
      .collect::<Result<Vec<_>>>()?;

    let engine = Self {
      file,
      router,
      shards,
      opts,
    };

    tracing::info!(
      target: "ironkv::engine",
      path = %engine.opts.path.display(),
      size = engine.opts.file_size,
      shards = engine.opts.shard_count,
      created = engine.file.created(),
      is_pmem = engine.file.is_pmem(),
      keys = engine.stats().unique_keys(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "engine opened"
    );

    Ok(engine)
  }

  #[inline]
  fn shard(&self, key: &Key) -> &Shard {
    &self.shards[self.router.route(key)]
  }

  /// Returns a copy of the current value of `key`, if any.
  pub fn get(&self, key: &Key) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    self.get_into(key, &mut out).then_some(out)
  }

  /// Copies the current value of `key` into `out`, reusing its allocation.
  /// Returns false if the key is absent.
  pub fn get_into(&self, key: &Key, out: &mut Vec<u8>) -> bool {
    self.shard(key).get_into(key, out)
  }

  /// Stores `value` under `key`.
  ///
  /// The record is durable according to `opts.sync_mode` before it becomes
  /// visible to readers.
  ///
  /// # Errors
  ///
  /// - `InvalidValueLength` if `value` is outside `[80, 1024]` bytes
  /// - `IndexFull` / `RegionFull` if the owning shard is out of space
  /// - `Io` if flushing the record failed
  pub fn set(&self, key: &Key, value: &[u8]) -> Result<()> {
    if !(MIN_VALUE_LEN..=MAX_VALUE_LEN).contains(&value.len()) {
      return Err(Error::InvalidValueLength(value.len()));
    }
    self.shard(key).set(key, value)
  }

  /// Synchronously flushes the whole mapping.
  pub fn flush(&self) -> Result<()> {
    self.file.flush()
  }

  /// Makes superseded slots in every shard available for reuse where no
  /// reader still holds them.
  pub fn reclaim(&self) {
    self.shards.iter().for_each(Shard::reclaim);
  }

  pub fn stats(&self) -> EngineStats {
    EngineStats {
      shards: self.shards.iter().map(Shard::stats).collect(),
    }
  }

  pub fn shard_count(&self) -> usize {
    self.router.shard_count()
  }

  pub fn options(&self) -> &KvOptions {
    &self.opts
  }

  /// True if the data file lives on a DAX-mounted persistent memory device.
  pub fn is_pmem(&self) -> bool {
    self.file.is_pmem()
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Err(e) = self.file.flush() {
      tracing::warn!(
        target: "ironkv::engine",
        path = %self.opts.path.display(),
        error = %e,
        "failed to flush data file on close"
      );
    }
  }
}
