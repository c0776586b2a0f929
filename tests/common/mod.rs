#![allow(dead_code)]

use ironkv::{Engine, Key, KvOptions, SyncMode, KEY_SIZE};
use std::path::PathBuf;
use tempfile::TempDir;

pub const SHARD_SIZE: u64 = 2 * 1024 * 1024;

pub struct TestEnv {
  pub engine: Engine,
  // The TempDir guard must be kept alive to prevent premature deletion of the directory.
  pub _dir: TempDir,
  pub opts: KvOptions,
}

impl TestEnv {
  pub fn new(mut options: KvOptions) -> Self {
    let dir = tempfile::tempdir().unwrap();
    options.path = dir.path().join("pmem.db");
    let engine = Engine::open(options.clone()).unwrap();
    Self {
      engine,
      _dir: dir,
      opts: options,
    }
  }

  pub fn with_default() -> Self {
    Self::new(small_options())
  }

  pub fn path(&self) -> PathBuf {
    self.opts.path.clone()
  }

  /// Closes the engine and opens it again over the same file.
  pub fn reopen(self) -> Self {
    let TestEnv { engine, _dir, opts } = self;
    drop(engine);
    let engine = Engine::open(opts.clone()).expect("Failed to reopen engine");
    Self { engine, _dir, opts }
  }
}

/// A small layout that keeps test files in the megabyte range.
pub fn small_options() -> KvOptions {
  let mut opts = KvOptions::default();
  opts.shard_count = 4;
  opts.file_size = 4 * SHARD_SIZE;
  opts.unique_keys_per_shard = 4096;
  opts.buckets_per_shard = 1024;
  opts.shrink_checkpoint = u64::MAX;
  opts.hybrid_checkpoint = u64::MAX;
  opts.stats_interval = 0;
  opts.zero_fill_threads = 2;
  opts.sync_mode = SyncMode::OnClose;
  opts
}

/// Key `n`. The first byte is the low byte of `n`, so consecutive keys
/// spread round-robin over the shards.
pub fn key(n: u64) -> Key {
  let mut k = [0u8; KEY_SIZE];
  k[..8].copy_from_slice(&n.to_le_bytes());
  k[8..].copy_from_slice(&n.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_le_bytes());
  k
}

/// Deterministic value of `len` bytes derived from `seed`.
pub fn value(seed: u64, len: usize) -> Vec<u8> {
  (0..len)
    .map(|i| (seed.wrapping_mul(31).wrapping_add(i as u64 * 7) % 251) as u8 + 2)
    .collect()
}
