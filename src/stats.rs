//! Point-in-time counters for shards and the whole engine.

use crate::shard::allocator::AllocMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
  pub shard: usize,
  /// `set` calls since the shard was opened.
  pub sets: u64,
  pub unique_keys: usize,
  /// Next append offset.
  pub frontier: u64,
  /// Size of the shard region in bytes.
  pub capacity: u64,
  /// Slots ready for reuse.
  pub free_slots: u64,
  /// Superseded slots waiting for readers to leave.
  pub pending_reclaim: u64,
  pub free_pool_available: u64,
  pub leaked_slots: u64,
  pub mode: AllocMode,
}

impl ShardStats {
  /// Fraction of the region below the frontier.
  pub fn utilization(&self) -> f64 {
    if self.capacity == 0 {
      return 0.0;
    }
    self.frontier.min(self.capacity) as f64 / self.capacity as f64
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
  pub shards: Vec<ShardStats>,
}

impl EngineStats {
  pub fn unique_keys(&self) -> usize {
    self.shards.iter().map(|s| s.unique_keys).sum()
  }

  pub fn sets(&self) -> u64 {
    self.shards.iter().map(|s| s.sets).sum()
  }

  pub fn free_slots(&self) -> u64 {
    self.shards.iter().map(|s| s.free_slots).sum()
  }

  pub fn leaked_slots(&self) -> u64 {
    self.shards.iter().map(|s| s.leaked_slots).sum()
  }
}
