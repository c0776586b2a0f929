//! Key-based routing to determine shard assignment.
//!
//! Keys are expected to be uniformly distributed already, so the shard is
//! taken straight from the low bits of the first key byte.

use crate::record::Key;

/// Routes keys to shard IDs.
#[derive(Debug, Clone, Copy)]
pub struct Router {
  mask: usize,
}

impl Router {
  /// Creates a new router with the specified shard count.
  ///
  /// # Panics
  ///
  /// Panics if `shard_count` is not a power of two in `1..=256`.
  pub fn new(shard_count: usize) -> Self {
    assert!(
      shard_count.is_power_of_two() && shard_count <= 256,
      "shard_count must be a power of two no larger than 256, got {}",
      shard_count
    );
    Self { mask: shard_count - 1 }
  }

  /// Routes a key to its assigned shard ID in `0..shard_count`.
  #[inline]
  pub fn route(&self, key: &Key) -> usize {
    key[0] as usize & self.mask
  }

  /// Returns the total number of shards.
  pub fn shard_count(&self) -> usize {
    self.mask + 1
  }
}
