//! Epoch gate deferring reuse of superseded slots.
//!
//! Readers pin the current epoch for the duration of an operation. A slot
//! retired during epoch `r` may still be referenced by readers pinned at any
//! epoch `<= r`. The global epoch only advances from `e` to `e + 1` once no
//! reader is pinned in `e - 1`, so by the time the epoch reaches `r + 2` every
//! reader that could have seen the slot has left, and it can be handed out
//! again.
//!
//! Pin counts live in three slots indexed by `epoch % 3`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const EPOCH_SLOTS: usize = 3;

#[derive(Debug, Default)]
pub struct EpochGate {
  epoch: AtomicU64,
  pinned: [AtomicUsize; EPOCH_SLOTS],
}

/// Keeps an epoch pinned until dropped.
#[must_use]
pub struct EpochGuard<'a> {
  gate: &'a EpochGate,
  slot: usize,
  epoch: u64,
}

impl EpochGuard<'_> {
  pub fn epoch(&self) -> u64 {
    self.epoch
  }
}

impl Drop for EpochGuard<'_> {
  fn drop(&mut self) {
    self.gate.pinned[self.slot].fetch_sub(1, Ordering::SeqCst);
  }
}

#[inline]
pub fn slot_of(epoch: u64) -> usize {
  (epoch % EPOCH_SLOTS as u64) as usize
}

impl EpochGate {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn current(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  /// Pins the current epoch.
  ///
  /// The pin is registered first and then validated against the epoch; if an
  /// advance slipped in between, the pin is withdrawn and retried.
  pub fn pin(&self) -> EpochGuard<'_> {
    loop {
      let epoch = self.epoch.load(Ordering::SeqCst);
      let slot = slot_of(epoch);
      self.pinned[slot].fetch_add(1, Ordering::SeqCst);
      if self.epoch.load(Ordering::SeqCst) == epoch {
        return EpochGuard {
          gate: self,
          slot,
          epoch,
        };
      }
      self.pinned[slot].fetch_sub(1, Ordering::SeqCst);
      std::hint::spin_loop();
    }
  }

  /// Attempts to advance the epoch by one.
  ///
  /// Returns the epoch whose retirements became reusable (`new - 2`). Returns
  /// `None` if nothing became reusable: a reader is still pinned one epoch
  /// back, another thread won the race, or the gate just left epoch 0.
  pub fn try_advance(&self) -> Option<u64> {
    let epoch = self.epoch.load(Ordering::SeqCst);
    let previous = slot_of(epoch + EPOCH_SLOTS as u64 - 1);
    if self.pinned[previous].load(Ordering::SeqCst) != 0 {
      return None;
    }
    self
      .epoch
      .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .and_then(|_| epoch.checked_sub(1))
  }

  /// Number of readers currently pinned, across all epochs.
  pub fn pinned(&self) -> usize {
    self.pinned.iter().map(|p| p.load(Ordering::SeqCst)).sum()
  }
}
