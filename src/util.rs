/// Rounds `n` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_up(n: u32, align: u32) -> u32 {
  (n + align - 1) & !(align - 1)
}

/// Hashes a key into a bucket hash and a one-byte tag.
///
/// The key is read as two little-endian words `w0, w1`; the hash is
/// `w1 * 199 + w0`. The low byte becomes the tag, the rest selects the bucket.
#[inline]
pub fn key_hash(key: &[u8; 16]) -> (u64, u8) {
  let w0 = u64::from_le_bytes(key[..8].try_into().unwrap_or([0; 8]));
  let w1 = u64::from_le_bytes(key[8..].try_into().unwrap_or([0; 8]));
  let hash = w1.wrapping_mul(199).wrapping_add(w0);
  (hash >> 8, (hash & 0xFF) as u8)
}
