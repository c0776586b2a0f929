//! Binary record format stored inline in a shard region.
//!
//! ```text
//! [Header: 6 bytes, little-endian bit-packed]
//!   bits  0..8   marker            (always RECORD_MARKER)
//!   bits  8..18  value length - 80
//!   bits 18..29  slot capacity - 1 (capacity is a multiple of 64)
//!   bits 29..38  digest
//!   bits 38..48  timestamp         (per-key update counter, wraps at 1024)
//! [Key: 16 bytes]
//! [Value: 80..=1024 bytes]
//! ```
//!
//! A record occupies its whole slot capacity in the region; the bytes between
//! the end of the value and the end of the slot are padding.

use byteorder::{ByteOrder, LittleEndian};

use crate::util::align_up;

pub const KEY_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 6;

pub const MIN_VALUE_LEN: usize = 80;
pub const MAX_VALUE_LEN: usize = 1024;

pub const RECORD_MARKER: u8 = 1;

/// Slot capacities are multiples of this.
pub const SLOT_ALIGN: u32 = 64;

pub const MIN_RECORD_SIZE: u32 = record_size(MIN_VALUE_LEN);
pub const MAX_RECORD_SIZE: u32 = record_size(MAX_VALUE_LEN);
pub const MAX_CAPACITY: u32 = align_up(MAX_RECORD_SIZE, SLOT_ALIGN);

const VALUE_LEN_BITS: u32 = 10;
const CAP_BITS: u32 = 11;
const DIGEST_BITS: u32 = 9;
const TIMESTAMP_BITS: u32 = 10;

const VALUE_LEN_SHIFT: u32 = 8;
const CAP_SHIFT: u32 = VALUE_LEN_SHIFT + VALUE_LEN_BITS;
const DIGEST_SHIFT: u32 = CAP_SHIFT + CAP_BITS;
const TIMESTAMP_SHIFT: u32 = DIGEST_SHIFT + DIGEST_BITS;

const _: () = assert!(TIMESTAMP_SHIFT + TIMESTAMP_BITS == (HEADER_SIZE as u32) * 8);

const fn mask(bits: u32) -> u64 {
  (1u64 << bits) - 1
}

pub type Key = [u8; KEY_SIZE];

/// Logical size of a record holding `value_len` value bytes.
pub const fn record_size(value_len: usize) -> u32 {
  (HEADER_SIZE + KEY_SIZE + value_len) as u32
}

/// Returns the timestamp following `ts`, wrapping within the field width.
#[inline]
pub fn next_timestamp(ts: u16) -> u16 {
  ((ts as u64 + 1) & mask(TIMESTAMP_BITS)) as u16
}

/// Decoded record header.
///
/// `value_len` and `capacity` hold the true values; the encoding stores them
/// as offsets (`- 80` and `- 1`) so they fit their bit widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
  pub marker: u8,
  pub value_len: u32,
  pub capacity: u32,
  pub digest: u16,
  pub timestamp: u16,
}

impl RecordHeader {
  pub fn encode(&self) -> [u8; HEADER_SIZE] {
    let value_code = (self.value_len as u64).wrapping_sub(MIN_VALUE_LEN as u64) & mask(VALUE_LEN_BITS);
    let cap_code = (self.capacity as u64).wrapping_sub(1) & mask(CAP_BITS);

    let word = self.marker as u64
      | value_code << VALUE_LEN_SHIFT
      | cap_code << CAP_SHIFT
      | (self.digest as u64 & mask(DIGEST_BITS)) << DIGEST_SHIFT
      | (self.timestamp as u64 & mask(TIMESTAMP_BITS)) << TIMESTAMP_SHIFT;

    let mut out = [0u8; HEADER_SIZE];
    LittleEndian::write_u48(&mut out, word);
    out
  }

  /// Decodes the first `HEADER_SIZE` bytes of `bytes`.
  ///
  /// # Panics
  ///
  /// Panics if `bytes` is shorter than `HEADER_SIZE`.
  pub fn decode(bytes: &[u8]) -> Self {
    let word = LittleEndian::read_u48(&bytes[..HEADER_SIZE]);
    Self {
      marker: (word & mask(8)) as u8,
      value_len: ((word >> VALUE_LEN_SHIFT) & mask(VALUE_LEN_BITS)) as u32 + MIN_VALUE_LEN as u32,
      capacity: ((word >> CAP_SHIFT) & mask(CAP_BITS)) as u32 + 1,
      digest: ((word >> DIGEST_SHIFT) & mask(DIGEST_BITS)) as u16,
      timestamp: ((word >> TIMESTAMP_SHIFT) & mask(TIMESTAMP_BITS)) as u16,
    }
  }

  pub fn record_size(&self) -> u32 {
    record_size(self.value_len as usize)
  }
}

/// Serializes a complete record into `buf` and returns its logical size.
///
/// # Panics
///
/// Panics if `buf` is too small or `value` is outside `[80, 1024]` bytes.
pub fn encode_record(buf: &mut [u8], key: &Key, value: &[u8], capacity: u32, timestamp: u16) -> usize {
  assert!(
    (MIN_VALUE_LEN..=MAX_VALUE_LEN).contains(&value.len()),
    "value length {} out of range",
    value.len()
  );
  let size = record_size(value.len()) as usize;
  debug_assert!(size as u32 <= capacity);

  let header = RecordHeader {
    marker: RECORD_MARKER,
    value_len: value.len() as u32,
    capacity,
    digest: digest(key, value, capacity, timestamp),
    timestamp,
  };

  buf[..HEADER_SIZE].copy_from_slice(&header.encode());
  buf[HEADER_SIZE..HEADER_SIZE + KEY_SIZE].copy_from_slice(key);
  buf[HEADER_SIZE + KEY_SIZE..size].copy_from_slice(value);
  size
}

/// Validates the record starting at `bytes[0]`. `bytes` extends to the end of
/// the region, so a record running past the region is rejected.
///
/// Returns the header if the marker, length bounds, size-vs-capacity and
/// digest all check out.
pub fn check_intact(bytes: &[u8]) -> Option<RecordHeader> {
  if bytes.len() < HEADER_SIZE || bytes[0] != RECORD_MARKER {
    return None;
  }
  let header = RecordHeader::decode(bytes);

  if !(MIN_VALUE_LEN as u32..=MAX_VALUE_LEN as u32).contains(&header.value_len) {
    return None;
  }
  let size = header.record_size();
  if size > header.capacity || size as usize > bytes.len() {
    return None;
  }

  let key: &Key = bytes[HEADER_SIZE..HEADER_SIZE + KEY_SIZE].try_into().ok()?;
  let value = &bytes[HEADER_SIZE + KEY_SIZE..size as usize];
  if digest(key, value, header.capacity, header.timestamp) != header.digest {
    return None;
  }
  Some(header)
}

/// Fast fold of the first 8 key bytes, the last 8 value bytes, the encoded
/// lengths and the timestamp, truncated to the digest width.
#[cfg(not(feature = "strict-digest"))]
pub fn digest(key: &Key, value: &[u8], capacity: u32, timestamp: u16) -> u16 {
  let len = value.len();
  let code = LittleEndian::read_u64(&key[..8])
    .wrapping_add(LittleEndian::read_u64(&value[len - 8..]))
    .wrapping_add((len as u64) >> 3)
    .wrapping_add((capacity as u64) >> 3)
    .wrapping_add(timestamp as u64);
  (code & mask(DIGEST_BITS)) as u16
}

/// Table-driven fold over the leading half of the value in 16-bit words.
#[cfg(feature = "strict-digest")]
pub fn digest(key: &Key, value: &[u8], _capacity: u32, timestamp: u16) -> u16 {
  let word = |bytes: &[u8], i: usize| LittleEndian::read_u16(&bytes[2 * i..2 * i + 2]);

  let mut code = word(key, 0)
    .wrapping_add(word(key, 2).wrapping_mul(3))
    .wrapping_add(word(key, 1).wrapping_mul(5))
    .wrapping_add(word(key, 3).wrapping_mul(7));

  let words = (value.len().min(MAX_VALUE_LEN) / 4).min(256);
  for i in (0..words).step_by(4) {
    code = code.wrapping_add(word(value, i) ^ STRICT_TABLE[i]);
  }
  code = code.wrapping_add(timestamp).wrapping_add(9);
  code & mask(DIGEST_BITS) as u16
}

#[cfg(feature = "strict-digest")]
#[rustfmt::skip]
static STRICT_TABLE: [u16; 256] = [
  58165, 24872, 20215, 53706, 1132,  24634, 48229, 65249, 39820, 10409,
  27591, 17994, 27430, 58691, 64967, 55141, 36450, 61067, 59359, 18763,
  53580, 50980, 32370, 13571, 64234, 56080, 22434, 8247,  48041, 44685,
  38463, 18533, 26818, 21865, 59516, 24323, 22244, 9449,  55171, 47736,
  11955, 57941, 60054, 55184, 19465, 7117,  30039, 15525, 62244, 19,
  32875, 54745, 4709,  42085, 61426, 24236, 8404,  25581, 42755, 16888,
  8428,  58339, 22072, 61108, 17030, 7024,  16904, 25338, 46617, 37793,
  11114, 22349, 37962, 41773, 33855, 34883, 52508, 19882, 10602, 1909,
  45033, 48919, 48315, 12205, 6550,  58810, 59528, 20902, 51116, 41850,
  51390, 15890, 52384, 5553,  32094, 30069, 35892, 62464, 62274, 11622,
  53021, 5085,  49322, 60607, 30523, 56064, 11558, 254,   54143, 13793,
  11253, 4080,  50069, 22243, 13840, 22256, 27809, 26901, 8423,  27096,
  50816, 64970, 8089,  43023, 32872, 16654, 50556, 46584, 36399, 9455,
  2681,  55553, 63272, 42957, 46527, 32233, 15229, 33571, 2566,  63447,
  24658, 1533,  29233, 3169,  29082, 45811, 32029, 11814, 25874, 13903,
  23299, 7814,  8180,  37555, 5598,  4289,  38910, 29994, 44796, 58808,
  5041,  51026, 6973,  8283,  52608, 34470, 47282, 53835, 3115,  41741,
  65092, 33596, 25608, 34755, 56297, 56397, 59025, 45044, 46934, 23353,
  30867, 9598,  12448, 42933, 17309, 21636, 14642, 7922,  40701, 14021,
  60918, 61073, 15984, 4084,  46424, 38174, 27788, 29473, 14530, 34816,
  45465, 15245, 17467, 26772, 49316, 52081, 9777,  63387, 63919, 53352,
  51073, 960,   53768, 29130, 21202, 57465, 33729, 22530, 53681, 13434,
  7966,  13672, 42108, 10243, 17572, 59644, 57778, 63777, 45970, 54015,
  33650, 3896,  33540, 13287, 61516, 19354, 40449, 46739, 40029, 17301,
  41840, 36206, 62468, 46758, 12264, 52353, 10870, 63841, 30228, 28478,
  18603, 61683, 53799, 58213, 62959, 3665,
];

#[cfg(test)]
mod tests {
  use super::*;

  fn key(n: u32) -> Key {
    let mut k = [0u8; KEY_SIZE];
    k[..4].copy_from_slice(&n.to_le_bytes());
    k
  }

  fn build(value: &[u8], ts: u16) -> Vec<u8> {
    let cap = align_up(record_size(value.len()), SLOT_ALIGN);
    let mut buf = vec![0u8; cap as usize];
    encode_record(&mut buf, &key(7), value, cap, ts);
    buf
  }

  #[test]
  fn test_size_constants() {
    assert_eq!(MIN_RECORD_SIZE, 102);
    assert_eq!(MAX_RECORD_SIZE, 1046);
    assert_eq!(MAX_CAPACITY, 1088);
    // capacity - 1 must fit in the 11-bit field
    assert!(MAX_CAPACITY - 1 < (1 << CAP_BITS));
  }

  #[test]
  fn test_header_fields_survive_full_range() {
    for value_len in MIN_VALUE_LEN as u32..MIN_VALUE_LEN as u32 + (1 << VALUE_LEN_BITS) {
      let h = RecordHeader {
        marker: RECORD_MARKER,
        value_len,
        capacity: 64,
        digest: 0,
        timestamp: 0,
      };
      assert_eq!(RecordHeader::decode(&h.encode()), h);
    }
    for capacity in 1..=(1u32 << CAP_BITS) {
      let h = RecordHeader {
        marker: RECORD_MARKER,
        value_len: 80,
        capacity,
        digest: 0x1FF,
        timestamp: 0x3FF,
      };
      assert_eq!(RecordHeader::decode(&h.encode()), h);
    }
    for digest in 0..(1u16 << DIGEST_BITS) {
      for timestamp in [0u16, 1, 511, 1023] {
        let h = RecordHeader {
          marker: 0xAB,
          value_len: 1024,
          capacity: 1088,
          digest,
          timestamp,
        };
        assert_eq!(RecordHeader::decode(&h.encode()), h);
      }
    }
  }

  #[test]
  fn test_header_bit_layout() {
    let h = RecordHeader {
      marker: RECORD_MARKER,
      value_len: 81,   // code 1
      capacity: 2,     // code 1
      digest: 1,
      timestamp: 1,
    };
    let word = LittleEndian::read_u48(&h.encode());
    assert_eq!(word, 1 | 1 << 8 | 1 << 18 | 1 << 29 | 1 << 38);
  }

  #[test]
  fn test_encoded_record_is_intact() {
    let value = vec![b'x'; 100];
    let buf = build(&value, 3);

    let header = check_intact(&buf).expect("record should be intact");
    assert_eq!(header.value_len, 100);
    assert_eq!(header.capacity, 128);
    assert_eq!(header.timestamp, 3);
    assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + KEY_SIZE], &key(7));
    assert_eq!(&buf[HEADER_SIZE + KEY_SIZE..HEADER_SIZE + KEY_SIZE + 100], &value[..]);
  }

  #[test]
  fn test_zeroed_bytes_are_not_intact() {
    assert!(check_intact(&[0u8; 256]).is_none());
  }

  #[test]
  fn test_wrong_marker_is_rejected() {
    let mut buf = build(&[1u8; 80], 0);
    buf[0] = 2;
    assert!(check_intact(&buf).is_none());
  }

  #[test]
  fn test_truncated_region_is_rejected() {
    let buf = build(&[1u8; 200], 0);
    let size = record_size(200) as usize;
    assert!(check_intact(&buf[..size]).is_some());
    assert!(check_intact(&buf[..size - 1]).is_none());
  }

  #[test]
  fn test_size_exceeding_capacity_is_rejected() {
    let value = vec![5u8; 300];
    let mut buf = build(&value, 0);
    // A consistent digest over a capacity too small for the record.
    let header = RecordHeader {
      marker: RECORD_MARKER,
      value_len: 300,
      capacity: 64,
      digest: digest(&key(7), &value, 64, 0),
      timestamp: 0,
    };
    buf[..HEADER_SIZE].copy_from_slice(&header.encode());
    assert!(check_intact(&buf).is_none());
  }

  #[cfg(not(feature = "strict-digest"))]
  #[test]
  fn test_digest_detects_value_tail_change() {
    let mut buf = build(&[9u8; 120], 0);
    let last = HEADER_SIZE + KEY_SIZE + 119;
    buf[last] ^= 0x01;
    assert!(check_intact(&buf).is_none());
  }

  #[test]
  fn test_digest_detects_key_change() {
    let mut buf = build(&[9u8; 120], 0);
    buf[HEADER_SIZE] ^= 0x01;
    assert!(check_intact(&buf).is_none());
  }

  #[test]
  fn test_digest_detects_timestamp_change() {
    let mut buf = build(&[9u8; 120], 4);
    let mut header = RecordHeader::decode(&buf);
    header.timestamp = 5;
    buf[..HEADER_SIZE].copy_from_slice(&header.encode());
    assert!(check_intact(&buf).is_none());
  }

  #[cfg(feature = "strict-digest")]
  #[test]
  fn test_strict_digest_detects_value_head_change() {
    let mut buf = build(&[9u8; 120], 0);
    buf[HEADER_SIZE + KEY_SIZE] ^= 0x01;
    assert!(check_intact(&buf).is_none());
  }

  #[test]
  fn test_timestamp_wraps() {
    assert_eq!(next_timestamp(0), 1);
    assert_eq!(next_timestamp(1022), 1023);
    assert_eq!(next_timestamp(1023), 0);
  }

  #[test]
  #[should_panic(expected = "out of range")]
  fn test_rejects_short_value() {
    let mut buf = vec![0u8; 128];
    encode_record(&mut buf, &key(0), &[0u8; 79], 128, 0);
  }
}
