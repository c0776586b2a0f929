//! Memory-mapped persistent region and per-shard accessors.
//!
//! `PmemFile` owns the single fixed-size mapping. Each shard receives a
//! `ShardRegion`: a bounds-checked window over its own contiguous sub-range.
//! All offsets handed to a `ShardRegion` are relative to the shard start.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use rayon::prelude::*;

use crate::config::SyncMode;
use crate::error::{Error, Result};

/// A fixed-size data file mapped read-write into memory.
pub struct PmemFile {
  mmap: MmapMut,
  base: *mut u8,
  len: u64,
  created: bool,
  is_pmem: bool,
  _file: File,
}

// SAFETY: `base` points into `mmap`, which lives as long as `self`. Shards
// write through it only within their own disjoint sub-ranges.
unsafe impl Send for PmemFile {}
unsafe impl Sync for PmemFile {}

impl PmemFile {
  /// Creates the file at `path` with `size` bytes, or opens it if it already
  /// exists with exactly that size.
  ///
  /// A newly created file is zero-filled by `zero_fill_threads` workers and
  /// flushed before any caller sees it.
  pub fn create_or_open(path: &Path, size: u64, zero_fill_threads: usize) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
      }
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)?;

    let actual = file.metadata()?.len();
    let created = actual == 0;
    if !created && actual != size {
      return Err(Error::FileSizeMismatch {
        expected: size,
        actual,
      });
    }
    if created {
      file.set_len(size)?;
    }

    let len = usize::try_from(size)
      .map_err(|_| Error::Config(format!("file size {} exceeds the address space", size)))?;

    // SAFETY: the file is opened read-write and sized to `len`. Concurrent
    // modification by other processes is outside the supported model.
    let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

    if created {
      zero_fill(&mut mmap, zero_fill_threads)?;
      mmap.flush()?;
    }

    let base = mmap.as_mut_ptr();
    let is_pmem = detect_dax(path);

    tracing::info!(
      target: "ironkv::region",
      path = %path.display(),
      size,
      created,
      is_pmem,
      "data file mapped"
    );

    Ok(Self {
      mmap,
      base,
      len: size,
      created,
      is_pmem,
      _file: file,
    })
  }

  pub fn len(&self) -> u64 {
    self.len
  }

  /// True if this open created (and zeroed) the file.
  pub fn created(&self) -> bool {
    self.created
  }

  /// True if the file lives on a DAX mount, i.e. stores reach persistent
  /// memory without going through the page cache.
  pub fn is_pmem(&self) -> bool {
    self.is_pmem
  }

  /// Synchronously flushes the whole mapping.
  pub fn flush(&self) -> Result<()> {
    self.mmap.flush()?;
    Ok(())
  }

  /// Synchronously flushes `[offset, offset + len)` of the mapping.
  pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
    self.mmap.flush_range(offset as usize, len as usize)?;
    Ok(())
  }

  /// Schedules write-back of `[offset, offset + len)` without waiting.
  pub fn flush_async_range(&self, offset: u64, len: u64) -> Result<()> {
    self.mmap.flush_async_range(offset as usize, len as usize)?;
    Ok(())
  }
}

fn zero_fill(mmap: &mut MmapMut, threads: usize) -> Result<()> {
  if mmap.is_empty() {
    return Ok(());
  }
  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(threads)
    .thread_name(|i| format!("ironkv-zero-{}", i))
    .build()
    .map_err(|e| Error::Io(io::Error::other(e)))?;

  let bytes: &mut [u8] = &mut mmap[..];
  let chunk = bytes.len().div_ceil(threads).max(1);
  pool.install(|| bytes.par_chunks_mut(chunk).for_each(|part| part.fill(0)));
  Ok(())
}

/// Looks up the mount holding `path` in `/proc/mounts` and reports whether it
/// carries the `dax` option.
fn detect_dax(path: &Path) -> bool {
  let Ok(path) = path.canonicalize() else {
    return false;
  };
  let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
    return false;
  };

  mounts
    .lines()
    .filter_map(|line| {
      let mut fields = line.split_whitespace();
      let _device = fields.next()?;
      let mount_point = fields.next()?;
      let _fs_type = fields.next()?;
      let options = fields.next()?;
      Some((mount_point, options))
    })
    .filter(|(mount_point, _)| path.starts_with(mount_point))
    .max_by_key(|(mount_point, _)| mount_point.len())
    .map(|(_, options)| options.split(',').any(|opt| opt == "dax" || opt.starts_with("dax=")))
    .unwrap_or(false)
}

/// A shard's window over the shared mapping.
///
/// Not `Clone`: exactly one shard owns each window, which is what makes
/// `with_bytes` sound.
pub struct ShardRegion {
  file: Arc<PmemFile>,
  start: u64,
  len: u64,
  sync_mode: SyncMode,
}

impl ShardRegion {
  /// # Panics
  ///
  /// Panics if `[start, start + len)` is not inside the file.
  pub fn new(file: Arc<PmemFile>, start: u64, len: u64, sync_mode: SyncMode) -> Self {
    assert!(
      start.checked_add(len).is_some_and(|end| end <= file.len()),
      "shard window {}..{} exceeds file of {} bytes",
      start,
      start + len,
      file.len()
    );
    Self {
      file,
      start,
      len,
      sync_mode,
    }
  }

  pub fn len(&self) -> u64 {
    self.len
  }

  #[inline]
  fn ptr(&self, offset: u64, len: usize) -> *mut u8 {
    assert!(
      offset.checked_add(len as u64).is_some_and(|end| end <= self.len),
      "access {}+{} outside shard region of {} bytes",
      offset,
      len,
      self.len
    );
    // SAFETY: bounds checked above; the window lies inside the mapping.
    unsafe { self.file.base.add((self.start + offset) as usize) }
  }

  /// Copies `buf.len()` bytes starting at `offset` into `buf`.
  pub fn read_into(&self, offset: u64, buf: &mut [u8]) {
    let src = self.ptr(offset, buf.len());
    // SAFETY: `src..src+len` is inside the mapping and cannot overlap `buf`.
    unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
  }

  /// Copies `bytes` into the region at `offset`.
  ///
  /// Callers only write into slots the allocator handed to them, so no two
  /// writers ever target overlapping ranges.
  pub fn write(&self, offset: u64, bytes: &[u8]) {
    let dst = self.ptr(offset, bytes.len());
    // SAFETY: `dst..dst+len` is inside the mapping and cannot overlap `bytes`.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) }
  }

  /// Pushes `[offset, offset + len)` towards the medium according to the
  /// configured `SyncMode`.
  pub fn persist(&self, offset: u64, len: u64) -> Result<()> {
    self.ptr(offset, len as usize);
    match self.sync_mode {
      SyncMode::Strict => self.file.flush_range(self.start + offset, len),
      SyncMode::Async => self.file.flush_async_range(self.start + offset, len),
      SyncMode::OnClose => Ok(()),
    }
  }

  /// Runs `f` over the whole window as a plain slice. Requires exclusive
  /// access to the window, so no writer can be active on it.
  pub fn with_bytes<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> R {
    let ptr = self.ptr(0, self.len as usize);
    // SAFETY: `&mut self` guarantees no concurrent writes through this window,
    // and windows of different shards never overlap.
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, self.len as usize) };
    f(bytes)
  }
}
