use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O Error: {0}")]
  Io(#[from] io::Error),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Value length {0} is outside the supported range [80, 1024]")]
  InvalidValueLength(usize),

  #[error("Identity arena of shard {shard} is full (capacity {capacity})")]
  IndexFull { shard: usize, capacity: usize },

  #[error("Region of shard {shard} is exhausted: requested {requested} bytes at frontier {frontier} (capacity {capacity})")]
  RegionFull {
    shard: usize,
    requested: u64,
    frontier: u64,
    capacity: u64,
  },

  #[error("Data file size mismatch: expected {expected} bytes, found {actual}")]
  FileSizeMismatch { expected: u64, actual: u64 },
}
