//! # IronKV
//!
//! `ironkv` is a sharded key-value store that keeps its records directly in a
//! memory-mapped file, intended for byte-addressable persistent memory.
//!
//! There is no write-ahead log and no on-disk index. Each record carries a
//! small header with a digest and a per-key timestamp; on open, every shard
//! scans its region and rebuilds its in-memory hash index from the records
//! that are intact.
//!
//! ## Key Features
//!
//! * **Lock-free**: Gets and sets only use atomic loads, stores and CAS.
//! * **Sharded**: The file is split into equal regions, one per shard.
//! * **Crash Consistent**: A record is flushed before it becomes visible.
//! * **Space Reuse**: Superseded slots are recycled through size-class free
//!   lists once no reader can still observe them.
//!
//! ## Example
//!
//! ```no_run
//! use ironkv::{Engine, KvOptions};
//!
//! # fn main() -> ironkv::Result<()> {
//! let engine = Engine::open(KvOptions::new("/mnt/pmem/kv.db"))?;
//!
//! let key = [7u8; 16];
//! engine.set(&key, &[1u8; 100])?;
//!
//! let mut buf = Vec::new();
//! assert!(engine.get_into(&key, &mut buf));
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
mod record;
mod region;
pub mod shard;
mod stats;
mod util;

pub use config::{KvOptions, SyncMode};
pub use engine::Engine;
pub use error::{Error, Result};
pub use record::{Key, KEY_SIZE, MAX_VALUE_LEN, MIN_VALUE_LEN};
pub use shard::allocator::AllocMode;
pub use stats::{EngineStats, ShardStats};
