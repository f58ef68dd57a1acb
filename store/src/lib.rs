//! Byte-addressed block store over pooled device memory.
//!
//! [`BlockStore`] splits each request into per-block segments, binds a
//! device unit to a block on its first write, and either copies straight
//! to the device or stages through the [`TransferEngine`](transfer::TransferEngine).

pub mod config;
pub mod error;
pub mod map;
pub mod splitter;
pub mod store;
pub mod transfer;

pub use config::{BackendKind, StoreConfig, WriteMode};
pub use error::{Result, StoreError};
pub use store::{BlockSizeHint, BlockStore, StoreStats};
pub use transfer::{TransferId, TransferStats};
pub use vram_common::size::ByteSize;
pub use vram_memory_pool::UNIT_SIZE;
