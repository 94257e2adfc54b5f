//! A fixed capacity block storage device: `BLOCK_STORE_NUM_BLOCKS` blocks of
//! `BLOCK_SIZE_BYTES` each, handed out by a free block bitmap and persisted as
//! a flat image of exactly `BLOCK_STORE_NUM_BYTES` bytes.
//!
//! # Layout
//! ======================================================
//! | Block 0 | Block 1 | ... | Block 254 | Bitmap (255) |
//! ======================================================
//!
//! The last block is reserved for the exported bitmap and can never be
//! allocated, read or written through the store.
mod alloc;
pub mod io;
mod store;

pub use crate::store::{BlockStore, BlockStoreError, Result};

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Bytes per block.
pub const BLOCK_SIZE_BYTES: usize = 256;
/// Every block on the device, the reserved bitmap block included.
pub const BLOCK_STORE_NUM_BLOCKS: usize = 256;
/// Holds the exported bitmap in the persisted image.
pub const BITMAP_BLOCK: BlockNumber = BLOCK_STORE_NUM_BLOCKS - 1;
/// Blocks available to callers.
pub const BLOCK_STORE_AVAIL_BLOCKS: usize = BLOCK_STORE_NUM_BLOCKS - 1;
/// Size of the exported bitmap, one bit per block.
pub const BITMAP_SIZE_BYTES: usize = BLOCK_STORE_NUM_BLOCKS / 8;
/// Size of a persisted image.
pub const BLOCK_STORE_NUM_BYTES: usize = BLOCK_STORE_NUM_BLOCKS * BLOCK_SIZE_BYTES;

const _: () = assert!(BITMAP_SIZE_BYTES <= BLOCK_SIZE_BYTES);
const _: () = assert!(BLOCK_STORE_NUM_BLOCKS % 8 == 0);
