use std::fmt;
use std::fs::File;
use std::path::Path;

use crate::alloc::Bitmap;
use crate::io::{BlockDevice, BlockStorage};
use crate::{
    BlockNumber, BITMAP_BLOCK, BITMAP_SIZE_BYTES, BLOCK_SIZE_BYTES, BLOCK_STORE_AVAIL_BLOCKS,
    BLOCK_STORE_NUM_BLOCKS, BLOCK_STORE_NUM_BYTES,
};

use log::{debug, info, warn};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no free blocks available")]
    Exhausted,
    #[error("block {0} is already allocated")]
    AlreadyAllocated(BlockNumber),
    #[error("block image I/O failed")]
    IoFailure(#[from] std::io::Error),
    #[error("corrupt block image: {0}")]
    CorruptImage(String),
}

pub type Result<T> = std::result::Result<T, BlockStoreError>;

type Block = [u8; BLOCK_SIZE_BYTES];

/// An in-memory block device of `BLOCK_STORE_NUM_BLOCKS` blocks.
///
/// Every slot is materialized up front and allocation is tracked purely by the
/// bitmap. A slot's content is only meaningful while its bit is set: reading a
/// free block yields zeroes and a block is zero-filled each time it is claimed.
pub struct BlockStore {
    bitmap: Bitmap,
    blocks: Box<[Block]>,
}

impl BlockStore {
    /// Creates an empty store. The bitmap block is marked in use immediately so
    /// it can never be handed out.
    pub fn create() -> Self {
        let mut bitmap = Bitmap::new();
        bitmap.set_reserved(BITMAP_BLOCK);
        Self {
            bitmap,
            blocks: vec![[0; BLOCK_SIZE_BYTES]; BLOCK_STORE_NUM_BLOCKS].into_boxed_slice(),
        }
    }

    /// Releases the bitmap and every block. Nothing is flushed to disk.
    pub fn destroy(self) {
        debug!("Destroying block store with {} used blocks.", self.used_blocks());
    }

    /// Claims the lowest numbered free block and returns its number.
    pub fn allocate(&mut self) -> Result<BlockNumber> {
        let blocknr = self
            .bitmap
            .first_free(BLOCK_STORE_AVAIL_BLOCKS)
            .ok_or(BlockStoreError::Exhausted)?;
        self.claim(blocknr);
        Ok(blocknr)
    }

    /// Claims a specific block. Nothing changes unless the call succeeds.
    pub fn request(&mut self, blocknr: BlockNumber) -> Result<()> {
        check_addressable(blocknr)?;
        if self.bitmap.test(blocknr) {
            return Err(BlockStoreError::AlreadyAllocated(blocknr));
        }
        self.claim(blocknr);
        Ok(())
    }

    /// Frees a block. Releasing a free or unaddressable block does nothing.
    pub fn release(&mut self, blocknr: BlockNumber) {
        if !self.is_allocated(blocknr) {
            return;
        }
        // The stale contents stay behind until the block is claimed again.
        self.bitmap.set_free(blocknr);
        debug!("Released block {}.", blocknr);
    }

    fn claim(&mut self, blocknr: BlockNumber) {
        self.bitmap.set_reserved(blocknr);
        self.blocks[blocknr] = [0; BLOCK_SIZE_BYTES];
        debug!("Claimed block {}.", blocknr);
    }

    /// Whether `blocknr` currently holds caller data.
    pub fn is_allocated(&self, blocknr: BlockNumber) -> bool {
        check_addressable(blocknr).is_ok() && self.bitmap.test(blocknr)
    }

    /// Allocated block numbers in ascending order.
    pub fn allocated(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        (0..BLOCK_STORE_AVAIL_BLOCKS).filter(move |&blocknr| self.is_allocated(blocknr))
    }

    pub fn used_blocks(&self) -> usize {
        // The bitmap block is always marked in use.
        self.bitmap.count_set() - 1
    }

    pub fn free_blocks(&self) -> usize {
        BLOCK_STORE_AVAIL_BLOCKS - self.used_blocks()
    }

    pub fn total_blocks() -> usize {
        BLOCK_STORE_AVAIL_BLOCKS
    }

    /// Copies one block into the front of `buf` and returns the number of bytes
    /// copied. A free block reads as zeroes.
    pub fn read(&self, blocknr: BlockNumber, buf: &mut [u8]) -> Result<usize> {
        check_addressable(blocknr)?;
        if buf.len() < BLOCK_SIZE_BYTES {
            return Err(short_buffer());
        }
        let out = &mut buf[..BLOCK_SIZE_BYTES];

        if self.bitmap.test(blocknr) {
            out.copy_from_slice(&self.blocks[blocknr]);
        } else {
            out.fill(0);
        }
        Ok(BLOCK_SIZE_BYTES)
    }

    /// Copies the first block worth of `buf` into `blocknr` and returns the number
    /// of bytes copied. Writing never allocates: data written to a free block is
    /// not visible and is wiped when the block is claimed.
    pub fn write(&mut self, blocknr: BlockNumber, buf: &[u8]) -> Result<usize> {
        check_addressable(blocknr)?;
        if buf.len() < BLOCK_SIZE_BYTES {
            return Err(short_buffer());
        }

        if !self.bitmap.test(blocknr) {
            debug!("Writing to unallocated block {}.", blocknr);
        }
        self.blocks[blocknr].copy_from_slice(&buf[..BLOCK_SIZE_BYTES]);
        Ok(BLOCK_SIZE_BYTES)
    }

    /// Writes the store image onto `dev` and returns the number of bytes written.
    ///
    /// # Layout
    /// Block `BITMAP_BLOCK` holds the exported bitmap padded with zeroes, every
    /// other block holds its contents if allocated and zeroes otherwise.
    pub fn flush_to<D: BlockStorage>(&self, dev: &mut D) -> Result<usize> {
        check_device(dev)?;

        let zeroes = [0; BLOCK_SIZE_BYTES];
        let mut bitmap_block = [0; BLOCK_SIZE_BYTES];
        bitmap_block[..BITMAP_SIZE_BYTES].copy_from_slice(self.bitmap.serialize());

        for blocknr in 0..BLOCK_STORE_NUM_BLOCKS {
            let block = if blocknr == BITMAP_BLOCK {
                &bitmap_block
            } else if self.bitmap.test(blocknr) {
                &self.blocks[blocknr]
            } else {
                &zeroes
            };
            dev.write_block(blocknr, block)?;
        }
        dev.sync_disk()?;
        Ok(BLOCK_STORE_NUM_BYTES)
    }

    /// Rebuilds a store from the image on `dev`, replaying every allocation the
    /// image's bitmap records.
    pub fn load_from<D: BlockStorage>(dev: &mut D) -> Result<Self> {
        check_device(dev)?;

        let mut block_buf = [0; BLOCK_SIZE_BYTES];
        dev.read_block(BITMAP_BLOCK, &mut block_buf)?;
        let (packed, padding) = block_buf.split_at(BITMAP_SIZE_BYTES);
        if padding.iter().any(|&b| b != 0) {
            return Err(corrupt("bitmap block padding is not zeroed".to_string()));
        }
        let image_map = Bitmap::parse(packed)
            .ok_or_else(|| corrupt("bitmap block has the wrong size".to_string()))?;
        if !image_map.test(BITMAP_BLOCK) {
            return Err(corrupt("bitmap block is not marked in use".to_string()));
        }

        let mut store = BlockStore::create();
        for blocknr in (0..BLOCK_STORE_NUM_BLOCKS).filter(|&b| b != BITMAP_BLOCK) {
            if !image_map.test(blocknr) {
                continue;
            }
            // Every id but BITMAP_BLOCK is addressable with the current geometry,
            // so this only fires if the reserved range ever grows.
            store.request(blocknr).map_err(|e| {
                corrupt(format!("bitmap marks block {} in use: {}", blocknr, e))
            })?;
            dev.read_block(blocknr, &mut block_buf)?;
            store.write(blocknr, &block_buf)?;
        }
        debug_assert_eq!(store.bitmap, image_map);
        Ok(store)
    }

    /// Atomically replaces the file at `path` with the store image and returns
    /// the number of bytes written. The image is staged in a temporary file next
    /// to `path`, so a failure before the rename leaves any previous file
    /// untouched. The containing directory is synced once the rename is done.
    pub fn serialize<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        check_path(path)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let staged = NamedTempFile::new_in(dir)?;
        let mut dev = BlockDevice::open(staged.reopen()?, BLOCK_STORE_NUM_BLOCKS);
        let written = self.flush_to(&mut dev)?;
        drop(dev);

        staged.persist(path).map_err(|e| e.error)?;
        // Make the rename itself durable. An error here means the new image is
        // already in place but may not survive a crash.
        sync_dir(dir)?;
        info!("Serialized {} blocks to {}.", self.used_blocks(), path.display());
        Ok(written)
    }

    /// Reads back a store written by `serialize`.
    pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;

        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < BLOCK_STORE_NUM_BYTES as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("image is {} bytes, expected {}", len, BLOCK_STORE_NUM_BYTES),
            )
            .into());
        }
        if len > BLOCK_STORE_NUM_BYTES as u64 {
            return Err(corrupt(format!(
                "image is {} bytes, expected {}",
                len, BLOCK_STORE_NUM_BYTES
            )));
        }

        let mut dev = BlockDevice::open(file, BLOCK_STORE_NUM_BLOCKS);
        let store = BlockStore::load_from(&mut dev)?;
        info!("Deserialized {} blocks from {}.", store.used_blocks(), path.display());
        Ok(store)
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::create()
    }
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("used_blocks", &self.used_blocks())
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

/// Rejects block numbers outside the caller visible range, the bitmap block
/// included.
fn check_addressable(blocknr: BlockNumber) -> Result<()> {
    if blocknr >= BLOCK_STORE_AVAIL_BLOCKS || blocknr == BITMAP_BLOCK {
        return Err(BlockStoreError::InvalidArgument(format!(
            "block {} is outside 0..{}",
            blocknr, BLOCK_STORE_AVAIL_BLOCKS
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn check_device<D: BlockStorage>(dev: &D) -> Result<()> {
    if dev.block_count() != BLOCK_STORE_NUM_BLOCKS {
        return Err(BlockStoreError::InvalidArgument(format!(
            "device holds {} blocks, expected {}",
            dev.block_count(),
            BLOCK_STORE_NUM_BLOCKS
        )));
    }
    Ok(())
}

fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(BlockStoreError::InvalidArgument(
            "path must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn short_buffer() -> BlockStoreError {
    BlockStoreError::InvalidArgument(format!(
        "buffer must hold at least {} bytes",
        BLOCK_SIZE_BYTES
    ))
}

fn corrupt(reason: String) -> BlockStoreError {
    warn!("Rejecting block image: {}.", reason);
    BlockStoreError::CorruptImage(reason)
}
