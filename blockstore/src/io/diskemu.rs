use crate::io::BlockStorage;
use crate::{BlockNumber, BLOCK_SIZE_BYTES};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, Cursor, ErrorKind, SeekFrom};

/// A seekable medium a `BlockDevice` can be laid over.
pub trait Medium: Read + Write + Seek {
    /// Makes every completed write durable.
    fn sync_all(&mut self) -> std::io::Result<()>;
}

impl Medium for File {
    fn sync_all(&mut self) -> std::io::Result<()> {
        File::sync_all(self)
    }
}

impl Medium for Cursor<Vec<u8>> {
    fn sync_all(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Emulates block disk/flash storage in userspace on top of a file (or any
/// other seekable medium), one `BLOCK_SIZE_BYTES` block after another.
pub struct BlockDevice<T> {
    /// The medium must be a fixed-size some exact multiple of the size of a block.
    fd: T,
    /// The total number of blocks available on the medium.
    block_count: usize,
}

impl<T: Medium> BlockDevice<T> {
    /// Wraps an already initialized medium without touching its contents. It
    /// is up for clients to ensure the medium holds `nblocks` blocks.
    pub fn open(fd: T, nblocks: usize) -> Self {
        BlockDevice {
            fd,
            block_count: nblocks,
        }
    }

    /// Returns ownership of the underlying medium to the caller.
    pub fn into_inner(self) -> T {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(())
    }
}

impl<T: Medium> BlockStorage for BlockDevice<T> {
    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;

        if buf.len() < BLOCK_SIZE_BYTES {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE_BYTES) as u64))?;
        // A medium shorter than its block count surfaces as UnexpectedEof.
        self.fd.read_exact(&mut buf[..BLOCK_SIZE_BYTES])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE_BYTES) as u64))?;

        let max = BLOCK_SIZE_BYTES.min(buf.len());
        self.fd.write_all(&buf[0..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.flush()?;
        self.fd.sync_all()
    }
}

/// The public way to lay a `BlockDevice` over a fresh medium, for instance an
/// in-memory `Cursor<Vec<u8>>` to hold a store image with
/// `BlockStore::flush_to` and `BlockStore::load_from`. Use `BlockDevice::open`
/// instead for a medium whose contents must be kept as they are.
pub struct BlockDeviceBuilder<T> {
    fd: T,
    block_count: usize,
    clear_medium: bool,
}

impl<T: Medium> From<T> for BlockDeviceBuilder<T> {
    fn from(fd: T) -> Self {
        BlockDeviceBuilder {
            fd,
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl<T: Medium> BlockDeviceBuilder<T> {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether `build` zeroes the medium. Defaults to true; pass false to
    /// reopen a medium that already holds data.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the medium and, unless told otherwise,
    /// does destructive things to prepare it for use. Ownership of the medium is
    /// transferred to the device meaning this builder can only be used to
    /// create one device.
    pub fn build(mut self) -> std::io::Result<BlockDevice<T>> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block device needs at least one block",
            ));
        }
        if self.clear_medium {
            self.zero_blocks()?;
        }
        Ok(BlockDevice::open(self.fd, self.block_count))
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let zeroes = [0x00; BLOCK_SIZE_BYTES];
        let mut bfd = BufWriter::new(&mut self.fd);
        // Zero out the "disk", buffering each write to prevent excessive syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()
    }
}
