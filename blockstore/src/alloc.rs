use crate::{BlockNumber, BITMAP_SIZE_BYTES, BLOCK_STORE_NUM_BLOCKS};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Debug, PartialEq)]
pub struct Bitmap {
    /// One bit per block on the device. Bit `n` lives in byte `n / 8` at bit
    /// position `n % 8`, least significant bit first, so the exported bytes are
    /// independent of host endianness.
    bitmap: [u8; BITMAP_SIZE_BYTES],
}

impl Bitmap {
    /// Creates a bitmap tracking `BLOCK_STORE_NUM_BLOCKS` blocks, all free.
    pub fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_SIZE_BYTES],
        }
    }

    /// Imports a bitmap from its exported representation. Returns `None` unless
    /// `buf` is exactly `BITMAP_SIZE_BYTES` long.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        LayoutVerified::<&[u8], Bitmap>::new(buf).map(|map| *map)
    }

    /// Exports the packed bits.
    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn get(&self, blocknr: BlockNumber) -> State {
        assert!(blocknr < BLOCK_STORE_NUM_BLOCKS);
        let byte = self.bitmap[blocknr / 8];

        let inner_offset = blocknr % 8;
        match (byte >> inner_offset) & 0b1 {
            0 => State::Free,
            1 => State::Used,
            _ => unreachable!("Block state returned a non 0 or 1 value. This likely indicates an error with bitmasking"),
        }
    }

    pub fn test(&self, blocknr: BlockNumber) -> bool {
        self.get(blocknr) == State::Used
    }

    pub fn set_reserved(&mut self, blocknr: BlockNumber) {
        assert!(blocknr < BLOCK_STORE_NUM_BLOCKS);
        self.bitmap[blocknr / 8] |= 0b1 << (blocknr % 8);
    }

    pub fn set_free(&mut self, blocknr: BlockNumber) {
        assert!(blocknr < BLOCK_STORE_NUM_BLOCKS);
        self.bitmap[blocknr / 8] &= !(0b1 << (blocknr % 8));
    }

    /// Returns the lowest free block below `cap`, if any.
    pub fn first_free(&self, cap: usize) -> Option<BlockNumber> {
        let cap = cap.min(BLOCK_STORE_NUM_BLOCKS);
        for (i, &byte) in self.bitmap.iter().enumerate() {
            // Skip saturated bytes without inspecting each bit.
            if byte == u8::MAX {
                continue;
            }
            let blocknr = i * 8 + (!byte).trailing_zeros() as usize;
            return if blocknr < cap { Some(blocknr) } else { None };
        }
        None
    }

    /// Counts every used block, reserved ones included.
    pub fn count_set(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(0);
        bmp.set_reserved(BLOCK_STORE_NUM_BLOCKS - 1);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(BLOCK_STORE_NUM_BLOCKS - 1), State::Used);
        assert_eq!(bmp.count_set(), 2);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(9);
        bmp.set_reserved(10);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbouring bits in the same byte survive.
        assert_eq!(bmp.get(9), State::Used);
    }

    #[test]
    fn first_free_skips_used_blocks() {
        let mut bmp = Bitmap::new();
        assert_eq!(bmp.first_free(BLOCK_STORE_NUM_BLOCKS), Some(0));

        bmp.set_reserved(0);
        bmp.set_reserved(2);
        assert_eq!(bmp.first_free(BLOCK_STORE_NUM_BLOCKS), Some(1));

        for i in 0..16 {
            bmp.set_reserved(i);
        }
        assert_eq!(bmp.first_free(BLOCK_STORE_NUM_BLOCKS), Some(16));
    }

    #[test]
    fn first_free_respects_cap() {
        let mut bmp = Bitmap::new();
        for i in 0..4 {
            bmp.set_reserved(i);
        }
        assert_eq!(bmp.first_free(4), None);
        assert_eq!(bmp.first_free(5), Some(4));
    }

    #[test]
    fn export_uses_lsb_first_bit_order() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(0);
        bmp.set_reserved(9);

        let bytes = bmp.serialize();
        assert_eq!(bytes.len(), BITMAP_SIZE_BYTES);
        assert_eq!(bytes[0], 0b0000_0001);
        assert_eq!(bytes[1], 0b0000_0010);
    }

    #[test]
    fn can_serialize_and_deserialize_state() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(10);
        bmp.set_reserved(11);
        bmp.set_reserved(12);

        let read_bmp = Bitmap::parse(bmp.serialize()).unwrap();
        assert_eq!(read_bmp, bmp);
    }

    #[test]
    fn parsing_buffer_with_invalid_size_fails() {
        assert!(Bitmap::parse(&[0; BITMAP_SIZE_BYTES - 1]).is_none());
        assert!(Bitmap::parse(&[0; BITMAP_SIZE_BYTES + 1]).is_none());
    }
}
