use blockstore::io::BlockDeviceBuilder;
use blockstore::{BlockStore, BLOCK_SIZE_BYTES, BLOCK_STORE_NUM_BLOCKS};
use std::io::Cursor;

pub fn main() {
    let image = tempfile::NamedTempFile::new().unwrap();

    let mut store = BlockStore::create();
    let blocknr = store.allocate().expect("fresh store has free blocks");
    store
        .write(blocknr, &[0x42; BLOCK_SIZE_BYTES])
        .expect("should write");
    store.serialize(image.path()).expect("should serialize");

    // The same image can also be kept in memory.
    let mut dev = BlockDeviceBuilder::from(Cursor::new(Vec::new()))
        .with_block_count(BLOCK_STORE_NUM_BLOCKS)
        .build()
        .expect("should build memory device");
    let bytes = store.flush_to(&mut dev).expect("should flush");
    println!("in-memory image holds {} bytes", bytes);
    store.destroy();

    let store = BlockStore::deserialize(image.path()).expect("should deserialize");
    let mut buf = [0; BLOCK_SIZE_BYTES];
    store.read(blocknr, &mut buf).unwrap();
    println!(
        "block {} holds {:#04x}, {} of {} blocks free",
        blocknr,
        buf[0],
        store.free_blocks(),
        BlockStore::total_blocks()
    );
}
