mod block;
mod diskemu;

pub use block::BlockStorage;
pub use diskemu::{BlockDevice, BlockDeviceBuilder, Medium};
