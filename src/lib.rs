pub mod access;
pub mod bitmap;
pub mod device;
pub mod direntry;
pub mod error;
pub mod fat;
pub mod fs;
pub mod node;
pub mod superblock;
pub mod times;
pub mod upcase;

#[cfg(test)]
pub(crate) mod testimg;

pub use crate::device::BlockDevice;
pub use crate::error::ExfatError;
pub use crate::fs::ExFatVolume;
pub use crate::node::{Node, NodeEntry, NodeId, ROOT_ID};
pub use crate::superblock::SuperBlock;
