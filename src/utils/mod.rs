//! Utility modules for devices, downloads, and memory.

mod device;
mod download;
mod memory;

pub use device::{detect_accelerators, device_for, parse_dtype, AcceleratorInfo, Backend};
pub use download::{RepoInfo, Sibling, Snapshot, SnapshotDownloader};
pub use memory::{clean_memory, format_bytes, parse_size};

#[cfg(test)]
pub(crate) use download::test_support;
