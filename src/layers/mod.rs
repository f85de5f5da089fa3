//! Weight placement across devices.
//!
//! This module provides:
//! - `WeightIndex`: tensor headers of every safetensors shard in a snapshot
//! - `ModuleTree`: the module hierarchy rebuilt from dotted tensor names
//! - `infer_device_map`: module-to-device planning under a memory budget
//! - `dispatch`: loading each tensor onto its planned device

mod device_map;
mod dispatch;
mod index;
mod tree;

pub use device_map::{infer_device_map, DeviceMap};
pub use dispatch::{dispatch, DispatchedModel};
pub use index::{TensorEntry, WeightIndex, SHARD_INDEX_FILE};
pub use tree::{ModuleNode, ModuleTree, Param};
