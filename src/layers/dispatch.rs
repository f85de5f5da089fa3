//! Materialise checkpoint weights on the devices chosen by a device map.

use std::collections::{BTreeMap, HashMap};

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};

use super::{DeviceMap, WeightIndex};
use crate::config::DeviceId;
use crate::utils::{device_for, format_bytes};

/// A model whose weights live on their assigned devices.
///
/// Parameters mapped to disk stay in the memory-mapped shards and are loaded
/// on demand.
pub struct DispatchedModel {
    tensors: HashMap<String, Tensor>,
    offloaded: Vec<String>,
    placement: BTreeMap<DeviceId, u64>,
    weights: MmapedSafetensors,
    dtype: DType,
}

impl DispatchedModel {
    /// Resident tensor by name
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Load an offloaded tensor onto `device`.
    pub fn load_offloaded(&self, name: &str, device: &Device) -> crate::Result<Tensor> {
        if !self.offloaded.iter().any(|n| n == name) {
            return Err(crate::FetchError::PlacementError(format!(
                "{} is not offloaded to disk",
                name
            )));
        }
        let tensor = self.weights.load(name, device)?;
        cast_float(tensor, self.dtype)
    }

    pub fn resident_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn offloaded(&self) -> &[String] {
        &self.offloaded
    }

    /// No tensor was loaded onto a compute device
    pub fn is_fully_offloaded(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Bytes placed on each device
    pub fn placement(&self) -> &BTreeMap<DeviceId, u64> {
        &self.placement
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl std::fmt::Debug for DispatchedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedModel")
            .field("resident", &self.tensors.len())
            .field("offloaded", &self.offloaded.len())
            .field("placement", &self.placement)
            .finish()
    }
}

/// Load every tensor of `index` onto the device `map` assigns it, casting
/// floating point weights to `dtype`.
pub fn dispatch(index: &WeightIndex, map: &DeviceMap, dtype: DType) -> crate::Result<DispatchedModel> {
    let weights = unsafe { MmapedSafetensors::multi(index.shard_paths())? };

    let mut devices: HashMap<DeviceId, Device> = HashMap::new();
    let mut tensors = HashMap::new();
    let mut offloaded = Vec::new();
    let mut placement: BTreeMap<DeviceId, u64> = BTreeMap::new();

    for entry in index.tensors() {
        let target = map.device_of(&entry.name).ok_or_else(|| {
            crate::FetchError::PlacementError(format!("{} is not covered by the device map", entry.name))
        })?;

        if target == DeviceId::Disk {
            *placement.entry(target).or_insert(0) += entry.size_as(dtype);
            offloaded.push(entry.name.clone());
            continue;
        }

        let device = match devices.get(&target) {
            Some(device) => device.clone(),
            None => {
                let device = device_for(target)?.ok_or_else(|| {
                    crate::FetchError::PlacementError(format!("No compute device for {}", target))
                })?;
                devices.insert(target, device.clone());
                device
            }
        };

        let tensor = cast_float(weights.load(&entry.name, &device)?, dtype)?;
        *placement.entry(target).or_insert(0) +=
            (tensor.elem_count() * tensor.dtype().size_in_bytes()) as u64;
        tensors.insert(entry.name.clone(), tensor);
    }

    for (device, bytes) in &placement {
        tracing::info!("Dispatched {} to {}", format_bytes(*bytes), device);
    }

    Ok(DispatchedModel {
        tensors,
        offloaded,
        placement,
        weights,
        dtype,
    })
}

fn cast_float(tensor: Tensor, dtype: DType) -> crate::Result<Tensor> {
    if tensor.dtype().is_float() && tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::index::test_support::write_f32_shard;

    fn tiny_index() -> (tempfile::TempDir, WeightIndex) {
        let dir = tempfile::tempdir().unwrap();
        write_f32_shard(
            &dir.path().join("model.safetensors"),
            &[
                ("model.embed_tokens.weight", vec![16, 4]),
                ("model.layers.0.mlp.weight", vec![4, 4]),
                ("lm_head.weight", vec![16, 4]),
            ],
        );
        let index = WeightIndex::open(dir.path()).unwrap();
        (dir, index)
    }

    #[test]
    fn test_dispatch_to_cpu_casts_dtype() {
        let (_dir, index) = tiny_index();
        let mut map = DeviceMap::default();
        map.insert(String::new(), DeviceId::Cpu);

        let model = dispatch(&index, &map, DType::BF16).unwrap();

        assert_eq!(model.resident_count(), 3);
        assert!(model.offloaded().is_empty());
        let embed = model.tensor("model.embed_tokens.weight").unwrap();
        assert_eq!(embed.dtype(), DType::BF16);
        assert_eq!(embed.dims(), &[16, 4]);
        assert_eq!(model.placement()[&DeviceId::Cpu], (64 + 16 + 64) * 2);
    }

    #[test]
    fn test_disk_entries_stay_offloaded() {
        let (_dir, index) = tiny_index();
        let mut map = DeviceMap::default();
        map.insert("model".to_string(), DeviceId::Cpu);
        map.insert("lm_head".to_string(), DeviceId::Disk);

        let model = dispatch(&index, &map, DType::F16).unwrap();

        assert_eq!(model.resident_count(), 2);
        assert_eq!(model.offloaded(), &["lm_head.weight".to_string()]);
        assert!(model.tensor("lm_head.weight").is_none());

        let head = model.load_offloaded("lm_head.weight", &Device::Cpu).unwrap();
        assert_eq!(head.dtype(), DType::F16);
        assert!(model.load_offloaded("model.layers.0.mlp.weight", &Device::Cpu).is_err());
    }

    #[test]
    fn test_uncovered_tensor_is_an_error() {
        let (_dir, index) = tiny_index();
        let mut map = DeviceMap::default();
        map.insert("model".to_string(), DeviceId::Cpu);

        assert!(matches!(
            dispatch(&index, &map, DType::F32),
            Err(crate::FetchError::PlacementError(_))
        ));
    }
}
