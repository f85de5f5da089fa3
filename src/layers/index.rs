//! Index of the tensors stored in a snapshot's safetensors shards.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;

/// Sharded checkpoints ship this file next to the shards
pub const SHARD_INDEX_FILE: &str = "model.safetensors.index.json";

/// Header information for one stored tensor
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub name: String,
    /// Index into [`WeightIndex::shard_paths`]
    pub shard: usize,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Bytes as stored on disk
    pub stored_bytes: u64,
}

impl TensorEntry {
    pub fn elem_count(&self) -> u64 {
        self.shape.iter().map(|d| *d as u64).product()
    }

    pub fn is_float(&self) -> bool {
        matches!(self.dtype, Dtype::F16 | Dtype::BF16 | Dtype::F32 | Dtype::F64)
    }

    /// Bytes the tensor occupies once floating point weights are cast to `dtype`.
    pub fn size_as(&self, dtype: candle_core::DType) -> u64 {
        if self.is_float() {
            self.elem_count() * dtype.size_in_bytes() as u64
        } else {
            self.stored_bytes
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Every tensor of a checkpoint, read from the shard headers without loading
/// tensor data.
#[derive(Debug, Clone)]
pub struct WeightIndex {
    model_dir: PathBuf,
    shard_paths: Vec<PathBuf>,
    tensors: Vec<TensorEntry>,
}

impl WeightIndex {
    /// Index the safetensors shards in `model_dir`.
    pub fn open(model_dir: impl AsRef<Path>) -> crate::Result<Self> {
        let model_dir = model_dir.as_ref();

        let shard_paths = find_safetensor_files(model_dir)?;
        if shard_paths.is_empty() {
            return Err(missing_weights_error(model_dir));
        }
        check_shard_index(model_dir)?;

        let mut tensors = Vec::new();
        let mut seen = HashSet::new();

        for (shard, path) in shard_paths.iter().enumerate() {
            let file = std::fs::File::open(path)?;
            let mmap = unsafe { memmap2::Mmap::map(&file)? };
            let st = SafeTensors::deserialize(&mmap)?;

            for (name, view) in st.tensors() {
                if !seen.insert(name.clone()) {
                    return Err(crate::FetchError::PlacementError(format!(
                        "Tensor {} appears in more than one shard",
                        name
                    )));
                }
                tensors.push(TensorEntry {
                    name,
                    shard,
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    stored_bytes: view.data().len() as u64,
                });
            }
        }

        tensors.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(
            "Indexed {} tensors across {} shards in {:?}",
            tensors.len(),
            shard_paths.len(),
            model_dir
        );

        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            shard_paths,
            tensors,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn shard_paths(&self) -> &[PathBuf] {
        &self.shard_paths
    }

    pub fn tensors(&self) -> &[TensorEntry] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tensors[i])
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.tensors.iter().map(|t| t.stored_bytes).sum()
    }
}

fn find_safetensor_files(model_dir: &Path) -> crate::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }

    // Sort for consistent ordering
    files.sort();
    Ok(files)
}

fn missing_weights_error(model_dir: &Path) -> crate::FetchError {
    let has_pytorch_weights = std::fs::read_dir(model_dir)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext == "bin" || ext == "pth")
            })
        })
        .unwrap_or(false);

    if has_pytorch_weights {
        crate::FetchError::ModelNotFound(format!(
            "{:?} only has PyTorch pickle weights; safetensors are required",
            model_dir
        ))
    } else {
        crate::FetchError::ModelNotFound(format!("No safetensor files found in {:?}", model_dir))
    }
}

/// Every shard named by the index file must be on disk.
fn check_shard_index(model_dir: &Path) -> crate::Result<()> {
    let index_path = model_dir.join(SHARD_INDEX_FILE);
    if !index_path.exists() {
        return Ok(());
    }

    let index: ShardIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
    let mut shards: Vec<&String> = index.weight_map.values().collect();
    shards.sort();
    shards.dedup();

    for shard in shards {
        if !model_dir.join(shard).is_file() {
            return Err(crate::FetchError::ModelNotFound(format!(
                "Shard {} listed in {} is missing",
                shard, SHARD_INDEX_FILE
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use safetensors::tensor::TensorView;
    use safetensors::Dtype;

    /// Write an F32 safetensors file with zero-filled tensors of the given shapes.
    pub fn write_f32_shard(path: &Path, tensors: &[(&str, Vec<usize>)]) {
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
            .iter()
            .map(|(name, shape)| {
                let numel: usize = shape.iter().product();
                (name.to_string(), shape.clone(), vec![0u8; numel * 4])
            })
            .collect();

        let views: Vec<(String, TensorView<'_>)> = buffers
            .iter()
            .map(|(name, shape, data)| {
                (
                    name.clone(),
                    TensorView::new(Dtype::F32, shape.clone(), data).unwrap(),
                )
            })
            .collect();

        let bytes = safetensors::serialize(views, &None).unwrap();
        std::fs::write(path, bytes).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_f32_shard;
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_open_single_shard() {
        let dir = tempfile::tempdir().unwrap();
        write_f32_shard(
            &dir.path().join("model.safetensors"),
            &[
                ("model.embed_tokens.weight", vec![8, 4]),
                ("model.norm.weight", vec![4]),
            ],
        );

        let index = WeightIndex::open(dir.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.stored_bytes(), (32 + 4) * 4);

        let embed = index.get("model.embed_tokens.weight").unwrap();
        assert_eq!(embed.shape, vec![8, 4]);
        assert_eq!(embed.size_as(DType::BF16), 32 * 2);
        assert!(index.get("lm_head.weight").is_none());
    }

    #[test]
    fn test_open_sharded_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_f32_shard(
            &dir.path().join("model-00001-of-00002.safetensors"),
            &[("model.layers.0.mlp.weight", vec![2, 2])],
        );
        write_f32_shard(
            &dir.path().join("model-00002-of-00002.safetensors"),
            &[("model.layers.1.mlp.weight", vec![2, 2])],
        );

        let index = WeightIndex::open(dir.path()).unwrap();
        assert_eq!(index.shard_paths().len(), 2);
        assert_eq!(index.get("model.layers.1.mlp.weight").unwrap().shard, 1);
    }

    #[test]
    fn test_missing_shard_listed_in_index() {
        let dir = tempfile::tempdir().unwrap();
        write_f32_shard(
            &dir.path().join("model-00001-of-00002.safetensors"),
            &[("a.weight", vec![1])],
        );
        std::fs::write(
            dir.path().join(SHARD_INDEX_FILE),
            r#"{"metadata": {}, "weight_map": {
                "a.weight": "model-00001-of-00002.safetensors",
                "b.weight": "model-00002-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let err = WeightIndex::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains("model-00002-of-00002.safetensors"));
    }

    #[test]
    fn test_no_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), b"pickle").unwrap();

        let err = WeightIndex::open(dir.path()).unwrap_err();
        assert!(matches!(err, crate::FetchError::ModelNotFound(_)));
        assert!(err.to_string().contains("PyTorch"));
    }

    #[test]
    fn test_truncated_shard_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_f32_shard(&path, &[("a.weight", vec![64])]);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 16]).unwrap();

        assert!(matches!(
            WeightIndex::open(dir.path()),
            Err(crate::FetchError::SafeTensorsError(_))
        ));
    }
}
