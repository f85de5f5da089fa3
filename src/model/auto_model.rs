//! Loading a downloaded snapshot: tokenizer, config, and weight placement.

use std::path::{Path, PathBuf};

use candle_core::DType;
use tokenizers::Tokenizer;

use crate::config::{MaxMemory, ModelConfig};
use crate::layers::{dispatch, infer_device_map, DeviceMap, DispatchedModel, ModuleTree, WeightIndex};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Entry point for reading a local snapshot.
pub struct AutoModel;

impl AutoModel {
    /// Read config.json and index the weights of a local snapshot without
    /// loading tensor data.
    ///
    /// # Arguments
    /// * `model_dir` - Directory holding config.json and *.safetensors
    /// * `dtype` - Floating point dtype the weights will be loaded as
    pub fn from_pretrained(model_dir: impl AsRef<Path>, dtype: DType) -> crate::Result<PretrainedModel> {
        let model_dir = model_dir.as_ref();
        ensure_model_files(model_dir)?;

        let config = ModelConfig::from_file(model_dir.join(CONFIG_FILE))?;
        tracing::info!("Detected architecture: {:?}", config.architecture());

        if config.has_custom_code() {
            tracing::warn!(
                "{:?} ships custom modeling code; only its safetensors weights are checked",
                model_dir
            );
        }

        let index = WeightIndex::open(model_dir)?;
        let tree = ModuleTree::from_index(&index, &config, dtype);

        let layer_class = config.decoder_layer_class();
        let blocks = tree.count_class(&layer_class);
        if blocks != config.num_hidden_layers {
            tracing::warn!(
                "config.json declares {} layers but {} {} blocks were found",
                config.num_hidden_layers,
                blocks,
                layer_class
            );
        }

        Ok(PretrainedModel {
            model_dir: model_dir.to_path_buf(),
            config,
            index,
            tree,
            dtype,
        })
    }
}

/// Load tokenizer.json from a snapshot directory
pub fn load_tokenizer(model_dir: impl AsRef<Path>) -> crate::Result<Tokenizer> {
    let path = model_dir.as_ref().join(TOKENIZER_FILE);
    if !path.exists() {
        return Err(crate::FetchError::TokenizerError(format!(
            "{} not found in {:?}",
            TOKENIZER_FILE,
            model_dir.as_ref()
        )));
    }

    Tokenizer::from_file(&path)
        .map_err(|e| crate::FetchError::TokenizerError(format!("Failed to load tokenizer: {}", e)))
}

/// The snapshot directory and its config.json must exist
pub fn ensure_model_files(model_dir: &Path) -> crate::Result<()> {
    if !model_dir.is_dir() {
        return Err(crate::FetchError::ModelNotFound(
            model_dir.display().to_string(),
        ));
    }
    if !model_dir.join(CONFIG_FILE).exists() {
        return Err(crate::FetchError::ModelNotFound(format!(
            "{} not found in {:?}",
            CONFIG_FILE, model_dir
        )));
    }
    Ok(())
}

/// A snapshot whose weights are indexed but not yet placed on devices.
#[derive(Debug)]
pub struct PretrainedModel {
    pub model_dir: PathBuf,
    pub config: ModelConfig,
    pub index: WeightIndex,
    pub tree: ModuleTree,
    pub dtype: DType,
}

impl PretrainedModel {
    /// Classes to keep whole: the model's decoder layer plus any requested ones.
    pub fn no_split_classes(&self, requested: &[String]) -> Vec<String> {
        let mut classes = vec![self.config.decoder_layer_class()];
        for class in requested {
            if !classes.contains(class) {
                classes.push(class.clone());
            }
        }
        classes
    }

    pub fn infer_device_map(&self, max_memory: &MaxMemory, no_split_classes: &[String]) -> DeviceMap {
        infer_device_map(&self.tree, max_memory, no_split_classes)
    }

    /// Place the weights according to `device_map`.
    pub fn dispatch(self, device_map: DeviceMap) -> crate::Result<LoadedModel> {
        let model = dispatch(&self.index, &device_map, self.dtype)?;
        Ok(LoadedModel {
            config: self.config,
            device_map,
            model,
        })
    }
}

/// A model resident on its devices
#[derive(Debug)]
pub struct LoadedModel {
    pub config: ModelConfig,
    pub device_map: DeviceMap,
    pub model: DispatchedModel,
}
