//! Model configuration read from a snapshot's config.json.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported model architectures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelArchitecture {
    Llama,
    Mistral,
    Mixtral,
    Qwen2,
    Qwen3,
    Gemma,
    Gemma2,
    Phi3,
    Unknown(String),
}

impl ModelArchitecture {
    /// Detect architecture from config.json architectures field
    pub fn from_architectures(architectures: &[String]) -> Self {
        let Some(arch) = architectures.first() else {
            return ModelArchitecture::Unknown("empty".to_string());
        };

        if arch.contains("Qwen3") {
            ModelArchitecture::Qwen3
        } else if arch.contains("Qwen2") {
            ModelArchitecture::Qwen2
        } else if arch.contains("Gemma2") {
            ModelArchitecture::Gemma2
        } else if arch.contains("Gemma") {
            ModelArchitecture::Gemma
        } else if arch.contains("Phi3") {
            ModelArchitecture::Phi3
        } else if arch.contains("Mixtral") {
            ModelArchitecture::Mixtral
        } else if arch.contains("Mistral") {
            ModelArchitecture::Mistral
        } else if arch.contains("Llama") {
            ModelArchitecture::Llama
        } else {
            ModelArchitecture::Unknown(arch.clone())
        }
    }

    /// Class name of one transformer block, the unit a device map must keep whole.
    pub fn decoder_layer_class(&self) -> String {
        match self {
            ModelArchitecture::Llama => "LlamaDecoderLayer".to_string(),
            ModelArchitecture::Mistral => "MistralDecoderLayer".to_string(),
            ModelArchitecture::Mixtral => "MixtralDecoderLayer".to_string(),
            ModelArchitecture::Qwen2 => "Qwen2DecoderLayer".to_string(),
            ModelArchitecture::Qwen3 => "Qwen3DecoderLayer".to_string(),
            ModelArchitecture::Gemma => "GemmaDecoderLayer".to_string(),
            ModelArchitecture::Gemma2 => "Gemma2DecoderLayer".to_string(),
            ModelArchitecture::Phi3 => "Phi3DecoderLayer".to_string(),
            ModelArchitecture::Unknown(arch) => {
                let stem = arch
                    .strip_suffix("ForCausalLM")
                    .or_else(|| arch.strip_suffix("LMHeadModel"))
                    .unwrap_or(arch);
                format!("{}DecoderLayer", stem)
            }
        }
    }
}

/// Subset of config.json needed to index and place a causal LM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model architecture type(s)
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Model type tag ("llama", "qwen2", ...)
    #[serde(default)]
    pub model_type: Option<String>,

    /// Hidden size (embedding dimension)
    pub hidden_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Torch dtype hint
    #[serde(default)]
    pub torch_dtype: Option<String>,

    /// Tie word embeddings
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Custom code entry points shipped with the repository
    #[serde(default)]
    pub auto_map: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ModelConfig {
    /// Load configuration from a config.json file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Get the detected model architecture
    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::from_architectures(&self.architectures)
    }

    /// Class name of the model root, e.g. `LlamaForCausalLM`
    pub fn root_class(&self) -> String {
        self.architectures
            .first()
            .cloned()
            .unwrap_or_else(|| "PreTrainedModel".to_string())
    }

    pub fn decoder_layer_class(&self) -> String {
        self.architecture().decoder_layer_class()
    }

    /// Whether the repository expects custom modeling code to run
    pub fn has_custom_code(&self) -> bool {
        self.auto_map.as_ref().is_some_and(|map| !map.is_empty())
    }
}
