//! # model-fetch
//!
//! Downloads a pretrained causal language model from the Hugging Face Hub and
//! checks that the snapshot is usable.
//!
//! ## Flow
//!
//! - **Snapshot download**: every file of the repository lands in a local
//!   directory; files already present are skipped
//! - **Verification load**: tokenizer plus a weight index built from the
//!   safetensors headers
//! - **Device map**: modules are placed on accelerators, cpu and disk under a
//!   per-device memory budget without splitting a decoder layer
//! - **Dispatch**: weights are materialised on their devices, then released
//!
//! ## Example
//!
//! ```ignore
//! use model_fetch::{fetch, RunConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::from_env()?;
//!     let outcome = fetch::run(&config).await?;
//!     println!("{}", outcome.snapshot.local_dir.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod fetch;
pub mod layers;
pub mod model;
pub mod utils;

// Re-exports for convenience
pub use config::{DeviceId, MaxMemory, ModelConfig, RunConfig, VerifyPolicy};
pub use fetch::{Outcome, Verification};
pub use layers::{DeviceMap, ModuleTree, WeightIndex};
pub use model::{AutoModel, LoadedModel};
pub use utils::{AcceleratorInfo, Snapshot};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Placement error: {0}")]
    PlacementError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Safetensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FetchError>;
