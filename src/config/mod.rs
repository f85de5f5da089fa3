//! Configuration: run settings, memory budget, and the model's config.json.

mod budget;
mod model_config;
mod run_config;

pub use budget::{DeviceId, MaxMemory};
pub use model_config::{ModelArchitecture, ModelConfig};
pub use run_config::{
    default_local_dir, load_dotenv, AccessToken, RunConfig, VerifyPolicy, DEFAULT_ENDPOINT,
    DEFAULT_MODEL_ID, DEFAULT_REVISION, ENDPOINT_VAR, TOKEN_VAR,
};
