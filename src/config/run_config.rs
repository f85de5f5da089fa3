//! Settings for one download-and-verify run.

use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::DType;

use super::MaxMemory;

/// Environment variable holding the hub access token.
pub const TOKEN_VAR: &str = "HF_ACCESS_KEY";

/// Environment variable overriding the hub base URL.
pub const ENDPOINT_VAR: &str = "HF_ENDPOINT";

pub const DEFAULT_MODEL_ID: &str = "meta-llama/Llama-3.2-3B-Instruct";
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";

/// Hub access token. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(raw: Option<String>) -> crate::Result<Self> {
        match raw.map(|t| t.trim().to_string()) {
            Some(token) if !token.is_empty() => Ok(Self(token)),
            _ => Err(crate::FetchError::ConfigError(format!(
                "{} not found in environment variables. Please set it in the .env file.",
                TOKEN_VAR
            ))),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First four characters followed by a mask
    pub fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{}****", prefix)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken").field(&self.masked()).finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// What to do when the downloaded files fail to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// Report the failure and finish with a success exit status
    #[default]
    Lenient,
    /// Report the failure and exit non-zero
    Strict,
}

/// Explicit configuration built once at program entry.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub token: AccessToken,
    pub model_id: String,
    pub revision: String,
    pub endpoint: String,
    pub local_dir: PathBuf,
    pub dtype: DType,
    pub max_memory: MaxMemory,
    /// Module classes that must stay on one device. Empty means the model's
    /// decoder layer class.
    pub no_split_classes: Vec<String>,
    pub verify_policy: VerifyPolicy,
}

impl RunConfig {
    /// Build a configuration with defaults. Fails when the token is missing.
    pub fn new(token: Option<String>) -> crate::Result<Self> {
        let token = AccessToken::new(token)?;
        let model_id = DEFAULT_MODEL_ID.to_string();
        let local_dir = default_local_dir(&model_id)?;

        Ok(Self {
            token,
            model_id,
            revision: DEFAULT_REVISION.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            local_dir,
            dtype: DType::BF16,
            max_memory: MaxMemory::default(),
            no_split_classes: Vec::new(),
            verify_policy: VerifyPolicy::Lenient,
        })
    }

    /// Load `.env` if present, then read the token and endpoint from the environment.
    pub fn from_env() -> crate::Result<Self> {
        load_dotenv();

        let mut config = Self::new(std::env::var(TOKEN_VAR).ok())?;
        if let Ok(endpoint) = std::env::var(ENDPOINT_VAR) {
            if !endpoint.trim().is_empty() {
                config.endpoint = endpoint.trim().trim_end_matches('/').to_string();
            }
        }
        Ok(config)
    }

    /// Change the model and move the local directory with it.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> crate::Result<Self> {
        self.model_id = model_id.into();
        self.local_dir = default_local_dir(&self.model_id)?;
        Ok(self)
    }

    pub fn with_local_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.local_dir = dir.as_ref().to_path_buf();
        self
    }
}

/// Load a `.env` file from the working directory or its parents.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => tracing::debug!("No .env file found"),
        Err(e) => tracing::warn!("Ignoring unreadable .env file: {}", e),
    }
}

/// `<cwd>/models/<model_id>`
pub fn default_local_dir(model_id: &str) -> crate::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(cwd.join("models").join(model_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_missing_token_is_config_error() {
        let err = RunConfig::new(None).unwrap_err();
        assert!(matches!(err, crate::FetchError::ConfigError(_)));
        assert!(err.to_string().contains(TOKEN_VAR));

        assert!(RunConfig::new(Some("   ".to_string())).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::new(Some("hf_abcdef".to_string())).unwrap();

        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.revision, "main");
        assert_eq!(config.dtype, DType::BF16);
        assert_eq!(config.verify_policy, VerifyPolicy::Lenient);
        assert!(config
            .local_dir
            .ends_with("models/meta-llama/Llama-3.2-3B-Instruct"));
    }

    #[test]
    fn test_token_is_masked() {
        let token = AccessToken::new(Some("hf_secretvalue".to_string())).unwrap();

        assert_eq!(token.to_string(), "hf_s****");
        assert!(!format!("{:?}", token).contains("secretvalue"));
        assert_eq!(token.expose(), "hf_secretvalue");
    }

    #[test]
    fn test_with_model_id_moves_local_dir() {
        let config = RunConfig::new(Some("hf_x".to_string()))
            .unwrap()
            .with_model_id("Qwen/Qwen2.5-0.5B")
            .unwrap();
        assert!(config.local_dir.ends_with("models/Qwen/Qwen2.5-0.5B"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_token_and_endpoint() {
        std::env::set_var(TOKEN_VAR, "hf_fromenv");
        std::env::set_var(ENDPOINT_VAR, "http://localhost:8080/");

        let config = RunConfig::from_env().unwrap();
        assert_eq!(config.token.expose(), "hf_fromenv");
        assert_eq!(config.endpoint, "http://localhost:8080");

        std::env::remove_var(TOKEN_VAR);
        std::env::remove_var(ENDPOINT_VAR);
    }

    #[test]
    #[serial]
    fn test_from_env_without_token_fails() {
        std::env::remove_var(TOKEN_VAR);
        assert!(matches!(
            RunConfig::from_env(),
            Err(crate::FetchError::ConfigError(_))
        ));
    }
}
