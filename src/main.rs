//! model-fetch CLI - download a model snapshot and check that it loads.
//!
//! With no arguments it fetches the default model into `./models/<model id>`.

use std::path::PathBuf;

use clap::Parser;

use model_fetch::{
    config::{load_dotenv, MaxMemory, RunConfig, VerifyPolicy},
    fetch,
    utils::parse_dtype,
};

#[derive(Parser)]
#[command(name = "model-fetch")]
#[command(author, version, about = "Download a Hugging Face model and verify it loads", long_about = None)]
struct Cli {
    /// HuggingFace model ID
    #[arg(long, env = "MODEL_FETCH_MODEL_ID")]
    model_id: Option<String>,

    /// Target directory (defaults to ./models/<model id>)
    #[arg(long, env = "MODEL_FETCH_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// Branch, tag or commit to download
    #[arg(long, env = "MODEL_FETCH_REVISION")]
    revision: Option<String>,

    /// Dtype to load floating point weights as
    #[arg(long, env = "MODEL_FETCH_DTYPE")]
    dtype: Option<String>,

    /// Per-device memory limit, e.g. `0=6GiB` or `cpu=12GB` (repeatable)
    #[arg(long = "max-memory", value_name = "DEVICE=SIZE")]
    max_memory: Vec<String>,

    /// Module class that must stay on a single device (repeatable)
    #[arg(long = "no-split", value_name = "CLASS")]
    no_split: Vec<String>,

    /// Exit non-zero when the downloaded files fail to load
    #[arg(long, env = "MODEL_FETCH_STRICT_VERIFY")]
    strict_verify: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::from_env()?;

        if let Some(model_id) = self.model_id {
            config = config.with_model_id(model_id)?;
        }
        if let Some(local_dir) = self.local_dir {
            config = config.with_local_dir(local_dir);
        }
        if let Some(revision) = self.revision {
            config.revision = revision;
        }
        if let Some(dtype) = self.dtype {
            config.dtype = parse_dtype(&dtype)?;
        }
        if !self.max_memory.is_empty() {
            config.max_memory = MaxMemory::from_entries(&self.max_memory)?;
        }
        config.no_split_classes = self.no_split;
        if self.strict_verify {
            config.verify_policy = VerifyPolicy::Strict;
        }

        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("model_fetch=info".parse()?),
        )
        .init();

    // Flags may fall back to variables defined in .env
    load_dotenv();
    let cli = Cli::parse();
    let config = cli.into_config()?;

    println!("{}: {}", model_fetch::config::TOKEN_VAR, config.token);
    println!("Memory budget: {}", config.max_memory);

    let outcome = fetch::run(&config).await?;

    if !outcome.is_success(config.verify_policy) {
        anyhow::bail!(
            "Verification of {} failed under strict policy",
            outcome.snapshot.local_dir.display()
        );
    }

    Ok(())
}
