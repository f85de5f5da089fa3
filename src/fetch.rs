//! The download-and-verify procedure.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::DType;
use tokenizers::Tokenizer;

use crate::config::{DeviceId, MaxMemory, RunConfig, VerifyPolicy};
use crate::layers::DeviceMap;
use crate::model::{load_tokenizer, AutoModel, LoadedModel};
use crate::utils::{
    clean_memory, detect_accelerators, format_bytes, AcceleratorInfo, Snapshot, SnapshotDownloader,
};

/// Tokenizer and model that loaded from a snapshot
#[derive(Debug)]
pub struct Verified {
    pub tokenizer: Tokenizer,
    pub model: LoadedModel,
}

/// Result of the verification load
#[derive(Debug)]
pub enum Verification {
    Loaded(Box<Verified>),
    Failed(String),
}

/// What remains of a verification once the loaded objects are released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyReport {
    Passed {
        device_map: DeviceMap,
        placement: BTreeMap<DeviceId, u64>,
    },
    Failed(String),
}

/// Summary of one run. Holds no model or tokenizer.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub accelerators: AcceleratorInfo,
    pub snapshot: Snapshot,
    pub verification: VerifyReport,
}

impl Outcome {
    /// Whether the run should end with a success status under `policy`
    pub fn is_success(&self, policy: VerifyPolicy) -> bool {
        match (&self.verification, policy) {
            (VerifyReport::Passed { .. }, _) => true,
            (VerifyReport::Failed(_), VerifyPolicy::Lenient) => true,
            (VerifyReport::Failed(_), VerifyPolicy::Strict) => false,
        }
    }
}

/// Download the configured model, verify it loads, and release it.
///
/// Download failures are returned as errors. Verification failures are
/// reported in the outcome.
pub async fn run(config: &RunConfig) -> crate::Result<Outcome> {
    let accelerators = detect_accelerators();
    println!("{}", accelerators);

    let title = format!("{} Model Downloader", config.model_id);
    println!("\n{}\n{}", title, "=".repeat(title.len()));
    println!("Starting model download... please wait.");

    let downloader = SnapshotDownloader::new(&config.endpoint, config.token.clone())?;
    let snapshot = downloader
        .download(&config.model_id, &config.revision, &config.local_dir)
        .await?;

    println!("\nDownload completed successfully!");
    println!("Model files saved at: {}", snapshot.local_dir.display());

    let mut max_memory = config.max_memory.clone();
    for device in max_memory.retain_accelerators(accelerators.count) {
        tracing::warn!("Accelerator {} not present, dropping its memory limit", device);
    }

    println!("\nVerifying tokenizer and model loading...");
    let verification = match verify(
        &snapshot.local_dir,
        config.dtype,
        &max_memory,
        &config.no_split_classes,
    ) {
        Verification::Loaded(verified) => {
            if verified.model.model.is_fully_offloaded() {
                tracing::warn!(
                    "No weights fit the memory budget ({}); every tensor stays offloaded to disk",
                    max_memory
                );
            }
            println!("Model and tokenizer loaded successfully.");
            let report = VerifyReport::Passed {
                device_map: verified.model.device_map.clone(),
                placement: verified.model.model.placement().clone(),
            };
            release(*verified);
            println!("Model and tokenizer unloaded from RAM.");
            report
        }
        Verification::Failed(reason) => {
            println!("Error loading model/tokenizer: {}", reason);
            VerifyReport::Failed(reason)
        }
    };

    println!(
        "\nTo load locally later: AutoModel::from_pretrained(\"{}\", DType::{:?})",
        snapshot.local_dir.display(),
        config.dtype
    );

    Ok(Outcome {
        accelerators,
        snapshot,
        verification,
    })
}

/// Load the tokenizer and model from `model_dir`, plan their placement under
/// `max_memory`, and dispatch the weights.
pub fn verify(
    model_dir: &Path,
    dtype: DType,
    max_memory: &MaxMemory,
    no_split_classes: &[String],
) -> Verification {
    match load_and_dispatch(model_dir, dtype, max_memory, no_split_classes) {
        Ok(verified) => Verification::Loaded(Box::new(verified)),
        Err(e) => {
            tracing::warn!("Verification of {:?} failed: {}", model_dir, e);
            Verification::Failed(e.to_string())
        }
    }
}

fn load_and_dispatch(
    model_dir: &Path,
    dtype: DType,
    max_memory: &MaxMemory,
    no_split_classes: &[String],
) -> crate::Result<Verified> {
    let tokenizer = load_tokenizer(model_dir)?;
    tracing::info!("Tokenizer loaded ({} tokens)", tokenizer.get_vocab_size(true));

    let pretrained = AutoModel::from_pretrained(model_dir, dtype)?;
    let classes = pretrained.no_split_classes(no_split_classes);

    let device_map = pretrained.infer_device_map(max_memory, &classes);
    device_map.check_no_split(&pretrained.tree, &classes)?;
    tracing::info!("Device map:\n{}", device_map);

    for (device, bytes) in device_map.bytes_per_device(&pretrained.tree) {
        tracing::debug!("Planned {} on {}", format_bytes(bytes), device);
    }

    let model = pretrained.dispatch(device_map)?;
    Ok(Verified { tokenizer, model })
}

/// Drop the loaded objects and return their memory.
fn release(verified: Verified) {
    drop(verified);
    clean_memory();
}
