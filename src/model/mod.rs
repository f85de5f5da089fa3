//! Snapshot loading.

mod auto_model;

pub use auto_model::{
    ensure_model_files, load_tokenizer, AutoModel, LoadedModel, PretrainedModel, CONFIG_FILE,
    TOKENIZER_FILE,
};
