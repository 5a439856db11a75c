use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ModelLoadError;

/// Architectures the built-in forward implementation can run
pub const SUPPORTED_MODEL_TYPES: &[&str] = &["recurrent-ranker"];

/// Architecture descriptor, read from `config.json` next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    pub model_type: String,

    // Id the model is served under; falls back to the directory name
    #[serde(default)]
    pub model_id: Option<String>,

    pub vocab_size: usize,
    pub hidden_size: usize,

    #[serde(default = "default_max_seq_len", alias = "max_position_embeddings")]
    pub max_seq_len: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default)]
    pub bos_token_id: Option<u32>,
    pub eos_token_id: u32,

    // Whether the ranking head reuses the embedding table
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_max_seq_len() -> usize {
    4096
}

fn default_max_batch_size() -> usize {
    32
}

impl ArchitectureDescriptor {
    /// Load and validate `config.json`
    pub fn load(config_path: &Path) -> Result<Self, ModelLoadError> {
        let contents = std::fs::read_to_string(config_path)?;
        let descriptor: Self = serde_json::from_str(&contents).map_err(|e| {
            ModelLoadError::Corrupted(format!("{}: {}", config_path.display(), e))
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), ModelLoadError> {
        if !SUPPORTED_MODEL_TYPES.contains(&self.model_type.as_str()) {
            return Err(ModelLoadError::ArchitectureMismatch(format!(
                "model_type '{}' is not supported (expected one of: {})",
                self.model_type,
                SUPPORTED_MODEL_TYPES.join(", ")
            )));
        }
        if self.vocab_size == 0 || self.hidden_size == 0 {
            return Err(ModelLoadError::ArchitectureMismatch(
                "vocab_size and hidden_size must be non-zero".to_string(),
            ));
        }
        if self.max_seq_len < 2 || self.max_batch_size == 0 {
            return Err(ModelLoadError::ArchitectureMismatch(format!(
                "max_seq_len {} / max_batch_size {} out of range",
                self.max_seq_len, self.max_batch_size
            )));
        }
        if self.eos_token_id as usize >= self.vocab_size {
            return Err(ModelLoadError::ArchitectureMismatch(format!(
                "eos_token_id {} outside vocabulary of {}",
                self.eos_token_id, self.vocab_size
            )));
        }
        Ok(())
    }

    /// Bytes of one cached state position
    pub fn state_bytes(&self) -> u64 {
        (self.hidden_size * std::mem::size_of::<f32>()) as u64
    }
}
