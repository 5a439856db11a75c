//! Session initialization options

use serde::{Deserialize, Serialize};

/// Options applied when a session binds devices and loads models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitOptions {
    /// Maximum number of sequences decoded together in one forward pass.
    /// Clamped to the model's own limit.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long an idle lane waits for more requests before dispatching a batch
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Maximum context length (overrides the model default if smaller)
    #[serde(default)]
    pub max_context_len: Option<usize>,

    /// Generation cache budget for the whole device pool, in MiB
    #[serde(default = "default_cache_budget_mib")]
    pub cache_budget_mib: u64,

    /// Model id to register a single model under (default: descriptor or directory name)
    #[serde(default)]
    pub model_id: Option<String>,

    /// Run one forward pass per device right after loading
    #[serde(default)]
    pub warmup: bool,

    /// Worker threads for the session runtime (None = tokio default)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

fn default_max_batch_size() -> usize {
    8
}

fn default_batch_window_ms() -> u64 {
    2
}

fn default_cache_budget_mib() -> u64 {
    1024
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            max_context_len: None,
            cache_budget_mib: default_cache_budget_mib(),
            model_id: None,
            warmup: false,
            worker_threads: None,
        }
    }
}

impl InitOptions {
    /// Cache budget in bytes
    pub fn cache_budget_bytes(&self) -> u64 {
        self.cache_budget_mib.saturating_mul(1024 * 1024)
    }

    pub fn batch_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_window_ms)
    }
}
