//! CLI commands
//!
//! Command-line front end over a local [`Session`](crate::session::Session).

mod chat;
mod devices;
mod info;

pub use chat::chat;
pub use devices::devices;
pub use info::info;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

/// Directory searched for models given by name
pub const MODEL_DIR_ENV: &str = "GENREC_MODEL_DIR";

/// genrec - inference runtime for generative recommendation models
#[derive(Parser)]
#[command(name = "genrec")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat with a model (interactive without --prompt)
    Chat {
        /// Model name or path
        model: String,

        /// Single prompt to answer, then exit
        #[arg(long, short)]
        prompt: Option<String>,

        /// Device selection (`auto`, `cpu`, `cuda:0`, `npu:0,1`)
        #[arg(long)]
        devices: Option<String>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,

        /// Top-p nucleus sampling
        #[arg(long)]
        top_p: Option<f32>,

        /// Per-request deadline in milliseconds (0 = none)
        #[arg(long, default_value = "0")]
        timeout_ms: u32,

        /// YAML or JSON runtime configuration
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Print full responses as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show model architecture and tensors
    Info {
        /// Model name or path
        model: String,
    },

    /// List devices, optionally resolving a selection
    Devices {
        /// Device selection to resolve
        #[arg(long)]
        spec: Option<String>,
    },
}

/// Resolve a model argument: a direct path, or a name under `GENREC_MODEL_DIR`
pub(crate) fn find_model_path(model: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(model);
    if direct.exists() {
        return Ok(direct);
    }

    let model_dir = std::env::var(MODEL_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./models"));

    let in_dir = model_dir.join(model);
    if in_dir.exists() {
        return Ok(in_dir);
    }

    Err(anyhow!("Model not found: {}", model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_args() {
        let cli = Cli::try_parse_from([
            "genrec",
            "chat",
            "ranker",
            "--prompt",
            "hi",
            "--devices",
            "npu:0,1",
            "--temperature",
            "0",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat {
                model,
                prompt,
                devices,
                temperature,
                timeout_ms,
                json,
                ..
            } => {
                assert_eq!(model, "ranker");
                assert_eq!(prompt.as_deref(), Some("hi"));
                assert_eq!(devices.as_deref(), Some("npu:0,1"));
                assert_eq!(temperature, Some(0.0));
                assert_eq!(timeout_ms, 0);
                assert!(json);
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_find_model_path_direct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        assert_eq!(find_model_path(&path).unwrap(), dir.path());
        assert!(find_model_path("/no/such/model/anywhere").is_err());
    }
}
