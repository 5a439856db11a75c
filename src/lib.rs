//! genrec - inference runtime for generative recommendation models
//!
//! genrec serves recurrent ranking/generation models behind a small,
//! handle-based API: create a session, initialize it against model weights
//! and devices, run chat completions from any number of threads, destroy it.
//!
//! # Architecture
//!
//! - **device**: device pool, memory arenas, serialized execution queues
//! - **model** / **loader**: architecture descriptors, SafeTensors loading,
//!   per-device weight placement
//! - **engine**: generation cache, sampling, batched decoding lanes
//! - **session**: the runtime behind a handle
//! - **api**: nullable entry points over [`Session`]
//!
//! # Example
//!
//! ```bash
//! # One-shot completion on two NPUs
//! GENREC_DEVICES=npu:0=32768,npu:1=32768 genrec chat ./models/ranker \
//!     --devices npu:0,1 --prompt "history: 12, 40, 7"
//!
//! # Inspect a model directory
//! genrec info ranker
//! ```

pub mod api;
pub mod chat;
pub mod cli;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod loader;
pub mod model;
pub mod session;
pub mod tokenizer;

#[cfg(test)]
pub mod testing;

// Re-export key types
pub use chat::{ChatMessage, Choice, FinishReason, Response, Status, Usage};
pub use config::{InitOptions, RequestParams, RuntimeConfig};
pub use error::{InitError, ModelLoadError};
pub use session::{Session, SessionState};
