//! Core inference engine
//!
//! This module provides the request execution pipeline:
//! - Cache: per-conversation generation state with leases and LRU eviction
//! - Executor: decode rounds of one model on one device
//! - Scheduler: lanes that aggregate requests into batches
//! - Sampler: token selection from logits

mod cache;
mod executor;
mod sampler;
mod scheduler;

pub use cache::{
    CacheLease, CacheSlot, CacheState, CacheStats, ConversationKey, GenerationCache, SlotRef,
    PROMPT_KEY_TOKENS,
};
pub use executor::{Executor, GeneratedChoice, Generation, GenerationRequest};
pub use sampler::Sampler;
pub use scheduler::{BatchScheduler, LaneKey};
