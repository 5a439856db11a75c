//! Model Store
//!
//! A [`ModelHandle`] is one loaded model: its architecture descriptor, the
//! read-only [`ForwardModel`], its tokenizer and the weight reservations it
//! holds on every bound device. Handles are immutable after load and shared
//! across concurrent batches.

mod config;
mod recurrent;

pub use config::{ArchitectureDescriptor, SUPPORTED_MODEL_TYPES};
pub use recurrent::RecurrentRanker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::InitOptions;
use crate::device::{Allocation, DevicePool, DeviceRef};
use crate::engine::CacheState;
use crate::error::{CacheError, InferenceError, ModelLoadError};
use crate::tokenizer::{BoxedTokenizer, TokenizerTrait};

/// Last-position logits over the vocabulary
pub type Logits = Vec<f32>;

/// Per-item forward outcome; capacity failures stay local to the item
pub type ItemResult = Result<Logits, CacheError>;

/// One sequence in a forward batch
pub struct BatchItem<'a> {
    /// Tokens not yet in the cache
    pub tokens: &'a [u32],
    /// The sequence's own cache; extended in place
    pub cache: &'a mut CacheState,
}

/// Read-only batched inference over one device
pub trait ForwardModel: Send + Sync {
    fn descriptor(&self) -> &ArchitectureDescriptor;

    /// Bytes one replica of the weights occupies on a device
    fn weight_bytes(&self) -> u64;

    /// Run one forward pass over `batch`.
    ///
    /// Each item's cache is extended with the states of its tokens and the
    /// logits of its last position are returned, in batch order. An `Err`
    /// fails the whole batch.
    fn forward(&self, batch: &mut [BatchItem<'_>]) -> Result<Vec<ItemResult>, InferenceError>;
}

/// A loaded model bound to a device pool
pub struct ModelHandle {
    id: String,
    path: PathBuf,
    model: Arc<dyn ForwardModel>,
    tokenizer: BoxedTokenizer,
    max_batch_size: usize,
    max_context_len: usize,
    // One weight replica per device, released on drop
    reservations: Vec<Allocation>,
}

impl ModelHandle {
    /// Place `model` on every device of `devices`.
    ///
    /// All-or-nothing: if any device cannot hold the weights, the
    /// reservations already made are released before the error returns.
    pub fn place<T: TokenizerTrait + 'static>(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        model: Arc<dyn ForwardModel>,
        tokenizer: T,
        devices: &DevicePool,
        options: &InitOptions,
    ) -> Result<Self, ModelLoadError> {
        let id = id.into();
        let descriptor = model.descriptor();

        if tokenizer.vocab_size() > descriptor.vocab_size {
            return Err(ModelLoadError::ArchitectureMismatch(format!(
                "tokenizer vocabulary {} exceeds model vocabulary {}",
                tokenizer.vocab_size(),
                descriptor.vocab_size
            )));
        }

        let weight_bytes = model.weight_bytes();
        let reservations = devices
            .devices()
            .iter()
            .map(|device| device.arena().allocate(weight_bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let max_context_len = options
            .max_context_len
            .map_or(descriptor.max_seq_len, |c| c.min(descriptor.max_seq_len));
        let max_batch_size = options.max_batch_size.clamp(1, descriptor.max_batch_size);

        tracing::info!(
            "Placed model '{}' on {} device(s): {:.2} MiB per replica, context {}, batch {}",
            id,
            reservations.len(),
            weight_bytes as f64 / (1024.0 * 1024.0),
            max_context_len,
            max_batch_size
        );

        Ok(Self {
            id,
            path: path.into(),
            model,
            tokenizer: Box::new(tokenizer),
            max_batch_size,
            max_context_len,
            reservations,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &ArchitectureDescriptor {
        self.model.descriptor()
    }

    pub fn model(&self) -> &Arc<dyn ForwardModel> {
        &self.model
    }

    /// Get the tokenizer
    pub fn tokenizer(&self) -> &dyn TokenizerTrait {
        self.tokenizer.as_ref()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }

    /// Bytes of one cached position
    pub fn state_bytes(&self) -> u64 {
        self.descriptor().state_bytes()
    }

    /// Total weight bytes reserved across devices
    pub fn reserved_bytes(&self) -> u64 {
        self.reservations.iter().map(Allocation::bytes).sum()
    }

    /// An empty cache for this model on `device`
    pub fn new_cache(&self, device: &DeviceRef) -> CacheState {
        CacheState::new(
            self.descriptor().hidden_size,
            self.max_context_len,
            device.arena().empty(),
        )
    }

    /// Run one single-token forward pass on every device.
    pub fn warmup(&self, devices: &DevicePool) -> Result<(), InferenceError> {
        for device in devices.devices() {
            let start = std::time::Instant::now();
            let token = [self.tokenizer.eos_token_id()];
            let mut cache = self.new_cache(device);
            device.execute(|| {
                let mut batch = [BatchItem {
                    tokens: &token,
                    cache: &mut cache,
                }];
                self.model.forward(&mut batch).map(|_| ())
            })?;
            tracing::debug!(
                "Warmed up '{}' on {} in {:?}",
                self.id,
                device.id(),
                start.elapsed()
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("max_batch_size", &self.max_batch_size)
            .field("max_context_len", &self.max_context_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, DeviceInfo, DeviceKind, StaticProbe};
    use crate::testing::{tiny_tokenizer, CountingModel};

    #[test]
    fn test_place_reserves_on_every_device() {
        let probe = StaticProbe::uniform(DeviceKind::Npu, 2, 1 << 20);
        let pool = DevicePool::from_spec("npu:0,1", &probe).unwrap();
        let model = Arc::new(CountingModel::new());
        let bytes = model.weight_bytes();

        let options = InitOptions::default();
        let handle =
            ModelHandle::place("m", "/m", model, tiny_tokenizer(), &pool, &options).unwrap();
        assert_eq!(handle.reserved_bytes(), 2 * bytes);
        for device in pool.devices() {
            assert_eq!(device.arena().used(), bytes);
        }

        drop(handle);
        for device in pool.devices() {
            assert_eq!(device.arena().used(), 0);
        }
    }

    #[test]
    fn test_place_rolls_back_on_oom() {
        let model = Arc::new(CountingModel::new());
        let bytes = model.weight_bytes();
        let probe = StaticProbe::new(vec![
            DeviceInfo::new(DeviceId::cpu(), bytes),
            DeviceInfo::new(DeviceId::new(DeviceKind::Cuda, 0), bytes * 4),
            DeviceInfo::new(DeviceId::new(DeviceKind::Cuda, 1), bytes / 2),
        ]);
        let pool = DevicePool::from_spec("cuda:0,1", &probe).unwrap();

        let options = InitOptions::default();
        let err = ModelHandle::place("m", "/m", model, tiny_tokenizer(), &pool, &options)
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::OutOfMemory(_)));
        assert_eq!(pool.devices()[0].arena().used(), 0);
    }

    #[test]
    fn test_limits_follow_options() {
        let probe = StaticProbe::uniform(DeviceKind::Npu, 1, 1 << 20);
        let pool = DevicePool::from_spec("npu:0", &probe).unwrap();
        let options = InitOptions {
            max_batch_size: 1000,
            max_context_len: Some(16),
            ..Default::default()
        };
        let model = Arc::new(CountingModel::new());
        let descriptor_batch = model.descriptor().max_batch_size;
        let handle =
            ModelHandle::place("m", "/m", model, tiny_tokenizer(), &pool, &options).unwrap();
        assert_eq!(handle.max_context_len(), 16);
        assert_eq!(handle.max_batch_size(), descriptor_batch);
    }
}
