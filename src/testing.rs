//! Test fixtures: a tiny architecture, a counting mock model and loader, and
//! a writer for on-disk SafeTensors model directories.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array1;
use safetensors::tensor::{Dtype, TensorView};

use crate::config::InitOptions;
use crate::device::DevicePool;
use crate::error::{InferenceError, ModelLoadError};
use crate::loader::ModelLoader;
use crate::model::{ArchitectureDescriptor, BatchItem, ForwardModel, ItemResult, ModelHandle};
use crate::tokenizer::ByteTokenizer;

/// Byte the mock model always prefers
pub const MOCK_TOKEN: u32 = b'a' as u32;

pub fn tiny_descriptor() -> ArchitectureDescriptor {
    ArchitectureDescriptor {
        model_type: "recurrent-ranker".to_string(),
        model_id: None,
        vocab_size: 258,
        hidden_size: 4,
        max_seq_len: 64,
        max_batch_size: 8,
        bos_token_id: Some(256),
        eos_token_id: 257,
        tie_word_embeddings: true,
    }
}

pub fn tiny_tokenizer() -> ByteTokenizer {
    ByteTokenizer::new(258, Some(256), 257).unwrap()
}

/// Mock forward model that records what it is fed.
///
/// Always ranks [`MOCK_TOKEN`] first, or EOS once a sequence ends with
/// `eos_after` consecutive mock tokens.
pub struct CountingModel {
    descriptor: ArchitectureDescriptor,
    delay: Option<Duration>,
    eos_after: Option<usize>,
    fail: Mutex<Option<InferenceError>>,
    panic_at: Option<usize>,
    forward_calls: AtomicUsize,
    full_prefills: AtomicUsize,
    tokens_fed: AtomicUsize,
    max_batch_seen: AtomicUsize,
}

impl CountingModel {
    pub fn new() -> Self {
        Self {
            descriptor: tiny_descriptor(),
            delay: None,
            eos_after: None,
            fail: Mutex::new(None),
            panic_at: None,
            forward_calls: AtomicUsize::new(0),
            full_prefills: AtomicUsize::new(0),
            tokens_fed: AtomicUsize::new(0),
            max_batch_seen: AtomicUsize::new(0),
        }
    }

    /// Sleep this long in every forward pass
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_eos_after(mut self, n: usize) -> Self {
        self.eos_after = Some(n);
        self
    }

    /// Panic inside the `call`-th forward pass, counting from 1
    pub fn panic_at(mut self, call: usize) -> Self {
        self.panic_at = Some(call);
        self
    }

    /// Fail the next forward pass with `err`
    pub fn fail_next(&self, err: InferenceError) {
        *self.fail.lock().unwrap() = Some(err);
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// Items that started from an empty cache
    pub fn full_prefills(&self) -> usize {
        self.full_prefills.load(Ordering::SeqCst)
    }

    pub fn tokens_fed(&self) -> usize {
        self.tokens_fed.load(Ordering::SeqCst)
    }

    pub fn max_batch_seen(&self) -> usize {
        self.max_batch_seen.load(Ordering::SeqCst)
    }

    fn logits_for(&self, history: &[u32]) -> Vec<f32> {
        let trailing = history
            .iter()
            .rev()
            .take_while(|&&t| t == MOCK_TOKEN)
            .count();
        let best = match self.eos_after {
            Some(n) if trailing >= n => self.descriptor.eos_token_id,
            _ => MOCK_TOKEN,
        };
        let mut logits = vec![0.0; self.descriptor.vocab_size];
        logits[best as usize] = 10.0;
        logits
    }
}

impl Default for CountingModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardModel for CountingModel {
    fn descriptor(&self) -> &ArchitectureDescriptor {
        &self.descriptor
    }

    fn weight_bytes(&self) -> u64 {
        4096
    }

    fn forward(&self, batch: &mut [BatchItem<'_>]) -> Result<Vec<ItemResult>, InferenceError> {
        let call = self.forward_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_at == Some(call) {
            panic!("kernel fault in forward pass {}", call);
        }
        self.max_batch_seen.fetch_max(batch.len(), Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.fail.lock().unwrap().take() {
            return Err(err);
        }

        let width = self.descriptor.hidden_size;
        let results: Vec<ItemResult> = batch
            .iter_mut()
            .map(|item| -> ItemResult {
                if item.cache.is_empty() {
                    self.full_prefills.fetch_add(1, Ordering::SeqCst);
                }
                let states = vec![Array1::zeros(width); item.tokens.len()];
                item.cache.extend(item.tokens, states)?;
                self.tokens_fed.fetch_add(item.tokens.len(), Ordering::SeqCst);
                Ok(self.logits_for(item.cache.tokens()))
            })
            .collect();
        Ok(results)
    }
}

/// Loader that places one shared [`CountingModel`] under each id
pub struct MockLoader {
    pub model: Arc<CountingModel>,
    pub ids: Vec<String>,
}

impl MockLoader {
    pub fn new(ids: &[&str]) -> Self {
        Self::with_model(CountingModel::new(), ids)
    }

    pub fn with_model(model: CountingModel, ids: &[&str]) -> Self {
        Self {
            model: Arc::new(model),
            ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ModelLoader for MockLoader {
    fn load(
        &self,
        path: &Path,
        devices: &DevicePool,
        options: &InitOptions,
    ) -> Result<Vec<ModelHandle>, ModelLoadError> {
        if !path.exists() {
            return Err(ModelLoadError::NotFound(path.to_path_buf()));
        }
        self.ids
            .iter()
            .map(|id| {
                ModelHandle::place(
                    id.as_str(),
                    path,
                    Arc::clone(&self.model) as Arc<dyn ForwardModel>,
                    tiny_tokenizer(),
                    devices,
                    options,
                )
            })
            .collect()
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Write `config.json` and `model.safetensors` for `descriptor` into `dir`.
///
/// Weights are small deterministic values; `lm_head.weight` is written only
/// when embeddings are untied.
pub fn write_model_dir(dir: &Path, descriptor: &ArchitectureDescriptor) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(descriptor).unwrap(),
    )
    .unwrap();

    let (vocab, hidden) = (descriptor.vocab_size, descriptor.hidden_size);
    let embed: Vec<f32> = (0..vocab * hidden)
        .map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5)
        .collect();
    let proj: Vec<f32> = (0..hidden * hidden)
        .map(|i| if i % (hidden + 1) == 0 { 0.5 } else { 0.0 })
        .collect();

    let mut tensors: Vec<(String, Vec<f32>, Vec<usize>)> = vec![
        ("embed_tokens.weight".to_string(), embed.clone(), vec![vocab, hidden]),
        ("state_proj.weight".to_string(), proj, vec![hidden, hidden]),
    ];
    if !descriptor.tie_word_embeddings {
        tensors.push(("lm_head.weight".to_string(), embed, vec![vocab, hidden]));
    }
    write_safetensors(&dir.join("model.safetensors"), &tensors);
}

/// Serialize F32 tensors into one SafeTensors file.
pub fn write_safetensors(path: &Path, tensors: &[(String, Vec<f32>, Vec<usize>)]) {
    let buffers: Vec<(String, Vec<u8>, Vec<usize>)> = tensors
        .iter()
        .map(|(name, values, shape)| (name.clone(), f32_bytes(values), shape.clone()))
        .collect();
    let views: HashMap<String, TensorView<'_>> = buffers
        .iter()
        .map(|(name, bytes, shape)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap();
            (name.clone(), view)
        })
        .collect();
    let bytes = safetensors::serialize(&views, &None).unwrap();
    std::fs::write(path, bytes).unwrap();
}
