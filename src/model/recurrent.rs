//! Built-in `recurrent-ranker` architecture
//!
//! `s_t = tanh(W_s · s_{t-1} + E[x_t])`, `logits = H · s_t`.
//! The per-position state `s_t` is what the generation cache stores.

use ndarray::{Array1, Array2, Axis};

use crate::engine::CacheState;
use crate::error::{CacheError, InferenceError, ModelLoadError};

use super::{ArchitectureDescriptor, BatchItem, ForwardModel, ItemResult};

/// Embedding table + recurrent state projection + ranking head
#[derive(Debug)]
pub struct RecurrentRanker {
    descriptor: ArchitectureDescriptor,
    /// [vocab, hidden]
    embed: Array2<f32>,
    /// [hidden, hidden]
    state_proj: Array2<f32>,
    /// [vocab, hidden]; None when tied to `embed`
    head: Option<Array2<f32>>,
}

impl RecurrentRanker {
    pub fn new(
        descriptor: ArchitectureDescriptor,
        embed: Array2<f32>,
        state_proj: Array2<f32>,
        head: Option<Array2<f32>>,
    ) -> Result<Self, ModelLoadError> {
        let vocab = descriptor.vocab_size;
        let hidden = descriptor.hidden_size;

        check_shape("embed_tokens.weight", &embed, [vocab, hidden])?;
        check_shape("state_proj.weight", &state_proj, [hidden, hidden])?;
        match &head {
            Some(head) => check_shape("lm_head.weight", head, [vocab, hidden])?,
            None if descriptor.tie_word_embeddings => {}
            None => {
                return Err(ModelLoadError::MissingWeights(
                    "lm_head.weight (ranking head) and tie_word_embeddings is false".to_string(),
                ))
            }
        }

        Ok(Self {
            descriptor,
            embed,
            state_proj,
            head,
        })
    }

    fn head(&self) -> &Array2<f32> {
        self.head.as_ref().unwrap_or(&self.embed)
    }

    fn step(&self, prev: &Array1<f32>, token: u32) -> Array1<f32> {
        let mut next = self.state_proj.dot(prev);
        next += &self.embed.row(token as usize);
        next.mapv_inplace(f32::tanh);
        next
    }

    /// Run `tokens` through the recurrence and append their states to `cache`.
    fn extend(&self, tokens: &[u32], cache: &mut CacheState) -> Result<Array1<f32>, CacheError> {
        let mut prev = cache
            .last_state()
            .cloned()
            .unwrap_or_else(|| Array1::zeros(self.descriptor.hidden_size));

        let mut states = Vec::with_capacity(tokens.len());
        for &token in tokens {
            prev = self.step(&prev, token);
            states.push(prev.clone());
        }
        cache.extend(tokens, states)?;
        Ok(prev)
    }
}

impl ForwardModel for RecurrentRanker {
    fn descriptor(&self) -> &ArchitectureDescriptor {
        &self.descriptor
    }

    fn weight_bytes(&self) -> u64 {
        let elems = self.embed.len()
            + self.state_proj.len()
            + self.head.as_ref().map_or(0, |h| h.len());
        (elems * std::mem::size_of::<f32>()) as u64
    }

    fn forward(&self, batch: &mut [BatchItem<'_>]) -> Result<Vec<ItemResult>, InferenceError> {
        let vocab = self.descriptor.vocab_size;
        for item in batch.iter() {
            if item.tokens.is_empty() {
                return Err(InferenceError::InvalidBatch("batch item without tokens".to_string()));
            }
            if let Some(&bad) = item.tokens.iter().find(|&&t| t as usize >= vocab) {
                return Err(InferenceError::InvalidBatch(format!(
                    "token {} outside vocabulary of {}",
                    bad, vocab
                )));
            }
        }

        let mut results: Vec<ItemResult> = Vec::with_capacity(batch.len());
        let mut finals: Vec<(usize, Array1<f32>)> = Vec::with_capacity(batch.len());

        for (i, item) in batch.iter_mut().enumerate() {
            match self.extend(item.tokens, item.cache) {
                Ok(last) => {
                    finals.push((i, last));
                    results.push(Ok(Vec::new()));
                }
                Err(e) => results.push(Err(e)),
            }
        }

        if finals.is_empty() {
            return Ok(results);
        }

        // One head projection for every item that advanced
        let hidden = self.descriptor.hidden_size;
        let mut stacked = Array2::<f32>::zeros((finals.len(), hidden));
        for (mut row, (_, state)) in stacked.axis_iter_mut(Axis(0)).zip(&finals) {
            row.assign(state);
        }
        let logits = stacked.dot(&self.head().t());

        for (row, (i, _)) in logits.axis_iter(Axis(0)).zip(&finals) {
            results[*i] = Ok(row.to_vec());
        }
        Ok(results)
    }
}

fn check_shape(
    name: &str,
    tensor: &Array2<f32>,
    expected: [usize; 2],
) -> Result<(), ModelLoadError> {
    if tensor.shape() != expected {
        return Err(ModelLoadError::ArchitectureMismatch(format!(
            "{} has shape {:?}, expected {:?}",
            name,
            tensor.shape(),
            expected
        )));
    }
    Ok(())
}
