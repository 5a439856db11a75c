//! SafeTensors weight loading
//!
//! Reads every shard of a model, keeps the F32 matrices the built-in
//! architecture needs and hands them to [`RecurrentRanker`]. Single-file and
//! sharded models are handled the same way.

use std::collections::HashMap;
use std::path::Path;

use ndarray::Array2;
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use serde::Serialize;

use crate::error::ModelLoadError;
use crate::model::{ArchitectureDescriptor, RecurrentRanker};

pub const EMBED_TOKENS: &str = "embed_tokens.weight";
pub const STATE_PROJ: &str = "state_proj.weight";
pub const LM_HEAD: &str = "lm_head.weight";

/// Tensor metadata, as listed by `genrec info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub bytes: usize,
}

/// Load the weights of a `recurrent-ranker` model from `weights`.
pub fn load_recurrent_ranker(
    descriptor: ArchitectureDescriptor,
    weights: &[impl AsRef<Path>],
) -> Result<RecurrentRanker, ModelLoadError> {
    let mut wanted = vec![EMBED_TOKENS, STATE_PROJ];
    if !descriptor.tie_word_embeddings {
        wanted.push(LM_HEAD);
    }

    let mut tensors: HashMap<String, Array2<f32>> = HashMap::new();
    let mut total_bytes = 0usize;
    for shard in weights {
        let shard = shard.as_ref();
        let data = std::fs::read(shard)?;
        total_bytes += data.len();
        let st = SafeTensors::deserialize(&data)
            .map_err(|e| ModelLoadError::Corrupted(format!("{}: {}", shard.display(), e)))?;

        for name in &wanted {
            if let Ok(view) = st.tensor(name) {
                let matrix = to_matrix(name, view.dtype(), view.shape(), view.data())?;
                tensors.insert(name.to_string(), matrix);
            }
        }
    }

    tracing::info!(
        "Read {} shard(s), {:.2} MiB",
        weights.len(),
        total_bytes as f64 / (1024.0 * 1024.0)
    );

    let mut take = |name: &str| {
        tensors
            .remove(name)
            .ok_or_else(|| ModelLoadError::MissingWeights(name.to_string()))
    };
    let embed = take(EMBED_TOKENS)?;
    let state_proj = take(STATE_PROJ)?;
    let head = if descriptor.tie_word_embeddings {
        None
    } else {
        Some(take(LM_HEAD)?)
    };

    RecurrentRanker::new(descriptor, embed, state_proj, head)
}

/// List the tensors stored in `weights`.
pub fn tensor_inventory(weights: &[impl AsRef<Path>]) -> Result<Vec<TensorInfo>, ModelLoadError> {
    let mut inventory = Vec::new();
    for shard in weights {
        let shard = shard.as_ref();
        let data = std::fs::read(shard)?;
        let st = SafeTensors::deserialize(&data)
            .map_err(|e| ModelLoadError::Corrupted(format!("{}: {}", shard.display(), e)))?;
        for (name, view) in st.tensors() {
            inventory.push(TensorInfo {
                name,
                dtype: format!("{:?}", view.dtype()),
                shape: view.shape().to_vec(),
                bytes: view.data().len(),
            });
        }
    }
    inventory.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(inventory)
}

fn to_matrix(
    name: &str,
    dtype: Dtype,
    shape: &[usize],
    data: &[u8],
) -> Result<Array2<f32>, ModelLoadError> {
    if dtype != Dtype::F32 {
        return Err(ModelLoadError::ArchitectureMismatch(format!(
            "{} has dtype {:?}; only F32 weights are supported",
            name, dtype
        )));
    }
    let [rows, cols] = shape else {
        return Err(ModelLoadError::ArchitectureMismatch(format!(
            "{} has rank {}, expected a matrix",
            name,
            shape.len()
        )));
    };

    let values: Vec<f32> = data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((*rows, *cols), values)
        .map_err(|e| ModelLoadError::Corrupted(format!("{}: {}", name, e)))
}
