//! Model info command

use anyhow::Result;

use super::find_model_path;
use crate::loader::{detect_model_sources, tensor_inventory};
use crate::model::ArchitectureDescriptor;

/// Show model information
pub fn info(model: String) -> Result<()> {
    let model_path = find_model_path(&model)?;
    println!("Path: {}", model_path.display());

    for source in detect_model_sources(&model_path)? {
        let descriptor = ArchitectureDescriptor::load(&source.config_path)?;
        let id = descriptor.model_id.as_deref().unwrap_or(&source.name);

        println!("\nModel: {}", id);
        println!("  Architecture: {}", descriptor.model_type);
        println!("  Vocab size: {}", descriptor.vocab_size);
        println!("  Hidden size: {}", descriptor.hidden_size);
        println!("  Max context: {}", descriptor.max_seq_len);
        println!("  Max batch: {}", descriptor.max_batch_size);
        println!("  Tied embeddings: {}", descriptor.tie_word_embeddings);
        println!(
            "  State per position: {} bytes",
            descriptor.state_bytes()
        );

        let inventory = tensor_inventory(&source.weights)?;
        let total: usize = inventory.iter().map(|t| t.bytes).sum();
        println!("\n  Tensors ({} file(s)):", source.weights.len());
        for tensor in &inventory {
            println!("    {:<24} {:>4} {:?}", tensor.name, tensor.dtype, tensor.shape);
        }

        let size_mb = total as f64 / (1024.0 * 1024.0);
        println!("\n  Weights size: {:.2} MB", size_mb);
    }

    Ok(())
}
