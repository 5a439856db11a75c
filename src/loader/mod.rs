//! Model loading
//!
//! This module turns a model path into placed [`ModelHandle`]s:
//! - `detect`: which models live under the path and where their files are
//! - `safetensors`: reading F32 weights into the built-in architecture
//!
//! Loading is all-or-nothing. A failure on any model drops the handles
//! already built, which releases their device reservations.

mod detect;
mod safetensors;

pub use detect::{detect_model_sources, ModelSource, CONFIG_FILE};
pub use safetensors::{load_recurrent_ranker, tensor_inventory, TensorInfo};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::config::InitOptions;
use crate::device::DevicePool;
use crate::error::ModelLoadError;
use crate::model::{ArchitectureDescriptor, ForwardModel, ModelHandle};
use crate::tokenizer::ByteTokenizer;

/// Source of model handles for a session
pub trait ModelLoader: Send + Sync {
    /// Load every model under `path` and place it on all of `devices`.
    fn load(
        &self,
        path: &Path,
        devices: &DevicePool,
        options: &InitOptions,
    ) -> Result<Vec<ModelHandle>, ModelLoadError>;
}

/// Loads `recurrent-ranker` models stored as SafeTensors
#[derive(Debug, Clone, Default)]
pub struct SafeTensorsLoader;

impl ModelLoader for SafeTensorsLoader {
    fn load(
        &self,
        path: &Path,
        devices: &DevicePool,
        options: &InitOptions,
    ) -> Result<Vec<ModelHandle>, ModelLoadError> {
        let sources = detect_model_sources(path)?;
        let single = sources.len() == 1;
        if !single && options.model_id.is_some() {
            tracing::warn!(
                "Ignoring model_id option: {} models found under {}",
                sources.len(),
                path.display()
            );
        }

        let mut seen = HashSet::new();
        let mut handles = Vec::with_capacity(sources.len());
        for source in sources {
            let descriptor = ArchitectureDescriptor::load(&source.config_path)?;
            let id = options
                .model_id
                .clone()
                .filter(|_| single)
                .or_else(|| descriptor.model_id.clone())
                .unwrap_or_else(|| source.name.clone());
            if !seen.insert(id.clone()) {
                return Err(ModelLoadError::Corrupted(format!(
                    "duplicate model id '{}' under {}",
                    id,
                    path.display()
                )));
            }

            handles.push(load_source(id, &source, descriptor, devices, options)?);
        }
        Ok(handles)
    }
}

fn load_source(
    id: String,
    source: &ModelSource,
    descriptor: ArchitectureDescriptor,
    devices: &DevicePool,
    options: &InitOptions,
) -> Result<ModelHandle, ModelLoadError> {
    tracing::info!(
        "Loading model '{}' from {} ({} file(s))",
        id,
        source.config_path.parent().unwrap_or(Path::new(".")).display(),
        source.weights.len()
    );

    let tokenizer = ByteTokenizer::new(
        descriptor.vocab_size,
        descriptor.bos_token_id,
        descriptor.eos_token_id,
    )
    .map_err(|e| ModelLoadError::ArchitectureMismatch(e.to_string()))?;

    let model: Arc<dyn ForwardModel> =
        Arc::new(load_recurrent_ranker(descriptor, &source.weights)?);
    let path = source
        .weights
        .first()
        .cloned()
        .unwrap_or_else(|| source.config_path.clone());

    let handle = ModelHandle::place(id, path, model, tokenizer, devices, options)?;
    if options.warmup {
        handle
            .warmup(devices)
            .map_err(|e| ModelLoadError::Corrupted(format!("warmup failed: {}", e)))?;
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, StaticProbe};
    use crate::testing::{tiny_descriptor, write_model_dir};

    fn pool(memory: u64) -> DevicePool {
        let probe = StaticProbe::uniform(DeviceKind::Npu, 2, memory);
        DevicePool::from_spec("npu:0,1", &probe).unwrap()
    }

    #[test]
    fn test_load_single_model_with_id_override() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path(), &tiny_descriptor());

        let options = InitOptions {
            model_id: Some("ranker".to_string()),
            warmup: true,
            ..Default::default()
        };
        let handles = SafeTensorsLoader.load(dir.path(), &pool(1 << 24), &options).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id(), "ranker");
        assert_eq!(handles[0].tokenizer().eos_token_id(), 257);
    }

    #[test]
    fn test_load_multi_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(&dir.path().join("news"), &tiny_descriptor());
        let named = ArchitectureDescriptor {
            model_id: Some("video-v2".to_string()),
            ..tiny_descriptor()
        };
        write_model_dir(&dir.path().join("video"), &named);

        let handles = SafeTensorsLoader
            .load(dir.path(), &pool(1 << 24), &InitOptions::default())
            .unwrap();
        let ids: Vec<_> = handles.iter().map(|h| h.id().to_string()).collect();
        assert_eq!(ids, vec!["news", "video-v2"]);
    }

    #[test]
    fn test_failed_load_releases_reservations() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(&dir.path().join("a"), &tiny_descriptor());
        // Second model has an unsupported architecture
        let broken = ArchitectureDescriptor {
            model_type: "transformer".to_string(),
            ..tiny_descriptor()
        };
        write_model_dir(&dir.path().join("b"), &broken);

        let devices = pool(1 << 24);
        let err = SafeTensorsLoader
            .load(dir.path(), &devices, &InitOptions::default())
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::ArchitectureMismatch(_)));
        for device in devices.devices() {
            assert_eq!(device.arena().used(), 0);
        }
    }

    #[test]
    fn test_weights_larger_than_device() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path(), &tiny_descriptor());
        let err = SafeTensorsLoader
            .load(dir.path(), &pool(1024), &InitOptions::default())
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::OutOfMemory(_)));
    }
}
