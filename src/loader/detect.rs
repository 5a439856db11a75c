//! Model source detection

use std::path::{Path, PathBuf};

use crate::error::ModelLoadError;

/// Name of the architecture descriptor next to the weights
pub const CONFIG_FILE: &str = "config.json";

/// One model found under a model path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    /// Fallback id: the model's directory name
    pub name: String,
    /// Weight files; more than one for sharded models
    pub weights: Vec<PathBuf>,
    /// Path to `config.json`
    pub config_path: PathBuf,
}

/// Detect the models under a path
///
/// The path can be:
/// - A model directory (`config.json` + `model.safetensors` or shards)
/// - A direct path to a `.safetensors` file with `config.json` beside it
/// - A directory whose subdirectories are model directories
pub fn detect_model_sources<P: AsRef<Path>>(path: P) -> Result<Vec<ModelSource>, ModelLoadError> {
    let path = path.as_ref();

    if path.is_file() {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext != "safetensors" {
            return Err(ModelLoadError::Corrupted(format!(
                "unsupported model file format: .{}",
                ext
            )));
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = if path.file_stem().map_or(false, |s| s == "model") {
            dir_name(dir)
        } else {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        return Ok(vec![ModelSource {
            name,
            weights: vec![path.to_path_buf()],
            config_path: require_config(dir)?,
        }]);
    }

    if !path.is_dir() {
        return Err(ModelLoadError::NotFound(path.to_path_buf()));
    }

    if let Some(weights) = find_weights_in_dir(path) {
        return Ok(vec![ModelSource {
            name: dir_name(path),
            weights,
            config_path: require_config(path)?,
        }]);
    }

    // Multi-model layout: one model directory per subdirectory
    let mut sources = Vec::new();
    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join(CONFIG_FILE).exists())
        .collect();
    subdirs.sort();

    for dir in subdirs {
        let weights = find_weights_in_dir(&dir).ok_or_else(|| {
            ModelLoadError::MissingWeights(format!("no .safetensors files in {}", dir.display()))
        })?;
        sources.push(ModelSource {
            name: dir_name(&dir),
            weights,
            config_path: dir.join(CONFIG_FILE),
        });
    }

    if sources.is_empty() {
        return Err(ModelLoadError::MissingWeights(format!(
            "no supported model files found in directory: {}",
            path.display()
        )));
    }
    Ok(sources)
}

/// Weight files in a directory: `model.safetensors`, then shards, then any
/// `.safetensors` file, in sorted order
fn find_weights_in_dir(dir: &Path) -> Option<Vec<PathBuf>> {
    let single = dir.join("model.safetensors");
    if single.exists() {
        return Some(vec![single]);
    }
    ["model-*-of-*.safetensors", "*.safetensors"]
        .iter()
        .map(|pattern| glob_sorted(dir, pattern))
        .find(|files| !files.is_empty())
}

fn glob_sorted(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full_pattern = dir.join(pattern);
    let Some(pattern) = full_pattern.to_str() else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .map(|paths| paths.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

fn require_config(dir: &Path) -> Result<PathBuf, ModelLoadError> {
    let config = dir.join(CONFIG_FILE);
    if config.exists() {
        Ok(config)
    } else {
        Err(ModelLoadError::NotFound(config))
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string())
}
