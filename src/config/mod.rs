//! Configuration system for genrec
//!
//! Two value objects, both built on demand (no shared mutable defaults):
//! - [`InitOptions`]: applied once when a session is initialized
//! - [`RequestParams`]: applied per chat completion
//!
//! [`RuntimeConfig`] bundles both for loading from a YAML or JSON file.

mod init;
mod request;

pub use init::InitOptions;
pub use request::RequestParams;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// File-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Device-selection string used when none is given on the command line
    #[serde(default)]
    pub devices: Option<String>,

    /// Initialization options
    #[serde(default)]
    pub init: InitOptions,

    /// Default request parameters
    #[serde(default)]
    pub request: RequestParams,
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load by file extension (`.json`, otherwise YAML)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path),
            _ => Self::from_yaml(path),
        }
    }
}
