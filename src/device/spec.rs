//! Device-selection string parsing
//!
//! Grammar: `"auto" | token ("," token)*` where a token is `kind:index`,
//! a bare `index` (reusing the previous token's kind) or `cpu`.
//! Parsing is independent from allocation; [`DevicePool::resolve`] consumes
//! the result.
//!
//! [`DevicePool::resolve`]: super::DevicePool::resolve

use std::str::FromStr;

use crate::error::DeviceError;

use super::{DeviceId, DeviceKind};

/// Parsed device selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Pick the best available device
    Auto,
    /// Use exactly these devices, in order
    Explicit(Vec<DeviceId>),
}

impl DeviceSelection {
    /// Parse a device-selection string such as `"npu:0,1"` or `"auto"`.
    pub fn parse(spec: &str) -> Result<Self, DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidSpec {
            spec: spec.to_string(),
            reason,
        };

        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty device spec".to_string()));
        }
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(DeviceSelection::Auto);
        }

        let mut devices: Vec<DeviceId> = Vec::new();
        let mut current_kind: Option<DeviceKind> = None;

        for raw in trimmed.split(',') {
            let token = raw.trim();
            if token.is_empty() {
                return Err(invalid("empty device token".to_string()));
            }

            let id = match token.split_once(':') {
                Some((kind, index)) => {
                    let kind: DeviceKind = kind.trim().parse().map_err(invalid)?;
                    let index = parse_index(index.trim()).map_err(invalid)?;
                    current_kind = Some(kind);
                    DeviceId::new(kind, index)
                }
                None if token.eq_ignore_ascii_case("cpu") => {
                    current_kind = Some(DeviceKind::Cpu);
                    DeviceId::cpu()
                }
                None => {
                    let kind = current_kind.ok_or_else(|| {
                        invalid(format!("index '{}' has no device kind", token))
                    })?;
                    DeviceId::new(kind, parse_index(token).map_err(invalid)?)
                }
            };

            if devices.contains(&id) {
                return Err(invalid(format!("device {} listed twice", id)));
            }
            devices.push(id);
        }

        Ok(DeviceSelection::Explicit(devices))
    }
}

impl FromStr for DeviceSelection {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_index(s: &str) -> Result<u32, String> {
    s.parse::<u32>()
        .map_err(|_| format!("'{}' is not a device index", s))
}
