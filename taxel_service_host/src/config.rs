//! TOML manifest loader with validation.
//!
//! The manifest describes the services this host registers and runs:
//!
//! ```toml
//! [[service]]
//! name = "palm"
//! class = "periodic"
//! interval_ms = 10
//! element_count = 64
//! routine = "generate"
//!
//! [[service]]
//! name = "palm-amplified"
//! class = "sporadic"
//! interval_ms = 1
//! element_count = 64
//! routine = "amplify"
//! source = "palm"
//! gain = 2.5
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use taxel_services::TemporalClass;

/// Manifest loading/validation error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Manifest path
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },
    /// TOML parse error.
    #[error("manifest parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// A manifest entry failed validation.
    #[error("manifest validation: {0}")]
    Validation(String),
}

/// Temporal class of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    /// Runs every `interval_ms`.
    Periodic,
    /// Runs on triggers, at most every `interval_ms`.
    Sporadic,
}

/// Built-in routine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineKind {
    /// Synthesize a travelling wave of taxel responses.
    Generate,
    /// Copy samples from `source`, scaling responses by `gain`.
    Amplify,
}

/// One service entry in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Buffer name.
    pub name: String,
    /// Temporal class.
    pub class: ServiceClass,
    /// Period (periodic) or minimum inter-arrival time (sporadic) [ms].
    pub interval_ms: u64,
    /// Number of elements in the buffer.
    pub element_count: usize,
    /// Which built-in routine drives the buffer.
    pub routine: RoutineKind,
    /// Source buffer for [`RoutineKind::Amplify`].
    #[serde(default)]
    pub source: Option<String>,
    /// Response scale factor for [`RoutineKind::Amplify`].
    #[serde(default = "default_gain")]
    pub gain: f32,
    /// Application-defined request tag.
    #[serde(default)]
    pub request_tag: u32,
    /// Application-defined response tag.
    #[serde(default)]
    pub response_tag: u32,
}

fn default_gain() -> f32 {
    1.0
}

impl ServiceConfig {
    /// Temporal class for registration.
    pub fn temporal_class(&self) -> TemporalClass {
        let interval = Duration::from_millis(self.interval_ms);
        match self.class {
            ServiceClass::Periodic => TemporalClass::Periodic { period: interval },
            ServiceClass::Sporadic => TemporalClass::Sporadic {
                min_interval: interval,
            },
        }
    }
}

/// The whole host manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Services to register, in order. Order matters: an amplifier's
    /// source must appear before the amplifier.
    #[serde(rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Load and validate the manifest at `path`.
pub fn load_config(path: &Path) -> Result<HostConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: HostConfig = toml::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &HostConfig) -> Result<(), ConfigError> {
    if config.services.is_empty() {
        return Err(ConfigError::Validation(
            "manifest declares no services".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for service in &config.services {
        if !names.insert(service.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate service name '{}'",
                service.name
            )));
        }
        if service.class == ServiceClass::Periodic && service.interval_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "service '{}': periodic interval_ms must be > 0",
                service.name
            )));
        }
        if service.element_count == 0 {
            return Err(ConfigError::Validation(format!(
                "service '{}': element_count must be > 0",
                service.name
            )));
        }
        match service.routine {
            RoutineKind::Amplify => {
                let Some(source) = &service.source else {
                    return Err(ConfigError::Validation(format!(
                        "service '{}': amplify requires a source",
                        service.name
                    )));
                };
                if !names.contains(source.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "service '{}': source '{source}' not declared earlier in the manifest",
                        service.name
                    )));
                }
            }
            RoutineKind::Generate => {
                if service.source.is_some() {
                    return Err(ConfigError::Validation(format!(
                        "service '{}': generate takes no source",
                        service.name
                    )));
                }
            }
        }
    }
    Ok(())
}
