//! Client configuration.
//!
//! Settings come from three places. Priority: YAML > environment variables
//! (including `.env`, loaded by the binary) > defaults.
//!
//! # Environment variables
//! - `GEMINI_API_KEY`
//! - `WAAV_LIVE_MODEL`
//! - `WAAV_LIVE_ENDPOINT`
//! - `WAAV_LIVE_VOICE`
//! - `WAAV_LIVE_SYSTEM_INSTRUCTION`
//! - `WAAV_LIVE_LOG_LEVEL`
//!
//! # Example
//! ```rust,no_run
//! use waav_live::config::ClientConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Environment only
//! let config = ClientConfig::from_env()?;
//!
//! // YAML file with environment fallbacks
//! let config = ClientConfig::from_file(Path::new("waav-live.yaml"))?;
//! println!("Model: {}", config.session.model);
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use thiserror::Error;

mod yaml;

pub use yaml::{LoggingYaml, SessionYaml, YamlConfig};

use crate::core::capture::CaptureConfig;
use crate::core::playback::PlaybackConfig;
use crate::core::session::SessionConfig;

pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_MODEL: &str = "WAAV_LIVE_MODEL";
pub const ENV_ENDPOINT: &str = "WAAV_LIVE_ENDPOINT";
pub const ENV_VOICE: &str = "WAAV_LIVE_VOICE";
pub const ENV_SYSTEM_INSTRUCTION: &str = "WAAV_LIVE_SYSTEM_INSTRUCTION";
pub const ENV_LOG_LEVEL: &str = "WAAV_LIVE_LOG_LEVEL";

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(String),
    #[error("Invalid {section} configuration: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Everything the client needs to run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ClientConfig {
    /// Load from environment variables only.
    pub fn from_env() -> ConfigResult<Self> {
        Self::merge(|key| std::env::var(key).ok(), None)
    }

    /// Load a YAML file, falling back to the environment for unset values.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml = YamlConfig::from_file(path)?;
        Self::merge(|key| std::env::var(key).ok(), Some(yaml))
    }

    /// Build a config from an environment lookup and optional YAML.
    pub fn merge<F>(env: F, yaml: Option<YamlConfig>) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let yaml = yaml.unwrap_or_default();
        let session_yaml = yaml.session.unwrap_or_default();

        let mut session = SessionConfig::default();
        if let Some(key) = session_yaml.api_key.or_else(|| env(ENV_API_KEY)) {
            session.api_key = key;
        }
        if let Some(endpoint) = session_yaml.endpoint.or_else(|| env(ENV_ENDPOINT)) {
            session.endpoint = endpoint;
        }
        if let Some(model) = session_yaml.model.or_else(|| env(ENV_MODEL)) {
            session.model = model;
        }
        session.system_instruction = session_yaml
            .system_instruction
            .or_else(|| env(ENV_SYSTEM_INSTRUCTION));
        session.generation.voice_name = session_yaml.voice.or_else(|| env(ENV_VOICE));

        if let Some(modalities) = session_yaml.response_modalities {
            session.generation.response_modalities = modalities;
        }
        session.generation.temperature = session_yaml.temperature;
        session.generation.top_p = session_yaml.top_p;
        session.generation.top_k = session_yaml.top_k;
        session.generation.max_output_tokens = session_yaml.max_output_tokens;
        session.input_audio_transcription = session_yaml.input_transcription.unwrap_or(false);
        session.output_audio_transcription = session_yaml.output_transcription.unwrap_or(false);
        session.session_resumption = session_yaml.session_resumption.unwrap_or(false);
        if let Some(timeout) = session_yaml.connect_timeout_ms {
            session.connect_timeout_ms = timeout;
        }
        if let Some(tools) = session_yaml.tools {
            session.tools = tools;
        }

        let log_level = yaml
            .logging
            .and_then(|l| l.level)
            .or_else(|| env(ENV_LOG_LEVEL))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let capture = yaml.capture.unwrap_or_default();
        session.input_sample_rate = capture.sample_rate;

        Ok(Self {
            session,
            capture,
            playback: yaml.playback.unwrap_or_default(),
            log_level,
        })
    }

    /// Validate every section. The API key is checked here too, so callers
    /// that only inspect config can skip this.
    pub fn validate(&self) -> ConfigResult<()> {
        self.session.validate().map_err(|e| ConfigError::Invalid {
            section: "session",
            message: e.to_string(),
        })?;
        self.capture.validate().map_err(|e| ConfigError::Invalid {
            section: "capture",
            message: e.to_string(),
        })?;
        self.playback.validate().map_err(|e| ConfigError::Invalid {
            section: "playback",
            message: e.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = ClientConfig::merge(env_of(&[]), None).unwrap();
        assert!(config.session.api_key.is_empty());
        assert_eq!(config.session.model, crate::core::session::DEFAULT_MODEL);
        assert_eq!(config.playback.sample_rate, 24000);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_values_apply() {
        let env = env_of(&[
            (ENV_API_KEY, "env-key"),
            (ENV_MODEL, "models/env"),
            (ENV_VOICE, "Puck"),
            (ENV_SYSTEM_INSTRUCTION, "Be brief."),
        ]);
        let config = ClientConfig::merge(env, None).unwrap();
        assert_eq!(config.session.api_key, "env-key");
        assert_eq!(config.session.model, "models/env");
        assert_eq!(config.session.generation.voice_name.as_deref(), Some("Puck"));
        assert_eq!(config.session.system_instruction.as_deref(), Some("Be brief."));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_env() {
        let yaml = YamlConfig::parse(
            "session:\n  api_key: \"yaml-key\"\n  voice: \"Aoede\"\ncapture:\n  sample_rate: 8000\n  band_high_hz: 3400\n",
        )
        .unwrap();
        let env = env_of(&[
            (ENV_API_KEY, "env-key"),
            (ENV_MODEL, "models/env"),
            (ENV_VOICE, "Puck"),
        ]);
        let config = ClientConfig::merge(env, Some(yaml)).unwrap();
        assert_eq!(config.session.api_key, "yaml-key");
        assert_eq!(config.session.model, "models/env");
        assert_eq!(config.session.generation.voice_name.as_deref(), Some("Aoede"));
        assert_eq!(config.session.input_sample_rate, 8000);
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let config = ClientConfig::merge(env_of(&[(ENV_MODEL, "  ")]), None).unwrap();
        assert_eq!(config.session.model, crate::core::session::DEFAULT_MODEL);
    }

    #[test]
    fn test_from_file_reports_invalid_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "session:\n  api_key: \"k\"\nplayback:\n  sample_rate: 0\n",
        )
        .unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                section: "playback",
                ..
            })
        ));
    }
}
