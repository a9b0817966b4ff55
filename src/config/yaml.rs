use std::path::Path;

use serde::Deserialize;

use super::{ConfigError, ConfigResult};
use crate::core::capture::CaptureConfig;
use crate::core::playback::PlaybackConfig;
use crate::core::session::{FunctionDeclaration, Modality};

/// Complete YAML configuration structure
///
/// All fields are optional; anything left out falls back to the environment
/// and then to built-in defaults. `capture` and `playback` sections are
/// partial: unspecified keys keep their defaults.
///
/// # Example YAML structure
/// ```yaml
/// session:
///   api_key: "your-gemini-key"
///   model: "models/gemini-2.0-flash-exp"
///   voice: "Puck"
///   system_instruction: "You are a helpful voice assistant."
///   response_modalities: ["AUDIO"]
///   temperature: 0.7
///   input_transcription: true
///   output_transcription: true
///   session_resumption: true
///   tools:
///     - name: "lookup_weather"
///       description: "Current weather for a city"
///       parameters:
///         type: "object"
///         properties:
///           city: { type: "string" }
///
/// capture:
///   frame_samples: 2048
///   silence_duration_ms: 1500
///
/// playback:
///   initial_buffer_delay: 0.15
///
/// logging:
///   level: "debug"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub session: Option<SessionYaml>,
    pub capture: Option<CaptureConfig>,
    pub playback: Option<PlaybackConfig>,
    pub logging: Option<LoggingYaml>,
}

/// Session settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Prebuilt voice name
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub response_modalities: Option<Vec<Modality>>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub input_transcription: Option<bool>,
    pub output_transcription: Option<bool>,
    pub session_resumption: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    pub tools: Option<Vec<FunctionDeclaration>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingYaml {
    pub level: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> ConfigResult<Self> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
