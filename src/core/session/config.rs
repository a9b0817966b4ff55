//! Session configuration.
//!
//! Everything that goes into the `setup` record, plus the connection
//! parameters (endpoint, key, timeout) used to open the socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::base::{LiveError, LiveResult};

/// Bidirectional streaming endpoint of the Generative Language API.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default model id.
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Microphone audio is sent at 16kHz.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16000;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Generation
// =============================================================================

/// Output modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Audio,
}

/// Generation parameters sent in `setup.generationConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    /// Prebuilt voice name (e.g. "Puck", "Aoede")
    pub voice_name: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            response_modalities: vec![Modality::Audio],
            temperature: None,
            top_p: None,
            top_k: None,
            max_output_tokens: None,
            voice_name: None,
        }
    }
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

// =============================================================================
// Session
// =============================================================================

/// Configuration for one live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// API key appended to the endpoint as `?key=`
    pub api_key: String,

    /// WebSocket endpoint
    pub endpoint: String,

    /// Model id, e.g. "models/gemini-2.0-flash-exp"
    pub model: String,

    pub generation: GenerationConfig,

    pub system_instruction: Option<String>,

    /// Tool declarations offered to the model
    pub tools: Vec<FunctionDeclaration>,

    /// Ask the service to transcribe microphone audio
    pub input_audio_transcription: bool,

    /// Ask the service to transcribe model audio
    pub output_audio_transcription: bool,

    /// Request resumption handles from the service
    pub session_resumption: bool,

    /// Handle from a previous session to resume
    pub resumption_handle: Option<String>,

    /// Socket-open deadline in milliseconds
    pub connect_timeout_ms: u64,

    /// Sample rate of realtime audio sent to the service
    pub input_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            generation: GenerationConfig::default(),
            system_instruction: None,
            tools: Vec::new(),
            input_audio_transcription: false,
            output_audio_transcription: false,
            session_resumption: false,
            resumption_handle: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            input_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
        }
    }
}

impl SessionConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Check the configuration is usable before connecting.
    pub fn validate(&self) -> LiveResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(LiveError::InvalidConfiguration(
                "API key is required".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(LiveError::InvalidConfiguration(
                "Model is required".to_string(),
            ));
        }
        if self.generation.response_modalities.is_empty() {
            return Err(LiveError::InvalidConfiguration(
                "At least one response modality is required".to_string(),
            ));
        }
        if let Some(t) = self.generation.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(LiveError::InvalidConfiguration(format!(
                "Temperature must be between 0.0 and 2.0, got {}",
                t
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(LiveError::InvalidConfiguration(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        if self.input_sample_rate == 0 {
            return Err(LiveError::InvalidConfiguration(
                "input_sample_rate must be positive".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for tool in &self.tools {
            if !names.insert(tool.name.as_str()) {
                return Err(LiveError::InvalidConfiguration(format!(
                    "Duplicate tool declaration: {}",
                    tool.name
                )));
            }
        }
        self.build_url().map(|_| ())
    }

    /// Endpoint URL with the API key attached.
    pub fn build_url(&self) -> LiveResult<Url> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            LiveError::InvalidConfiguration(format!("Invalid endpoint '{}': {}", self.endpoint, e))
        })?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(LiveError::InvalidConfiguration(format!(
                    "Endpoint scheme must be ws or wss, got {}",
                    other
                )));
            }
        }
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    /// Whether the model was asked to answer with audio.
    pub fn wants_audio(&self) -> bool {
        self.generation
            .response_modalities
            .contains(&Modality::Audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.input_sample_rate, 16000);
        assert!(config.wants_audio());
    }

    #[test]
    fn test_api_key_required() {
        let result = SessionConfig::default().validate();
        assert!(matches!(result, Err(LiveError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_build_url_appends_key() {
        let config = SessionConfig::new("secret");
        let url = config.build_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("generativelanguage.googleapis.com"));
        assert_eq!(url.query(), Some("key=secret"));
    }

    #[test]
    fn test_rejects_http_endpoint() {
        let config = SessionConfig {
            endpoint: "https://example.com".to_string(),
            ..SessionConfig::new("k")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_temperature() {
        let mut config = SessionConfig::new("k");
        config.generation.temperature = Some(3.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_tools() {
        let mut config = SessionConfig::new("k");
        let decl = FunctionDeclaration {
            name: "search".into(),
            description: None,
            parameters: None,
        };
        config.tools = vec![decl.clone(), decl];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_modality_serialization() {
        assert_eq!(serde_json::to_string(&Modality::Audio).unwrap(), "\"AUDIO\"");
    }
}
