//! Wire records for the bidirectional streaming protocol.
//!
//! Every record is a JSON object with exactly one populated top-level field
//! naming its kind.
//!
//! # Protocol Overview
//!
//! Client records (sent to server):
//! - setup - Model and session configuration, sent exactly once, first
//! - clientContent - Complete user turns
//! - realtimeInput - Streaming audio, text and activity markers
//! - toolResponse - Answers to one toolCall batch
//!
//! Server records (received from server):
//! - setupComplete - Setup acknowledged, content may flow
//! - serverContent - Model turn fragments, interrupted, turnComplete
//! - toolCall - Functions the client must invoke
//! - toolCallCancellation - Previously issued calls to abandon
//! - usageMetadata - Token accounting
//! - goAway - The server will close the connection soon
//! - sessionResumptionUpdate - New resumption handle

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::base::{
    ActivityMarker, Content, ContentPart, EncodedFrame, FunctionCall, FunctionResponse,
    LiveError, LiveResult,
};
use super::config::{FunctionDeclaration, GenerationConfig, Modality, SessionConfig};
use crate::core::audio::pcm;

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

// =============================================================================
// Shared pieces
// =============================================================================

/// Inline binary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 encoded bytes
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl From<&ContentPart> for WirePart {
    fn from(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text(text) => Self {
                text: Some(text.clone()),
                inline_data: None,
            },
            ContentPart::InlineAudio { mime_type, data } => Self {
                text: None,
                inline_data: Some(Blob {
                    mime_type: mime_type.clone(),
                    data: pcm::encode_frame(data),
                }),
            },
        }
    }
}

impl WirePart {
    /// Convert to a domain part. `Ok(None)` for part kinds this client does
    /// not consume (executable code and the like).
    fn into_part(self) -> LiveResult<Option<ContentPart>> {
        if let Some(blob) = self.inline_data {
            let data = pcm::decode_frame(&blob.data).map_err(|e| {
                LiveError::Protocol(format!("invalid base64 in inlineData: {}", e))
            })?;
            return Ok(Some(ContentPart::InlineAudio {
                mime_type: blob.mime_type,
                data: Bytes::from(data),
            }));
        }
        Ok(self.text.map(ContentPart::Text))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

impl From<&Content> for WireContent {
    fn from(content: &Content) -> Self {
        Self {
            role: Some(content.role.clone()),
            parts: content.parts.iter().map(WirePart::from).collect(),
        }
    }
}

// =============================================================================
// Client records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

impl From<&GenerationConfig> for WireGenerationConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            response_modalities: config.response_modalities.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_output_tokens: config.max_output_tokens,
            speech_config: config.voice_name.as_ref().map(|name| SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: name.clone(),
                    },
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// The one-time `setup` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: WireGenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumption>,
}

impl From<&SessionConfig> for Setup {
    fn from(config: &SessionConfig) -> Self {
        let tools = if config.tools.is_empty() {
            Vec::new()
        } else {
            vec![WireTool {
                function_declarations: config.tools.clone(),
            }]
        };
        let session_resumption = (config.session_resumption || config.resumption_handle.is_some())
            .then(|| SessionResumption {
                handle: config.resumption_handle.clone(),
            });

        Self {
            model: config.model.clone(),
            generation_config: WireGenerationConfig::from(&config.generation),
            system_instruction: config.system_instruction.as_ref().map(|text| WireContent {
                role: None,
                parts: vec![WirePart {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
            tools,
            input_audio_transcription: config.input_audio_transcription.then(Empty::default),
            output_audio_transcription: config.output_audio_transcription.then(Empty::default),
            session_resumption,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<WireContent>,
    pub turn_complete: bool,
}

/// Streaming input. Exactly one field is set per record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_start: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_end: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

impl RealtimeInput {
    pub fn audio(frame: &EncodedFrame) -> Self {
        Self {
            audio: Some(Blob {
                mime_type: pcm::pcm16_mime_type(frame.sample_rate),
                data: frame.data.clone(),
            }),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn activity(marker: ActivityMarker) -> Self {
        match marker {
            ActivityMarker::ActivityStart => Self {
                activity_start: Some(Empty::default()),
                ..Default::default()
            },
            ActivityMarker::ActivityEnd => Self {
                activity_end: Some(Empty::default()),
                ..Default::default()
            },
            ActivityMarker::AudioStreamEnd => Self {
                audio_stream_end: Some(true),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Client-originated records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutgoingMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl OutgoingMessage {
    pub fn client_content(turns: &[Content], turn_complete: bool) -> Self {
        Self::ClientContent(ClientContent {
            turns: turns.iter().map(WireContent::from).collect(),
            turn_complete,
        })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::ClientContent(_) => "clientContent",
            Self::RealtimeInput(_) => "realtimeInput",
            Self::ToolResponse(_) => "toolResponse",
        }
    }

    pub fn to_json(&self) -> LiveResult<String> {
        serde_json::to_string(self).map_err(|e| LiveError::Serialization(e.to_string()))
    }
}

// =============================================================================
// Server records
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTranscription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerContent {
    #[serde(default)]
    model_turn: Option<WireContent>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    generation_complete: bool,
    #[serde(default)]
    input_transcription: Option<WireTranscription>,
    #[serde(default)]
    output_transcription: Option<WireTranscription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolCallCancellation {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGoAway {
    #[serde(default)]
    time_left: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResumptionUpdate {
    #[serde(default)]
    new_handle: Option<String>,
    #[serde(default)]
    resumable: bool,
}

/// Every server record kind, all optional, for classification.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIncoming {
    setup_complete: Option<Value>,
    server_content: Option<WireServerContent>,
    tool_call: Option<WireToolCall>,
    tool_call_cancellation: Option<WireToolCallCancellation>,
    go_away: Option<WireGoAway>,
    session_resumption_update: Option<WireResumptionUpdate>,
    usage_metadata: Option<Value>,
}

/// One `serverContent` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    pub parts: Vec<ContentPart>,
    pub interrupted: bool,
    pub turn_complete: bool,
    pub generation_complete: bool,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
}

/// Server-originated records.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    SetupComplete,
    ServerContent(ServerContent),
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    UsageMetadata(Value),
    GoAway { time_left: Option<String> },
    SessionResumptionUpdate {
        new_handle: Option<String>,
        resumable: bool,
    },
}

impl IncomingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetupComplete => "setupComplete",
            Self::ServerContent(_) => "serverContent",
            Self::ToolCall(_) => "toolCall",
            Self::ToolCallCancellation(_) => "toolCallCancellation",
            Self::UsageMetadata(_) => "usageMetadata",
            Self::GoAway { .. } => "goAway",
            Self::SessionResumptionUpdate { .. } => "sessionResumptionUpdate",
        }
    }
}

/// A classified server frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    pub message: IncomingMessage,
    /// `usageMetadata` that arrived alongside the primary record
    pub usage: Option<Value>,
}

/// Parse and classify one server frame by its single populated field.
///
/// `usageMetadata` may accompany one other record; any other combination,
/// or a frame with no known field, is a protocol error.
pub fn parse_incoming(text: &str) -> LiveResult<ParsedFrame> {
    let raw: RawIncoming = serde_json::from_str(text)
        .map_err(|e| LiveError::Protocol(format!("unparseable frame: {}", e)))?;

    let mut populated: Vec<&'static str> = Vec::new();
    if raw.setup_complete.is_some() {
        populated.push("setupComplete");
    }
    if raw.server_content.is_some() {
        populated.push("serverContent");
    }
    if raw.tool_call.is_some() {
        populated.push("toolCall");
    }
    if raw.tool_call_cancellation.is_some() {
        populated.push("toolCallCancellation");
    }
    if raw.go_away.is_some() {
        populated.push("goAway");
    }
    if raw.session_resumption_update.is_some() {
        populated.push("sessionResumptionUpdate");
    }

    match populated.len() {
        0 => match raw.usage_metadata {
            Some(usage) => Ok(ParsedFrame {
                message: IncomingMessage::UsageMetadata(usage),
                usage: None,
            }),
            None => Err(LiveError::Protocol(
                "frame has no recognized field".to_string(),
            )),
        },
        1 => {
            let usage = raw.usage_metadata;
            let message = if raw.setup_complete.is_some() {
                IncomingMessage::SetupComplete
            } else if let Some(content) = raw.server_content {
                IncomingMessage::ServerContent(convert_server_content(content)?)
            } else if let Some(call) = raw.tool_call {
                IncomingMessage::ToolCall(call.function_calls)
            } else if let Some(cancel) = raw.tool_call_cancellation {
                IncomingMessage::ToolCallCancellation(cancel.ids)
            } else if let Some(go_away) = raw.go_away {
                IncomingMessage::GoAway {
                    time_left: go_away.time_left,
                }
            } else if let Some(update) = raw.session_resumption_update {
                IncomingMessage::SessionResumptionUpdate {
                    new_handle: update.new_handle,
                    resumable: update.resumable,
                }
            } else {
                return Err(LiveError::Protocol(
                    "frame has no recognized field".to_string(),
                ));
            };
            Ok(ParsedFrame { message, usage })
        }
        _ => Err(LiveError::Protocol(format!(
            "frame has multiple populated fields: {}",
            populated.join(", ")
        ))),
    }
}

fn convert_server_content(content: WireServerContent) -> LiveResult<ServerContent> {
    let mut parts = Vec::new();
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(part) = part.into_part()? {
                parts.push(part);
            }
        }
    }

    Ok(ServerContent {
        parts,
        interrupted: content.interrupted,
        turn_complete: content.turn_complete,
        generation_complete: content.generation_complete,
        input_transcription: content.input_transcription.map(|t| t.text),
        output_transcription: content.output_transcription.map(|t| t.text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::config::FunctionDeclaration;
    use serde_json::json;

    #[test]
    fn test_setup_serialization() {
        let mut config = SessionConfig::new("k");
        config.system_instruction = Some("Be brief".into());
        config.generation.voice_name = Some("Puck".into());
        config.output_audio_transcription = true;
        config.tools = vec![FunctionDeclaration {
            name: "search".into(),
            description: Some("Search".into()),
            parameters: None,
        }];

        let msg = OutgoingMessage::Setup(Setup::from(&config));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief");
        assert_eq!(setup["tools"][0]["functionDeclarations"][0]["name"], "search");
        assert_eq!(setup["outputAudioTranscription"], json!({}));
        assert!(setup.get("inputAudioTranscription").is_none());
        assert!(setup.get("sessionResumption").is_none());
    }

    #[test]
    fn test_setup_with_resumption_handle() {
        let mut config = SessionConfig::new("k");
        config.resumption_handle = Some("h1".into());
        let value = serde_json::to_value(OutgoingMessage::Setup(Setup::from(&config))).unwrap();
        assert_eq!(value["setup"]["sessionResumption"]["handle"], "h1");
    }

    #[test]
    fn test_client_content_serialization() {
        let msg = OutgoingMessage::client_content(&[Content::user_text("hi")], true);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "clientContent": {
                    "turns": [{"role": "user", "parts": [{"text": "hi"}]}],
                    "turnComplete": true
                }
            })
        );
    }

    #[test]
    fn test_realtime_input_variants() {
        let frame = EncodedFrame {
            seq: 0,
            sample_rate: 16000,
            data: "AAA=".into(),
        };
        let audio = serde_json::to_value(OutgoingMessage::RealtimeInput(RealtimeInput::audio(&frame))).unwrap();
        assert_eq!(audio["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(audio["realtimeInput"]["audio"]["data"], "AAA=");

        let end = serde_json::to_value(OutgoingMessage::RealtimeInput(RealtimeInput::activity(
            ActivityMarker::AudioStreamEnd,
        )))
        .unwrap();
        assert_eq!(end, json!({"realtimeInput": {"audioStreamEnd": true}}));
    }

    #[test]
    fn test_tool_response_serialization() {
        let msg = OutgoingMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: "a".into(),
                name: "f".into(),
                response: json!({"result": 1}),
            }],
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["toolResponse"]["functionResponses"][0]["id"], "a");
    }

    #[test]
    fn test_parse_setup_complete() {
        let frame = parse_incoming(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(frame.message, IncomingMessage::SetupComplete);
        assert!(frame.usage.is_none());
    }

    #[test]
    fn test_parse_server_content_parts() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"text":"Hi"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}}
        ]},"turnComplete":true}}"#;
        let frame = parse_incoming(text).unwrap();
        let IncomingMessage::ServerContent(content) = frame.message else {
            panic!("expected serverContent");
        };
        assert_eq!(content.parts.len(), 2);
        assert_eq!(content.parts[0], ContentPart::text("Hi"));
        assert_eq!(content.parts[1], ContentPart::pcm16(24000, vec![1u8, 2]));
        assert!(content.turn_complete);
        assert!(!content.interrupted);
    }

    #[test]
    fn test_parse_transcriptions() {
        let frame = parse_incoming(
            r#"{"serverContent":{"outputTranscription":{"text":"hello"}}}"#,
        )
        .unwrap();
        let IncomingMessage::ServerContent(content) = frame.message else {
            panic!("expected serverContent");
        };
        assert_eq!(content.output_transcription.as_deref(), Some("hello"));
    }

    #[test]
    fn test_parse_tool_call() {
        let frame = parse_incoming(
            r#"{"toolCall":{"functionCalls":[{"id":"1","name":"f","args":{"q":"x"}}]}}"#,
        )
        .unwrap();
        let IncomingMessage::ToolCall(calls) = frame.message else {
            panic!("expected toolCall");
        };
        assert_eq!(calls[0].id, "1");
        assert_eq!(calls[0].args["q"], "x");
    }

    #[test]
    fn test_usage_rides_along() {
        let frame = parse_incoming(
            r#"{"serverContent":{"turnComplete":true},"usageMetadata":{"totalTokenCount":5}}"#,
        )
        .unwrap();
        assert_eq!(frame.message.kind(), "serverContent");
        assert_eq!(frame.usage.unwrap()["totalTokenCount"], 5);

        let alone = parse_incoming(r#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap();
        assert_eq!(alone.message.kind(), "usageMetadata");
    }

    #[test]
    fn test_protocol_errors() {
        assert!(matches!(parse_incoming("{}"), Err(LiveError::Protocol(_))));
        assert!(matches!(parse_incoming("not json"), Err(LiveError::Protocol(_))));
        assert!(matches!(
            parse_incoming(r#"{"unknownThing":{}}"#),
            Err(LiveError::Protocol(_))
        ));
        assert!(matches!(
            parse_incoming(r#"{"setupComplete":{},"toolCall":{"functionCalls":[]}}"#),
            Err(LiveError::Protocol(_))
        ));
        assert!(matches!(
            parse_incoming(
                r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"!!"}}]}}}"#
            ),
            Err(LiveError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_resumption_and_go_away() {
        let frame = parse_incoming(
            r#"{"sessionResumptionUpdate":{"newHandle":"h2","resumable":true}}"#,
        )
        .unwrap();
        assert_eq!(
            frame.message,
            IncomingMessage::SessionResumptionUpdate {
                new_handle: Some("h2".into()),
                resumable: true
            }
        );

        let frame = parse_incoming(r#"{"goAway":{"timeLeft":"5s"}}"#).unwrap();
        assert_eq!(
            frame.message,
            IncomingMessage::GoAway {
                time_left: Some("5s".into())
            }
        );
    }
}
