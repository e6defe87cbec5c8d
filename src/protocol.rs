//! Wire protocol for the multiplexed agent channel
//!
//! Everything crossing the WebSocket is a JSON envelope discriminated by
//! `mime_type`. Binary payloads (PCM audio, JPEG frames) travel as base64
//! text inside the envelope `data` field.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Envelope sent to the agent server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub mime_type: String,
    pub data: String,
}

impl OutboundEnvelope {
    /// A typed chat message; `data` is plain text.
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            data: data.into(),
        }
    }

    /// A microphone PCM chunk; `data` is base64.
    pub fn pcm_audio(pcm: &[u8]) -> Self {
        Self {
            mime_type: "audio/pcm".to_string(),
            data: encode_base64(pcm),
        }
    }

    /// An image payload already base64-encoded by the frame sampler or the
    /// upload path.
    pub fn image(mime_type: impl Into<String>, base64_data: String) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: base64_data,
        }
    }
}

/// Envelope received from the agent server
///
/// Every field is defaulted so partial frames parse: a turn boundary arrives
/// as a bare `{"turn_complete": true}` with no `mime_type` at all.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// Structured payload of a `tool_call` / `tool_result` envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPayload {
    pub name: String,
    pub payload: Value,
}

impl ToolPayload {
    fn from_data(data: &Value) -> Self {
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("N/A")
            .to_string();
        let payload = data
            .get("args")
            .or_else(|| data.get("response"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Self { name, payload }
    }
}

/// A classified inbound envelope
///
/// The finite `mime_type` set becomes a closed enum so dispatch is an
/// exhaustive match; everything else (including `text/input_translated`,
/// which the server emits but this client does not render) lands in the
/// explicit ignore arm.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Partial transcription of the user's speech
    UserTranscription(String),
    /// Partial transcription of the agent's speech
    AgentTranscription(String),
    /// Final agent text, rendered immediately
    AgentText(String),
    /// Agent audio, decoded from base64 PCM
    AudioChunk(Vec<u8>),
    ToolCall(ToolPayload),
    ToolResult(ToolPayload),
    Ignored,
}

impl InboundEvent {
    pub fn classify(envelope: &InboundEnvelope) -> Self {
        match envelope.mime_type.as_str() {
            "text/input_transcription" => Self::UserTranscription(text_data(envelope)),
            "text/transcription" => Self::AgentTranscription(text_data(envelope)),
            "text/plain" => Self::AgentText(text_data(envelope)),
            "audio/pcm" => Self::AudioChunk(decode_base64(&text_data(envelope))),
            "tool_call" => Self::ToolCall(ToolPayload::from_data(&envelope.data)),
            "tool_result" => Self::ToolResult(ToolPayload::from_data(&envelope.data)),
            _ => Self::Ignored,
        }
    }

    /// Whether this event is agent-side activity that supersedes a pending
    /// user-speech fragment.
    pub fn supersedes_user_speech(&self) -> bool {
        matches!(
            self,
            Self::AgentTranscription(_)
                | Self::AgentText(_)
                | Self::AudioChunk(_)
                | Self::ToolCall(_)
                | Self::ToolResult(_)
        )
    }
}

fn text_data(envelope: &InboundEnvelope) -> String {
    envelope
        .data
        .as_str()
        .map(str::to_string)
        .unwrap_or_default()
}

/// Base64-encode raw bytes for the wire.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a base64 payload.
///
/// Malformed input is logged and substituted with an empty payload; decode
/// failures never escape the dispatch loop.
pub fn decode_base64(data: &str) -> Vec<u8> {
    match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to decode base64 payload: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_text_serialization() {
        let json = serde_json::to_string(&OutboundEnvelope::text("hello")).unwrap();
        assert!(json.contains(r#""mime_type":"text/plain""#));
        assert!(json.contains(r#""data":"hello""#));
    }

    #[test]
    fn test_outbound_pcm_is_base64() {
        let envelope = OutboundEnvelope::pcm_audio(&[0x01, 0x02, 0x03]);
        assert_eq!(envelope.mime_type, "audio/pcm");
        assert_eq!(decode_base64(&envelope.data), vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_bare_turn_complete_parses() {
        let envelope: InboundEnvelope = serde_json::from_str(r#"{"turn_complete": true}"#).unwrap();
        assert!(envelope.turn_complete);
        assert!(envelope.mime_type.is_empty());
        assert_eq!(InboundEvent::classify(&envelope), InboundEvent::Ignored);
    }

    #[test]
    fn test_classify_transcriptions() {
        let envelope: InboundEnvelope =
            serde_json::from_str(r#"{"mime_type": "text/input_transcription", "data": "hi"}"#)
                .unwrap();
        assert_eq!(
            InboundEvent::classify(&envelope),
            InboundEvent::UserTranscription("hi".to_string())
        );

        let envelope: InboundEnvelope =
            serde_json::from_str(r#"{"mime_type": "text/transcription", "data": "there"}"#)
                .unwrap();
        assert_eq!(
            InboundEvent::classify(&envelope),
            InboundEvent::AgentTranscription("there".to_string())
        );
    }

    #[test]
    fn test_classify_tool_call() {
        let envelope: InboundEnvelope = serde_json::from_value(json!({
            "mime_type": "tool_call",
            "data": {"name": "get_balance", "args": {"account": "checking"}}
        }))
        .unwrap();
        match InboundEvent::classify(&envelope) {
            InboundEvent::ToolCall(payload) => {
                assert_eq!(payload.name, "get_balance");
                assert_eq!(payload.payload, json!({"account": "checking"}));
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_classify_tool_result_uses_response() {
        let envelope: InboundEnvelope = serde_json::from_value(json!({
            "mime_type": "tool_result",
            "data": {"name": "get_balance", "response": {"balance": 12.5}}
        }))
        .unwrap();
        match InboundEvent::classify(&envelope) {
            InboundEvent::ToolResult(payload) => {
                assert_eq!(payload.payload, json!({"balance": 12.5}));
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_mime_type_is_ignored() {
        let envelope: InboundEnvelope =
            serde_json::from_str(r#"{"mime_type": "text/input_translated", "data": "hola"}"#)
                .unwrap();
        assert_eq!(InboundEvent::classify(&envelope), InboundEvent::Ignored);
    }

    #[test]
    fn test_base64_round_trip() {
        for bytes in [vec![], vec![0u8], vec![255u8; 7], (0..=255u8).collect::<Vec<_>>()] {
            assert_eq!(decode_base64(&encode_base64(&bytes)), bytes);
        }
    }

    #[test]
    fn test_malformed_base64_yields_empty_payload() {
        assert!(decode_base64("not base64!!").is_empty());
    }
}
