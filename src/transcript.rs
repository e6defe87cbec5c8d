//! Transcript assembly
//!
//! Turns the interleaved stream of partial transcriptions, agent text, audio
//! chunks, and tool traffic into an ordered log of finished entries. Partial
//! speech is held in single-slot buffers, one per side, and only the agent
//! side is ever promoted into the log.

use crate::audio::playback::PlaybackDevice;
use crate::protocol::{InboundEnvelope, InboundEvent, ToolPayload};
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevLogKind {
    ToolCall,
    ToolResult,
}

impl fmt::Display for DevLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolCall => write!(f, "TOOL CALL"),
            Self::ToolResult => write!(f, "TOOL RESULT"),
        }
    }
}

/// A finished, ordered transcript entry
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    UserText {
        text: String,
        at: DateTime<Local>,
    },
    /// Marker for an image the user sent; the payload itself is not kept.
    UserImage {
        mime_type: String,
        at: DateTime<Local>,
    },
    AgentText {
        text: String,
        at: DateTime<Local>,
    },
    /// Tool traffic, only recorded in dev mode
    DevLog {
        kind: DevLogKind,
        name: String,
        payload: serde_json::Value,
        at: DateTime<Local>,
    },
}

impl TranscriptEntry {
    pub fn at(&self) -> DateTime<Local> {
        match self {
            Self::UserText { at, .. }
            | Self::UserImage { at, .. }
            | Self::AgentText { at, .. }
            | Self::DevLog { at, .. } => *at,
        }
    }
}

impl fmt::Display for TranscriptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserText { text, .. } => write!(f, "You: {}", text),
            Self::UserImage { mime_type, .. } => write!(f, "You: [image {}]", mime_type),
            Self::AgentText { text, .. } => write!(f, "Agent: {}", text),
            Self::DevLog {
                kind,
                name,
                payload,
                ..
            } => {
                let pretty = serde_json::to_string_pretty(payload)
                    .unwrap_or_else(|_| payload.to_string());
                write!(f, "[{}] | Name: {}\n{}", kind, name, pretty)
            }
        }
    }
}

/// Append-only entry log with an optional listener for rendering.
#[derive(Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
    listener: Option<mpsc::UnboundedSender<TranscriptEntry>>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: mpsc::UnboundedSender<TranscriptEntry>) -> Self {
        Self {
            entries: Vec::new(),
            listener: Some(listener),
        }
    }

    pub fn append(&mut self, entry: TranscriptEntry) {
        if let Some(listener) = &self.listener {
            let _ = listener.send(entry.clone());
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }
}

/// Assembles inbound envelopes into transcript entries.
///
/// Holds at most one pending fragment per side. Agent speech accretes until
/// `turn_complete` promotes it; user speech is display-suppressed and only
/// ever discarded, either when the agent responds or when the user submits
/// text by hand.
#[derive(Default)]
pub struct TranscriptAssembler {
    user_partial: String,
    agent_partial: String,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches one envelope. Audio goes straight to `playback`; text
    /// accumulates in the side buffers; tool traffic becomes a dev log
    /// entry when `dev_mode` is set.
    pub fn handle(
        &mut self,
        envelope: &InboundEnvelope,
        log: &mut TranscriptLog,
        playback: Option<&mut (dyn PlaybackDevice + 'static)>,
        dev_mode: bool,
    ) {
        if envelope.interrupted {
            debug!("agent turn interrupted");
        }
        if envelope.turn_complete {
            self.finish_turn(log);
            return;
        }

        let event = InboundEvent::classify(envelope);
        if event.supersedes_user_speech() && !self.user_partial.is_empty() {
            self.discard_user_speech();
        }

        match event {
            InboundEvent::UserTranscription(text) => {
                // Each partial replaces the last; the buffer never renders
                self.user_partial = text;
            }
            InboundEvent::AgentTranscription(text) => {
                self.agent_partial = text;
            }
            InboundEvent::AgentText(text) => self.push_agent_text(text, log),
            InboundEvent::AudioChunk(pcm) => match playback {
                Some(device) => device.play(&pcm),
                None => trace!(bytes = pcm.len(), "no playback device, dropping audio"),
            },
            InboundEvent::ToolCall(payload) => {
                self.push_dev_log(DevLogKind::ToolCall, payload, log, dev_mode)
            }
            InboundEvent::ToolResult(payload) => {
                self.push_dev_log(DevLogKind::ToolResult, payload, log, dev_mode)
            }
            InboundEvent::Ignored => {}
        }
    }

    /// Turn boundary: the agent transcription fragment is promoted to an
    /// entry, the user fragment is dropped unseen.
    fn finish_turn(&mut self, log: &mut TranscriptLog) {
        self.discard_user_speech();
        if !self.agent_partial.is_empty() {
            let text = std::mem::take(&mut self.agent_partial);
            log.append(TranscriptEntry::AgentText {
                text,
                at: Local::now(),
            });
        }
    }

    /// Final agent text renders immediately and clears any transcription
    /// fragment it supersedes.
    fn push_agent_text(&mut self, text: String, log: &mut TranscriptLog) {
        if text.is_empty() {
            return;
        }
        self.agent_partial.clear();
        log.append(TranscriptEntry::AgentText {
            text,
            at: Local::now(),
        });
    }

    fn push_dev_log(
        &mut self,
        kind: DevLogKind,
        tool: ToolPayload,
        log: &mut TranscriptLog,
        dev_mode: bool,
    ) {
        if !dev_mode {
            return;
        }
        log.append(TranscriptEntry::DevLog {
            kind,
            name: tool.name,
            payload: tool.payload,
            at: Local::now(),
        });
    }

    /// Drops the pending user-speech fragment without logging an entry.
    /// Called on agent activity and when the user submits text by hand.
    pub fn discard_user_speech(&mut self) {
        if !self.user_partial.is_empty() {
            debug!("discarding pending user speech fragment");
            self.user_partial.clear();
        }
    }

    /// Connection closed; fragments from the dead session never carry over.
    pub fn reset(&mut self) {
        self.user_partial.clear();
        self.agent_partial.clear();
    }

    #[cfg(test)]
    fn user_partial(&self) -> &str {
        &self.user_partial
    }

    #[cfg(test)]
    fn agent_partial(&self) -> &str {
        &self.agent_partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RecordingPlayback {
        chunks: Vec<Vec<u8>>,
    }

    impl PlaybackDevice for RecordingPlayback {
        fn play(&mut self, pcm: &[u8]) {
            self.chunks.push(pcm.to_vec());
        }
    }

    fn envelope(mime_type: &str, data: serde_json::Value) -> InboundEnvelope {
        serde_json::from_value(json!({"mime_type": mime_type, "data": data})).unwrap()
    }

    fn turn_complete() -> InboundEnvelope {
        serde_json::from_value(json!({"turn_complete": true})).unwrap()
    }

    fn agent_texts(log: &TranscriptLog) -> Vec<&str> {
        log.entries()
            .iter()
            .filter_map(|e| match e {
                TranscriptEntry::AgentText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_agent_transcription_promoted_on_turn_complete() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();

        assembler.handle(&envelope("text/transcription", json!("Your bal")), &mut log, None, false);
        assembler.handle(
            &envelope("text/transcription", json!("Your balance is $12.50")),
            &mut log,
            None,
            false,
        );
        assert!(log.entries().is_empty());

        assembler.handle(&turn_complete(), &mut log, None, false);
        assert_eq!(agent_texts(&log), vec!["Your balance is $12.50"]);
        assert!(assembler.agent_partial().is_empty());
    }

    #[test]
    fn test_user_speech_is_never_logged() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();

        assembler.handle(
            &envelope("text/input_transcription", json!("what is my bal")),
            &mut log,
            None,
            false,
        );
        assert_eq!(assembler.user_partial(), "what is my bal");

        // Agent activity clears the fragment, no entry appears for it
        assembler.handle(&envelope("text/plain", json!("Checking now.")), &mut log, None, false);
        assert!(assembler.user_partial().is_empty());
        assert_eq!(agent_texts(&log), vec!["Checking now."]);

        assembler.handle(&turn_complete(), &mut log, None, false);
        assert!(!log
            .entries()
            .iter()
            .any(|e| matches!(e, TranscriptEntry::UserText { .. })));
    }

    #[test]
    fn test_turn_complete_with_empty_buffers_logs_nothing() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();
        assembler.handle(&turn_complete(), &mut log, None, false);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_plain_text_renders_immediately_and_clears_fragment() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();

        assembler.handle(&envelope("text/transcription", json!("One mo")), &mut log, None, false);
        assembler.handle(&envelope("text/plain", json!("One moment.")), &mut log, None, false);
        assert_eq!(agent_texts(&log), vec!["One moment."]);

        // The superseded fragment must not resurface at the boundary
        assembler.handle(&turn_complete(), &mut log, None, false);
        assert_eq!(agent_texts(&log), vec!["One moment."]);
    }

    #[test]
    fn test_audio_routed_to_playback() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();
        let mut playback = RecordingPlayback { chunks: Vec::new() };

        let data = crate::protocol::encode_base64(&[1, 2, 3, 4]);
        assembler.handle(
            &envelope("audio/pcm", json!(data)),
            &mut log,
            Some(&mut playback),
            false,
        );
        assert_eq!(playback.chunks, vec![vec![1, 2, 3, 4]]);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_tool_traffic_gated_on_dev_mode() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();
        let call = envelope("tool_call", json!({"name": "get_balance", "args": {}}));

        assembler.handle(&call, &mut log, None, false);
        assert!(log.entries().is_empty());

        assembler.handle(&call, &mut log, None, true);
        match &log.entries()[0] {
            TranscriptEntry::DevLog { kind, name, .. } => {
                assert_eq!(*kind, DevLogKind::ToolCall);
                assert_eq!(name, "get_balance");
            }
            other => panic!("Wrong entry: {:?}", other),
        }
    }

    #[test]
    fn test_interrupted_alone_changes_nothing() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();

        assembler.handle(&envelope("text/transcription", json!("As I was say")), &mut log, None, false);
        let interrupted: InboundEnvelope =
            serde_json::from_value(json!({"interrupted": true})).unwrap();
        assembler.handle(&interrupted, &mut log, None, false);
        assert!(log.entries().is_empty());
        assert_eq!(assembler.agent_partial(), "As I was say");
    }

    #[test]
    fn test_reset_drops_both_fragments() {
        let mut assembler = TranscriptAssembler::new();
        let mut log = TranscriptLog::new();

        assembler.handle(&envelope("text/input_transcription", json!("hel")), &mut log, None, false);
        assembler.handle(&envelope("text/transcription", json!("Hi the")), &mut log, None, false);
        assembler.reset();

        assembler.handle(&turn_complete(), &mut log, None, false);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_listener_sees_appends_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut log = TranscriptLog::with_listener(tx);
        log.append(TranscriptEntry::UserText {
            text: "hi".to_string(),
            at: Local::now(),
        });
        log.append(TranscriptEntry::AgentText {
            text: "hello".to_string(),
            at: Local::now(),
        });

        assert!(matches!(rx.try_recv().unwrap(), TranscriptEntry::UserText { .. }));
        assert!(matches!(rx.try_recv().unwrap(), TranscriptEntry::AgentText { .. }));
    }

    #[test]
    fn test_dev_log_display_format() {
        let entry = TranscriptEntry::DevLog {
            kind: DevLogKind::ToolCall,
            name: "get_balance".to_string(),
            payload: json!({}),
            at: Local::now(),
        };
        assert_eq!(entry.to_string(), "[TOOL CALL] | Name: get_balance\n{}");
    }
}
