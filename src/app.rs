//! Application orchestrator
//!
//! Single event loop tying the connection, the capture mode machine, and the
//! transcript assembler together. Every state change funnels through one
//! consumer, so mode transitions run to completion before the next event is
//! looked at.

use crate::audio::playback::PlaybackDevice;
use crate::audio::{AudioDeviceError, MicrophoneSource, PcmChunk};
use crate::connection::{
    session_id, ConnectParams, Connection, ConnectionError, ConnectionEvent,
};
use crate::media::VideoSource;
use crate::mode::{CaptureMode, ControlStates, ModeController, VideoStart};
use crate::protocol::OutboundEnvelope;
use crate::transcript::{TranscriptAssembler, TranscriptEntry, TranscriptLog};
use chrono::Local;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A command from the user-facing frontend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    StartAudio,
    StopAudio,
    StartWebcam,
    StopWebcam,
    StartScreen,
    StopScreen,
    SendText(String),
    UploadImage(PathBuf),
    ShowStatus,
    Quit,
}

/// Everything the orchestrator loop reacts to
#[derive(Debug)]
pub enum AppEvent {
    Command(UserCommand),
    /// A microphone chunk ready for the wire
    MicChunk(PcmChunk),
    /// A sampled video frame, already JPEG + base64
    VideoFrame(String),
    /// The platform control ended the screen share out-of-band
    ScreenShareEnded,
}

/// Lazily opens the speaker on first use; the device stays held afterwards.
pub type PlaybackFactory =
    Box<dyn Fn() -> Result<Box<dyn PlaybackDevice>, AudioDeviceError> + Send>;

pub struct ChatApp<M: MicrophoneSource, V: VideoSource> {
    connection: Connection,
    modes: ModeController<M, V>,
    assembler: TranscriptAssembler,
    log: TranscriptLog,
    playback: Option<Box<dyn PlaybackDevice>>,
    playback_factory: PlaybackFactory,
    language: String,
    dev_mode: bool,
    events_tx: mpsc::Sender<AppEvent>,
}

impl<M, V> ChatApp<M, V>
where
    M: MicrophoneSource + 'static,
    V: VideoSource + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Connection,
        modes: ModeController<M, V>,
        log: TranscriptLog,
        playback_factory: PlaybackFactory,
        language: String,
        dev_mode: bool,
        events_tx: mpsc::Sender<AppEvent>,
    ) -> Self {
        Self {
            connection,
            modes,
            assembler: TranscriptAssembler::new(),
            log,
            playback: None,
            playback_factory,
            language,
            dev_mode,
            events_tx,
        }
    }

    /// Opens the session. The parameters captured here, including whether
    /// capture is already running, stay frozen across every reconnect.
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        let params = ConnectParams {
            session_id: session_id(),
            is_audio: self.modes.mode().is_capturing(),
            language: self.language.clone(),
            dev_mode: self.dev_mode,
        };
        info!(session_id = %params.session_id, lang = %params.language, "starting session");
        self.connection.connect(params)
    }

    /// The orchestrator loop. Returns when the frontend quits.
    pub async fn run(&mut self, mut events_rx: mpsc::Receiver<AppEvent>) {
        let mut conn_events = self.connection.subscribe();
        let mut conn_state = self.connection.watch_state();

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    // The frontend holds a sender for the life of the process
                    let Some(event) = event else { return };
                    if !self.handle_event(event).await {
                        return;
                    }
                }
                conn_event = conn_events.recv() => {
                    match conn_event {
                        Ok(event) => self.handle_connection_event(event),
                        Err(e) => warn!("connection event stream lagged: {e}"),
                    }
                }
                _ = conn_state.changed() => {
                    info!(state = %*conn_state.borrow(), "connection state");
                }
            }
        }
    }

    /// Returns false when the app should exit.
    async fn handle_event(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::Command(command) => return self.handle_command(command).await,
            AppEvent::MicChunk(chunk) => {
                if self.modes.mode().is_capturing() {
                    self.connection
                        .send(OutboundEnvelope::pcm_audio(&chunk.to_le_bytes()));
                }
            }
            AppEvent::VideoFrame(base64_jpeg) => {
                if self.modes.mode().is_video() {
                    self.connection
                        .send(OutboundEnvelope::image("image/jpeg", base64_jpeg));
                }
            }
            AppEvent::ScreenShareEnded => {
                if self.modes.mode() == CaptureMode::ScreenShare {
                    info!("screen share ended by platform control");
                    self.modes.stop_video();
                }
            }
        }
        true
    }

    async fn handle_command(&mut self, command: UserCommand) -> bool {
        match command {
            UserCommand::StartAudio => {
                self.ensure_playback();
                match self.modes.start_audio() {
                    Ok(Some(mic_rx)) => self.forward_mic(mic_rx),
                    Ok(None) => {}
                    Err(e) => error!("could not start audio: {e}"),
                }
            }
            UserCommand::StopAudio => self.modes.stop_audio(),
            UserCommand::StartWebcam => {
                self.ensure_playback();
                let frame_tx = self.forward_frames();
                match self.modes.start_webcam(frame_tx).await {
                    Ok(started) => self.adopt_video_start(started),
                    Err(e) => error!("could not start webcam: {e}"),
                }
            }
            UserCommand::StopWebcam => {
                if self.modes.mode() == CaptureMode::Webcam {
                    self.modes.stop_video();
                }
            }
            UserCommand::StartScreen => {
                self.ensure_playback();
                let frame_tx = self.forward_frames();
                let events_tx = self.events_tx.clone();
                let on_ended = move || {
                    let _ = events_tx.try_send(AppEvent::ScreenShareEnded);
                };
                match self.modes.start_screen(frame_tx, on_ended).await {
                    Ok(started) => self.adopt_video_start(started),
                    Err(e) => error!("could not start screen share: {e}"),
                }
            }
            UserCommand::StopScreen => {
                if self.modes.mode() == CaptureMode::ScreenShare {
                    self.modes.stop_video();
                }
            }
            UserCommand::SendText(text) => self.send_text(text),
            UserCommand::UploadImage(path) => self.upload_image(&path),
            UserCommand::ShowStatus => self.show_status(),
            UserCommand::Quit => {
                info!("shutting down");
                return false;
            }
        }
        true
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {}
            ConnectionEvent::Message(envelope) => {
                self.assembler.handle(
                    &envelope,
                    &mut self.log,
                    self.playback.as_deref_mut(),
                    self.dev_mode,
                );
            }
            ConnectionEvent::Closed { .. } => {
                // Fragments from the dead session never carry over
                self.assembler.reset();
            }
        }
    }

    /// Typed text bypasses the speech buffers: logged at submit, sent
    /// immediately. Dropped by the connection when the socket is down,
    /// matching the behavior of speech and frames.
    fn send_text(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.assembler.discard_user_speech();
        self.log.append(TranscriptEntry::UserText {
            text: text.to_string(),
            at: Local::now(),
        });
        self.connection.send(OutboundEnvelope::text(text));
    }

    fn upload_image(&mut self, path: &std::path::Path) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("could not read image {}: {e}", path.display());
                return;
            }
        };
        let Some(mime_type) = sniff_image_mime(&bytes) else {
            error!("{} is not a recognized image format", path.display());
            return;
        };
        self.log.append(TranscriptEntry::UserImage {
            mime_type: mime_type.to_string(),
            at: Local::now(),
        });
        self.connection.send(OutboundEnvelope::image(
            mime_type,
            crate::protocol::encode_base64(&bytes),
        ));
    }

    fn show_status(&self) {
        let mode = self.modes.mode();
        let state = self.connection.state();
        let controls = ControlStates::derive(mode, state);
        let language = self
            .connection
            .params()
            .map(|p| p.language.as_str())
            .unwrap_or("-");
        info!(
            ?mode,
            %state,
            lang = language,
            entries = self.log.entries().len(),
            send_text = controls.send_text,
            "status"
        );
    }

    /// Open the speaker on first need; kept for the rest of the process.
    fn ensure_playback(&mut self) {
        if self.playback.is_some() {
            return;
        }
        match (self.playback_factory)() {
            Ok(device) => self.playback = Some(device),
            Err(e) => warn!("no playback device, agent audio will be dropped: {e}"),
        }
    }

    fn adopt_video_start(&mut self, started: Option<VideoStart>) {
        if let Some(VideoStart { mic_rx: Some(rx) }) = started {
            self.forward_mic(rx);
        }
    }

    /// Pumps microphone chunks into the event loop. The task ends when the
    /// capture thread drops its sender.
    fn forward_mic(&self, mut mic_rx: mpsc::Receiver<PcmChunk>) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = mic_rx.recv().await {
                if events_tx.send(AppEvent::MicChunk(chunk)).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Builds the frame channel for a video mode and pumps it into the
    /// event loop. The task ends when the sampler is aborted.
    fn forward_frames(&self) -> mpsc::Sender<String> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(8);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if events_tx.send(AppEvent::VideoFrame(frame)).await.is_err() {
                    return;
                }
            }
        });
        frame_tx
    }
}

/// Detects the mime type of an uploaded image from its magic bytes.
/// Returns None for anything the codec layer does not recognize.
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|f| f.to_mime_type())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_image_mime_png() {
        let png = image::RgbImage::new(2, 2);
        let mut bytes = Vec::new();
        png.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        assert_eq!(sniff_image_mime(&bytes), Some("image/png"));
    }

    #[test]
    fn test_sniff_image_mime_rejects_garbage() {
        assert_eq!(sniff_image_mime(b"definitely not an image"), None);
    }
}
