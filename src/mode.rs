//! Capture mode state machine
//!
//! Governs which capture mode is active and drives the microphone and video
//! adapters through transitions. Webcam and screen share are mutually
//! exclusive; an audio-only call is superseded (not combined) when video
//! starts. The duplex connection is owned elsewhere and is never torn down
//! by a mode change.

use crate::audio::{AudioDeviceError, MicrophoneSource, PcmChunk};
use crate::connection::ConnectionState;
use crate::media::{CaptureError, MediaHandler, VideoSource};
use tokio::sync::mpsc;
use tracing::debug;

/// The mutually exclusive capture modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Idle,
    AudioOnly,
    Webcam,
    ScreenShare,
}

impl CaptureMode {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Webcam | Self::ScreenShare)
    }

    /// Any mode that streams microphone audio to the agent.
    pub fn is_capturing(self) -> bool {
        self != Self::Idle
    }
}

/// Errors from mode transitions
#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error(transparent)]
    Video(#[from] CaptureError),

    #[error(transparent)]
    Microphone(#[from] AudioDeviceError),
}

/// Result of a completed video start transition
pub struct VideoStart {
    /// The microphone chunk stream when capture newly started; None when the
    /// microphone was already held (an audio call being upgraded keeps it).
    pub mic_rx: Option<mpsc::Receiver<PcmChunk>>,
}

enum VideoKind {
    Webcam,
    Screen,
}

/// Owns the capture devices and enforces the transition rules.
pub struct ModeController<M: MicrophoneSource, V: VideoSource> {
    mode: CaptureMode,
    mic: M,
    media: MediaHandler<V>,
}

impl<M: MicrophoneSource, V: VideoSource> ModeController<M, V> {
    pub fn new(mic: M, source: V) -> Self {
        Self {
            mode: CaptureMode::Idle,
            mic,
            media: MediaHandler::new(source),
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Idle -> AudioOnly. Returns the microphone chunk stream, or None when
    /// the transition is a guarded no-op (already in a call, or video
    /// active). A microphone failure unwinds back to Idle.
    pub fn start_audio(&mut self) -> Result<Option<mpsc::Receiver<PcmChunk>>, ModeError> {
        if self.mode != CaptureMode::Idle {
            debug!(mode = ?self.mode, "start-audio ignored");
            return Ok(None);
        }
        self.mode = CaptureMode::AudioOnly;
        match self.mic.start() {
            Ok(rx) => Ok(Some(rx)),
            Err(e) => {
                self.stop_audio();
                Err(e.into())
            }
        }
    }

    /// AudioOnly -> Idle; the connection stays open. No-op during video
    /// (the microphone is owned by the video mode then).
    pub fn stop_audio(&mut self) {
        if self.mode.is_video() {
            debug!("stop-audio ignored while video is active");
            return;
        }
        self.mic.stop();
        self.mode = CaptureMode::Idle;
    }

    /// {Idle, AudioOnly} -> Webcam. No-op while screen share or webcam is
    /// already active.
    pub async fn start_webcam(
        &mut self,
        frame_tx: mpsc::Sender<String>,
    ) -> Result<Option<VideoStart>, ModeError> {
        self.start_video(VideoKind::Webcam, frame_tx, || {}).await
    }

    /// {Idle, AudioOnly} -> ScreenShare. `on_ended` fires when the platform's
    /// native control stops the share.
    pub async fn start_screen(
        &mut self,
        frame_tx: mpsc::Sender<String>,
        on_ended: impl FnOnce() + Send + 'static,
    ) -> Result<Option<VideoStart>, ModeError> {
        self.start_video(VideoKind::Screen, frame_tx, on_ended).await
    }

    async fn start_video(
        &mut self,
        kind: VideoKind,
        frame_tx: mpsc::Sender<String>,
        on_ended: impl FnOnce() + Send + 'static,
    ) -> Result<Option<VideoStart>, ModeError> {
        if self.mode.is_video() {
            debug!(mode = ?self.mode, "start-video ignored");
            return Ok(None);
        }

        // An audio-only call is demoted, not combined; the microphone keeps
        // running underneath the video mode.
        self.mode = match kind {
            VideoKind::Webcam => CaptureMode::Webcam,
            VideoKind::Screen => CaptureMode::ScreenShare,
        };

        let opened = match kind {
            VideoKind::Webcam => self.media.start_webcam().await,
            VideoKind::Screen => self.media.start_screen(on_ended).await,
        };
        if let Err(e) = opened {
            self.stop_video();
            return Err(e.into());
        }

        let mic_rx = if self.mic.is_active() {
            None
        } else {
            match self.mic.start() {
                Ok(rx) => Some(rx),
                Err(e) => {
                    self.stop_video();
                    return Err(e.into());
                }
            }
        };

        self.media.start_frame_capture(frame_tx);
        Ok(Some(VideoStart { mic_rx }))
    }

    /// {Webcam, ScreenShare} -> Idle on stop or capture failure: releases
    /// the video stream, the frame sampler, and the microphone. The
    /// connection stays open.
    pub fn stop_video(&mut self) {
        self.media.stop_all();
        self.mic.stop();
        self.mode = CaptureMode::Idle;
    }

    #[cfg(test)]
    fn media(&self) -> &MediaHandler<V> {
        &self.media
    }
}

/// Which controls are interactable; a pure function of the current state.
///
/// Exactly one of each start/stop pair is live per mode family; everything
/// but text entry goes dead while the connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStates {
    pub start_audio: bool,
    pub stop_audio: bool,
    pub start_webcam: bool,
    pub stop_webcam: bool,
    pub start_screen: bool,
    pub stop_screen: bool,
    pub send_text: bool,
}

impl ControlStates {
    pub fn derive(mode: CaptureMode, connection: ConnectionState) -> Self {
        let connected = connection == ConnectionState::Connected;
        if !connected {
            return Self {
                start_audio: false,
                stop_audio: false,
                start_webcam: false,
                stop_webcam: false,
                start_screen: false,
                stop_screen: false,
                send_text: false,
            };
        }
        Self {
            start_audio: mode == CaptureMode::Idle,
            stop_audio: mode == CaptureMode::AudioOnly,
            start_webcam: !mode.is_video(),
            stop_webcam: mode == CaptureMode::Webcam,
            start_screen: !mode.is_video(),
            stop_screen: mode == CaptureMode::ScreenShare,
            send_text: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoStream;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    struct FakeMic {
        active: bool,
        starts: usize,
        fail: bool,
    }

    impl FakeMic {
        fn new() -> Self {
            Self {
                active: false,
                starts: 0,
                fail: false,
            }
        }
    }

    impl MicrophoneSource for FakeMic {
        fn start(&mut self) -> Result<mpsc::Receiver<PcmChunk>, AudioDeviceError> {
            if self.fail {
                return Err(AudioDeviceError::NoInputDevice);
            }
            self.active = true;
            self.starts += 1;
            let (_tx, rx) = mpsc::channel(4);
            Ok(rx)
        }

        fn stop(&mut self) {
            self.active = false;
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    struct FakeStream {
        stopped: Arc<AtomicBool>,
    }

    impl VideoStream for FakeStream {
        fn frame(&mut self) -> Option<RgbImage> {
            (!self.stopped.load(Ordering::SeqCst)).then(|| RgbImage::new(2, 2))
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn take_end_signal(&mut self) -> Option<oneshot::Receiver<()>> {
            None
        }
    }

    #[derive(Default)]
    struct FakeVideo {
        fail: bool,
        opened: Arc<std::sync::Mutex<Vec<Arc<AtomicBool>>>>,
    }

    #[async_trait]
    impl VideoSource for FakeVideo {
        async fn open_webcam(&mut self) -> Result<Box<dyn VideoStream>, CaptureError> {
            if self.fail {
                return Err(CaptureError::PermissionDenied("webcam".to_string()));
            }
            let stopped = Arc::new(AtomicBool::new(false));
            self.opened.lock().unwrap().push(stopped.clone());
            Ok(Box::new(FakeStream { stopped }))
        }

        async fn open_screen(&mut self) -> Result<Box<dyn VideoStream>, CaptureError> {
            self.open_webcam().await
        }
    }

    fn controller() -> ModeController<FakeMic, FakeVideo> {
        ModeController::new(FakeMic::new(), FakeVideo::default())
    }

    fn frame_tx() -> mpsc::Sender<String> {
        mpsc::channel(4).0
    }

    #[tokio::test]
    async fn test_video_modes_are_mutually_exclusive() {
        let mut modes = controller();
        modes.start_webcam(frame_tx()).await.unwrap();
        assert_eq!(modes.mode(), CaptureMode::Webcam);

        // Screen share while the webcam is live is a guarded no-op
        let started = modes.start_screen(frame_tx(), || {}).await.unwrap();
        assert!(started.is_none());
        assert_eq!(modes.mode(), CaptureMode::Webcam);
    }

    #[tokio::test]
    async fn test_audio_guarded_while_video_active() {
        let mut modes = controller();
        modes.start_screen(frame_tx(), || {}).await.unwrap();

        assert!(modes.start_audio().unwrap().is_none());
        assert_eq!(modes.mode(), CaptureMode::ScreenShare);

        // Stop-audio must not release the microphone out from under video
        modes.stop_audio();
        assert_eq!(modes.mode(), CaptureMode::ScreenShare);
        assert!(modes.mic.is_active());
    }

    #[tokio::test]
    async fn test_webcam_supersedes_audio_and_keeps_microphone() {
        let mut modes = controller();
        assert!(modes.start_audio().unwrap().is_some());
        assert_eq!(modes.mode(), CaptureMode::AudioOnly);

        let started = modes.start_webcam(frame_tx()).await.unwrap().unwrap();
        assert_eq!(modes.mode(), CaptureMode::Webcam);
        // Microphone kept, not stopped and reacquired
        assert!(started.mic_rx.is_none());
        assert_eq!(modes.mic.starts, 1);
        assert!(modes.mic.is_active());
    }

    #[tokio::test]
    async fn test_video_failure_unwinds_to_idle() {
        let mut modes = ModeController::new(
            FakeMic::new(),
            FakeVideo {
                fail: true,
                opened: Arc::default(),
            },
        );
        assert!(modes.start_audio().unwrap().is_some());

        assert!(modes.start_webcam(frame_tx()).await.is_err());
        assert_eq!(modes.mode(), CaptureMode::Idle);
        assert!(!modes.mic.is_active());
        assert!(!modes.media().has_stream());
        assert!(!modes.media().is_sampling());
    }

    #[tokio::test]
    async fn test_microphone_failure_unwinds_video() {
        let mut mic = FakeMic::new();
        mic.fail = true;
        let video = FakeVideo::default();
        let opened = video.opened.clone();
        let mut modes = ModeController::new(mic, video);

        assert!(modes.start_webcam(frame_tx()).await.is_err());
        assert_eq!(modes.mode(), CaptureMode::Idle);
        assert!(!modes.media().has_stream());
        // The partially acquired stream was released
        assert!(opened.lock().unwrap()[0].load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_audio_failure_unwinds_to_idle() {
        let mut mic = FakeMic::new();
        mic.fail = true;
        let mut modes = ModeController::new(mic, FakeVideo::default());

        assert!(modes.start_audio().is_err());
        assert_eq!(modes.mode(), CaptureMode::Idle);
    }

    #[tokio::test]
    async fn test_stop_video_releases_all_devices() {
        let mut modes = controller();
        modes.start_webcam(frame_tx()).await.unwrap();
        assert!(modes.media().is_sampling());

        modes.stop_video();
        assert_eq!(modes.mode(), CaptureMode::Idle);
        assert!(!modes.mic.is_active());
        assert!(!modes.media().has_stream());
        assert!(!modes.media().is_sampling());
    }

    #[tokio::test]
    async fn test_start_audio_twice_is_noop() {
        let mut modes = controller();
        assert!(modes.start_audio().unwrap().is_some());
        assert!(modes.start_audio().unwrap().is_none());
        assert_eq!(modes.mic.starts, 1);
    }

    #[test]
    fn test_control_states_per_mode() {
        let connected = ConnectionState::Connected;

        let idle = ControlStates::derive(CaptureMode::Idle, connected);
        assert!(idle.start_audio && idle.start_webcam && idle.start_screen);
        assert!(!idle.stop_audio && !idle.stop_webcam && !idle.stop_screen);

        let audio = ControlStates::derive(CaptureMode::AudioOnly, connected);
        assert!(!audio.start_audio && audio.stop_audio);
        assert!(audio.start_webcam && audio.start_screen);

        let webcam = ControlStates::derive(CaptureMode::Webcam, connected);
        assert!(!webcam.start_audio && !webcam.start_webcam && !webcam.start_screen);
        assert!(webcam.stop_webcam && !webcam.stop_screen);

        let screen = ControlStates::derive(CaptureMode::ScreenShare, connected);
        assert!(screen.stop_screen && !screen.stop_webcam);
    }

    #[test]
    fn test_controls_dead_while_disconnected() {
        let states = ControlStates::derive(CaptureMode::Webcam, ConnectionState::Error);
        assert!(!states.stop_webcam && !states.send_text && !states.start_audio);
    }
}
