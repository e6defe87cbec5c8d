//! Video capture adapter
//!
//! Owns at most one platform video stream at a time and samples it into
//! base64 JPEG frames on a fixed period. Webcam and screen capture are
//! platform concerns behind the `VideoSource` trait; the crate ships a
//! synthetic test-pattern source so the full frame pipeline runs without
//! real capture hardware.

use crate::protocol;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Fixed frame sampling period
pub const FRAME_INTERVAL: Duration = Duration::from_secs(1);

/// JPEG quality for sampled frames (matches the 0.8 canvas quality upstream)
pub const JPEG_QUALITY: u8 = 80;

/// Errors from video acquisition
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("No capture device available")]
    NoDevice,

    #[error("Capture source error: {0}")]
    Source(String),
}

/// Platform video acquisition boundary
///
/// Acquisition awaits the platform permission prompt; a rejected prompt
/// surfaces as `CaptureError` and the caller unwinds.
#[async_trait]
pub trait VideoSource: Send {
    async fn open_webcam(&mut self) -> Result<Box<dyn VideoStream>, CaptureError>;
    async fn open_screen(&mut self) -> Result<Box<dyn VideoStream>, CaptureError>;
}

/// A live video stream handle
pub trait VideoStream: Send {
    /// Current frame, or None while the stream is paused or unavailable.
    fn frame(&mut self) -> Option<RgbImage>;

    /// Stop all tracks; the stream yields no further frames.
    fn stop(&mut self);

    /// One-shot signal for screen sharing stopped via the platform's native
    /// controls. None for sources without such a control; may only be taken
    /// once.
    fn take_end_signal(&mut self) -> Option<oneshot::Receiver<()>>;
}

type SharedStream = Arc<Mutex<Box<dyn VideoStream>>>;

/// Owns the active stream and its sampling timer
pub struct MediaHandler<V: VideoSource> {
    source: V,
    current: Option<SharedStream>,
    sampler: Option<JoinHandle<()>>,
    end_watcher: Option<JoinHandle<()>>,
}

impl<V: VideoSource> MediaHandler<V> {
    pub fn new(source: V) -> Self {
        Self {
            source,
            current: None,
            sampler: None,
            end_watcher: None,
        }
    }

    pub async fn start_webcam(&mut self) -> Result<(), CaptureError> {
        let stream = self.source.open_webcam().await?;
        self.adopt(stream);
        Ok(())
    }

    /// Start screen capture; `on_ended` fires when the platform's own stop
    /// control ends the share, so it takes the same path as the explicit
    /// stop command.
    pub async fn start_screen(
        &mut self,
        on_ended: impl FnOnce() + Send + 'static,
    ) -> Result<(), CaptureError> {
        let mut stream = self.source.open_screen().await?;
        let end_signal = stream.take_end_signal();
        self.adopt(stream);

        if let Some(signal) = end_signal {
            self.end_watcher = Some(tokio::spawn(async move {
                if signal.await.is_ok() {
                    info!("Screen sharing ended by platform controls");
                    on_ended();
                }
            }));
        }
        Ok(())
    }

    /// Replace the held stream; at most one stream is owned at a time, and
    /// the previous one is fully stopped first.
    fn adopt(&mut self, stream: Box<dyn VideoStream>) {
        if self.current.is_some() {
            self.stop_all();
        }
        self.current = Some(Arc::new(Mutex::new(stream)));
    }

    /// Begin fixed-period frame sampling into `frame_tx` (base64 JPEG).
    /// Re-arming while a sampler runs replaces the old timer.
    pub fn start_frame_capture(&mut self, frame_tx: mpsc::Sender<String>) {
        if let Some(task) = self.sampler.take() {
            task.abort();
        }
        let Some(stream) = self.current.clone() else {
            warn!("Frame capture requested without an active stream");
            return;
        };

        self.sampler = Some(tokio::spawn(async move {
            let mut ticker = interval(FRAME_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval fires immediately; the first sample waits one period
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let encoded = {
                    let mut guard = match stream.lock() {
                        Ok(guard) => guard,
                        Err(_) => break,
                    };
                    guard.frame().and_then(|frame| encode_jpeg_base64(&frame))
                };
                if let Some(data) = encoded {
                    if frame_tx.send(data).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }

    /// Cancel sampling, stop all tracks of the owned stream, release it.
    pub fn stop_all(&mut self) {
        if let Some(task) = self.sampler.take() {
            task.abort();
        }
        if let Some(task) = self.end_watcher.take() {
            task.abort();
        }
        if let Some(stream) = self.current.take() {
            if let Ok(mut guard) = stream.lock() {
                guard.stop();
            }
        }
    }

    pub fn has_stream(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

fn encode_jpeg_base64(frame: &RgbImage) -> Option<String> {
    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    if let Err(e) = frame.write_with_encoder(encoder) {
        warn!("Failed to encode frame: {}", e);
        return None;
    }
    Some(protocol::encode_base64(&jpeg))
}

/// Synthetic moving test pattern standing in for platform capture
pub struct PatternSource {
    width: u32,
    height: u32,
}

impl Default for PatternSource {
    fn default() -> Self {
        Self {
            width: 320,
            height: 180,
        }
    }
}

#[async_trait]
impl VideoSource for PatternSource {
    async fn open_webcam(&mut self) -> Result<Box<dyn VideoStream>, CaptureError> {
        Ok(Box::new(PatternStream::new(self.width, self.height, false)))
    }

    async fn open_screen(&mut self) -> Result<Box<dyn VideoStream>, CaptureError> {
        Ok(Box::new(PatternStream::new(self.width, self.height, true)))
    }
}

struct PatternStream {
    width: u32,
    height: u32,
    tick: u32,
    stopped: bool,
    end_rx: Option<oneshot::Receiver<()>>,
    // Held so the end signal stays pending for the stream's lifetime
    _end_tx: Option<oneshot::Sender<()>>,
}

impl PatternStream {
    fn new(width: u32, height: u32, with_end_signal: bool) -> Self {
        let (end_tx, end_rx) = if with_end_signal {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Self {
            width,
            height,
            tick: 0,
            stopped: false,
            end_rx,
            _end_tx: end_tx,
        }
    }
}

impl VideoStream for PatternStream {
    fn frame(&mut self) -> Option<RgbImage> {
        if self.stopped {
            return None;
        }
        self.tick = self.tick.wrapping_add(1);
        let shift = self.tick;
        Some(RgbImage::from_fn(self.width, self.height, |x, y| {
            let r = ((x + shift) % 256) as u8;
            let g = ((y + shift) % 256) as u8;
            image::Rgb([r, g, 128])
        }))
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn take_end_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.end_rx.take()
    }
}
