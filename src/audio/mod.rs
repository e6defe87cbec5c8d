//! Microphone capture behind the `MicrophoneSource` boundary
//!
//! The cpal implementation captures from the default input device on a
//! dedicated thread, resamples to 16 kHz mono PCM16 when the device rate
//! differs, and hands 100 ms chunks to the orchestrator over an mpsc channel.

pub mod playback;
mod resampler;
mod types;

pub use types::{AudioDeviceError, MicrophoneHandle, PcmChunk};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use resampler::ChunkPipeline;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Sample rate of the PCM stream sent to the agent (16 kHz)
pub const STREAM_SAMPLE_RATE: u32 = 16000;

/// Microphone acquisition boundary
///
/// The state machine holds one of these and starts/stops it across mode
/// transitions; tests substitute a scripted fake.
pub trait MicrophoneSource: Send {
    /// Begin capture and return the chunk stream.
    fn start(&mut self) -> Result<mpsc::Receiver<PcmChunk>, AudioDeviceError>;

    /// Release the device. Safe to call when not capturing.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Default-device cpal microphone
#[derive(Default)]
pub struct CpalMicrophone {
    handle: Option<MicrophoneHandle>,
}

impl MicrophoneSource for CpalMicrophone {
    fn start(&mut self) -> Result<mpsc::Receiver<PcmChunk>, AudioDeviceError> {
        if self.is_active() {
            return Err(AudioDeviceError::AlreadyRunning);
        }

        let is_capturing = Arc::new(AtomicBool::new(true));
        let (chunk_tx, chunk_rx) = mpsc::channel(600);

        let flag = is_capturing.clone();
        let thread_handle = thread::spawn(move || {
            if let Err(e) = run_capture(flag, chunk_tx) {
                error!("Microphone capture error: {}", e);
            }
        });

        self.handle = Some(MicrophoneHandle {
            is_capturing,
            thread_handle: Some(thread_handle),
        });
        Ok(chunk_rx)
    }

    fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
    }

    fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.is_capturing())
            .unwrap_or(false)
    }
}

/// Run capture on the current thread until the flag clears (blocking).
fn run_capture(
    is_capturing: Arc<AtomicBool>,
    chunk_tx: mpsc::Sender<PcmChunk>,
) -> Result<(), AudioDeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioDeviceError::NoInputDevice)?;
    info!(
        "Using audio input device: {}",
        device.name().unwrap_or_else(|_| "unknown".to_string())
    );

    let supported = select_input_config(&device)?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    info!(
        "Audio config: {} channels, {} Hz",
        channels, config.sample_rate.0
    );

    let pipeline = Arc::new(Mutex::new(ChunkPipeline::new(config.sample_rate.0, chunk_tx)));
    let err_callback = |err| error!("Audio stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => {
            let flag = is_capturing.clone();
            let pipeline = pipeline.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if !flag.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Ok(mut p) = pipeline.lock() {
                        p.push(data, channels);
                    }
                },
                err_callback,
                None,
            )?
        }
        SampleFormat::F32 => {
            let flag = is_capturing.clone();
            let pipeline = pipeline.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if !flag.load(Ordering::SeqCst) {
                        return;
                    }
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    if let Ok(mut p) = pipeline.lock() {
                        p.push(&samples, channels);
                    }
                },
                err_callback,
                None,
            )?
        }
        other => {
            return Err(AudioDeviceError::UnsupportedFormat(format!("{:?}", other)));
        }
    };

    stream.play()?;
    info!("Microphone capture started");

    // Keep the stream alive until capture is stopped
    while is_capturing.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);
    Ok(())
}

/// Pick an input config at the stream rate, falling back to the device's
/// best rate (the pipeline resamples).
fn select_input_config(
    device: &cpal::Device,
) -> Result<cpal::SupportedStreamConfig, AudioDeviceError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioDeviceError::ConfigError(e.to_string()))?;

    let mut fallback = None;
    for config in configs {
        if config.channels() == 0 {
            continue;
        }
        if config.min_sample_rate().0 <= STREAM_SAMPLE_RATE
            && config.max_sample_rate().0 >= STREAM_SAMPLE_RATE
        {
            return Ok(config.with_sample_rate(cpal::SampleRate(STREAM_SAMPLE_RATE)));
        }
        if fallback.is_none() {
            fallback = Some(config.with_max_sample_rate());
        }
    }

    match fallback {
        Some(config) => {
            warn!(
                "{} Hz not supported, capturing at {} Hz",
                STREAM_SAMPLE_RATE,
                config.sample_rate().0
            );
            Ok(config)
        }
        None => Err(AudioDeviceError::NoSupportedConfig),
    }
}
