//! PCM playback behind the `PlaybackDevice` boundary
//!
//! Inbound `audio/pcm` payloads are queued into a dedicated output thread
//! feeding the default cpal device. A discard implementation serves headless
//! runs and tests. No rate conversion happens here; the playback device is an
//! opaque sink for whatever PCM the agent sends.

use super::types::AudioDeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tracing::{error, info, trace};

/// Opaque sink for agent audio
pub trait PlaybackDevice: Send {
    /// Queue raw little-endian PCM16 mono bytes for playback.
    fn play(&mut self, pcm: &[u8]);
}

/// Playback that drops audio, for headless runs
#[derive(Debug, Default)]
pub struct DiscardPlayback;

impl PlaybackDevice for DiscardPlayback {
    fn play(&mut self, pcm: &[u8]) {
        trace!("Discarding {} bytes of agent audio", pcm.len());
    }
}

type SampleQueue = Arc<Mutex<VecDeque<i16>>>;

/// Default-device cpal playback
///
/// The output stream runs on its own thread (cpal streams are not `Send`);
/// `play` only appends to the shared sample queue.
pub struct CpalPlayback {
    queue: SampleQueue,
    is_playing: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CpalPlayback {
    /// Open the default output device and start the playback thread.
    pub fn open() -> Result<Self, AudioDeviceError> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let is_playing = Arc::new(AtomicBool::new(true));

        // The thread reports back once so device errors surface to the caller
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let thread_queue = queue.clone();
        let flag = is_playing.clone();
        let thread_handle = thread::spawn(move || run_playback(flag, thread_queue, ready_tx));

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                is_playing,
                thread_handle: Some(thread_handle),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioDeviceError::ConfigError(
                "playback thread exited before reporting".to_string(),
            )),
        }
    }
}

impl PlaybackDevice for CpalPlayback {
    fn play(&mut self, pcm: &[u8]) {
        let samples = bytes_to_samples(pcm);
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples);
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.is_playing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        info!("Audio playback stopped");
    }
}

/// Little-endian byte pairs to PCM16; a trailing odd byte is ignored.
pub(crate) fn bytes_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn run_playback(
    is_playing: Arc<AtomicBool>,
    queue: SampleQueue,
    ready_tx: std_mpsc::Sender<Result<(), AudioDeviceError>>,
) {
    let opened = (|| {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioDeviceError::NoOutputDevice)?;
        let supported = device.default_output_config()?;
        Ok::<_, AudioDeviceError>((device, supported))
    })();

    let (device, supported) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    let err_callback = |err| error!("Playback stream error: {}", err);

    let stream_result = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |out: &mut [f32], _| fill_f32(out, channels, &queue),
            err_callback,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |out: &mut [i16], _| fill_i16(out, channels, &queue),
            err_callback,
            None,
        ),
        other => {
            let _ = ready_tx.send(Err(AudioDeviceError::UnsupportedFormat(format!(
                "{:?}",
                other
            ))));
            return;
        }
    };

    let stream = match stream_result {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(e.into()));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    info!("Audio playback started");

    while is_playing.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(100));
    }
    drop(stream);
}

fn fill_f32(out: &mut [f32], channels: usize, queue: &SampleQueue) {
    let mut queue = match queue.lock() {
        Ok(queue) => queue,
        Err(_) => {
            out.fill(0.0);
            return;
        }
    };
    for frame in out.chunks_mut(channels) {
        let value = queue
            .pop_front()
            .map(|s| s as f32 / 32768.0)
            .unwrap_or(0.0);
        for sample in frame {
            *sample = value;
        }
    }
}

fn fill_i16(out: &mut [i16], channels: usize, queue: &SampleQueue) {
    let mut queue = match queue.lock() {
        Ok(queue) => queue,
        Err(_) => {
            out.fill(0);
            return;
        }
    };
    for frame in out.chunks_mut(channels) {
        let value = queue.pop_front().unwrap_or(0);
        for sample in frame {
            *sample = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_samples() {
        assert_eq!(bytes_to_samples(&[1, 0, 254, 255]), vec![1, -2]);
    }

    #[test]
    fn test_bytes_to_samples_ignores_trailing_byte() {
        assert_eq!(bytes_to_samples(&[0, 1, 42]), vec![256]);
    }

    #[test]
    fn test_discard_playback_accepts_anything() {
        let mut playback = DiscardPlayback;
        playback.play(&[]);
        playback.play(&[1, 2, 3]);
    }
}
