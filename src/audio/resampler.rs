//! Sample pipeline: mono downmix, optional resampling, fixed-size chunking

use super::types::PcmChunk;
use super::STREAM_SAMPLE_RATE;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Chunk size in samples (100 ms of audio at 16 kHz)
pub(crate) const CHUNK_SAMPLES: usize = 1600;

/// Turns interleaved device samples into fixed-size 16 kHz mono chunks.
///
/// Lives behind a mutex shared with the cpal callback, so nothing here may
/// block: complete chunks leave through `try_send` and are dropped on
/// overflow.
pub(crate) struct ChunkPipeline {
    resampler: Option<SincFixedIn<f32>>,
    /// Device-rate samples consumed per resampler pass
    input_frames: usize,
    input: Vec<i16>,
    output: Vec<i16>,
    chunk_tx: mpsc::Sender<PcmChunk>,
}

impl ChunkPipeline {
    pub fn new(device_rate: u32, chunk_tx: mpsc::Sender<PcmChunk>) -> Self {
        let (resampler, input_frames) = if device_rate == STREAM_SAMPLE_RATE {
            (None, CHUNK_SAMPLES)
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let input_frames = (CHUNK_SAMPLES as f64 * device_rate as f64
                / STREAM_SAMPLE_RATE as f64)
                .ceil() as usize;
            match SincFixedIn::<f32>::new(
                STREAM_SAMPLE_RATE as f64 / device_rate as f64,
                2.0,
                params,
                input_frames,
                1, // mono
            ) {
                Ok(resampler) => {
                    info!(
                        "Resampling microphone {} Hz -> {} Hz",
                        device_rate, STREAM_SAMPLE_RATE
                    );
                    (Some(resampler), input_frames)
                }
                Err(e) => {
                    error!("Failed to create resampler, streaming at device rate: {}", e);
                    (None, CHUNK_SAMPLES)
                }
            }
        };

        Self {
            resampler,
            input_frames,
            input: Vec::with_capacity(input_frames * 2),
            output: Vec::with_capacity(CHUNK_SAMPLES * 2),
            chunk_tx,
        }
    }

    /// Feed interleaved device samples; complete chunks go downstream.
    pub fn push(&mut self, data: &[i16], channels: usize) {
        let mono = downmix(data, channels);

        if let Some(resampler) = self.resampler.as_mut() {
            self.input.extend(&mono);
            while self.input.len() >= self.input_frames {
                let block: Vec<f32> = self
                    .input
                    .drain(..self.input_frames)
                    .map(|s| s as f32 / 32768.0)
                    .collect();
                match resampler.process(&[block], None) {
                    Ok(resampled) => self.output.extend(
                        resampled[0]
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
                    ),
                    Err(e) => error!("Resampling error: {}", e),
                }
            }
        } else {
            self.output.extend(&mono);
        }

        self.drain_chunks();
    }

    fn drain_chunks(&mut self) {
        while self.output.len() >= CHUNK_SAMPLES {
            let samples: Vec<i16> = self.output.drain(..CHUNK_SAMPLES).collect();
            let chunk = PcmChunk {
                samples,
                sample_rate: STREAM_SAMPLE_RATE,
            };
            if let Err(e) = self.chunk_tx.try_send(chunk) {
                warn!("Audio buffer overflow - chunk dropped: {}", e);
                return;
            }
        }
    }
}

/// Average interleaved channels down to mono.
fn downmix(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}
