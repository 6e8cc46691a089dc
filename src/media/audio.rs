//! Mikrofon-Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Die Samples werden auf
//! Mono heruntergemischt, auf 8 kHz resampelt und als G.711 µ-law (PCMU)
//! in 20ms-Frames in den `LocalTrack` geschoben.

use super::track::{LocalTrack, MediaFrame, TrackCodec, TrackSource};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate des kodierten Streams (PCMU)
pub const CAPTURE_RATE: u32 = 8000;

/// Frame Size in Samples (20ms @ 8kHz = 160 samples)
pub const FRAME_SAMPLES: usize = 160;

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SAMPLES * 10;

/// Bevorzugte Geräte-Rate (48kHz ist der Standard)
const PREFERRED_DEVICE_RATE: u32 = 48_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Capture thread exited before the stream started")]
    CaptureThreadGone,
}

// ============================================================================
// MICROPHONE
// ============================================================================

/// Öffnet das Standard-Mikrofon und liefert einen laufenden Track
///
/// Der cpal-Stream ist nicht `Send` und lebt deshalb auf einem eigenen
/// Thread, bis der Track gestoppt wird.
pub async fn open_microphone() -> Result<Arc<LocalTrack>, AudioError> {
    let track = LocalTrack::new(TrackSource::Microphone, TrackCodec::pcmu());

    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AudioError>>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let capture_track = Arc::clone(&track);
    std::thread::Builder::new()
        .name("mic-capture".to_string())
        .spawn(move || run_capture_thread(capture_track, ready_tx, stop_rx))
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    // Beim Stoppen des Tracks den Capture-Thread beenden
    track.on_stop(move || {
        let _ = stop_tx.send(());
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(track),
        Ok(Err(e)) => {
            track.stop();
            Err(e)
        }
        Err(_) => {
            track.stop();
            Err(AudioError::CaptureThreadGone)
        }
    }
}

fn run_capture_thread(
    track: Arc<LocalTrack>,
    ready_tx: oneshot::Sender<Result<(), AudioError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        tracing::warn!("No audio input device found");
        let _ = ready_tx.send(Err(AudioError::NoInputDevice));
        return;
    };

    let stream = match build_capture_stream(&device, Arc::clone(&track)) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamPlayError(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Blockiert bis der Track gestoppt wird (oder der Sender wegfällt)
    let _ = stop_rx.recv();
    drop(stream);
    tracing::info!("Microphone capture stopped");
}

fn build_capture_stream(
    device: &Device,
    track: Arc<LocalTrack>,
) -> Result<cpal::Stream, AudioError> {
    let config = find_best_input_config(device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let source_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let mut buffer = HeapRb::<i16>::new(RING_BUFFER_SIZE);

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                for sample in resample_linear(&mono, source_rate, CAPTURE_RATE) {
                    let _ = buffer.try_push(to_pcm16(sample));
                }

                while buffer.occupied_len() >= FRAME_SAMPLES {
                    let payload: Vec<u8> = (0..FRAME_SAMPLES)
                        .filter_map(|_| buffer.try_pop())
                        .map(linear_to_ulaw)
                        .collect();
                    track.push_frame(MediaFrame {
                        data: Bytes::from(payload),
                        duration: FRAME_DURATION,
                    });
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    // Priorität: 48kHz > andere, nur F32
    let target_rate = cpal::SampleRate(PREFERRED_DEVICE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.clone().with_sample_rate(target_rate).config());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.clone().with_max_sample_rate().config());
        }
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 input configuration found".to_string(),
    ))
}

// ============================================================================
// SAMPLE PROCESSING
// ============================================================================

/// Mischt interleaved Samples auf einen Kanal herunter
pub(crate) fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
pub(crate) fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// G.711 µ-law Kodierung eines 16-bit Samples
pub(crate) fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_reference_values() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        // Vorzeichen steckt im obersten Bit
        assert_eq!(linear_to_ulaw(1000) & 0x80, 0x80);
        assert_eq!(linear_to_ulaw(-1000) & 0x80, 0x00);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_48k_to_8k() {
        let input = vec![0.25f32; 960];
        let output = resample_linear(&input, 48_000, CAPTURE_RATE);
        assert_eq!(output.len(), FRAME_SAMPLES);
        assert!(output.iter().all(|s| (*s - 0.25).abs() < f32::EPSILON));
    }

    #[test]
    fn test_pcm16_clamps() {
        assert_eq!(to_pcm16(2.0), i16::MAX);
        assert_eq!(to_pcm16(-2.0), -i16::MAX);
    }
}
