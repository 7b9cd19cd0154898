pub mod cpal_device;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub const WAV_MIME_TYPE: &str = "audio/wav";
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;
const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("recording is already in progress")]
    AlreadyStarted,
    #[error("recording is not in progress")]
    NotStarted,
    #[error("microphone stream error: {0}")]
    Stream(String),
    #[error("unable to encode recording: {0}")]
    Encoding(String),
}

/// Output format of a recording. Fixed when the device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureFormat {
    pub sample_rate_hz: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
        }
    }
}

impl CaptureFormat {
    pub fn channels(&self) -> u16 {
        CHANNELS
    }

    pub fn bitrate_bps(&self) -> u32 {
        self.sample_rate_hz
            .saturating_mul(u32::from(CHANNELS))
            .saturating_mul(u32::from(BITS_PER_SAMPLE))
    }
}

/// One finished recording in a single WAV container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub sample_count: usize,
    pub duration_ms: u64,
}

impl EncodedAudio {
    /// A recording with a header but no captured samples.
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// Exclusive access to an audio input device.
pub trait Microphone: Send + Sync {
    fn open(&self, format: CaptureFormat) -> Result<Box<dyn RecordingSession>, CaptureError>;
}

/// An open device stream. Dropping it without `stop` discards whatever was buffered.
#[async_trait]
pub trait RecordingSession: Send {
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Finalizes the buffer and releases the device stream.
    async fn stop(&mut self) -> Result<EncodedAudio, CaptureError>;

    fn abort(&mut self);
}

pub(crate) fn encode_recording(
    mono_samples: &[i16],
    device_sample_rate_hz: u32,
    format: CaptureFormat,
) -> Result<EncodedAudio, CaptureError> {
    let samples = resample_linear(mono_samples, device_sample_rate_hz, format.sample_rate_hz);
    let bytes = pcm16_to_wav_bytes(&samples, format.sample_rate_hz, format.channels())?;
    let duration_ms = if format.sample_rate_hz == 0 {
        0
    } else {
        (samples.len() as u64 * 1000) / u64::from(format.sample_rate_hz)
    };

    Ok(EncodedAudio {
        bytes,
        mime_type: WAV_MIME_TYPE,
        sample_rate_hz: format.sample_rate_hz,
        channels: format.channels(),
        sample_count: samples.len(),
        duration_ms,
    })
}

pub(crate) fn float_to_pcm16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped <= -1.0 {
        i16::MIN
    } else if clamped >= 1.0 {
        i16::MAX
    } else {
        (clamped * i16::MAX as f32).round() as i16
    }
}

pub(crate) fn resample_linear(samples: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if samples.is_empty() || from_hz == to_hz || from_hz == 0 || to_hz == 0 {
        return samples.to_vec();
    }

    let output_len = ((samples.len() as u64 * u64::from(to_hz)) / u64::from(from_hz)) as usize;
    let step = f64::from(from_hz) / f64::from(to_hz);

    (0..output_len)
        .map(|index| {
            let position = index as f64 * step;
            let left_index = position.floor() as usize;
            let fraction = position - left_index as f64;
            let left = f64::from(samples[left_index]);
            let right = f64::from(samples.get(left_index + 1).copied().unwrap_or(samples[left_index]));
            (left + (right - left) * fraction).round() as i16
        })
        .collect()
}

fn pcm16_to_wav_bytes(
    samples: &[i16],
    sample_rate_hz: u32,
    channels: u16,
) -> Result<Vec<u8>, CaptureError> {
    let bytes_per_sample = BITS_PER_SAMPLE / 8;
    let block_align = channels
        .checked_mul(bytes_per_sample)
        .ok_or_else(|| CaptureError::Encoding("block alignment overflow".to_string()))?;
    let byte_rate = sample_rate_hz
        .checked_mul(u32::from(block_align))
        .ok_or_else(|| CaptureError::Encoding("byte rate overflow".to_string()))?;

    let sample_count = u32::try_from(samples.len())
        .map_err(|_| CaptureError::Encoding("recording is too long for WAV".to_string()))?;
    let data_size = sample_count
        .checked_mul(u32::from(bytes_per_sample))
        .ok_or_else(|| CaptureError::Encoding("data size overflow".to_string()))?;
    let riff_chunk_size = 36u32
        .checked_add(data_size)
        .ok_or_else(|| CaptureError::Encoding("RIFF chunk overflow".to_string()))?;

    let mut wav_bytes = Vec::with_capacity(44 + samples.len() * usize::from(bytes_per_sample));
    wav_bytes.extend_from_slice(b"RIFF");
    wav_bytes.extend_from_slice(&riff_chunk_size.to_le_bytes());
    wav_bytes.extend_from_slice(b"WAVE");
    wav_bytes.extend_from_slice(b"fmt ");
    wav_bytes.extend_from_slice(&16u32.to_le_bytes());
    wav_bytes.extend_from_slice(&1u16.to_le_bytes());
    wav_bytes.extend_from_slice(&channels.to_le_bytes());
    wav_bytes.extend_from_slice(&sample_rate_hz.to_le_bytes());
    wav_bytes.extend_from_slice(&byte_rate.to_le_bytes());
    wav_bytes.extend_from_slice(&block_align.to_le_bytes());
    wav_bytes.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav_bytes.extend_from_slice(b"data");
    wav_bytes.extend_from_slice(&data_size.to_le_bytes());
    for sample in samples {
        wav_bytes.extend_from_slice(&sample.to_le_bytes());
    }

    Ok(wav_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_pcm16_clamps_and_scales() {
        assert_eq!(float_to_pcm16(-2.0), i16::MIN);
        assert_eq!(float_to_pcm16(2.0), i16::MAX);
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(0.5), (0.5 * i16::MAX as f32).round() as i16);
    }

    #[test]
    fn resampling_down_by_three_keeps_every_third_sample() {
        let samples: Vec<i16> = (0..48).map(|value| value * 10).collect();

        let resampled = resample_linear(&samples, 48_000, 16_000);

        assert_eq!(resampled.len(), 16);
        assert_eq!(resampled[0], 0);
        assert_eq!(resampled[1], 30);
        assert_eq!(resampled[15], 450);
    }

    #[test]
    fn resampling_up_interpolates_between_neighbours() {
        let resampled = resample_linear(&[0, 100], 8_000, 16_000);

        assert_eq!(resampled, vec![0, 50, 100, 100]);
    }

    #[test]
    fn encoded_recording_has_wav_header_and_target_rate() {
        let samples = vec![1_i16; 4_800];

        let audio = encode_recording(&samples, 48_000, CaptureFormat::default())
            .expect("encoding should succeed");

        assert_eq!(audio.mime_type, WAV_MIME_TYPE);
        assert_eq!(audio.sample_rate_hz, 16_000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.sample_count, 1_600);
        assert_eq!(audio.duration_ms, 100);
        assert_eq!(&audio.bytes[0..4], b"RIFF");
        assert_eq!(&audio.bytes[8..12], b"WAVE");
        assert_eq!(
            u32::from_le_bytes([audio.bytes[24], audio.bytes[25], audio.bytes[26], audio.bytes[27]]),
            16_000
        );
        assert_eq!(audio.bytes.len(), 44 + 1_600 * 2);
        assert!(!audio.is_empty());
    }

    #[test]
    fn empty_capture_encodes_to_empty_recording() {
        let audio =
            encode_recording(&[], 44_100, CaptureFormat::default()).expect("encoding should succeed");

        assert!(audio.is_empty());
        assert_eq!(audio.bytes.len(), 44);
    }

    #[test]
    fn default_format_is_sixteen_khz_mono() {
        let format = CaptureFormat::default();

        assert_eq!(format.channels(), 1);
        assert_eq!(format.bitrate_bps(), 256_000);
    }
}
