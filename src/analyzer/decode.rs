//! Byte buffer -> mono f32 at the analysis rate, then cut to the mode's window.

use crate::model::AnalysisMode;
use rubato::{FftFixedInOut, Resampler};
use std::io::Cursor;
use std::ops::Range;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

/// Sample rate everything is analyzed at. Tempo and key content sits well
/// below 11 kHz.
pub const TARGET_SAMPLE_RATE: u32 = 22050;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported or unrecognized format: {0}")]
    UnsupportedFormat(String),
    #[error("No audio track in {0}")]
    NoAudioTrack(String),
    #[error("Decode error: {0}")]
    Symphonia(#[from] SymphoniaError),
    #[error("File decoded to zero samples")]
    Empty,
}

/// Whole track, mono, at [`TARGET_SAMPLE_RATE`].
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decoded track plus the sample range the estimators should look at.
#[derive(Debug, Clone)]
pub struct PreparedAudio {
    pub audio: DecodedAudio,
    pub window: Range<usize>,
    pub mode: AnalysisMode,
}

impl PreparedAudio {
    pub fn new(audio: DecodedAudio, mode: AnalysisMode) -> Self {
        let (start, len) = mode.window(audio.duration());
        let sr = audio.sample_rate as f64;
        let begin = ((start * sr) as usize).min(audio.samples.len());
        let end = (begin + (len * sr) as usize).min(audio.samples.len());
        Self {
            audio,
            window: begin..end,
            mode,
        }
    }

    pub fn window_samples(&self) -> &[f32] {
        &self.audio.samples[self.window.clone()]
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.sample_rate
    }

    pub fn duration(&self) -> f64 {
        self.audio.duration()
    }

    pub fn analyzed_duration(&self) -> f64 {
        self.window.len() as f64 / self.audio.sample_rate as f64
    }
}

/// Decode an in-memory file. `file_name` only feeds the format hint.
pub fn decode_bytes(bytes: Arc<[u8]>, file_name: &str) -> Result<DecodedAudio, DecodeError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
    {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::UnsupportedFormat(format!("{file_name}: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::NoAudioTrack(file_name.to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params.sample_rate.unwrap_or(44100);
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);

    log::trace!("Decoding {file_name} @ {source_rate}Hz, {channels} channels");

    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    let mut mono: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::trace!("Skipping corrupt frame in {file_name}: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        mono.extend(to_mono(buf.samples(), spec.channels.count().max(1)));
    }

    if mono.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(DecodedAudio {
        samples: resample(&mono, source_rate, TARGET_SAMPLE_RATE),
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

/// Average interleaved channels down to one.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// FFT resampling via rubato, falling back to linear interpolation when the
/// resampler can't be built for this rate pair.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    const CHUNK_SIZE: usize = 1024;
    let mut resampler =
        match FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, 1) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Resampler init failed ({e}), using linear fallback");
                return resample_linear(samples, from_rate, to_rate);
            }
        };

    let in_frames = resampler.input_frames_next();
    let out_frames = resampler.output_frames_next();
    let ratio = to_rate as f64 / from_rate as f64;
    let mut output = Vec::with_capacity((samples.len() as f64 * ratio).ceil() as usize);

    let mut pos = 0;
    while pos < samples.len() {
        let end = (pos + in_frames).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();
        chunk.resize(in_frames, 0.0);

        match resampler.process(&[chunk], None) {
            Ok(resampled) => {
                if let Some(channel) = resampled.first() {
                    let valid = if end - pos < in_frames {
                        (((end - pos) as f64 * ratio).ceil() as usize).min(out_frames)
                    } else {
                        out_frames
                    };
                    output.extend_from_slice(&channel[..valid.min(channel.len())]);
                }
            }
            Err(e) => {
                log::debug!("Resampler failed mid-stream ({e}), finishing with linear fallback");
                output.extend(resample_linear(&samples[pos..], from_rate, to_rate));
                break;
            }
        }
        pos += in_frames;
    }

    output
}

fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let step = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / step) as usize;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * step;
            let idx = src as usize;
            let frac = (src - idx as f64) as f32;
            match samples.get(idx + 1) {
                Some(next) => samples[idx] * (1.0 - frac) + next * frac,
                None => samples[idx.min(samples.len() - 1)],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(sample_rate: u32, channels: u16, secs: f32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let frames = (sample_rate as f32 * secs) as usize;
            for i in 0..frames {
                let v = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin();
                for _ in 0..channels {
                    writer.write_sample((v * 16000.0) as i16).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let mono = to_mono(&[0.5, 0.3, 0.8, 0.2], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.4).abs() < 1e-6);
        assert!((mono[1] - 0.5).abs() < 1e-6);
        assert_eq!(to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..4410).map(|i| (i as f32 / 100.0).sin()).collect();
        let out = resample(&samples, 44100, 22050);
        assert!((out.len() as i64 - 2205).abs() < 4, "got {}", out.len());
        let linear = resample_linear(&samples, 44100, 22050);
        assert_eq!(linear.len(), 2205);
    }

    #[test]
    fn test_decode_wav_bytes() {
        let bytes: Arc<[u8]> = wav_bytes(44100, 2, 2.0).into();
        let audio = decode_bytes(bytes, "tone.wav").unwrap();
        assert_eq!(audio.sample_rate, TARGET_SAMPLE_RATE);
        assert!((audio.duration() - 2.0).abs() < 0.05, "{}", audio.duration());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let bytes: Arc<[u8]> = vec![0u8; 512].into();
        assert!(decode_bytes(bytes, "junk.mp3").is_err());
    }

    #[test]
    fn test_prepared_window_quick_is_centered() {
        let audio = DecodedAudio {
            samples: vec![0.0; TARGET_SAMPLE_RATE as usize * 60],
            sample_rate: TARGET_SAMPLE_RATE,
        };
        let prepared = PreparedAudio::new(audio, AnalysisMode::Quick);
        let sr = TARGET_SAMPLE_RATE as usize;
        assert_eq!(prepared.window, (sr * 45 / 2)..(sr * 45 / 2 + sr * 15));
        assert!((prepared.analyzed_duration() - 15.0).abs() < 1e-9);
        assert!((prepared.duration() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_prepared_window_short_track_uses_everything() {
        let audio = DecodedAudio {
            samples: vec![0.0; TARGET_SAMPLE_RATE as usize * 10],
            sample_rate: TARGET_SAMPLE_RATE,
        };
        let prepared = PreparedAudio::new(audio, AnalysisMode::HighPrecision);
        assert_eq!(prepared.window_samples().len(), TARGET_SAMPLE_RATE as usize * 10);
    }
}
