use super::decode::PreparedAudio;
use super::key::{self, KeyEstimator};
use super::spectrum::Stft;
use super::tags::EmbeddedTags;
use super::tempo::{self, TempoEstimator};
use crate::model::{
    AnalysisMode, BeatStorage, ExtractionResult, Key, MAX_BPM, Segment, SegmentDensity,
    UNKNOWN_KEY,
};

/// Detected values below this confidence yield to an embedded tag.
pub const TAG_OVERRIDE_THRESHOLD: f64 = 0.7;
/// Confidence assigned to a value taken from a tag.
pub const TAG_CONFIDENCE: f64 = 0.85;

const SILENCE_DB: f64 = -60.0;
const CENTROID_FRAMES: usize = 32;

/// Knobs that shape an extraction result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSettings {
    pub mode: AnalysisMode,
    pub segment_density: SegmentDensity,
    pub beat_storage: BeatStorage,
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Clipped RMS proxy in [0, 1].
pub fn energy(samples: &[f32]) -> f64 {
    (rms(samples) * 4.0).clamp(0.0, 1.0)
}

/// Ratio of detected beats to the beats the tempo predicts over the window.
pub fn danceability(beat_count: usize, bpm: f64, analyzed_duration: f64) -> f64 {
    let expected = bpm / 60.0 * analyzed_duration;
    if expected <= 0.0 {
        return 0.0;
    }
    (beat_count as f64 / expected).clamp(0.0, 1.0)
}

/// Magnitude-weighted mean frequency, averaged over evenly spaced frames.
pub fn spectral_centroid(samples: &[f32], sample_rate: u32) -> f64 {
    let stft = Stft::new(2048, 2048);
    if samples.len() < stft.frame_size {
        return 0.0;
    }
    let last_start = samples.len() - stft.frame_size;
    let frames = CENTROID_FRAMES.min(last_start / stft.frame_size + 1);

    let mut total = 0.0;
    let mut counted = 0usize;
    for i in 0..frames {
        let start = if frames > 1 { last_start * i / (frames - 1) } else { 0 };
        let mags = stft.magnitudes_at(samples, start);
        let weight: f64 = mags.iter().map(|&m| f64::from(m)).sum();
        if weight < 1e-9 {
            continue;
        }
        let weighted: f64 = mags
            .iter()
            .enumerate()
            .map(|(bin, &m)| f64::from(stft.bin_frequency(bin, sample_rate)) * f64::from(m))
            .sum();
        total += weighted / weight;
        counted += 1;
    }
    if counted == 0 { 0.0 } else { total / counted as f64 }
}

/// Split the whole track into `count` equal spans with local energy and
/// loudness.
pub fn segments(samples: &[f32], sample_rate: u32, count: usize) -> Vec<Segment> {
    if samples.is_empty() || count == 0 {
        return Vec::new();
    }
    let sr = sample_rate as f64;
    (0..count)
        .map(|i| {
            let begin = samples.len() * i / count;
            let end = samples.len() * (i + 1) / count;
            let level = rms(&samples[begin..end]);
            let loudness = if level > 0.0 {
                (20.0 * level.log10()).max(SILENCE_DB)
            } else {
                SILENCE_DB
            };
            Segment {
                start: begin as f64 / sr,
                end: end as f64 / sr,
                energy: (level * 4.0).clamp(0.0, 1.0),
                loudness,
            }
        })
        .collect()
}

/// Run every stage over prepared audio. A failing stage leaves its fields at
/// placeholder values instead of aborting the whole result.
pub fn extract_from_audio(
    prepared: &PreparedAudio,
    settings: &ExtractionSettings,
    tempo_strategies: &[Box<dyn TempoEstimator>],
    key_strategies: &[Box<dyn KeyEstimator>],
    progress: &dyn Fn(u8, &str),
) -> ExtractionResult {
    let window = prepared.window_samples();
    let sr = prepared.sample_rate();
    let mut result = ExtractionResult::placeholder(settings.mode);
    result.duration = prepared.duration();
    result.analyzed_duration = prepared.analyzed_duration();

    progress(40, "detecting tempo");
    let beats = match tempo::estimate(tempo_strategies, window, sr) {
        Ok((est, strategy)) => {
            log::trace!("Tempo {:.1} BPM via {strategy}", est.bpm);
            if est.bpm > 0.0 && est.bpm <= MAX_BPM {
                result.bpm = est.bpm;
                result.confidence = est.confidence;
            }
            est.beats
        }
        Err(e) => {
            log::debug!("Tempo unavailable: {e}");
            Vec::new()
        }
    };

    progress(70, "detecting key");
    match key::estimate(key_strategies, window, sr) {
        Ok((est, strategy)) => {
            log::trace!("Key {} via {strategy}", est.key);
            result.key = est.key.to_string();
            result.key_confidence = est.confidence;
        }
        Err(e) => log::debug!("Key unavailable: {e}"),
    }

    progress(90, "computing features");
    result.energy = energy(window);
    result.danceability = danceability(beats.len(), result.bpm, result.analyzed_duration);
    result.spectral_centroid = spectral_centroid(window, sr);
    result.segments = segments(&prepared.audio.samples, sr, settings.segment_density.count());

    let offset = prepared.window.start as f64 / sr as f64;
    match settings.beat_storage {
        BeatStorage::None => {}
        BeatStorage::Count => result.beat_count = Some(beats.len() as u32),
        BeatStorage::Full => {
            result.beat_count = Some(beats.len() as u32);
            result.beat_times = beats.iter().map(|t| t + offset).collect();
        }
    }

    result
}

/// Merge embedded tag values over a detected result. A tag wins only when
/// the detector was unsure, and then carries a fixed confidence.
pub fn merge_tags(mut result: ExtractionResult, tags: &EmbeddedTags) -> ExtractionResult {
    let unsure_tempo = result.confidence < TAG_OVERRIDE_THRESHOLD;
    match tags.bpm {
        Some(bpm) if unsure_tempo && bpm > 0.0 && bpm <= MAX_BPM => {
            log::debug!("Using tagged BPM {bpm} over detected {:.1}", result.bpm);
            result.bpm = bpm;
            result.confidence = TAG_CONFIDENCE;
        }
        _ => {}
    }

    let unsure_key = result.key_confidence < TAG_OVERRIDE_THRESHOLD || result.key == UNKNOWN_KEY;
    match tags.key.as_deref().and_then(Key::parse) {
        Some(key) if unsure_key => {
            log::debug!("Using tagged key {key} over detected {}", result.key);
            result.key = key.to_string();
            result.key_confidence = TAG_CONFIDENCE;
        }
        _ => {}
    }

    result
}
