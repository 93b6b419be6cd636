//! Key estimation: a chroma profile matched against Krumhansl-Kessler
//! templates, with a fixed low-confidence default when that fails.

use super::spectrum::Stft;
use crate::model::{Key, Mode, PitchClass};
use thiserror::Error;

const KK_MAJOR: [f32; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const KK_MINOR: [f32; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

const MIN_FREQ: f32 = 55.0;
const MAX_FREQ: f32 = 5000.0;

/// Confidence attached to the fallback key.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    #[error("no tonal energy in the analyzed window")]
    Silent,
    #[error("all key strategies failed: {0}")]
    Exhausted(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyEstimate {
    pub key: Key,
    pub confidence: f64,
}

pub trait KeyEstimator: Send + Sync {
    fn estimate(&self, samples: &[f32], sample_rate: u32) -> Result<KeyEstimate, KeyError>;

    fn name(&self) -> &'static str;
}

pub fn default_strategies() -> Vec<Box<dyn KeyEstimator>> {
    vec![Box::new(ChromaKeyEstimator::new()), Box::new(FixedKey)]
}

pub fn estimate(
    strategies: &[Box<dyn KeyEstimator>],
    samples: &[f32],
    sample_rate: u32,
) -> Result<(KeyEstimate, &'static str), KeyError> {
    let mut failures = Vec::new();
    for strategy in strategies {
        match strategy.estimate(samples, sample_rate) {
            Ok(est) => return Ok((est, strategy.name())),
            Err(e) => {
                log::debug!("Key strategy {} failed: {e}", strategy.name());
                failures.push(format!("{}: {e}", strategy.name()));
            }
        }
    }
    Err(KeyError::Exhausted(failures.join("; ")))
}

pub struct ChromaKeyEstimator {
    frame_size: usize,
    hop: usize,
}

impl ChromaKeyEstimator {
    pub fn new() -> Self {
        Self {
            frame_size: 4096,
            hop: 2048,
        }
    }

    /// Summed magnitude per pitch class (C = 0) over every frame.
    pub fn chroma(&self, samples: &[f32], sample_rate: u32) -> [f32; 12] {
        let stft = Stft::new(self.frame_size, self.hop);
        let bin_classes: Vec<Option<usize>> = (0..stft.bins())
            .map(|bin| {
                let freq = stft.bin_frequency(bin, sample_rate);
                if !(MIN_FREQ..=MAX_FREQ).contains(&freq) {
                    return None;
                }
                // semitones from A4, shifted so C = 0
                let semis = (12.0 * (freq / 440.0).log2()).round() as i32;
                Some((semis + 9).rem_euclid(12) as usize)
            })
            .collect();

        let mut chroma = [0.0f32; 12];
        for frame in stft.frames(samples) {
            for (mag, class) in frame.iter().zip(&bin_classes) {
                if let Some(pc) = class {
                    chroma[*pc] += mag;
                }
            }
        }
        chroma
    }
}

impl Default for ChromaKeyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn pearson(a: &[f32; 12], b: &[f32; 12]) -> f32 {
    let ma = a.iter().sum::<f32>() / 12.0;
    let mb = b.iter().sum::<f32>() / 12.0;
    let (mut num, mut da, mut db) = (0.0, 0.0, 0.0);
    for i in 0..12 {
        let x = a[i] - ma;
        let y = b[i] - mb;
        num += x * y;
        da += x * x;
        db += y * y;
    }
    let denom = (da * db).sqrt();
    if denom < 1e-12 { 0.0 } else { num / denom }
}

fn rotated(profile: &[f32; 12], root: usize) -> [f32; 12] {
    let mut out = [0.0; 12];
    for (i, v) in out.iter_mut().enumerate() {
        *v = profile[(i + 12 - root) % 12];
    }
    out
}

impl KeyEstimator for ChromaKeyEstimator {
    fn name(&self) -> &'static str {
        "chroma-profile"
    }

    fn estimate(&self, samples: &[f32], sample_rate: u32) -> Result<KeyEstimate, KeyError> {
        let chroma = self.chroma(samples, sample_rate);
        if chroma.iter().sum::<f32>() < 1e-6 {
            return Err(KeyError::Silent);
        }

        let mut scores: Vec<(f32, Key)> = Vec::with_capacity(24);
        for root in 0..12 {
            for (profile, mode) in [(&KK_MAJOR, Mode::Major), (&KK_MINOR, Mode::Minor)] {
                let score = pearson(&chroma, &rotated(profile, root));
                scores.push((score, Key::new(PitchClass::from_index(root), mode)));
            }
        }
        scores.sort_by(|a, b| b.0.total_cmp(&a.0));

        let (best, key) = scores[0];
        let separation = best - scores[1].0;
        let confidence =
            0.7 * (separation / 0.15).clamp(0.0, 1.0) + 0.3 * ((best + 1.0) / 2.0).clamp(0.0, 1.0);

        Ok(KeyEstimate {
            key,
            confidence: f64::from(confidence),
        })
    }
}

/// Last resort: C major at a confidence low enough that any tag overrides it.
pub struct FixedKey;

impl KeyEstimator for FixedKey {
    fn name(&self) -> &'static str {
        "fixed-default"
    }

    fn estimate(&self, _samples: &[f32], _sample_rate: u32) -> Result<KeyEstimate, KeyError> {
        Ok(KeyEstimate {
            key: Key::new(PitchClass::C, Mode::Major),
            confidence: FALLBACK_CONFIDENCE,
        })
    }
}
