//! Tempo estimation strategies.
//!
//! [`estimate`] runs an ordered list of named estimators and returns the
//! first one that succeeds. The primary tracker autocorrelates a spectral
//! flux envelope; the fallback picks energy onsets and reads the tempo off an
//! inter-onset-interval histogram.

use super::spectrum::Stft;
use thiserror::Error;

/// Tempo range every estimate is folded into.
pub const MIN_BPM: f64 = 60.0;
pub const MAX_BPM: f64 = 200.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TempoError {
    #[error("signal too short for tempo estimation ({0:.1}s)")]
    TooShort(f64),
    #[error("no periodicity found in onset envelope")]
    NoPeriodicity,
    #[error("only {0} onsets detected, need at least 4")]
    TooFewOnsets(usize),
    #[error("all tempo strategies failed: {0}")]
    Exhausted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempoEstimate {
    pub bpm: f64,
    /// 0-1
    pub confidence: f64,
    /// Beat times in seconds, relative to the start of the analyzed window
    pub beats: Vec<f64>,
}

pub trait TempoEstimator: Send + Sync {
    fn estimate(&self, samples: &[f32], sample_rate: u32) -> Result<TempoEstimate, TempoError>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Primary first, fallback second.
pub fn default_strategies() -> Vec<Box<dyn TempoEstimator>> {
    vec![Box::new(FluxBeatTracker::new()), Box::new(EnergyOnsetTracker::new())]
}

/// Try each strategy in order. Returns the estimate and the name of the
/// strategy that produced it.
pub fn estimate(
    strategies: &[Box<dyn TempoEstimator>],
    samples: &[f32],
    sample_rate: u32,
) -> Result<(TempoEstimate, &'static str), TempoError> {
    let mut failures = Vec::new();
    for strategy in strategies {
        match strategy.estimate(samples, sample_rate) {
            Ok(est) => return Ok((est, strategy.name())),
            Err(e) => {
                log::debug!("Tempo strategy {} failed: {e}", strategy.name());
                failures.push(format!("{}: {e}", strategy.name()));
            }
        }
    }
    Err(TempoError::Exhausted(failures.join("; ")))
}

/// Halve or double until the tempo lands in [60, 200].
pub fn octave_correct(mut bpm: f64) -> f64 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return bpm;
    }
    while bpm > MAX_BPM {
        bpm /= 2.0;
    }
    while bpm < MIN_BPM {
        bpm *= 2.0;
    }
    bpm
}

/// Keep onsets at least 0.8 beat periods apart.
fn thin_to_beats(onsets: &[f64], bpm: f64) -> Vec<f64> {
    let min_gap = 0.8 * 60.0 / bpm;
    let mut beats: Vec<f64> = Vec::with_capacity(onsets.len());
    for &t in onsets {
        if beats.last().is_none_or(|&last| t - last >= min_gap) {
            beats.push(t);
        }
    }
    beats
}

// =============================================================================
// Primary: spectral flux + autocorrelation
// =============================================================================

pub struct FluxBeatTracker {
    frame_size: usize,
    hop: usize,
    /// Local-mean multiplier an envelope peak must exceed to count as an onset
    threshold: f32,
}

impl FluxBeatTracker {
    pub fn new() -> Self {
        Self {
            frame_size: 1024,
            hop: 256,
            threshold: 1.5,
        }
    }

    fn flux_envelope(&self, samples: &[f32]) -> Vec<f32> {
        let stft = Stft::new(self.frame_size, self.hop);
        let frames = stft.frames(samples);
        let mut flux = vec![0.0f32; frames.len()];
        for i in 1..frames.len() {
            flux[i] = frames[i]
                .iter()
                .zip(&frames[i - 1])
                .map(|(&cur, &prev)| (cur - prev).max(0.0))
                .sum();
        }
        flux
    }

    fn peak_pick(&self, env: &[f32], frame_secs: f64) -> Vec<f64> {
        const SPAN: usize = 3;
        const AVG: usize = 30;
        let mut onsets = Vec::new();
        for i in 1..env.len() {
            let lo = i.saturating_sub(SPAN);
            let hi = (i + SPAN).min(env.len() - 1);
            if env[lo..=hi].iter().any(|&v| v > env[i]) {
                continue;
            }
            let alo = i.saturating_sub(AVG);
            let ahi = (i + AVG).min(env.len() - 1);
            let mean = env[alo..=ahi].iter().sum::<f32>() / (ahi - alo + 1) as f32;
            if env[i] > mean * self.threshold && env[i] > 1e-6 {
                // plateau: keep the first frame only
                let now = i as f64 * frame_secs;
                if onsets
                    .last()
                    .is_none_or(|&last: &f64| now - last > frame_secs * SPAN as f64)
                {
                    onsets.push(now);
                }
            }
        }
        onsets
    }
}

impl Default for FluxBeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TempoEstimator for FluxBeatTracker {
    fn name(&self) -> &'static str {
        "spectral-flux"
    }

    fn estimate(&self, samples: &[f32], sample_rate: u32) -> Result<TempoEstimate, TempoError> {
        let secs = samples.len() as f64 / sample_rate as f64;
        if secs < 3.0 {
            return Err(TempoError::TooShort(secs));
        }

        let env = self.flux_envelope(samples);
        let frame_secs = self.hop as f64 / sample_rate as f64;

        // Lag range covers 50-220 BPM so octave correction has room to work.
        let min_lag = (60.0 / (220.0 * frame_secs)).floor().max(1.0) as usize;
        let max_lag = ((60.0 / (50.0 * frame_secs)).ceil() as usize).min(env.len() / 2);
        if min_lag >= max_lag {
            return Err(TempoError::TooShort(secs));
        }

        let mean = env.iter().sum::<f32>() / env.len() as f32;
        let centered: Vec<f32> = env.iter().map(|&x| x - mean).collect();
        let energy: f32 = centered.iter().map(|&x| x * x).sum();
        if energy < 1e-10 {
            return Err(TempoError::NoPeriodicity);
        }
        let n = centered.len();
        let corr_at = |lag: usize| -> f32 {
            centered[..n - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(&a, &b)| a * b)
                .sum::<f32>()
                / energy
        };

        let (best_lag, best_corr) = (min_lag..=max_lag)
            .map(|lag| (lag, corr_at(lag)))
            .fold((min_lag, f32::NEG_INFINITY), |acc, cur| {
                if cur.1 > acc.1 { cur } else { acc }
            });
        if best_corr < 0.05 {
            return Err(TempoError::NoPeriodicity);
        }

        // Parabolic interpolation for sub-frame lag precision
        let lag = if best_lag > min_lag && best_lag < max_lag {
            let prev = corr_at(best_lag - 1);
            let next = corr_at(best_lag + 1);
            let denom = prev - 2.0 * best_corr + next;
            if denom.abs() > 1e-10 {
                best_lag as f64 + 0.5 * f64::from((prev - next) / denom)
            } else {
                best_lag as f64
            }
        } else {
            best_lag as f64
        };

        let mut bpm = 60.0 / (lag * frame_secs);
        // Fast tempos often carry a strong half-tempo correlation too.
        if bpm > 160.0 {
            let half_lag = (lag * 2.0).round() as usize;
            if half_lag <= max_lag && corr_at(half_lag) > best_corr * 0.6 {
                bpm /= 2.0;
            }
        }
        let bpm = octave_correct(bpm);

        let onsets = self.peak_pick(&env, frame_secs);
        Ok(TempoEstimate {
            bpm,
            confidence: f64::from(best_corr).clamp(0.0, 1.0),
            beats: thin_to_beats(&onsets, bpm),
        })
    }
}

// =============================================================================
// Fallback: energy onsets + IOI histogram
// =============================================================================

pub struct EnergyOnsetTracker {
    frame_size: usize,
    hop: usize,
    /// Frames in the rolling average
    history: usize,
    ratio: f32,
    min_gap_secs: f64,
}

impl EnergyOnsetTracker {
    pub fn new() -> Self {
        Self {
            frame_size: 512,
            hop: 256,
            history: 43,
            ratio: 1.5,
            min_gap_secs: 0.1,
        }
    }

    /// Onset times (seconds) where the frame-to-frame energy rise beats the
    /// rolling average of recent rises.
    pub fn onsets(&self, samples: &[f32], sample_rate: u32) -> Vec<f64> {
        let frame_secs = self.hop as f64 / sample_rate as f64;
        let energies: Vec<f32> = (0..)
            .map(|i| i * self.hop)
            .take_while(|&start| start + self.frame_size <= samples.len())
            .map(|start| samples[start..start + self.frame_size].iter().map(|s| s * s).sum())
            .collect();

        let mut onsets: Vec<f64> = Vec::new();
        let mut deltas: Vec<f32> = Vec::with_capacity(energies.len());
        for i in 1..energies.len() {
            let delta = (energies[i] - energies[i - 1]).max(0.0);
            let window = &deltas[deltas.len().saturating_sub(self.history)..];
            let avg = if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<f32>() / window.len() as f32
            };
            deltas.push(delta);

            if delta > 1e-6 && delta > avg * self.ratio {
                let t = i as f64 * frame_secs;
                if onsets.last().is_none_or(|&last| t - last >= self.min_gap_secs) {
                    onsets.push(t);
                }
            }
        }
        onsets
    }
}

impl Default for EnergyOnsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TempoEstimator for EnergyOnsetTracker {
    fn name(&self) -> &'static str {
        "energy-onset"
    }

    fn estimate(&self, samples: &[f32], sample_rate: u32) -> Result<TempoEstimate, TempoError> {
        let onsets = self.onsets(samples, sample_rate);
        if onsets.len() < 4 {
            return Err(TempoError::TooFewOnsets(onsets.len()));
        }

        let iois: Vec<f64> = onsets
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|&d| (0.2..=2.0).contains(&d))
            .collect();
        if iois.is_empty() {
            return Err(TempoError::NoPeriodicity);
        }

        // 10 ms histogram; the densest bin picks the neighbourhood, the
        // median inside it picks the value.
        const BIN: f64 = 0.01;
        let mut hist = std::collections::BTreeMap::<i64, usize>::new();
        for &d in &iois {
            *hist.entry((d / BIN).round() as i64).or_default() += 1;
        }
        let peak = hist
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&bin, _)| bin)
            .ok_or(TempoError::NoPeriodicity)?;

        let mut near: Vec<f64> = iois
            .iter()
            .copied()
            .filter(|&d| ((d / BIN).round() as i64 - peak).abs() <= 2)
            .collect();
        near.sort_by(f64::total_cmp);
        let median = near[near.len() / 2];

        let bpm = octave_correct(60.0 / median);
        let support = near.len() as f64 / iois.len() as f64;
        Ok(TempoEstimate {
            bpm,
            // histogram tempo is never trusted as much as the primary tracker
            confidence: (support * 0.6).clamp(0.0, 0.6),
            beats: thin_to_beats(&onsets, bpm),
        })
    }
}
