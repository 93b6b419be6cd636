use super::harmonic::HarmonicTier;
use serde::Serialize;

pub const BPM_WEIGHT: f64 = 0.40;
pub const KEY_WEIGHT: f64 = 0.40;
pub const ENERGY_WEIGHT: f64 = 0.10;
pub const CONFIDENCE_WEIGHT: f64 = 0.10;

/// Pitch change beyond this many percent stops sounding natural.
pub const NATURAL_PITCH_PERCENT: f64 = 6.0;

/// Step function of absolute BPM difference.
pub fn bpm_score(diff: f64) -> f64 {
    let diff = diff.abs();
    if diff <= 0.05 {
        1.0
    } else if diff <= 1.0 {
        0.95
    } else if diff <= 2.0 {
        0.9
    } else if diff <= 3.0 {
        0.8
    } else if diff <= 5.0 {
        0.7
    } else if diff <= 8.0 {
        0.5
    } else if diff <= 10.0 {
        0.4
    } else if diff <= 15.0 {
        0.2
    } else {
        0.0
    }
}

pub fn composite(bpm_diff: f64, tier: HarmonicTier, energy_gap: f64, confidence: f64) -> f64 {
    BPM_WEIGHT * bpm_score(bpm_diff)
        + KEY_WEIGHT * tier.score()
        + ENERGY_WEIGHT * (1.0 - energy_gap.abs()).clamp(0.0, 1.0)
        + CONFIDENCE_WEIGHT * confidence.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Category {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Category::Excellent
        } else if score >= 0.70 {
            Category::Good
        } else if score >= 0.50 {
            Category::Fair
        } else {
            Category::Poor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Excellent => "excellent",
            Category::Good => "good",
            Category::Fair => "fair",
            Category::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchBadge {
    Perfect,
    Excellent,
    Good,
    Workable,
    Challenging,
}

impl MatchBadge {
    pub fn classify(bpm_diff: f64, tier: HarmonicTier, energy_gap: f64) -> Self {
        let t = tier.number();
        if bpm_diff <= 1.0 && t == 1 && energy_gap <= 0.1 {
            MatchBadge::Perfect
        } else if bpm_diff <= 3.0 && t <= 3 && energy_gap <= 0.2 {
            MatchBadge::Excellent
        } else if bpm_diff <= 6.0 && t <= 4 {
            MatchBadge::Good
        } else if bpm_diff <= 10.0 {
            MatchBadge::Workable
        } else {
            MatchBadge::Challenging
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchBadge::Perfect => "perfect",
            MatchBadge::Excellent => "excellent",
            MatchBadge::Good => "good",
            MatchBadge::Workable => "workable",
            MatchBadge::Challenging => "challenging",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MixDifficulty {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl MixDifficulty {
    pub fn classify(bpm_diff: f64, tier: HarmonicTier, energy_gap: f64) -> Self {
        let t = tier.number();
        if bpm_diff <= 2.0 && t <= 2 && energy_gap <= 0.15 {
            MixDifficulty::Beginner
        } else if bpm_diff <= 5.0 && t <= 4 && energy_gap <= 0.3 {
            MixDifficulty::Intermediate
        } else if bpm_diff <= 10.0 && t <= 5 {
            MixDifficulty::Advanced
        } else {
            MixDifficulty::Expert
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MixDifficulty::Beginner => "beginner",
            MixDifficulty::Intermediate => "intermediate",
            MixDifficulty::Advanced => "advanced",
            MixDifficulty::Expert => "expert",
        }
    }
}

/// Tempo change that brings a track to a target BPM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PitchAdjust {
    pub percent: f64,
    pub semitones: f64,
    pub natural: bool,
}

pub fn pitch_adjust(source_bpm: f64, target_bpm: f64) -> PitchAdjust {
    if source_bpm <= 0.0 || target_bpm <= 0.0 {
        return PitchAdjust {
            percent: 0.0,
            semitones: 0.0,
            natural: false,
        };
    }
    let ratio = target_bpm / source_bpm;
    let percent = (ratio - 1.0) * 100.0;
    PitchAdjust {
        percent,
        semitones: (12.0 * ratio.log2() * 10.0).round() / 10.0,
        natural: percent.abs() <= NATURAL_PITCH_PERCENT,
    }
}
