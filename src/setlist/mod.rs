//! Greedy set generation.
//!
//! At each step every unused track is scored against the energy curve at the
//! current position and against the previous pick, then one of the three best
//! is chosen at random. The set ends once its running duration reaches the
//! target or the library runs out.

pub mod curve;

use crate::mashup::harmonic::{self, HarmonicTier};
use crate::mashup::scoring::bpm_score;
use crate::model::Track;
use curve::EnergyCurve;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;

const ENERGY_WEIGHT: f64 = 0.40;
const TRANSITION_WEIGHT: f64 = 0.40;
const DIVERSITY_WEIGHT: f64 = 0.10;
const NOVELTY_WEIGHT: f64 = 0.10;

/// Candidates the random pick chooses among.
pub const TOP_CHOICES: usize = 3;

/// Mix-in point as a fraction of the outgoing track when it has no segments.
const DEFAULT_MIX_FRACTION: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetOptions {
    /// Seconds
    pub target_duration: f64,
    pub curve: EnergyCurve,
    /// Count key compatibility in transition quality
    pub harmonic: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            target_duration: 3600.0,
            curve: EnergyCurve::default(),
            harmonic: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetTrack {
    pub id: u64,
    pub name: String,
    pub bpm: f64,
    pub key: String,
    pub energy: f64,
    pub duration: f64,
    pub folder: String,
    /// Curve value the track was picked against
    pub target_energy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetTransition {
    pub from: u64,
    pub to: u64,
    pub score: f64,
    pub bpm_gap: f64,
    pub key_compatible: bool,
    /// Seconds into the outgoing track
    pub mix_point: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratedSet {
    pub tracks: Vec<SetTrack>,
    pub transitions: Vec<SetTransition>,
    pub total_duration: f64,
    pub energy_arc: Vec<f64>,
    pub average_transition_score: f64,
}

/// BPM proximity, averaged with the key tier score when `harmonic` is set.
pub fn transition_quality(from: &Track, to: &Track, harmonic: bool) -> f64 {
    let bpm = bpm_score(from.bpm - to.bpm);
    if harmonic {
        (bpm + harmonic::tier_for(&from.key, &to.key).score()) / 2.0
    } else {
        bpm
    }
}

/// Start of the outgoing track's last segment, or three quarters in.
pub fn mix_point(track: &Track) -> f64 {
    match track.segments.last() {
        Some(seg) => seg.start,
        None => track.duration * DEFAULT_MIX_FRACTION,
    }
}

fn candidate_score(
    candidate: &Track,
    previous: Option<&Track>,
    target_energy: f64,
    folder_uses: &HashMap<&str, usize>,
    harmonic: bool,
) -> f64 {
    let energy_fit = (1.0 - 2.0 * (candidate.energy - target_energy).abs()).max(0.0);
    let label = candidate.folder_label();
    let (transition, diversity) = match previous {
        Some(prev) => (
            transition_quality(prev, candidate, harmonic),
            if prev.folder_label() != label { 1.0 } else { 0.0 },
        ),
        None => (1.0, 1.0),
    };
    let uses = folder_uses.get(label).copied().unwrap_or(0);
    let novelty = 1.0 / (1.0 + uses as f64);

    ENERGY_WEIGHT * energy_fit
        + TRANSITION_WEIGHT * transition
        + DIVERSITY_WEIGHT * diversity
        + NOVELTY_WEIGHT * novelty
}

/// Build a set from the analyzed tracks with a positive duration.
pub fn generate_set<R: Rng>(
    tracks: &[Track],
    options: &SetOptions,
    rng: &mut R,
) -> GeneratedSet {
    let mut remaining: Vec<&Track> = tracks
        .iter()
        .filter(|t| t.is_analyzed() && t.duration > 0.0)
        .collect();
    let mut chosen: Vec<(&Track, f64)> = Vec::new();
    let mut folder_uses: HashMap<&str, usize> = HashMap::new();
    let mut total = 0.0;

    while total < options.target_duration && !remaining.is_empty() {
        let position = if options.target_duration > 0.0 {
            total / options.target_duration
        } else {
            1.0
        };
        let target = options.curve.target(position);
        let previous = chosen.last().map(|(t, _)| *t);

        let mut ranked: Vec<(usize, f64)> = remaining
            .iter()
            .enumerate()
            .map(|(i, t)| {
                (
                    i,
                    candidate_score(t, previous, target, &folder_uses, options.harmonic),
                )
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let pick = rng.random_range(0..TOP_CHOICES.min(ranked.len()));
        let track = remaining.remove(ranked[pick].0);
        log::trace!(
            "Set position {position:.2}: target {target:.2}, picked {} (energy {:.2})",
            track.name,
            track.energy
        );

        *folder_uses.entry(track.folder_label()).or_insert(0) += 1;
        total += track.duration;
        chosen.push((track, target));
    }

    let transitions: Vec<SetTransition> = chosen
        .windows(2)
        .map(|pair| {
            let (from, to) = (pair[0].0, pair[1].0);
            let tier = harmonic::tier_for(&from.key, &to.key);
            SetTransition {
                from: from.id,
                to: to.id,
                score: transition_quality(from, to, options.harmonic),
                bpm_gap: (from.bpm - to.bpm).abs(),
                key_compatible: tier <= HarmonicTier::Tier3,
                mix_point: mix_point(from),
            }
        })
        .collect();

    let average_transition_score = if transitions.is_empty() {
        0.0
    } else {
        transitions.iter().map(|t| t.score).sum::<f64>() / transitions.len() as f64
    };

    GeneratedSet {
        energy_arc: chosen.iter().map(|(t, _)| t.energy).collect(),
        tracks: chosen
            .iter()
            .map(|&(t, target)| SetTrack {
                id: t.id,
                name: t.name.clone(),
                bpm: t.bpm,
                key: t.key.clone(),
                energy: t.energy,
                duration: t.duration,
                folder: t.folder_label().to_string(),
                target_energy: target,
            })
            .collect(),
        transitions,
        total_duration: total,
        average_transition_score,
    }
}
