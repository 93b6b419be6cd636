//! Pairwise compatibility ranking.
//!
//! Candidate pairs are pruned by tempo before any scoring: tracks are sorted
//! by BPM and each one is only compared against the window of tracks within
//! the configured tolerance, plus the few whose tempo is about double its
//! own. Survivors are scored in parallel and ranked by a stable sort.

pub mod duplicates;
pub mod harmonic;
pub mod scoring;

use crate::model::{BpmTolerance, Track};
use harmonic::HarmonicTier;
use rayon::prelude::*;
use scoring::{Category, MatchBadge, MixDifficulty, PitchAdjust};
use serde::Serialize;
use std::collections::BTreeMap;

/// Sub-tolerance for half-time/double-time pairs. Independent of the direct
/// tolerance.
pub const HALF_TIME_TOLERANCE: f64 = 3.0;

#[derive(Debug, Clone, Default)]
pub struct MashupOptions {
    pub tolerance: BpmTolerance,
    /// Only pair tracks whose folder labels differ
    pub cross_folder: bool,
    /// Up to two folder labels the pairs must come from
    pub pinned_folders: Vec<String>,
    /// Keep at most this many candidates after ranking
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairTrack {
    pub id: u64,
    pub name: String,
    pub bpm: f64,
    pub key: String,
    pub folder: String,
}

impl From<&Track> for PairTrack {
    fn from(t: &Track) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            bpm: t.bpm,
            key: t.key.clone(),
            folder: t.folder_label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MashupCandidate {
    pub track1: PairTrack,
    pub track2: PairTrack,
    pub score: f64,
    pub category: Category,
    /// Measured against the doubled or halved tempo for half-time pairs
    pub bpm_difference: f64,
    pub half_time: bool,
    /// Change to bring track2 to track1's tempo
    pub pitch: PitchAdjust,
    pub match_badge: MatchBadge,
    pub harmonic_tier: HarmonicTier,
    pub difficulty: MixDifficulty,
    pub energy_gap: f64,
    pub perfect_match: u8,
}

/// A pair of indices into the input slice, `i < j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePair {
    pub i: usize,
    pub j: usize,
    pub half_time: bool,
}

/// Enumerate the pairs worth scoring, in `(i, j)` order. Every pair within
/// `tolerance` BPM is included; half/double-time pairs within
/// [`HALF_TIME_TOLERANCE`] are added and flagged.
pub fn candidate_pairs(bpms: &[f64], tolerance: f64) -> Vec<CandidatePair> {
    let mut order: Vec<usize> = (0..bpms.len()).filter(|&i| bpms[i] > 0.0).collect();
    order.sort_by(|&a, &b| bpms[a].total_cmp(&bpms[b]));
    let sorted: Vec<f64> = order.iter().map(|&i| bpms[i]).collect();

    let mut pairs: BTreeMap<(usize, usize), bool> = BTreeMap::new();
    for (p, &a) in order.iter().enumerate() {
        for (q, &b) in order.iter().enumerate().skip(p + 1) {
            if sorted[q] - sorted[p] > tolerance {
                break;
            }
            pairs.insert((a.min(b), a.max(b)), false);
        }

        // tracks near double this tempo
        let double = sorted[p] * 2.0;
        let from = sorted.partition_point(|&x| x < double - HALF_TIME_TOLERANCE);
        let to = sorted.partition_point(|&x| x <= double + HALF_TIME_TOLERANCE);
        for &b in &order[from..to] {
            if b != a {
                pairs.entry((a.min(b), a.max(b))).or_insert(true);
            }
        }
    }

    pairs
        .into_iter()
        .map(|((i, j), half_time)| CandidatePair { i, j, half_time })
        .collect()
}

fn passes_folder_filter(a: &str, b: &str, options: &MashupOptions) -> bool {
    if options.cross_folder && a == b {
        return false;
    }
    match options.pinned_folders.as_slice() {
        [] => true,
        [only] => a == only || b == only,
        [first, second, ..] => (a == first && b == second) || (a == second && b == first),
    }
}

/// Score one pair. `half_time` compares against the doubled/halved tempo.
pub fn score_pair(a: &Track, b: &Track, half_time: bool) -> MashupCandidate {
    // tempo track2 has to reach to sit on track1's grid
    let target = if !half_time {
        a.bpm
    } else if b.bpm > a.bpm {
        a.bpm * 2.0
    } else {
        a.bpm / 2.0
    };
    let bpm_difference = (b.bpm - target).abs();
    let tier = harmonic::tier_for(&a.key, &b.key);
    let energy_gap = (a.energy - b.energy).abs();
    let confidence = (a.confidence + b.confidence) / 2.0;
    let score = scoring::composite(bpm_difference, tier, energy_gap, confidence);

    MashupCandidate {
        track1: PairTrack::from(a),
        track2: PairTrack::from(b),
        score,
        category: Category::from_score(score),
        bpm_difference,
        half_time,
        pitch: scoring::pitch_adjust(b.bpm, target),
        match_badge: MatchBadge::classify(bpm_difference, tier, energy_gap),
        harmonic_tier: tier,
        difficulty: MixDifficulty::classify(bpm_difference, tier, energy_gap),
        energy_gap,
        perfect_match: (score * 100.0).round().clamp(0.0, 100.0) as u8,
    }
}

/// Rank mashup candidates among the analyzed tracks. Ties keep enumeration
/// order.
pub fn find_mashups(tracks: &[Track], options: &MashupOptions) -> Vec<MashupCandidate> {
    let analyzed: Vec<&Track> = tracks.iter().filter(|t| t.is_analyzed()).collect();
    let bpms: Vec<f64> = analyzed.iter().map(|t| t.bpm).collect();
    let pairs: Vec<CandidatePair> = candidate_pairs(&bpms, options.tolerance.bpm())
        .into_iter()
        .filter(|p| {
            passes_folder_filter(
                analyzed[p.i].folder_label(),
                analyzed[p.j].folder_label(),
                options,
            )
        })
        .collect();

    let total = analyzed.len() * analyzed.len().saturating_sub(1) / 2;
    log::debug!(
        "Scoring {} of {total} possible pairs at ±{} BPM",
        pairs.len(),
        options.tolerance.bpm()
    );

    let mut candidates: Vec<MashupCandidate> = pairs
        .par_iter()
        .map(|p| score_pair(analyzed[p.i], analyzed[p.j], p.half_time))
        .collect();
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    if let Some(limit) = options.limit {
        candidates.truncate(limit);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: u64, bpm: f64, key: &str, energy: f64, folder: &str) -> Track {
        let folder = (!folder.is_empty()).then(|| folder.to_string());
        let mut t = Track::placeholder(
            id,
            format!("t{id}.mp3"),
            format!("t{id}.mp3"),
            folder,
            None,
        );
        t.bpm = bpm;
        t.key = key.to_string();
        t.energy = energy;
        t.confidence = 0.9;
        t.key_confidence = 0.9;
        t.duration = 240.0;
        t.is_analyzing = false;
        t
    }

    #[test]
    fn test_end_to_end_pair() {
        let tracks = vec![track(1, 128.0, "Am", 0.70, ""), track(2, 129.0, "Am", 0.72, "")];
        let found = find_mashups(&tracks, &MashupOptions::default());
        assert_eq!(found.len(), 1);
        let c = &found[0];
        assert_eq!(c.harmonic_tier, HarmonicTier::Tier1);
        assert_eq!(c.category, Category::Excellent);
        assert_eq!(c.bpm_difference, 1.0);
        assert!(matches!(c.match_badge, MatchBadge::Perfect | MatchBadge::Excellent));
        assert!((c.score - 0.968).abs() < 1e-9, "score {}", c.score);
        assert_eq!(c.perfect_match, 97);
        assert!(c.pitch.natural);
    }

    #[test]
    fn test_pruning_keeps_every_direct_match() {
        let bpms = [120.0, 174.0, 124.0, 87.0, 126.0, 60.0, 140.0, 121.0, 0.0, 119.5];
        for tol in [2.0, 5.0, 10.0, 15.0] {
            let pairs = candidate_pairs(&bpms, tol);
            for i in 0..bpms.len() {
                for j in (i + 1)..bpms.len() {
                    if bpms[i] > 0.0 && bpms[j] > 0.0 && (bpms[i] - bpms[j]).abs() <= tol {
                        assert!(
                            pairs.iter().any(|p| p.i == i && p.j == j && !p.half_time),
                            "dropped ({i}, {j}) at ±{tol}"
                        );
                    }
                }
            }
            assert!(pairs.windows(2).all(|w| (w[0].i, w[0].j) < (w[1].i, w[1].j)));
        }
    }

    #[test]
    fn test_half_time_pairs_flagged() {
        let pairs = candidate_pairs(&[87.0, 174.0, 150.0], 5.0);
        assert_eq!(
            pairs,
            vec![CandidatePair {
                i: 0,
                j: 1,
                half_time: true
            }]
        );

        // 90 vs 174 is 6 BPM off double; outside the half-time tolerance
        assert!(candidate_pairs(&[90.0, 174.0], 15.0).is_empty());
    }

    #[test]
    fn test_half_time_scoring_uses_doubled_tempo() {
        let c = score_pair(&track(1, 87.0, "Am", 0.5, ""), &track(2, 175.0, "Am", 0.5, ""), true);
        assert_eq!(c.bpm_difference, 1.0);
        assert!(c.half_time);
        assert!(c.pitch.percent < 0.0);
    }

    #[test]
    fn test_ranking_is_stable() {
        let tracks = vec![
            track(1, 128.0, "Am", 0.5, ""),
            track(2, 128.0, "Am", 0.5, ""),
            track(3, 128.0, "Am", 0.5, ""),
        ];
        let found = find_mashups(&tracks, &MashupOptions::default());
        let ids: Vec<(u64, u64)> = found.iter().map(|c| (c.track1.id, c.track2.id)).collect();
        assert_eq!(ids, vec![(1, 2), (1, 3), (2, 3)]);
    }

    #[test]
    fn test_folder_filters() {
        let tracks = vec![
            track(1, 128.0, "Am", 0.5, "House/Deep"),
            track(2, 128.0, "Am", 0.5, "House"),
            track(3, 128.0, "Am", 0.5, "Techno"),
            track(4, 128.0, "Am", 0.5, "Disco"),
        ];
        let ids = |opts: MashupOptions| {
            let mut v: Vec<(u64, u64)> = find_mashups(&tracks, &opts)
                .iter()
                .map(|c| (c.track1.id, c.track2.id))
                .collect();
            v.sort_unstable();
            v
        };

        let cross = ids(MashupOptions {
            cross_folder: true,
            ..Default::default()
        });
        assert!(!cross.contains(&(1, 2)));
        assert_eq!(cross.len(), 5);

        let one = ids(MashupOptions {
            cross_folder: true,
            pinned_folders: vec!["Techno".into()],
            ..Default::default()
        });
        assert_eq!(one, vec![(1, 3), (2, 3), (3, 4)]);

        let two = ids(MashupOptions {
            pinned_folders: vec!["Disco".into(), "House".into()],
            ..Default::default()
        });
        assert_eq!(two, vec![(1, 4), (2, 4)]);
    }

    #[test]
    fn test_unanalyzed_tracks_ignored() {
        let mut pending = track(2, 128.0, "Am", 0.5, "");
        pending.is_analyzing = true;
        let tracks = vec![track(1, 128.0, "Am", 0.5, ""), pending];
        assert!(find_mashups(&tracks, &MashupOptions::default()).is_empty());
    }
}
