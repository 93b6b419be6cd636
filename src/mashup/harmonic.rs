//! Key compatibility on the Camelot wheel.
//!
//! Twelve positions, two rings: `A` for minor keys and `B` for major. Tiers
//! only depend on the unsigned wheel distance, so a step clockwise and a
//! step counter-clockwise always land in the same tier.

use crate::model::Key;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HarmonicTier {
    /// Same key
    #[serde(rename = "tier-1")]
    Tier1,
    /// One step on the same ring
    #[serde(rename = "tier-2")]
    Tier2,
    /// Relative major/minor
    #[serde(rename = "tier-3")]
    Tier3,
    /// Two steps on the same ring ("energy boost")
    #[serde(rename = "tier-4")]
    Tier4,
    /// One step across rings
    #[serde(rename = "tier-5")]
    Tier5,
    /// Everything else, including unknown keys
    #[serde(rename = "tier-6")]
    Tier6,
}

impl HarmonicTier {
    pub fn number(self) -> u8 {
        match self {
            HarmonicTier::Tier1 => 1,
            HarmonicTier::Tier2 => 2,
            HarmonicTier::Tier3 => 3,
            HarmonicTier::Tier4 => 4,
            HarmonicTier::Tier5 => 5,
            HarmonicTier::Tier6 => 6,
        }
    }

    /// Key component of the composite score.
    pub fn score(self) -> f64 {
        match self {
            HarmonicTier::Tier1 => 1.0,
            HarmonicTier::Tier2 => 0.9,
            HarmonicTier::Tier3 => 0.8,
            HarmonicTier::Tier4 => 0.7,
            HarmonicTier::Tier5 => 0.5,
            HarmonicTier::Tier6 => 0.3,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            HarmonicTier::Tier1 => "same key",
            HarmonicTier::Tier2 => "adjacent",
            HarmonicTier::Tier3 => "relative",
            HarmonicTier::Tier4 => "energy boost",
            HarmonicTier::Tier5 => "diagonal",
            HarmonicTier::Tier6 => "creative/risky",
        }
    }
}

impl fmt::Display for HarmonicTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier-{}", self.number())
    }
}

/// Shortest number of steps between two wheel positions (0-6).
pub fn wheel_distance(a: u8, b: u8) -> u8 {
    let d = (i16::from(a) - i16::from(b)).rem_euclid(12) as u8;
    d.min(12 - d)
}

pub fn tier(a: Key, b: Key) -> HarmonicTier {
    let same_ring = a.mode == b.mode;
    match (wheel_distance(a.camelot_number(), b.camelot_number()), same_ring) {
        (0, true) => HarmonicTier::Tier1,
        (1, true) => HarmonicTier::Tier2,
        (0, false) => HarmonicTier::Tier3,
        (2, true) => HarmonicTier::Tier4,
        (1, false) => HarmonicTier::Tier5,
        _ => HarmonicTier::Tier6,
    }
}

/// Tier for key strings; anything unparseable is tier 6.
pub fn tier_for(a: &str, b: &str) -> HarmonicTier {
    match (Key::parse(a), Key::parse(b)) {
        (Some(a), Some(b)) => tier(a, b),
        _ => HarmonicTier::Tier6,
    }
}
