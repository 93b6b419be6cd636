use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Target energy over normalized set position.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum EnergyCurve {
    /// Near-constant with a small ripple
    Steady,
    /// Warm-up, climb, then sustain near the peak
    #[default]
    Build,
    /// Two full up-and-down cycles
    Rollercoaster,
}

impl EnergyCurve {
    /// Target energy at `position` in [0, 1].
    pub fn target(self, position: f64) -> f64 {
        let p = position.clamp(0.0, 1.0);
        let value = match self {
            EnergyCurve::Steady => 0.6 + 0.05 * (TAU * 3.0 * p).sin(),
            EnergyCurve::Build => {
                if p < 0.25 {
                    0.3 + 0.2 * (p / 0.25)
                } else if p < 0.75 {
                    0.5 + 0.4 * ((p - 0.25) / 0.5)
                } else {
                    0.9 - 0.05 * ((p - 0.75) / 0.25)
                }
            }
            EnergyCurve::Rollercoaster => 0.55 + 0.3 * (TAU * 2.0 * p).sin(),
        };
        value.clamp(0.0, 1.0)
    }
}
