//! Read-only neurofeedback inputs.
//!
//! Snapshots are produced by an external EEG client at roughly 1 Hz. This
//! crate only consumes them: patterns read band powers, the render loop reads
//! brightness and coherence, the audio side reads coherence and the volume
//! modulations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// EEG frequency bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

/// One neurofeedback reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeurofeedbackSnapshot {
    /// How well the measured band matches the target, in `[0, 1]`.
    pub coherence_score: f64,
    pub target_band: Band,
    #[serde(default = "unity")]
    pub brightness_modulation: f64,
    #[serde(default = "unity")]
    pub beat_volume_modulation: f64,
    #[serde(default = "unity")]
    pub noise_volume_modulation: f64,
    /// Relative band powers; 1.0 is the session baseline.
    #[serde(default)]
    pub band_powers: BTreeMap<Band, f64>,
}

fn unity() -> f64 {
    1.0
}

impl NeurofeedbackSnapshot {
    pub fn new(coherence_score: f64, target_band: Band) -> Self {
        Self {
            coherence_score,
            target_band,
            brightness_modulation: 1.0,
            beat_volume_modulation: 1.0,
            noise_volume_modulation: 1.0,
            band_powers: BTreeMap::new(),
        }
    }

    pub fn with_band_power(mut self, band: Band, power: f64) -> Self {
        self.band_powers.insert(band, power);
        self
    }

    /// Coherence mapped onto `[-1, 1]`; 0 is "neither on nor off target".
    pub fn normalized_coherence(&self) -> f64 {
        normalize_coherence(self.coherence_score)
    }

    /// Multiplier applied to discrete complexity parameters of generative
    /// patterns: `1 + Σ(power - 1) * influence / 100 * 0.5`, never negative.
    pub fn complexity_factor(&self, influence_percent: f64) -> f64 {
        let excess: f64 = self.band_powers.values().map(|power| power - 1.0).sum();
        (1.0 + excess * influence_percent / 100.0 * 0.5).max(0.0)
    }
}

pub fn normalize_coherence(score: f64) -> f64 {
    (score * 2.0 - 1.0).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_score_into_signed_range() {
        assert_eq!(normalize_coherence(0.0), -1.0);
        assert_eq!(normalize_coherence(0.5), 0.0);
        assert_eq!(normalize_coherence(1.0), 1.0);
        assert_eq!(normalize_coherence(3.0), 1.0);
    }

    #[test]
    fn complexity_factor_sums_band_excess() {
        let snapshot = NeurofeedbackSnapshot::new(0.8, Band::Alpha)
            .with_band_power(Band::Alpha, 1.6)
            .with_band_power(Band::Theta, 1.2);
        let factor = snapshot.complexity_factor(50.0);
        assert!((factor - (1.0 + 0.8 * 0.5 * 0.5)).abs() < 1e-12);

        let quiet = NeurofeedbackSnapshot::new(0.1, Band::Alpha).with_band_power(Band::Beta, -10.0);
        assert_eq!(quiet.complexity_factor(100.0), 0.0);
    }

    #[test]
    fn missing_modulations_default_to_unity() {
        let snapshot: NeurofeedbackSnapshot =
            serde_json::from_str(r#"{"coherence_score":0.4,"target_band":"theta"}"#).unwrap();
        assert_eq!(snapshot.brightness_modulation, 1.0);
        assert!(snapshot.band_powers.is_empty());
    }
}
