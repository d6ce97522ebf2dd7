use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{EntrainError, Result};

/// Spectral peaks below this fraction of the total energy are not reported.
const MIN_PEAK_SHARE: f32 = 0.05;
/// Swings smaller than this fraction of the signal level count as steady.
const STEADY_TOLERANCE: f32 = 1e-4;

/// Measured properties of a displayed luminance sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StimulusReport {
    pub samples: usize,
    /// Strongest non-DC frequency, refined between FFT bins.
    pub dominant_hz: Option<f64>,
    /// Fraction of samples brighter than the sequence mean.
    pub duty_cycle: f64,
    /// Peak-to-peak luminance swing.
    pub modulation_depth: f64,
    /// Bright/dark changes per second.
    pub transitions_per_second: f64,
}

/// Frequency analysis of what the display actually showed, one luminance
/// sample per refresh.
pub struct StimulusAnalyzer {
    sample_rate_hz: f64,
    history: Vec<f32>,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl StimulusAnalyzer {
    /// Creates an analyzer expecting one sample per display refresh.
    pub fn new(refresh_rate_hz: f64) -> Self {
        Self {
            sample_rate_hz: refresh_rate_hz.max(1.0),
            history: Vec::new(),
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Returns the sampling rate, i.e. the display refresh rate.
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Appends the luminance of one displayed frame.
    pub fn push(&mut self, luminance: f32) {
        self.history.push(luminance);
    }

    /// Returns the samples pushed so far.
    pub fn history(&self) -> &[f32] {
        &self.history
    }

    /// Clears the recorded history.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Analyses everything pushed so far.
    pub fn report(&mut self) -> Result<StimulusReport> {
        let samples = std::mem::take(&mut self.history);
        let report = self.analyze(&samples);
        self.history = samples;
        report
    }

    /// Analyses an explicit sample sequence without touching the history.
    pub fn analyze(&mut self, samples: &[f32]) -> Result<StimulusReport> {
        if samples.len() < 2 {
            return Err(EntrainError::InvalidInput(
                "stimulus analysis requires at least two samples",
            ));
        }

        let len = samples.len();
        let mean = samples.iter().sum::<f32>() / len as f32;
        let (min, max) = samples
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| (lo.min(*s), hi.max(*s)));
        let bright: Vec<bool> = samples.iter().map(|s| *s > mean).collect();
        let duty_cycle = bright.iter().filter(|b| **b).count() as f64 / len as f64;
        let transitions = bright.windows(2).filter(|w| w[0] != w[1]).count();
        let duration = len as f64 / self.sample_rate_hz;

        Ok(StimulusReport {
            samples: len,
            dominant_hz: if is_steady(min, max) {
                None
            } else {
                self.dominant_frequency(samples, mean)?
            },
            duty_cycle,
            modulation_depth: (max - min) as f64,
            transitions_per_second: transitions as f64 / duration,
        })
    }

    fn dominant_frequency(&mut self, samples: &[f32], mean: f32) -> Result<Option<f64>> {
        let len = samples.len();
        let bin_hz = self.sample_rate_hz / len as f64;
        let fft = self.prepare_fft(len)?;

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = (*value - mean) * hann_value(index, len);
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let magnitudes: Vec<f32> = fft.spectrum.iter().map(|bin| bin.norm()).collect();
        let total: f32 = magnitudes.iter().skip(1).sum();
        let peak = magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, m)| (i, *m));

        let Some((index, magnitude)) = peak else {
            return Ok(None);
        };
        if total <= f32::EPSILON || magnitude / total < MIN_PEAK_SHARE {
            return Ok(None);
        }

        // Parabolic interpolation around the peak bin.
        let offset = match (magnitudes.get(index - 1), magnitudes.get(index + 1)) {
            (Some(&left), Some(&right)) => {
                let denom = left - 2.0 * magnitude + right;
                if denom.abs() > f32::EPSILON {
                    (0.5 * (left - right) / denom).clamp(-0.5, 0.5) as f64
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        Ok(Some((index as f64 + offset) * bin_hz))
    }

    fn prepare_fft(&mut self, size: usize) -> Result<&mut FftResources> {
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            let plan = self.fft_planner.plan_fft_forward(size);
            self.fft = Some(FftResources {
                size,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            });
        }

        self.fft
            .as_mut()
            .ok_or_else(|| EntrainError::Fft("fft plan unavailable".to_string()))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for StimulusAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StimulusAnalyzer")
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("history", &self.history.len())
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn is_steady(min: f32, max: f32) -> bool {
    let level = min.abs().max(max.abs()).max(1.0);
    max - min <= STEADY_TOLERANCE * level
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }
    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{RenderState, TimingOracle};
    use std::time::Duration;

    fn flicker(target: f64, refresh: f64, frames: usize) -> Vec<f32> {
        let oracle = TimingOracle::new(target, refresh);
        let frame = Duration::from_secs_f64(1.0 / refresh);
        let mut state = RenderState::new(Duration::ZERO);
        let mut now = Duration::ZERO;
        (0..frames)
            .map(|_| {
                now += frame;
                if oracle.decide(&mut state, now) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    #[test]
    fn finds_exact_divisor_flicker() {
        let mut analyzer = StimulusAnalyzer::new(60.0);
        let report = analyzer.analyze(&flicker(10.0, 60.0, 600)).unwrap();
        let dominant = report.dominant_hz.unwrap();
        assert!((dominant - 10.0).abs() < 0.2, "{dominant}");
        assert!((report.duty_cycle - 0.5).abs() < 1e-9);
        assert!((report.transitions_per_second - 20.0).abs() < 0.5);
    }

    #[test]
    fn finds_phase_accumulated_flicker() {
        let mut analyzer = StimulusAnalyzer::new(60.0);
        let report = analyzer.analyze(&flicker(7.0, 60.0, 1200)).unwrap();
        let dominant = report.dominant_hz.unwrap();
        assert!((dominant - 7.0).abs() < 0.3, "{dominant}");
    }

    #[test]
    fn steady_light_has_no_dominant_frequency() {
        let mut analyzer = StimulusAnalyzer::new(60.0);
        for _ in 0..120 {
            analyzer.push(0.8);
        }
        let report = analyzer.report().unwrap();
        assert_eq!(report.dominant_hz, None);
        assert_eq!(report.modulation_depth, 0.0);
        assert_eq!(analyzer.history().len(), 120);
        analyzer.reset();
        assert!(analyzer.history().is_empty());
    }

    #[test]
    fn near_constant_input_never_reports_a_frequency() {
        let mut analyzer = StimulusAnalyzer::new(60.0);
        let samples: Vec<f32> = (0..600)
            .map(|i| 0.8 + if i % 7 == 0 { 1e-7 } else { 0.0 })
            .collect();
        let report = analyzer.analyze(&samples).unwrap();
        assert_eq!(report.dominant_hz, None);
    }

    #[test]
    fn reported_frequencies_stay_within_the_spectrum() {
        let mut analyzer = StimulusAnalyzer::new(60.0);
        let nyquist = analyzer.sample_rate_hz() / 2.0;
        for target in [1.0, 5.0, 7.0, 10.0, 13.0, 29.0] {
            let report = analyzer.analyze(&flicker(target, 60.0, 480)).unwrap();
            if let Some(hz) = report.dominant_hz {
                assert!((0.0..=nyquist).contains(&hz), "{target}: {hz}");
            }
        }
    }

    #[test]
    fn rejects_tiny_inputs() {
        assert_eq!(StimulusAnalyzer::new(0.0).sample_rate_hz(), 1.0);
        let mut analyzer = StimulusAnalyzer::new(60.0);
        assert!(matches!(analyzer.analyze(&[1.0]), Err(EntrainError::InvalidInput(_))));
    }
}
