use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::neurofeedback::NeurofeedbackSnapshot;
use crate::render::Rgba;
use crate::Result;

/// Lowest flicker frequency the configuration layer lets through.
pub const MIN_TARGET_HZ: f64 = 0.1;

/// Top-level configuration document for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub visual: VisualConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Pattern family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternMode {
    Clinical,
    Generative,
}

impl Default for PatternMode {
    fn default() -> Self {
        Self::Clinical
    }
}

/// Snapshot of everything the render loop reads on one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    pub target_hz: f64,
    pub refresh_rate_hz: f64,
    pub pattern_mode: PatternMode,
    pub pattern_id: String,
    pub pattern: PatternParams,
    pub colors: Colors,
    pub neurofeedback_enabled: bool,
    /// Blur applied at zero coherence when neurofeedback is enabled.
    pub max_blur_px: f64,
    pub safety_acknowledged: bool,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            target_hz: 10.0,
            refresh_rate_hz: 60.0,
            pattern_mode: PatternMode::Clinical,
            pattern_id: "full-field".to_string(),
            pattern: PatternParams::default(),
            colors: Colors::default(),
            neurofeedback_enabled: false,
            max_blur_px: 6.0,
            safety_acknowledged: false,
        }
    }
}

impl VisualConfig {
    /// Target frequency clamped so that one half-cycle lasts at least a frame.
    pub fn effective_target_hz(&self) -> f64 {
        let ceiling = (self.refresh_rate_hz / 2.0).max(MIN_TARGET_HZ);
        if self.target_hz.is_finite() {
            self.target_hz.clamp(MIN_TARGET_HZ, ceiling)
        } else {
            ceiling
        }
    }

    /// Fingerprint of the fields that affect pattern pixels.
    pub fn pattern_fingerprint(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.pattern_mode.hash(&mut hasher);
        self.pattern_id.hash(&mut hasher);
        self.colors.on.hash(&mut hasher);
        self.colors.off.hash(&mut hasher);
        // Float parameters hash through their serialized form.
        serde_json::to_vec(&self.pattern)
            .unwrap_or_default()
            .hash(&mut hasher);
        hasher.finish()
    }
}

/// On/off colors and the post-hoc brightness scalar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Colors {
    pub on: Rgba,
    pub off: Rgba,
    pub brightness: f64,
}

impl Default for Colors {
    fn default() -> Self {
        Self {
            on: Rgba::WHITE,
            off: Rgba::BLACK,
            brightness: 1.0,
        }
    }
}

/// Parameters shared by the pattern library. Each renderer reads the subset
/// it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternParams {
    /// Checkerboard cells across the width.
    pub cells: u32,
    /// Grating cycles across the width.
    pub spatial_frequency: f64,
    pub orientation_deg: f64,
    /// Gabor envelope sigma as a fraction of the shorter side.
    pub gabor_sigma: f64,
    pub sparse_density: f64,
    pub sparse_cells: u32,
    pub seed: u64,
    /// Cycles per second for motion patterns.
    pub motion_speed: f64,
    pub breathing_rate_hz: f64,
    pub breathing_depth: f64,
    pub rotation_speed_deg: f64,
    /// Base count for generative patterns (circles, petals, triangles...).
    pub complexity: u32,
    pub line_width: f64,
    pub fractal_dimension: f64,
    pub octaves: u32,
    /// Lattice cells across the width for value noise.
    pub noise_scale: f64,
    /// Pixel block size used when painting noise.
    pub noise_block: u32,
    /// Neurofeedback influence on complexity, in percent.
    pub nf_influence: f64,
}

impl Default for PatternParams {
    fn default() -> Self {
        Self {
            cells: 8,
            spatial_frequency: 6.0,
            orientation_deg: 0.0,
            gabor_sigma: 0.18,
            sparse_density: 0.15,
            sparse_cells: 32,
            seed: 0x5eed,
            motion_speed: 0.5,
            breathing_rate_hz: 0.1,
            breathing_depth: 0.08,
            rotation_speed_deg: 6.0,
            complexity: 6,
            line_width: 2.0,
            fractal_dimension: 1.4,
            octaves: 5,
            noise_scale: 4.0,
            noise_block: 4,
            nf_influence: 50.0,
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub master_volume: f64,
    /// Echo delay in seconds.
    pub echo_time: f64,
    pub echo_feedback: f64,
    pub tick_interval_ms: f64,
    pub lookahead_ms: f64,
    pub classes: BTreeMap<String, ClassConfig>,
    pub neurofeedback: NeurofeedbackPolicy,
    pub binaural: BinauralConfig,
    /// Soft cap on concurrently playing sounds; `None` disables the cap.
    pub max_active_chains: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            master_volume: 0.8,
            echo_time: 0.35,
            echo_feedback: 0.35,
            tick_interval_ms: 25.0,
            lookahead_ms: 100.0,
            classes: BTreeMap::new(),
            neurofeedback: NeurofeedbackPolicy::default(),
            binaural: BinauralConfig::default(),
            max_active_chains: Some(32),
        }
    }
}

/// How a sound class reacts to the neurofeedback target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReinforcementMode {
    Positive,
    Negative,
    Neutral,
}

impl Default for ReinforcementMode {
    fn default() -> Self {
        Self::Neutral
    }
}

/// Per-class Poisson scheduling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassConfig {
    pub enabled: bool,
    /// Mean events per minute; zero silences the class.
    pub bpm: f64,
    pub min_gap: f64,
    /// Upper bound on the gap between events; `None` is unbounded.
    pub max_gap: Option<f64>,
    pub reinforcement_mode: ReinforcementMode,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bpm: 6.0,
            min_gap: 1.0,
            max_gap: Some(30.0),
            reinforcement_mode: ReinforcementMode::Neutral,
        }
    }
}

/// Partial update for a [`ClassConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassConfigPatch {
    pub enabled: Option<bool>,
    pub bpm: Option<f64>,
    pub min_gap: Option<f64>,
    pub max_gap: Option<Option<f64>>,
    pub reinforcement_mode: Option<ReinforcementMode>,
}

impl ClassConfigPatch {
    pub fn apply(&self, config: &mut ClassConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(bpm) = self.bpm {
            config.bpm = bpm.max(0.0);
        }
        if let Some(min_gap) = self.min_gap {
            config.min_gap = min_gap.max(0.0);
        }
        if let Some(max_gap) = self.max_gap {
            config.max_gap = max_gap;
        }
        if let Some(mode) = self.reinforcement_mode {
            config.reinforcement_mode = mode;
        }
    }
}

/// Neurofeedback handling on the audio side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeurofeedbackPolicy {
    pub enabled: bool,
    /// Pan LFO rate in Hz.
    pub lfo_frequency: f64,
    /// Strength of the coherence-driven pan bias.
    pub lfo_bias: f64,
}

impl Default for NeurofeedbackPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            lfo_frequency: 0.05,
            lfo_bias: 1.0,
        }
    }
}

/// How the binaural carrier frequency is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CarrierPolicy {
    Auto,
    Manual { hz: f64 },
}

impl Default for CarrierPolicy {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinauralConfig {
    pub enabled: bool,
    pub beat_hz: f64,
    /// Follow the visual flicker frequency instead of `beat_hz`.
    pub lock_to_flicker: bool,
    pub carrier: CarrierPolicy,
    pub volume: f64,
    /// Fade time used by start and stop.
    pub ramp_seconds: f64,
}

impl Default for BinauralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            beat_hz: 10.0,
            lock_to_flicker: false,
            carrier: CarrierPolicy::Auto,
            volume: 0.3,
            ramp_seconds: 0.5,
        }
    }
}

/// Narrow read-only view over externally owned configuration. Every call
/// returns an owned snapshot; callers take one per tick.
pub trait ConfigSource {
    fn visual(&self) -> VisualConfig;
    fn audio(&self) -> AudioConfig;
    fn neurofeedback(&self) -> Option<NeurofeedbackSnapshot>;
}

impl ConfigSource for AppConfig {
    fn visual(&self) -> VisualConfig {
        self.visual.clone()
    }

    fn audio(&self) -> AudioConfig {
        self.audio.clone()
    }

    fn neurofeedback(&self) -> Option<NeurofeedbackSnapshot> {
        None
    }
}

/// Shared configuration updated by external collaborators (UI, EEG client)
/// and read by the core through [`ConfigSource`].
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    config: Arc<RwLock<AppConfig>>,
    neurofeedback: Arc<RwLock<Option<NeurofeedbackSnapshot>>>,
}

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            neurofeedback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut AppConfig)) {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    pub fn publish_neurofeedback(&self, snapshot: Option<NeurofeedbackSnapshot>) {
        let mut guard = self
            .neurofeedback
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = snapshot;
    }
}

impl ConfigSource for SharedConfig {
    fn visual(&self) -> VisualConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .visual
            .clone()
    }

    fn audio(&self) -> AudioConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .audio
            .clone()
    }

    fn neurofeedback(&self) -> Option<NeurofeedbackSnapshot> {
        self.neurofeedback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_target_to_half_refresh() {
        let mut visual = VisualConfig::default();
        visual.target_hz = 45.0;
        visual.refresh_rate_hz = 60.0;
        assert_eq!(visual.effective_target_hz(), 30.0);

        visual.target_hz = 0.0;
        assert_eq!(visual.effective_target_hz(), MIN_TARGET_HZ);
    }

    #[test]
    fn parses_partial_documents_with_defaults() {
        let config = AppConfig::from_json(
            r##"{
                "visual": { "target_hz": 12.0, "pattern_id": "checkerboard",
                            "colors": { "on": "#ff0000" } },
                "audio": { "classes": { "birds": { "bpm": 4.0, "max_gap": null } } }
            }"##,
        )
        .unwrap();

        assert_eq!(config.visual.target_hz, 12.0);
        assert_eq!(config.visual.colors.on, Rgba::rgb(255, 0, 0));
        assert_eq!(config.visual.colors.off, Rgba::BLACK);
        let birds = &config.audio.classes["birds"];
        assert_eq!(birds.bpm, 4.0);
        assert_eq!(birds.max_gap, None);
        assert!(birds.enabled);
        assert_eq!(config.audio.block_size, 1024);
    }

    #[test]
    fn fingerprint_tracks_pattern_fields_only() {
        let base = VisualConfig::default();
        let mut brighter = base.clone();
        brighter.colors.brightness = 0.3;
        brighter.target_hz = 20.0;
        assert_eq!(base.pattern_fingerprint(), brighter.pattern_fingerprint());

        let mut finer = base.clone();
        finer.pattern.cells = 16;
        assert_ne!(base.pattern_fingerprint(), finer.pattern_fingerprint());
    }

    #[test]
    fn patches_only_touch_named_fields() {
        let mut config = ClassConfig::default();
        ClassConfigPatch {
            bpm: Some(-3.0),
            max_gap: Some(None),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.bpm, 0.0);
        assert_eq!(config.max_gap, None);
        assert_eq!(config.min_gap, 1.0);
    }

    #[test]
    fn shared_config_publishes_snapshots() {
        use crate::neurofeedback::Band;

        let shared = SharedConfig::new(AppConfig::default());
        assert!(shared.neurofeedback().is_none());
        shared.update(|cfg| cfg.visual.target_hz = 7.5);
        shared.publish_neurofeedback(Some(NeurofeedbackSnapshot::new(0.7, Band::Alpha)));
        assert_eq!(shared.visual().target_hz, 7.5);
        assert_eq!(shared.neurofeedback().unwrap().coherence_score, 0.7);
    }
}
