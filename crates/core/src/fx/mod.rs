//! Per-event sound chains and the shared effect buses.
//!
//! Each event gets `source -> gain -> pan -> lowpass`, feeding the dry master
//! plus sends into one shared multi-tap reverb and one shared feedback echo.
//! While neurofeedback is active, every playing chain is pushed nearer or
//! farther (gain, brightness and reverb together) according to its class's
//! reinforcement mode.

mod nodes;

use std::f64::consts::TAU;
use std::sync::Arc;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use nodes::{equal_power, Biquad, FeedbackDelay, MultiTapReverb, SourceNode, MAX_ECHO_SECONDS};

use crate::assets::{AudioBuffer, PanPolicy, SoundVariant};
use crate::config::{AudioConfig, NeurofeedbackPolicy, ReinforcementMode};

pub const OPEN_CUTOFF_HZ: f64 = 20_000.0;
/// Echo send relative to the chain's reverb send.
const ECHO_SEND_RATIO: f64 = 0.5;

/// Perceived distance of a chain in `[0, 1]`; 0 is close.
pub fn distance_for(mode: ReinforcementMode, normalized_coherence: f64) -> f64 {
    let n = normalized_coherence.clamp(-1.0, 1.0);
    match mode {
        ReinforcementMode::Positive => 0.5 - n * 0.5,
        ReinforcementMode::Negative => 0.5 + n * 0.5,
        ReinforcementMode::Neutral => 0.5,
    }
}

/// The three coupled distance cues.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceCues {
    pub distance: f64,
    pub gain_factor: f64,
    pub cutoff_hz: f64,
    pub reverb_mix: f64,
}

impl DistanceCues {
    pub fn at(distance: f64) -> Self {
        let d = distance.clamp(0.0, 1.0);
        Self {
            distance: d,
            gain_factor: 1.0 - d * 0.7,
            cutoff_hz: OPEN_CUTOFF_HZ - d * 18_000.0,
            reverb_mix: d * 0.6,
        }
    }
}

/// Pan LFO shared by every spatial chain. The phase keeps running across
/// events.
#[derive(Debug, Clone, Default)]
pub struct SpatialBias {
    phase: f64,
}

impl SpatialBias {
    pub fn advance(&mut self, seconds: f64, frequency_hz: f64) {
        self.phase = (self.phase + TAU * frequency_hz * seconds).rem_euclid(TAU);
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn pan(&self, normalized_coherence: f64, lfo_bias: f64) -> f64 {
        let lfo = self.phase.sin() * 0.5;
        let bias = normalized_coherence * lfo_bias * 0.3;
        (lfo + bias).clamp(-1.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Placement {
    Fixed(f64),
    Spatial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub u64);

/// One playing event.
#[derive(Debug)]
pub struct ActiveSoundChain {
    id: ChainId,
    class: String,
    variant_id: String,
    source: SourceNode,
    started: bool,
    gain: f64,
    placement: Placement,
    pan: f64,
    lowpass: [Biquad; 2],
    reverb_send: f64,
    mode: ReinforcementMode,
    cues: Option<DistanceCues>,
}

impl ActiveSoundChain {
    /// Returns the handle assigned at creation.
    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Returns the sound class that fired this chain.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns the id of the variant being played.
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Absolute output frame at which playback starts.
    pub fn start_frame(&self) -> u64 {
        self.source.start_frame()
    }

    /// Jittered gain before distance attenuation.
    pub fn base_gain(&self) -> f64 {
        self.gain
    }

    /// Gain after distance attenuation.
    pub fn effective_gain(&self) -> f64 {
        self.gain * self.cues.map(|c| c.gain_factor).unwrap_or(1.0)
    }

    /// Current stereo position in `[-1, 1]`.
    pub fn pan(&self) -> f64 {
        self.pan
    }

    /// Current lowpass cutoff.
    pub fn cutoff_hz(&self) -> f64 {
        self.lowpass[0].cutoff_hz()
    }

    /// Reverb send level; the distance cue replaces the variant's own send.
    pub fn reverb_send(&self) -> f64 {
        self.cues.map(|c| c.reverb_mix).unwrap_or(self.reverb_send)
    }

    /// Perceived distance, or `None` while neurofeedback is off.
    pub fn distance(&self) -> Option<f64> {
        self.cues.map(|c| c.distance)
    }

    /// Returns the reinforcement mode of the chain's class.
    pub fn reinforcement_mode(&self) -> ReinforcementMode {
        self.mode
    }

    fn apply_cues(&mut self, cues: Option<DistanceCues>, sample_rate: u32) {
        self.cues = cues;
        let cutoff = cues.map(|c| c.cutoff_hz).unwrap_or(OPEN_CUTOFF_HZ);
        for filter in &mut self.lowpass {
            filter.set_lowpass(sample_rate, cutoff, std::f64::consts::FRAC_1_SQRT_2);
        }
    }
}

/// Owner of the active-sound set and the shared buses.
pub struct FxGraph {
    sample_rate: u32,
    chains: Vec<ActiveSoundChain>,
    next_id: u64,
    reverb: MultiTapReverb,
    echo: FeedbackDelay,
    master_volume: f64,
    noise_volume: f64,
    policy: NeurofeedbackPolicy,
    coherence: Option<f64>,
    lfo: SpatialBias,
    rng: SmallRng,
    completed: u64,
    scratch: Vec<(f32, f32)>,
}

impl FxGraph {
    /// Creates an empty graph with the shared reverb and echo buses.
    pub fn new(config: &AudioConfig) -> Self {
        Self::with_rng(config, SmallRng::from_os_rng())
    }

    /// Same as [`new`](Self::new) with reproducible jitter.
    pub fn with_seed(config: &AudioConfig, seed: u64) -> Self {
        Self::with_rng(config, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: &AudioConfig, rng: SmallRng) -> Self {
        let sample_rate = config.sample_rate.max(1);
        Self {
            sample_rate,
            chains: Vec::new(),
            next_id: 0,
            reverb: MultiTapReverb::new(sample_rate),
            echo: FeedbackDelay::new(sample_rate, config.echo_time, config.echo_feedback),
            master_volume: config.master_volume.clamp(0.0, 1.0),
            noise_volume: 1.0,
            policy: config.neurofeedback.clone(),
            coherence: None,
            lfo: SpatialBias::default(),
            rng,
            completed: 0,
            scratch: Vec::new(),
        }
    }

    /// Picks up master volume, echo and neurofeedback policy changes.
    pub fn apply_config(&mut self, config: &AudioConfig) {
        self.master_volume = config.master_volume.clamp(0.0, 1.0);
        self.echo.set(config.echo_time, config.echo_feedback);
        self.policy = config.neurofeedback.clone();
        if !self.policy.enabled && self.coherence.is_some() {
            self.set_coherence(None);
        }
    }

    /// Builds and registers the chain for one event. Playback starts at the
    /// sample nearest `scheduled_time` on the audio clock.
    pub fn create_chain(
        &mut self,
        buffer: Arc<AudioBuffer>,
        variant: &SoundVariant,
        scheduled_time: f64,
        mode: ReinforcementMode,
    ) -> ChainId {
        let id = ChainId(self.next_id);
        self.next_id += 1;

        let jitter = variant.gain_jitter;
        let mut gain = variant.base_gain;
        if jitter > 0.0 {
            gain += self.rng.random_range(-jitter..=jitter);
        }
        let gain = gain.clamp(0.0, 1.0);

        let (lo, hi) = variant.pitch_jitter;
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let rate = if hi > lo {
            self.rng.random_range(lo..=hi)
        } else {
            lo
        };

        let placement = match variant.pan_policy {
            PanPolicy::Center => Placement::Fixed(0.0),
            PanPolicy::Fixed { pan } => Placement::Fixed(pan.clamp(-1.0, 1.0)),
            PanPolicy::Random { spread } => {
                let spread = spread.abs().min(1.0);
                let pan = if spread > 0.0 {
                    self.rng.random_range(-spread..=spread)
                } else {
                    0.0
                };
                Placement::Fixed(pan)
            }
            PanPolicy::Spatial => Placement::Spatial,
        };

        let start_frame = (scheduled_time.max(0.0) * self.sample_rate as f64).round() as u64;
        let mut chain = ActiveSoundChain {
            id,
            class: variant.class.clone(),
            variant_id: variant.id.clone(),
            source: SourceNode::new(buffer, rate, self.sample_rate, start_frame),
            started: false,
            gain,
            placement,
            pan: 0.0,
            lowpass: [Biquad::lowpass(self.sample_rate, OPEN_CUTOFF_HZ); 2],
            reverb_send: variant.reverb_send,
            mode,
            cues: None,
        };
        chain.pan = self.pan_for(chain.placement);
        chain.apply_cues(self.cues_for(mode), self.sample_rate);

        tracing::trace!(chain = id.0, variant = %variant.id, start_frame, gain, rate, "sound chain created");
        self.chains.push(chain);
        id
    }

    /// Updates the coherence every playing chain reacts to. `None` turns the
    /// distance cues off.
    pub fn apply_neurofeedback(&mut self, normalized_coherence: Option<f64>) {
        let coherence = normalized_coherence.filter(|_| self.policy.enabled);
        self.set_coherence(coherence);
    }

    /// Scales sound-event output by the neurofeedback noise modulation.
    pub fn set_noise_volume(&mut self, volume: f64) {
        self.noise_volume = volume.clamp(0.0, 1.0);
    }

    fn set_coherence(&mut self, coherence: Option<f64>) {
        self.coherence = coherence;
        let sample_rate = self.sample_rate;
        let cues: Vec<_> = self.chains.iter().map(|c| self.cues_for(c.mode)).collect();
        for (chain, cues) in self.chains.iter_mut().zip(cues) {
            chain.apply_cues(cues, sample_rate);
        }
    }

    fn cues_for(&self, mode: ReinforcementMode) -> Option<DistanceCues> {
        self.coherence
            .map(|n| DistanceCues::at(distance_for(mode, n)))
    }

    fn pan_for(&self, placement: Placement) -> f64 {
        match placement {
            Placement::Fixed(pan) => pan,
            Placement::Spatial => self
                .lfo
                .pan(self.coherence.unwrap_or(0.0), self.policy.lfo_bias),
        }
    }

    /// Returns the active-sound set.
    pub fn chains(&self) -> &[ActiveSoundChain] {
        &self.chains
    }

    /// Looks up a chain that is still playing.
    pub fn chain(&self, id: ChainId) -> Option<&ActiveSoundChain> {
        self.chains.iter().find(|c| c.id == id)
    }

    /// Number of chains currently playing.
    pub fn active_count(&self) -> usize {
        self.chains.len()
    }

    /// Chains that played to the end and were released.
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Renders one block starting at absolute frame `frame_start`,
    /// overwriting `left` and `right`. Chains that reach the end of their
    /// buffer are released.
    pub fn render(&mut self, frame_start: u64, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len());
        left[..frames].fill(0.0);
        right[..frames].fill(0.0);

        let block_seconds = frames as f64 / self.sample_rate as f64;
        self.lfo.advance(block_seconds, self.policy.lfo_frequency);

        self.scratch.clear();
        self.scratch.resize(frames, (0.0, 0.0));
        let spatial_pan = self
            .lfo
            .pan(self.coherence.unwrap_or(0.0), self.policy.lfo_bias);
        let noise_volume = self.noise_volume;
        let block_end = frame_start + frames as u64;

        for chain in &mut self.chains {
            if !chain.started {
                chain.source.start_no_earlier_than(frame_start);
                chain.started = chain.source.start_frame() < block_end;
            }
            if let Placement::Spatial = chain.placement {
                chain.pan = spatial_pan;
            }
            let gain = (chain.effective_gain() * noise_volume) as f32;
            let (pan_l, pan_r) = equal_power(chain.pan);
            let send = chain.reverb_send() as f32;

            for (i, bus) in self.scratch.iter_mut().enumerate() {
                let frame = frame_start + i as u64;
                let Some(sample) = chain.source.sample_at(frame) else {
                    break;
                };
                let x = sample * gain;
                let l = chain.lowpass[0].process(x * pan_l);
                let r = chain.lowpass[1].process(x * pan_r);
                left[i] += l;
                right[i] += r;
                let mono = (l + r) * 0.5;
                bus.0 += mono * send;
                bus.1 += mono * send * ECHO_SEND_RATIO as f32;
            }
        }

        let master = self.master_volume as f32;
        for (i, bus) in self.scratch.iter().enumerate() {
            let (rev_l, rev_r) = self.reverb.process(bus.0);
            let echo = self.echo.process(bus.1);
            left[i] = (left[i] + rev_l + echo) * master;
            right[i] = (right[i] + rev_r + echo) * master;
        }

        let before = self.chains.len();
        self.chains
            .retain(|chain| !chain.source.is_finished_at(block_end));
        let released = before - self.chains.len();
        if released > 0 {
            self.completed += released as u64;
            tracing::trace!(released, active = self.chains.len(), "sound chains released");
        }
    }

    /// Drops every playing chain and silences the buses.
    pub fn stop_all(&mut self) {
        self.chains.clear();
        self.reverb.clear();
        self.echo.clear();
    }
}

impl std::fmt::Debug for FxGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FxGraph")
            .field("sample_rate", &self.sample_rate)
            .field("active", &self.chains.len())
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 1_000,
            neurofeedback: NeurofeedbackPolicy {
                enabled: true,
                ..NeurofeedbackPolicy::default()
            },
            ..AudioConfig::default()
        }
    }

    fn variant(pan_policy: PanPolicy) -> SoundVariant {
        SoundVariant {
            id: "v".to_string(),
            class: "birds".to_string(),
            tags: vec![],
            path: "v.wav".to_string(),
            duration: 0.1,
            weight: 1.0,
            base_gain: 0.5,
            gain_jitter: 0.0,
            pitch_jitter: (1.0, 1.0),
            pan_policy,
            reverb_send: 0.2,
            cooldown: 0.0,
        }
    }

    fn tone(len: usize) -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::new(1_000, vec![0.5; len]))
    }

    #[test]
    fn absurd_sample_rates_do_not_panic() {
        let audio = AudioConfig {
            sample_rate: 16,
            ..config()
        };
        let mut fx = FxGraph::with_seed(&audio, 1);
        fx.create_chain(tone(64), &variant(PanPolicy::Spatial), 0.0, ReinforcementMode::Positive);
        fx.apply_neurofeedback(Some(0.5));
        let mut left = vec![0.0; 32];
        let mut right = vec![0.0; 32];
        fx.render(0, &mut left, &mut right);
        assert!(left.iter().chain(&right).all(|s| s.is_finite()));
    }

    #[test]
    fn positive_distance_cues_are_monotonic() {
        let mut previous: Option<DistanceCues> = None;
        for step in 0..=20 {
            let n = -1.0 + step as f64 * 0.1;
            let cues = DistanceCues::at(distance_for(ReinforcementMode::Positive, n));
            assert!((0.0..=1.0).contains(&cues.distance));
            assert!((2_000.0..=20_000.0).contains(&cues.cutoff_hz));
            assert!((0.0..=0.6).contains(&cues.reverb_mix));
            if let Some(prev) = previous {
                assert!(cues.distance < prev.distance);
                assert!(cues.gain_factor > prev.gain_factor);
                assert!(cues.cutoff_hz > prev.cutoff_hz);
                assert!(cues.reverb_mix < prev.reverb_mix);
            }
            previous = Some(cues);
        }
        assert_eq!(distance_for(ReinforcementMode::Positive, -1.0), 1.0);
        assert_eq!(distance_for(ReinforcementMode::Positive, 1.0), 0.0);
    }

    #[test]
    fn negative_and_neutral_modes() {
        assert_eq!(distance_for(ReinforcementMode::Negative, 1.0), 1.0);
        assert_eq!(distance_for(ReinforcementMode::Negative, -1.0), 0.0);
        assert_eq!(distance_for(ReinforcementMode::Neutral, 0.8), 0.5);
    }

    #[test]
    fn spatial_lfo_phase_is_continuous_and_biased() {
        let mut lfo = SpatialBias::default();
        lfo.advance(1.0, 0.25);
        assert!((lfo.phase() - TAU * 0.25).abs() < 1e-9);
        assert!((lfo.pan(0.0, 1.0) - 0.5).abs() < 1e-9);
        assert!((lfo.pan(1.0, 1.0) - 0.8).abs() < 1e-9);
        lfo.advance(1.0, 0.25);
        assert!(lfo.pan(-1.0, 10.0) >= -1.0);
    }

    #[test]
    fn chain_starts_on_its_scheduled_sample() {
        let mut graph = FxGraph::with_seed(&config(), 1);
        graph.create_chain(tone(50), &variant(PanPolicy::Center), 0.105, ReinforcementMode::Neutral);
        let mut left = vec![0.0; 100];
        let mut right = vec![0.0; 100];
        graph.render(100, &mut left, &mut right);
        assert!(left[..5].iter().all(|s| s.abs() < 1e-6));
        assert!(left[5].abs() > 0.0);
    }

    #[test]
    fn finished_chains_are_released() {
        let mut graph = FxGraph::with_seed(&config(), 1);
        graph.create_chain(tone(30), &variant(PanPolicy::Center), 0.0, ReinforcementMode::Neutral);
        graph.create_chain(tone(300), &variant(PanPolicy::Center), 0.0, ReinforcementMode::Neutral);
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        graph.render(0, &mut left, &mut right);
        assert_eq!(graph.active_count(), 1);
        assert_eq!(graph.completed_count(), 1);
        for block in 1..6 {
            graph.render(block * 64, &mut left, &mut right);
        }
        assert_eq!(graph.active_count(), 0);
        assert_eq!(graph.completed_count(), 2);
    }

    #[test]
    fn late_chains_start_at_the_current_block() {
        let mut graph = FxGraph::with_seed(&config(), 1);
        let id = graph.create_chain(tone(50), &variant(PanPolicy::Center), 0.0, ReinforcementMode::Neutral);
        let mut left = vec![0.0; 10];
        let mut right = vec![0.0; 10];
        graph.render(500, &mut left, &mut right);
        assert_eq!(graph.chain(id).unwrap().start_frame(), 500);
        assert!(left[0].abs() > 0.0);
    }

    #[test]
    fn neurofeedback_retunes_playing_chains() {
        let mut graph = FxGraph::with_seed(&config(), 1);
        let id = graph.create_chain(tone(500), &variant(PanPolicy::Center), 0.0, ReinforcementMode::Positive);
        assert_eq!(graph.chain(id).unwrap().distance(), None);
        assert_eq!(graph.chain(id).unwrap().reverb_send(), 0.2);

        graph.apply_neurofeedback(Some(1.0));
        let chain = graph.chain(id).unwrap();
        assert_eq!(chain.distance(), Some(0.0));
        assert_eq!(chain.effective_gain(), 0.5);

        graph.apply_neurofeedback(Some(-1.0));
        let chain = graph.chain(id).unwrap();
        assert_eq!(chain.distance(), Some(1.0));
        assert!((chain.effective_gain() - 0.15).abs() < 1e-9);
        assert!((chain.reverb_send() - 0.6).abs() < 1e-9);
        assert!(chain.cutoff_hz() < 500.0);
    }

    #[test]
    fn neurofeedback_is_ignored_when_policy_disabled() {
        let mut graph = FxGraph::with_seed(&AudioConfig::default(), 1);
        let id = graph.create_chain(tone(500), &variant(PanPolicy::Center), 0.0, ReinforcementMode::Positive);
        graph.apply_neurofeedback(Some(1.0));
        assert_eq!(graph.chain(id).unwrap().distance(), None);
    }

    #[test]
    fn jitter_stays_in_range_and_pan_policies_apply() {
        let mut graph = FxGraph::with_seed(&config(), 9);
        let mut v = variant(PanPolicy::Random { spread: 0.5 });
        v.base_gain = 0.9;
        v.gain_jitter = 0.5;
        for _ in 0..200 {
            let id = graph.create_chain(tone(10), &v, 0.0, ReinforcementMode::Neutral);
            let chain = graph.chain(id).unwrap();
            assert!((0.0..=1.0).contains(&chain.base_gain()));
            assert!(chain.pan().abs() <= 0.5);
        }
        let id = graph.create_chain(tone(10), &variant(PanPolicy::Fixed { pan: -3.0 }), 0.0, ReinforcementMode::Neutral);
        assert_eq!(graph.chain(id).unwrap().pan(), -1.0);
        graph.stop_all();
        assert_eq!(graph.active_count(), 0);
    }
}
