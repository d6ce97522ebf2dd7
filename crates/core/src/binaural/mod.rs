//! Binaural beat generator.
//!
//! Two continuous sine oscillators, `carrier` hard left and `carrier + beat`
//! hard right. Output level follows a small automation timeline on the audio
//! clock; start and stop always cancel pending automation before scheduling
//! their own ramp.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::config::{BinauralConfig, CarrierPolicy};

/// Ramp used when neurofeedback nudges the level of a running generator.
const LEVEL_SMOOTHING_SECONDS: f64 = 0.05;

/// Carrier breakpoints `(beat_hz, carrier_hz)`, interpolated linearly.
const CARRIER_TABLE: [(f64, f64); 7] = [
    (1.0, 180.0),
    (4.0, 200.0),
    (6.0, 220.0),
    (11.0, 400.0),
    (20.0, 600.0),
    (40.0, 900.0),
    (f64::INFINITY, 900.0),
];

/// Carrier frequency tuned for a beat frequency: low carriers for slow
/// beats, rising to 900 Hz for gamma.
pub fn carrier_for_beat(beat_hz: f64) -> f64 {
    let (mut lo_beat, mut lo_carrier) = CARRIER_TABLE[0];
    if beat_hz <= lo_beat {
        return lo_carrier;
    }
    for &(hi_beat, hi_carrier) in &CARRIER_TABLE[1..] {
        if beat_hz <= hi_beat {
            if hi_beat.is_infinite() {
                return hi_carrier;
            }
            let t = (beat_hz - lo_beat) / (hi_beat - lo_beat);
            return lo_carrier + t * (hi_carrier - lo_carrier);
        }
        lo_beat = hi_beat;
        lo_carrier = hi_carrier;
    }
    lo_carrier
}

pub fn carrier_for_policy(policy: CarrierPolicy, beat_hz: f64) -> f64 {
    match policy {
        CarrierPolicy::Auto => carrier_for_beat(beat_hz),
        CarrierPolicy::Manual { hz } => hz.max(1.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum AutomationKind {
    Set,
    LinearRamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct AutomationEvent {
    kind: AutomationKind,
    time: f64,
    value: f64,
}

/// Parameter automation on the audio clock. A linear ramp runs from the
/// previous event to its own end time, so ramps scheduled without
/// cancelling first queue up behind each other.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GainAutomation {
    initial: f64,
    events: Vec<AutomationEvent>,
}

impl GainAutomation {
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Jumps to `value` at `time`.
    pub fn set_value_at(&mut self, value: f64, time: f64) {
        self.insert(AutomationEvent {
            kind: AutomationKind::Set,
            time,
            value,
        });
    }

    /// Ramps from the preceding event to `value`, arriving at `end_time`.
    pub fn linear_ramp_to(&mut self, value: f64, end_time: f64) {
        self.insert(AutomationEvent {
            kind: AutomationKind::LinearRamp,
            time: end_time,
            value,
        });
    }

    /// Drops everything after `time` and pins the value it had there.
    pub fn cancel_and_hold(&mut self, time: f64) {
        let held = self.value_at(time);
        self.initial = held;
        self.events.clear();
        self.set_value_at(held, time);
    }

    /// Evaluates the automation at `time`.
    pub fn value_at(&self, time: f64) -> f64 {
        let next = self.events.partition_point(|e| e.time <= time);
        let (start_time, start_value) = match next.checked_sub(1) {
            Some(i) => (self.events[i].time, self.events[i].value),
            None => (f64::NEG_INFINITY, self.initial),
        };
        match self.events.get(next) {
            Some(end) if end.kind == AutomationKind::LinearRamp => {
                if !start_time.is_finite() || end.time <= start_time {
                    return start_value;
                }
                let t = (time - start_time) / (end.time - start_time);
                start_value + (end.value - start_value) * t
            }
            _ => start_value,
        }
    }

    /// Collapses events that lie entirely before `time`.
    pub fn prune_before(&mut self, time: f64) {
        let settled = self.events.partition_point(|e| e.time <= time);
        if settled > 1 {
            let last = self.events[settled - 1];
            self.initial = last.value;
            self.events.drain(..settled - 1);
        }
    }

    fn insert(&mut self, event: AutomationEvent) {
        let at = self.events.partition_point(|e| e.time <= event.time);
        self.events.insert(at, event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinauralState {
    pub running: bool,
    pub carrier_hz: f64,
    pub beat_hz: f64,
    pub level: f64,
}

#[derive(Debug, Clone)]
pub struct BinauralGenerator {
    sample_rate: u32,
    carrier_hz: f64,
    beat_hz: f64,
    phase_left: f64,
    phase_right: f64,
    gain: GainAutomation,
    running: bool,
    volume: f64,
    modulation: f64,
    ramp_seconds: f64,
}

impl BinauralGenerator {
    /// Creates a silent, stopped generator.
    pub fn new(sample_rate: u32, config: &BinauralConfig, flicker_hz: f64) -> Self {
        let mut generator = Self {
            sample_rate: sample_rate.max(1),
            carrier_hz: 0.0,
            beat_hz: 0.0,
            phase_left: 0.0,
            phase_right: 0.0,
            gain: GainAutomation::new(0.0),
            running: false,
            volume: 0.0,
            modulation: 1.0,
            ramp_seconds: 0.0,
        };
        generator.configure(config, flicker_hz);
        generator
    }

    /// Retunes frequencies without resetting oscillator phase.
    pub fn configure(&mut self, config: &BinauralConfig, flicker_hz: f64) {
        let beat = if config.lock_to_flicker {
            flicker_hz
        } else {
            config.beat_hz
        };
        self.beat_hz = beat.max(0.0);
        self.carrier_hz = carrier_for_policy(config.carrier, self.beat_hz);
        self.volume = config.volume.clamp(0.0, 1.0);
        self.ramp_seconds = config.ramp_seconds.max(0.0);
    }

    /// Left-channel oscillator frequency.
    pub fn carrier_hz(&self) -> f64 {
        self.carrier_hz
    }

    /// Right minus left oscillator frequency.
    pub fn beat_hz(&self) -> f64 {
        self.beat_hz
    }

    /// Snapshot including the gain level sounding at `now`.
    pub fn state(&self, now: f64) -> BinauralState {
        BinauralState {
            running: self.running,
            carrier_hz: self.carrier_hz,
            beat_hz: self.beat_hz,
            level: self.gain.value_at(now),
        }
    }

    fn target_level(&self) -> f64 {
        self.volume * self.modulation
    }

    /// Fades in from whatever level is currently sounding.
    pub fn start(&mut self, now: f64) {
        self.running = true;
        self.schedule(self.target_level(), now, self.ramp_seconds);
        tracing::debug!(carrier_hz = self.carrier_hz, beat_hz = self.beat_hz, "binaural started");
    }

    /// Fades out, cancelling any ramp still in progress.
    pub fn stop(&mut self, now: f64) {
        self.running = false;
        self.schedule(0.0, now, self.ramp_seconds);
        tracing::debug!("binaural stopped");
    }

    /// Applies a neurofeedback beat-volume modulation.
    pub fn set_modulation(&mut self, modulation: f64, now: f64) {
        let modulation = modulation.clamp(0.0, 1.0);
        if (modulation - self.modulation).abs() < 1e-6 {
            return;
        }
        self.modulation = modulation;
        if self.running {
            self.schedule(self.target_level(), now, LEVEL_SMOOTHING_SECONDS);
        }
    }

    /// Changes the configured volume with a short ramp. Unchanged values
    /// leave the automation alone.
    pub fn set_volume(&mut self, volume: f64, now: f64) {
        let volume = volume.clamp(0.0, 1.0);
        if (volume - self.volume).abs() < 1e-6 {
            return;
        }
        self.volume = volume;
        if self.running {
            self.schedule(self.target_level(), now, LEVEL_SMOOTHING_SECONDS);
        }
    }

    fn schedule(&mut self, level: f64, now: f64, ramp: f64) {
        self.gain.cancel_and_hold(now);
        if ramp > 0.0 {
            self.gain.linear_ramp_to(level, now + ramp);
        } else {
            self.gain.set_value_at(level, now);
        }
    }

    /// Adds one block to `left` and `right`, starting at absolute frame
    /// `frame_start`.
    pub fn render(&mut self, frame_start: u64, left: &mut [f32], right: &mut [f32]) {
        let sr = self.sample_rate as f64;
        let step_left = TAU * self.carrier_hz / sr;
        let step_right = TAU * (self.carrier_hz + self.beat_hz) / sr;
        let frames = left.len().min(right.len());

        for i in 0..frames {
            let time = (frame_start + i as u64) as f64 / sr;
            let level = self.gain.value_at(time);
            if level > 0.0 {
                left[i] += (self.phase_left.sin() * level) as f32;
                right[i] += (self.phase_right.sin() * level) as f32;
            }
            self.phase_left = (self.phase_left + step_left).rem_euclid(TAU);
            self.phase_right = (self.phase_right + step_right).rem_euclid(TAU);
        }
        self.gain.prune_before(frame_start as f64 / sr);
    }
}
