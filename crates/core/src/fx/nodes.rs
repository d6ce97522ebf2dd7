//! Signal-processing building blocks for sound chains and the shared buses.

use std::f64::consts::{FRAC_PI_4, TAU};
use std::sync::Arc;

use crate::assets::AudioBuffer;

/// Lowest cutoff the lowpass accepts.
const MIN_CUTOFF_HZ: f64 = 10.0;
/// Cutoffs are kept below this fraction of the sample rate.
const MAX_CUTOFF_RATIO: f64 = 0.45;

/// Equal-power stereo gains for a pan position in `[-1, 1]`.
pub fn equal_power(pan: f64) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
    (angle.cos() as f32, angle.sin() as f32)
}

/// Buffer playback with a start frame and linear-interpolated rate change.
#[derive(Debug, Clone)]
pub struct SourceNode {
    buffer: Arc<AudioBuffer>,
    /// Source samples advanced per output frame.
    rate: f64,
    start_frame: u64,
}

impl SourceNode {
    pub fn new(buffer: Arc<AudioBuffer>, playback_rate: f64, output_rate: u32, start_frame: u64) -> Self {
        let rate = playback_rate * buffer.sample_rate as f64 / output_rate.max(1) as f64;
        Self {
            buffer,
            rate: rate.max(1e-6),
            start_frame,
        }
    }

    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    /// Late starts begin at `frame` instead of cutting the head off.
    pub fn start_no_earlier_than(&mut self, frame: u64) {
        self.start_frame = self.start_frame.max(frame);
    }

    /// Output frames until the buffer runs out.
    pub fn length_frames(&self) -> u64 {
        (self.buffer.samples.len() as f64 / self.rate).ceil() as u64
    }

    /// Sample for an absolute output frame: silence before the start,
    /// `None` once playback has ended.
    pub fn sample_at(&self, frame: u64) -> Option<f32> {
        let Some(offset) = frame.checked_sub(self.start_frame) else {
            return Some(0.0);
        };
        let position = offset as f64 * self.rate;
        let index = position.floor() as usize;
        let samples = &self.buffer.samples;
        let current = *samples.get(index)?;
        let next = samples.get(index + 1).copied().unwrap_or(0.0);
        let frac = (position - index as f64) as f32;
        Some(current + (next - current) * frac)
    }

    pub fn is_finished_at(&self, frame: u64) -> bool {
        frame >= self.start_frame + self.length_frames()
    }
}

/// RBJ biquad in transposed direct form II.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
    cutoff_hz: f64,
}

impl Biquad {
    pub fn lowpass(sample_rate: u32, cutoff_hz: f64) -> Self {
        let mut filter = Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
            cutoff_hz: 0.0,
        };
        filter.set_lowpass(sample_rate, cutoff_hz, std::f64::consts::FRAC_1_SQRT_2);
        filter
    }

    pub fn cutoff_hz(&self) -> f64 {
        self.cutoff_hz
    }

    /// Retunes without clearing state so parameter sweeps stay click-free.
    pub fn set_lowpass(&mut self, sample_rate: u32, cutoff_hz: f64, q: f64) {
        let sr = sample_rate.max(1) as f64;
        let hi = sr * MAX_CUTOFF_RATIO;
        let cutoff = cutoff_hz.clamp(MIN_CUTOFF_HZ.min(hi), hi);
        self.cutoff_hz = cutoff;

        let w0 = TAU * cutoff / sr;
        let alpha = w0.sin() / (2.0 * q.max(0.1));
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        self.b0 = ((1.0 - cos_w0) / 2.0 / a0) as f32;
        self.b1 = ((1.0 - cos_w0) / a0) as f32;
        self.b2 = self.b0;
        self.a1 = (-2.0 * cos_w0 / a0) as f32;
        self.a2 = ((1.0 - alpha) / a0) as f32;
    }

    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// Delay-line reverb: a handful of decaying taps, offset per channel for
/// width, with light recirculation for a tail.
#[derive(Debug, Clone)]
pub struct MultiTapReverb {
    line: Vec<f32>,
    write: usize,
    taps_left: Vec<(usize, f32)>,
    taps_right: Vec<(usize, f32)>,
    recirculation: f32,
}

const REVERB_TAPS_MS: [f64; 6] = [23.0, 41.0, 67.0, 97.0, 131.0, 179.0];
const REVERB_RIGHT_SPREAD: f64 = 1.07;

impl MultiTapReverb {
    pub fn new(sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f64;
        let taps = |spread: f64| -> Vec<(usize, f32)> {
            REVERB_TAPS_MS
                .iter()
                .enumerate()
                .map(|(i, ms)| {
                    let delay = (ms * spread * sr / 1000.0).round().max(1.0) as usize;
                    (delay, 0.55 * 0.8_f32.powi(i as i32))
                })
                .collect()
        };
        let taps_left = taps(1.0);
        let taps_right = taps(REVERB_RIGHT_SPREAD);
        let longest = taps_right.iter().map(|(d, _)| *d).max().unwrap_or(1);
        Self {
            line: vec![0.0; longest + 1],
            write: 0,
            taps_left,
            taps_right,
            recirculation: 0.25,
        }
    }

    fn read(&self, delay: usize) -> f32 {
        let len = self.line.len();
        self.line[(self.write + len - delay % len) % len]
    }

    pub fn process(&mut self, input: f32) -> (f32, f32) {
        let left: f32 = self.taps_left.iter().map(|(d, g)| self.read(*d) * g).sum();
        let right: f32 = self.taps_right.iter().map(|(d, g)| self.read(*d) * g).sum();
        let feedback = (left + right) * 0.5 * self.recirculation;
        self.line[self.write] = input + feedback;
        self.write = (self.write + 1) % self.line.len();
        (left, right)
    }

    pub fn clear(&mut self) {
        self.line.iter_mut().for_each(|s| *s = 0.0);
    }
}

/// Longest echo the shared delay line supports.
pub const MAX_ECHO_SECONDS: f64 = 2.0;
const MAX_ECHO_FEEDBACK: f64 = 0.95;

/// Single-tap feedback delay.
#[derive(Debug, Clone)]
pub struct FeedbackDelay {
    line: Vec<f32>,
    write: usize,
    delay: usize,
    feedback: f32,
    sample_rate: u32,
}

impl FeedbackDelay {
    pub fn new(sample_rate: u32, time_seconds: f64, feedback: f64) -> Self {
        let capacity = (MAX_ECHO_SECONDS * sample_rate.max(1) as f64).ceil() as usize + 1;
        let mut delay = Self {
            line: vec![0.0; capacity],
            write: 0,
            delay: 1,
            feedback: 0.0,
            sample_rate,
        };
        delay.set(time_seconds, feedback);
        delay
    }

    pub fn set(&mut self, time_seconds: f64, feedback: f64) {
        let frames = (time_seconds.clamp(0.0, MAX_ECHO_SECONDS) * self.sample_rate as f64).round();
        self.delay = (frames as usize).clamp(1, self.line.len() - 1);
        self.feedback = feedback.clamp(0.0, MAX_ECHO_FEEDBACK) as f32;
    }

    pub fn delay_frames(&self) -> usize {
        self.delay
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let len = self.line.len();
        let out = self.line[(self.write + len - self.delay) % len];
        self.line[self.write] = input + out * self.feedback;
        self.write = (self.write + 1) % len;
        out
    }

    pub fn clear(&mut self) {
        self.line.iter_mut().for_each(|s| *s = 0.0);
    }
}
