//! Flicker timing oracle.
//!
//! Turns a target flicker frequency and the measured display refresh rate into
//! a per-frame on/off decision. Two strategies are used:
//!
//! * **Frame counting** when the refresh rate is an integer multiple of the
//!   target. An integer counter advanced once per painted frame cannot drift.
//! * **Phase accumulation** otherwise. A bounded phase in `[0, 1)` advances by
//!   `dt * target_hz` per frame, avoiding the discontinuities of
//!   `timestamp % period`.
//!
//! The oracle does not validate its inputs. Targets above half the refresh
//! rate collapse into a degenerate always-on or always-off cycle; the
//! configuration layer clamps them before they get here
//! (see [`crate::config::VisualConfig::effective_target_hz`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tolerance used to decide whether `refresh / target` is an integer.
pub const EXACT_DIVISOR_EPSILON: f64 = 0.01;

/// Number of whole cycles after which the frame counter is folded.
pub const FOLD_AFTER_CYCLES: u64 = 1000;

/// Frame split of one flicker cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlickerTiming {
    pub frames_on: u32,
    pub frames_off: u32,
    pub frames_per_cycle: u32,
}

impl FlickerTiming {
    pub fn compute(target_hz: f64, refresh_hz: f64) -> Self {
        let frames_per_cycle = (refresh_hz / target_hz).round().max(1.0) as u32;
        let frames_on = frames_per_cycle / 2;
        Self {
            frames_on,
            frames_off: frames_per_cycle - frames_on,
            frames_per_cycle,
        }
    }
}

/// Which decision strategy the oracle uses for a given frequency pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingMode {
    FrameCount,
    PhaseAccumulator,
}

/// Mutable per-surface timing state owned by the render loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    pub frame_count: u64,
    pub is_on: bool,
    pub phase_accumulator: f64,
    pub last_render_timestamp: Duration,
    pub start_timestamp: Duration,
    pub dropped_frame_count: u64,
}

impl RenderState {
    /// Fresh state stamped with `now` from the session clock.
    pub fn new(now: Duration) -> Self {
        Self {
            frame_count: 0,
            is_on: false,
            phase_accumulator: 0.0,
            last_render_timestamp: now,
            start_timestamp: now,
            dropped_frame_count: 0,
        }
    }

    /// Elapsed time since the loop (re)started.
    pub fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.start_timestamp)
    }
}

/// Stateless decision function for one `(target, refresh)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingOracle {
    target_hz: f64,
    refresh_hz: f64,
    timing: FlickerTiming,
    mode: TimingMode,
}

impl TimingOracle {
    /// Picks frame counting when `refresh_hz / target_hz` is an integer
    /// within [`EXACT_DIVISOR_EPSILON`], phase accumulation otherwise.
    pub fn new(target_hz: f64, refresh_hz: f64) -> Self {
        let timing = FlickerTiming::compute(target_hz, refresh_hz);
        let ratio = refresh_hz / target_hz;
        let mode = if (timing.frames_per_cycle as f64 - ratio).abs() < EXACT_DIVISOR_EPSILON {
            TimingMode::FrameCount
        } else {
            TimingMode::PhaseAccumulator
        };
        Self {
            target_hz,
            refresh_hz,
            timing,
            mode,
        }
    }

    /// Returns the frame split derived from the frequency pair.
    pub fn timing(&self) -> FlickerTiming {
        self.timing
    }

    /// Returns which decision strategy the oracle uses.
    pub fn mode(&self) -> TimingMode {
        self.mode
    }

    /// True when the oracle was built for the same frequency pair.
    pub fn matches(&self, target_hz: f64, refresh_hz: f64) -> bool {
        self.target_hz == target_hz && self.refresh_hz == refresh_hz
    }

    /// Decides whether the frame painted at `timestamp` is "on" and advances
    /// `state`. Must be called exactly once per accepted frame.
    pub fn decide(&self, state: &mut RenderState, timestamp: Duration) -> bool {
        let should_be_on = match self.mode {
            TimingMode::FrameCount => {
                let cycle = self.timing.frames_per_cycle as u64;
                let on = state.frame_count % cycle < self.timing.frames_on as u64;
                state.frame_count += 1;
                if state.frame_count >= cycle * FOLD_AFTER_CYCLES {
                    state.frame_count %= cycle;
                }
                on
            }
            TimingMode::PhaseAccumulator => {
                let dt = timestamp
                    .saturating_sub(state.last_render_timestamp)
                    .as_secs_f64();
                state.phase_accumulator =
                    (state.phase_accumulator + dt * self.target_hz).rem_euclid(1.0);
                // rem_euclid can round up to exactly 1.0 for tiny negatives.
                if state.phase_accumulator >= 1.0 {
                    state.phase_accumulator = 0.0;
                }
                state.phase_accumulator < 0.5
            }
        };
        state.last_render_timestamp = timestamp;
        state.is_on = should_be_on;
        should_be_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(index: u64, refresh_hz: f64) -> Duration {
        Duration::from_secs_f64(index as f64 / refresh_hz)
    }

    #[test]
    fn sixty_hz_ten_hz_sequence() {
        let oracle = TimingOracle::new(10.0, 60.0);
        assert_eq!(
            oracle.timing(),
            FlickerTiming {
                frames_on: 3,
                frames_off: 3,
                frames_per_cycle: 6
            }
        );
        assert_eq!(oracle.mode(), TimingMode::FrameCount);

        let mut state = RenderState::new(Duration::ZERO);
        let decisions: Vec<bool> = (1..=12)
            .map(|i| oracle.decide(&mut state, frame_at(i, 60.0)))
            .collect();
        let on = true;
        let off = false;
        assert_eq!(
            decisions,
            vec![on, on, on, off, off, off, on, on, on, off, off, off]
        );
    }

    #[test]
    fn odd_cycles_give_the_extra_frame_to_off() {
        let timing = FlickerTiming::compute(12.0, 60.0);
        assert_eq!(timing.frames_per_cycle, 5);
        assert_eq!(timing.frames_on, 2);
        assert_eq!(timing.frames_off, 3);
        assert_eq!(timing.frames_on + timing.frames_off, timing.frames_per_cycle);
    }

    #[test]
    fn exact_divisors_have_constant_duty_and_transition_position() {
        for &(refresh, target) in &[(60.0, 10.0), (120.0, 40.0), (144.0, 12.0), (240.0, 8.0)] {
            let oracle = TimingOracle::new(target, refresh);
            assert_eq!(oracle.mode(), TimingMode::FrameCount);
            let n = oracle.timing().frames_per_cycle as usize;
            let cycles = 50;
            let mut state = RenderState::new(Duration::ZERO);
            let seq: Vec<bool> = (0..n * cycles)
                .map(|i| oracle.decide(&mut state, frame_at(i as u64, refresh)))
                .collect();
            let on_count = seq.iter().filter(|on| **on).count();
            assert_eq!(on_count, oracle.timing().frames_on as usize * cycles);
            for cycle in seq.chunks(n) {
                let first_off = cycle.iter().position(|on| !on).unwrap();
                assert_eq!(first_off, oracle.timing().frames_on as usize);
            }
        }
    }

    #[test]
    fn phase_accumulator_stays_bounded_and_averages_half() {
        let refresh = 60.0;
        let oracle = TimingOracle::new(7.0, refresh);
        assert_eq!(oracle.mode(), TimingMode::PhaseAccumulator);

        let mut state = RenderState::new(Duration::ZERO);
        let ticks = 120_000_u64;
        let mut on = 0_u64;
        for i in 1..=ticks {
            if oracle.decide(&mut state, frame_at(i, refresh)) {
                on += 1;
            }
            assert!((0.0..1.0).contains(&state.phase_accumulator));
        }
        let fraction = on as f64 / ticks as f64;
        assert!((fraction - 0.5).abs() < 0.01, "on fraction {fraction}");
    }

    #[test]
    fn folding_is_transparent_over_ten_million_frames() {
        let oracle = TimingOracle::new(10.0, 60.0);
        let cycle = oracle.timing().frames_per_cycle as u64;
        let frames_on = oracle.timing().frames_on as u64;
        let mut state = RenderState::new(Duration::ZERO);
        for i in 0..10_000_000_u64 {
            let expected = i % cycle < frames_on;
            assert_eq!(oracle.decide(&mut state, Duration::ZERO), expected);
        }
        assert!(state.frame_count < cycle * FOLD_AFTER_CYCLES);
    }

    #[test]
    fn invalid_targets_degenerate_without_panicking() {
        let oracle = TimingOracle::new(60.0, 60.0);
        assert_eq!(oracle.timing().frames_per_cycle, 1);
        assert_eq!(oracle.mode(), TimingMode::FrameCount);
        let mut state = RenderState::new(Duration::ZERO);
        assert!((0..10).all(|i| !oracle.decide(&mut state, frame_at(i, 60.0))));

        let oracle = TimingOracle::new(500.0, 60.0);
        assert_eq!(oracle.timing().frames_per_cycle, 1);
    }
}
