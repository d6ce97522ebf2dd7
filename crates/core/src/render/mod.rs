//! Render loop driver.
//!
//! The loop is an explicit two-state machine (`Stopped`/`Running`) driven by
//! display callbacks from a [`FrameRequester`]. It runs only while it is
//! enabled, not paused, visible, the safety notice has been acknowledged and a
//! surface is attached. Leaving `Running` cancels the pending callback
//! synchronously and blanks the surface; re-entering it starts from fresh
//! counters stamped with the session clock.

mod surface;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigSource, VisualConfig};
use crate::neurofeedback::NeurofeedbackSnapshot;
use crate::patterns::{PatternRegistry, RenderContext};
use crate::timeline::{FrameHandle, FrameRequester, MonotonicClock};
use crate::timing::{RenderState, TimingOracle};

pub use surface::{Frame, PixelSurface, Rgba, Surface};

/// Callbacks arriving sooner than this fraction of a refresh interval after
/// the last accepted frame are skipped.
pub const FRAME_BUDGET_FRACTION: f64 = 0.9;
/// Intervals longer than this many refresh periods count as dropped frames.
pub const DROPPED_FRAME_FACTOR: f64 = 1.5;
const DIAGNOSTIC_WINDOW: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopPhase {
    Stopped,
    Running,
}

/// Frame pacing figures over the recent window of accepted frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderDiagnostics {
    pub fps: f64,
    pub avg_frame_time_ms: f64,
    pub p95_frame_time_ms: f64,
    pub dropped_frame_count: u64,
    pub frames_accepted: u64,
    pub repaints: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Default)]
struct FrameStats {
    intervals_ms: VecDeque<f64>,
    dropped: u64,
    accepted: u64,
    repaints: u64,
    cache_hits: u64,
}

impl FrameStats {
    fn record(&mut self, interval_ms: f64) {
        if self.intervals_ms.len() == DIAGNOSTIC_WINDOW {
            self.intervals_ms.pop_front();
        }
        self.intervals_ms.push_back(interval_ms);
        self.accepted += 1;
    }

    fn diagnostics(&self) -> RenderDiagnostics {
        let n = self.intervals_ms.len();
        let (avg, p95) = if n == 0 {
            (0.0, 0.0)
        } else {
            let mut sorted: Vec<f64> = self.intervals_ms.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            let rank = ((0.95 * n as f64).ceil() as usize).clamp(1, n) - 1;
            (sorted.iter().sum::<f64>() / n as f64, sorted[rank])
        };
        RenderDiagnostics {
            fps: if avg > 0.0 { 1000.0 / avg } else { 0.0 },
            avg_frame_time_ms: avg,
            p95_frame_time_ms: p95,
            dropped_frame_count: self.dropped,
            frames_accepted: self.accepted,
            repaints: self.repaints,
            cache_hits: self.cache_hits,
        }
    }
}

/// Cached images of a static pattern, one per flicker state.
#[derive(Debug)]
struct StaticCache {
    fingerprint: u64,
    size: (u32, u32),
    frames: [Option<Frame>; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PaintKey {
    is_on: bool,
    fingerprint: u64,
    size: (u32, u32),
}

#[derive(Debug, Clone, Copy)]
struct LoopControl {
    enabled: bool,
    paused: bool,
    visible: bool,
}

pub struct RenderLoop<S: Surface, C: ConfigSource, F: FrameRequester> {
    clock: Arc<dyn MonotonicClock>,
    frames: F,
    registry: PatternRegistry,
    surface: Option<S>,
    config: Option<C>,
    control: LoopControl,
    phase: LoopPhase,
    pending: Option<FrameHandle>,
    state: Option<RenderState>,
    oracle: Option<TimingOracle>,
    last_paint: Option<PaintKey>,
    cache: Option<StaticCache>,
    stats: FrameStats,
}

impl<S: Surface, C: ConfigSource, F: FrameRequester> RenderLoop<S, C, F> {
    /// Creates a stopped loop with the built-in pattern library.
    pub fn new(clock: Arc<dyn MonotonicClock>, frames: F) -> Self {
        Self::with_registry(clock, frames, PatternRegistry::new())
    }

    pub fn with_registry(clock: Arc<dyn MonotonicClock>, frames: F, registry: PatternRegistry) -> Self {
        Self {
            clock,
            frames,
            registry,
            surface: None,
            config: None,
            control: LoopControl {
                enabled: false,
                paused: false,
                visible: true,
            },
            phase: LoopPhase::Stopped,
            pending: None,
            state: None,
            oracle: None,
            last_paint: None,
            cache: None,
            stats: FrameStats::default(),
        }
    }

    /// Attaches the surface and configuration and enables the loop. The loop
    /// only starts running once every run condition holds.
    pub fn start(&mut self, surface: S, config: C) {
        self.surface = Some(surface);
        self.config = Some(config);
        self.cache = None;
        self.control.enabled = true;
        self.reconcile();
    }

    /// Disables the loop. No callback is painted after this returns.
    pub fn stop(&mut self) {
        self.control.enabled = false;
        self.reconcile();
    }

    /// Explicit pause. Pausing cancels the pending callback and blanks the
    /// surface; resuming starts a fresh run.
    pub fn set_paused(&mut self, paused: bool) {
        self.control.paused = paused;
        self.reconcile();
    }

    /// Host visibility signal; hiding behaves like a pause.
    pub fn on_visibility_change(&mut self, visible: bool) {
        self.control.visible = visible;
        self.reconcile();
    }

    /// Re-evaluates the run conditions, e.g. after the safety notice has been
    /// acknowledged in the external configuration.
    pub fn refresh(&mut self) {
        self.reconcile();
    }

    /// Display callback entry point. Stale or cancelled handles are ignored.
    pub fn on_frame(&mut self, handle: FrameHandle) {
        if self.phase != LoopPhase::Running || self.pending != Some(handle) {
            return;
        }
        self.pending = None;
        self.tick();
        if self.phase == LoopPhase::Running {
            self.pending = Some(self.frames.request_frame());
        }
    }

    /// Returns whether the loop is currently running.
    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Timing state of the current run; `None` while stopped.
    pub fn state(&self) -> Option<&RenderState> {
        self.state.as_ref()
    }

    /// Returns the attached surface, if any.
    pub fn surface(&self) -> Option<&S> {
        self.surface.as_ref()
    }

    /// Mutable access for the host, e.g. to resize the surface.
    pub fn surface_mut(&mut self) -> Option<&mut S> {
        self.surface.as_mut()
    }

    /// Returns the frame requester, so the host can deliver callbacks.
    pub fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }

    /// Frame pacing over the recent window of accepted frames.
    pub fn diagnostics(&self) -> RenderDiagnostics {
        self.stats.diagnostics()
    }

    /// Drops cached static-pattern images.
    pub fn invalidate_cache(&mut self) {
        self.cache = None;
        self.last_paint = None;
    }

    fn should_run(&self) -> bool {
        let safety = self
            .config
            .as_ref()
            .map(|config| config.visual().safety_acknowledged)
            .unwrap_or(false);
        self.control.enabled
            && !self.control.paused
            && self.control.visible
            && safety
            && self.surface.is_some()
    }

    fn reconcile(&mut self) {
        match (self.phase, self.should_run()) {
            (LoopPhase::Stopped, true) => self.begin(),
            (LoopPhase::Running, false) => self.halt(),
            _ => {}
        }
    }

    fn begin(&mut self) {
        let now = self.clock.now();
        self.state = Some(RenderState::new(now));
        self.oracle = None;
        self.last_paint = None;
        self.phase = LoopPhase::Running;
        self.pending = Some(self.frames.request_frame());
        tracing::info!(start_ms = now.as_secs_f64() * 1000.0, "render loop running");
    }

    fn halt(&mut self) {
        if let Some(handle) = self.pending.take() {
            self.frames.cancel_frame(handle);
        }
        self.phase = LoopPhase::Stopped;
        self.state = None;
        self.last_paint = None;

        let off = self
            .config
            .as_ref()
            .map(|config| config.visual().colors.off)
            .unwrap_or(Rgba::BLACK);
        if let Some(surface) = self.surface.as_mut() {
            if surface.is_ready() {
                surface.set_blur(0.0);
                surface.fill(off);
            }
        }
        tracing::info!(
            enabled = self.control.enabled,
            paused = self.control.paused,
            visible = self.control.visible,
            "render loop stopped"
        );
    }

    fn tick(&mut self) {
        let (Some(config), Some(surface), Some(state)) =
            (self.config.as_ref(), self.surface.as_mut(), self.state.as_mut())
        else {
            return;
        };
        if !surface.is_ready() {
            return;
        }

        // One snapshot per tick; nothing below re-reads the source.
        let visual = config.visual();
        let neurofeedback = if visual.neurofeedback_enabled {
            config.neurofeedback()
        } else {
            None
        };

        let now = self.clock.now();
        let refresh = visual.refresh_rate_hz.max(1.0);
        let frame_ms = 1000.0 / refresh;
        let interval_ms = now.saturating_sub(state.last_render_timestamp).as_secs_f64() * 1000.0;
        if interval_ms < FRAME_BUDGET_FRACTION * frame_ms {
            return;
        }
        if interval_ms > DROPPED_FRAME_FACTOR * frame_ms {
            state.dropped_frame_count += 1;
            self.stats.dropped += 1;
        }
        self.stats.record(interval_ms);

        let target = visual.effective_target_hz();
        let oracle = match self.oracle {
            Some(oracle) if oracle.matches(target, refresh) => oracle,
            _ => {
                let oracle = TimingOracle::new(target, refresh);
                tracing::debug!(target_hz = target, refresh_hz = refresh, timing = ?oracle.timing(), mode = ?oracle.mode(), "flicker timing updated");
                self.oracle = Some(oracle);
                oracle
            }
        };
        let is_on = oracle.decide(state, now);

        let key = PaintKey {
            is_on,
            fingerprint: visual.pattern_fingerprint(),
            size: surface.size(),
        };
        let is_static = self.registry.is_static(visual.pattern_mode, &visual.pattern_id);
        if !is_static || self.last_paint != Some(key) {
            let elapsed = state.elapsed(now);
            paint(
                &self.registry,
                surface,
                &mut self.cache,
                &mut self.stats,
                &visual,
                neurofeedback.as_ref(),
                key,
                is_static,
                elapsed,
            );
            self.last_paint = Some(key);
        }

        let brightness = visual.colors.brightness
            * neurofeedback
                .as_ref()
                .map(|nf| nf.brightness_modulation)
                .unwrap_or(1.0);
        surface.set_opacity(brightness.clamp(0.0, 1.0));
        let blur = neurofeedback
            .as_ref()
            .map(|nf| (1.0 - nf.coherence_score.clamp(0.0, 1.0)) * visual.max_blur_px)
            .unwrap_or(0.0);
        surface.set_blur(blur);
    }
}

#[allow(clippy::too_many_arguments)]
fn paint<S: Surface>(
    registry: &PatternRegistry,
    surface: &mut S,
    cache: &mut Option<StaticCache>,
    stats: &mut FrameStats,
    visual: &VisualConfig,
    neurofeedback: Option<&NeurofeedbackSnapshot>,
    key: PaintKey,
    is_static: bool,
    elapsed: Duration,
) {
    stats.repaints += 1;
    let slot = key.is_on as usize;

    if is_static {
        let stale = cache
            .as_ref()
            .map(|c| c.fingerprint != key.fingerprint || c.size != key.size)
            .unwrap_or(true);
        if stale {
            if cache.is_some() {
                tracing::debug!(size = ?key.size, "static pattern cache invalidated");
            }
            *cache = Some(StaticCache {
                fingerprint: key.fingerprint,
                size: key.size,
                frames: [None, None],
            });
        }
        if let Some(frame) = cache.as_ref().and_then(|c| c.frames[slot].as_ref()) {
            surface.blit(frame);
            stats.cache_hits += 1;
            return;
        }
    }

    let (width, height) = key.size;
    let mut ctx = RenderContext {
        surface: &mut *surface,
        width: width as f64,
        height: height as f64,
        is_on: key.is_on,
        time: elapsed.as_secs_f64(),
        params: &visual.pattern,
        colors: &visual.colors,
        neurofeedback,
    };
    registry.render(visual.pattern_mode, &visual.pattern_id, &mut ctx);

    if is_static {
        if let Some(c) = cache.as_mut() {
            c.frames[slot] = surface.snapshot();
        }
    }
}

impl<S: Surface, C: ConfigSource, F: FrameRequester> std::fmt::Debug for RenderLoop<S, C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderLoop")
            .field("phase", &self.phase)
            .field("pending", &self.pending)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
