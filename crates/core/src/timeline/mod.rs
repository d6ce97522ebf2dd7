//! Clock sources and host callback scheduling.
//!
//! Every elapsed-time computation inside a render loop or audio session reads
//! from one [`MonotonicClock`]. Timestamps are [`Duration`]s since the clock's
//! own origin, so an epoch-based wall clock cannot be mixed in by accident.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Monotonic time source shared by everything in one session.
pub trait MonotonicClock: Send + Sync {
    /// Time elapsed since the clock's origin. Never decreases.
    fn now(&self) -> Duration;
}

/// Clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock. Clones share the same underlying time so a test
/// harness can hold one handle while the loop under test holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) {
        self.nanos
            .fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, millis: f64) {
        self.advance(Duration::from_secs_f64(millis.max(0.0) / 1000.0));
    }

    /// Moves the clock forward to `time`. Earlier values are ignored.
    pub fn set(&self, time: Duration) {
        self.nanos
            .fetch_max(time.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Identifier of one requested display callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub u64);

/// Display-synced callback source (the host's animation-frame facility).
pub trait FrameRequester {
    /// Requests one callback on the next displayed frame.
    fn request_frame(&mut self) -> FrameHandle;
    /// Cancels a previously requested callback. Unknown handles are ignored.
    fn cancel_frame(&mut self, handle: FrameHandle);
}

/// Frame requester driven by hand. The host (or a test) takes the pending
/// handle and delivers it back to the render loop when a frame is "displayed".
#[derive(Debug, Default)]
pub struct ManualFrames {
    next_id: u64,
    pending: Option<FrameHandle>,
    cancelled: u64,
}

impl ManualFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the currently pending callback, if any.
    pub fn take_pending(&mut self) -> Option<FrameHandle> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of callbacks cancelled so far.
    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }
}

impl FrameRequester for ManualFrames {
    fn request_frame(&mut self) -> FrameHandle {
        self.next_id += 1;
        let handle = FrameHandle(self.next_id);
        self.pending = Some(handle);
        handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        if self.pending == Some(handle) {
            self.pending = None;
            self.cancelled += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_handles_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance_ms(16.5);
        assert_eq!(other.now(), Duration::from_micros(16_500));

        other.set(Duration::from_millis(5));
        assert_eq!(clock.now(), Duration::from_micros(16_500));
    }

    #[test]
    fn cancelling_clears_the_pending_frame() {
        let mut frames = ManualFrames::new();
        let first = frames.request_frame();
        frames.cancel_frame(FrameHandle(first.0 + 10));
        assert!(frames.has_pending());

        frames.cancel_frame(first);
        assert!(!frames.has_pending());
        assert_eq!(frames.cancelled(), 1);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
