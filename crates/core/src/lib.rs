//! Core library for the entrainment stimulus engine.
//!
//! The visual side decides, frame by frame, whether a flicker stimulus is on
//! or off and paints the configured pattern. The audio side schedules ambient
//! sound events as a Poisson process, plays each through its own effect chain
//! and keeps a binaural beat running underneath. Both read configuration as
//! snapshots through [`ConfigSource`] and share one monotonic clock per
//! session.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod binaural;
pub mod config;
pub mod error;
pub mod fx;
pub mod neurofeedback;
pub mod patterns;
pub mod render;
pub mod scheduler;
pub mod timeline;
pub mod timing;

pub use analysis::{StimulusAnalyzer, StimulusReport};
pub use assets::{AssetLoader, AudioBuffer, CacheStats, FsLoader, SoundCatalog, SoundVariant};
pub use audio::{AudioDiagnostics, AudioEngine};
pub use binaural::{carrier_for_beat, BinauralGenerator};
pub use config::{AppConfig, AudioConfig, ConfigSource, SharedConfig, VisualConfig};
pub use error::{EntrainError, Result};
pub use fx::{ActiveSoundChain, FxGraph};
pub use neurofeedback::{Band, NeurofeedbackSnapshot};
pub use patterns::{PatternRegistry, PatternRenderer, RenderContext};
pub use render::{PixelSurface, RenderDiagnostics, RenderLoop, Rgba, Surface};
pub use scheduler::{EventScheduler, ScheduledEvent};
pub use timeline::{FrameHandle, FrameRequester, ManualClock, ManualFrames, MonotonicClock, SystemClock};
pub use timing::{FlickerTiming, RenderState, TimingMode, TimingOracle};
