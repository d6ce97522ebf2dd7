//! Pattern renderer registry.
//!
//! Renderers are stateless strategies keyed by `(PatternMode, id)`. Each
//! family has a fallback used for unknown ids, so dispatch never fails.
//! Clinical patterns other than the motion variants are *static*: identical
//! configuration and on/off state give identical pixels, which lets the render
//! loop cache them.

mod clinical;
mod generative;
pub mod noise;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Colors, PatternMode, PatternParams};
use crate::neurofeedback::NeurofeedbackSnapshot;
use crate::render::{Rgba, Surface};

pub use clinical::{Checkerboard, DriftGrating, FullField, Gabor, Grating, RadialMotion, Sparse};
pub use generative::{FlowerOfLife, FractalNoise, Lotus, Metatron, Spiral, SriYantra};

pub const CLINICAL_FALLBACK: &str = "full-field";
pub const GENERATIVE_FALLBACK: &str = "flower-of-life";

/// Everything a renderer may read while painting one frame.
pub struct RenderContext<'a> {
    pub surface: &'a mut dyn Surface,
    pub width: f64,
    pub height: f64,
    pub is_on: bool,
    /// Seconds since the render loop (re)started.
    pub time: f64,
    pub params: &'a PatternParams,
    pub colors: &'a Colors,
    pub neurofeedback: Option<&'a NeurofeedbackSnapshot>,
}

impl RenderContext<'_> {
    /// Foreground/background pair with the flicker state applied.
    pub fn active_colors(&self) -> (Rgba, Rgba) {
        if self.is_on {
            (self.colors.on, self.colors.off)
        } else {
            (self.colors.off, self.colors.on)
        }
    }

    pub fn min_side(&self) -> f64 {
        self.width.min(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.width / 2.0, self.height / 2.0)
    }
}

/// A pure drawing strategy.
pub trait PatternRenderer: Send + Sync {
    fn render(&self, ctx: &mut RenderContext<'_>);

    /// Motion patterns repaint every frame because they depend on time.
    fn is_motion(&self) -> bool {
        false
    }
}

struct Family {
    renderers: BTreeMap<String, Arc<dyn PatternRenderer>>,
    fallback: Arc<dyn PatternRenderer>,
}

impl Family {
    fn new(fallback_id: &str, fallback: Arc<dyn PatternRenderer>) -> Self {
        let mut renderers = BTreeMap::new();
        renderers.insert(fallback_id.to_string(), fallback.clone());
        Self {
            renderers,
            fallback,
        }
    }

    fn resolve(&self, id: &str) -> &dyn PatternRenderer {
        self.renderers
            .get(id)
            .map(|renderer| renderer.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }
}

pub struct PatternRegistry {
    clinical: Family,
    generative: Family,
}

impl PatternRegistry {
    /// Registry holding the built-in library.
    pub fn new() -> Self {
        let mut registry = Self {
            clinical: Family::new(CLINICAL_FALLBACK, Arc::new(FullField)),
            generative: Family::new(GENERATIVE_FALLBACK, Arc::new(FlowerOfLife)),
        };
        registry.register(PatternMode::Clinical, "checkerboard", Arc::new(Checkerboard));
        registry.register(PatternMode::Clinical, "grating", Arc::new(Grating));
        registry.register(PatternMode::Clinical, "gabor", Arc::new(Gabor));
        registry.register(PatternMode::Clinical, "sparse", Arc::new(Sparse));
        registry.register(PatternMode::Clinical, "radial-motion", Arc::new(RadialMotion));
        registry.register(PatternMode::Clinical, "drift-grating", Arc::new(DriftGrating));
        registry.register(PatternMode::Generative, "sri-yantra", Arc::new(SriYantra));
        registry.register(PatternMode::Generative, "metatron", Arc::new(Metatron));
        registry.register(PatternMode::Generative, "lotus", Arc::new(Lotus));
        registry.register(PatternMode::Generative, "spiral", Arc::new(Spiral));
        registry.register(PatternMode::Generative, "fractal-noise", Arc::new(FractalNoise));
        registry
    }

    /// Adds or replaces a renderer.
    pub fn register(&mut self, mode: PatternMode, id: &str, renderer: Arc<dyn PatternRenderer>) {
        self.family_mut(mode).renderers.insert(id.to_string(), renderer);
    }

    pub fn contains(&self, mode: PatternMode, id: &str) -> bool {
        self.family(mode).renderers.contains_key(id)
    }

    pub fn ids(&self, mode: PatternMode) -> impl Iterator<Item = &str> {
        self.family(mode).renderers.keys().map(String::as_str)
    }

    pub fn render(&self, mode: PatternMode, id: &str, ctx: &mut RenderContext<'_>) {
        self.family(mode).resolve(id).render(ctx);
    }

    pub fn is_static(&self, mode: PatternMode, id: &str) -> bool {
        mode == PatternMode::Clinical && !self.family(mode).resolve(id).is_motion()
    }

    fn family(&self, mode: PatternMode) -> &Family {
        match mode {
            PatternMode::Clinical => &self.clinical,
            PatternMode::Generative => &self.generative,
        }
    }

    fn family_mut(&mut self, mode: PatternMode) -> &mut Family {
        match mode {
            PatternMode::Clinical => &mut self.clinical,
            PatternMode::Generative => &mut self.generative,
        }
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PatternRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRegistry")
            .field("clinical", &self.clinical.renderers.keys().collect::<Vec<_>>())
            .field("generative", &self.generative.renderers.keys().collect::<Vec<_>>())
            .finish()
    }
}
