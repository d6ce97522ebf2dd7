//! Clinical SSVEP stimuli.
//!
//! Reversal stimuli (checkerboard, grating, Gabor) swap contrast on each
//! half-cycle instead of flashing, so mean luminance stays constant.

use std::f64::consts::PI;

use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{PatternRenderer, RenderContext};

const SPARSE_ON_SALT: u64 = 0x9e37_79b9_7f4a_7c15;
const SPARSE_OFF_SALT: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Whole-field flash between the on and off colors.
pub struct FullField;

impl PatternRenderer for FullField {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let color = if ctx.is_on { ctx.colors.on } else { ctx.colors.off };
        ctx.surface.fill(color);
    }
}

/// Pattern-reversal checkerboard.
pub struct Checkerboard;

impl PatternRenderer for Checkerboard {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let cells = ctx.params.cells.max(1);
        let Some((cell, rows)) = cell_grid(ctx.width, ctx.height, cells) else {
            return;
        };
        for row in 0..rows {
            for col in 0..cells {
                let white = ((row + col) % 2 == 0) ^ ctx.is_on;
                let color = if white { ctx.colors.on } else { ctx.colors.off };
                ctx.surface
                    .fill_rect(col as f64 * cell, row as f64 * cell, cell, cell, color);
            }
        }
    }
}

/// Sinusoidal grating with a π phase reversal.
pub struct Grating;

impl PatternRenderer for Grating {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        paint_grating(ctx, 0.0, None);
    }
}

/// Grating windowed by a 2D Gaussian centred on the surface.
pub struct Gabor;

impl PatternRenderer for Gabor {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let sigma = (ctx.params.gabor_sigma * ctx.min_side()).max(1.0);
        paint_grating(ctx, 0.0, Some(sigma));
    }
}

/// Grating drifting at `motion_speed` cycles per second.
pub struct DriftGrating;

impl PatternRenderer for DriftGrating {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let drift = 2.0 * PI * ctx.params.motion_speed * ctx.time;
        paint_grating(ctx, drift, None);
    }

    fn is_motion(&self) -> bool {
        true
    }
}

fn paint_grating(ctx: &mut RenderContext<'_>, drift: f64, envelope_sigma: Option<f64>) {
    let theta = ctx.params.orientation_deg.to_radians();
    let (cos_t, sin_t) = (theta.cos(), theta.sin());
    let k = 2.0 * PI * ctx.params.spatial_frequency / ctx.width.max(1.0);
    let reversal = if ctx.is_on { PI } else { 0.0 };
    let (cx, cy) = ctx.center();
    let (on, off) = (ctx.colors.on, ctx.colors.off);
    let (w, h) = (ctx.width as u32, ctx.height as u32);

    for y in 0..h {
        for x in 0..w {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            let u = dx * cos_t + dy * sin_t;
            let mut contrast = (k * u + reversal - drift).sin();
            if let Some(sigma) = envelope_sigma {
                contrast *= (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
            ctx.surface.set_pixel(x, y, off.mix(on, 0.5 + 0.5 * contrast));
        }
    }
}

/// Sparse random cell field (QR-like). Each flicker state has its own fixed
/// seed, so both fields are reproducible and distinct.
pub struct Sparse;

impl PatternRenderer for Sparse {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let salt = if ctx.is_on { SPARSE_ON_SALT } else { SPARSE_OFF_SALT };
        let mut rng = SmallRng::seed_from_u64(ctx.params.seed ^ salt);
        let density = ctx.params.sparse_density.clamp(0.0, 1.0);
        let cols = ctx.params.sparse_cells.max(1);

        ctx.surface.fill(ctx.colors.off);
        let Some((cell, rows)) = cell_grid(ctx.width, ctx.height, cols) else {
            return;
        };
        for row in 0..rows {
            for col in 0..cols {
                if rng.random::<f64>() < density {
                    ctx.surface.fill_rect(
                        col as f64 * cell,
                        row as f64 * cell,
                        cell,
                        cell,
                        ctx.colors.on,
                    );
                }
            }
        }
    }
}

/// Square cell size and row count for `cols` columns across the surface.
/// `None` when the surface has no area to divide.
fn cell_grid(width: f64, height: f64, cols: u32) -> Option<(f64, u32)> {
    if !(width > 0.0 && height > 0.0) {
        return None;
    }
    let cell = width / cols as f64;
    Some((cell, (height / cell).ceil() as u32))
}

/// Concentric rings travelling outward; the flicker state swaps ring parity.
pub struct RadialMotion;

impl PatternRenderer for RadialMotion {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let spacing = (ctx.min_side() / (2.0 * ctx.params.cells.max(1) as f64)).max(1.0);
        let shift = ctx.params.motion_speed * ctx.time;
        let (cx, cy) = ctx.center();
        let (w, h) = (ctx.width as u32, ctx.height as u32);

        for y in 0..h {
            for x in 0..w {
                let d = (x as f64 + 0.5 - cx).hypot(y as f64 + 0.5 - cy);
                let band = (d / spacing - shift).floor() as i64;
                let lit = (band.rem_euclid(2) == 0) ^ ctx.is_on;
                let color = if lit { ctx.colors.on } else { ctx.colors.off };
                ctx.surface.set_pixel(x, y, color);
            }
        }
    }

    fn is_motion(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{Colors, PatternMode, PatternParams};
    use crate::patterns::tests::paint;
    use crate::patterns::{PatternRegistry, RenderContext};
    use crate::render::{PixelSurface, Rgba, Surface};

    #[test]
    fn checkerboard_reverses_instead_of_flashing() {
        let registry = PatternRegistry::new();
        let params = PatternParams::default();
        let on = paint(&registry, PatternMode::Clinical, "checkerboard", true, 0.0, &params, None);
        let off = paint(&registry, PatternMode::Clinical, "checkerboard", false, 0.0, &params, None);

        // 64px / 8 cells = 8px cells; cell (0,0) is white when off.
        assert_eq!(off.pixel(1, 1), Some(Rgba::WHITE));
        assert_eq!(on.pixel(1, 1), Some(Rgba::BLACK));
        assert_eq!(on.pixel(9, 1), Some(Rgba::WHITE));
        assert!((on.mean_luminance() - off.mean_luminance()).abs() < 1e-9);
    }

    #[test]
    fn grating_reversal_inverts_contrast() {
        let registry = PatternRegistry::new();
        let params = PatternParams::default();
        let on = paint(&registry, PatternMode::Clinical, "grating", true, 0.0, &params, None);
        let off = paint(&registry, PatternMode::Clinical, "grating", false, 0.0, &params, None);
        let a = on.pixel(5, 10).unwrap();
        let b = off.pixel(5, 10).unwrap();
        assert!((a.r as i32 + b.r as i32 - 255).abs() <= 1, "{a:?} {b:?}");
    }

    #[test]
    fn gabor_fades_to_mid_grey_at_the_edges() {
        let registry = PatternRegistry::new();
        let params = PatternParams {
            gabor_sigma: 0.1,
            ..PatternParams::default()
        };
        let surface = paint(&registry, PatternMode::Clinical, "gabor", true, 0.0, &params, None);
        let corner = surface.pixel(0, 0).unwrap();
        assert!((corner.r as i32 - 128).abs() <= 1);
    }

    #[test]
    fn sparse_fields_differ_per_state_but_not_per_frame() {
        let registry = PatternRegistry::new();
        let params = PatternParams {
            sparse_density: 0.5,
            ..PatternParams::default()
        };
        let on_a = paint(&registry, PatternMode::Clinical, "sparse", true, 0.0, &params, None);
        let on_b = paint(&registry, PatternMode::Clinical, "sparse", true, 3.0, &params, None);
        let off = paint(&registry, PatternMode::Clinical, "sparse", false, 0.0, &params, None);
        assert_eq!(on_a.snapshot(), on_b.snapshot());
        assert_ne!(on_a.snapshot(), off.snapshot());
    }

    #[test]
    fn motion_patterns_change_over_time() {
        let registry = PatternRegistry::new();
        let params = PatternParams::default();
        for id in ["radial-motion", "drift-grating"] {
            let early = paint(&registry, PatternMode::Clinical, id, true, 0.0, &params, None);
            let later = paint(&registry, PatternMode::Clinical, id, true, 0.7, &params, None);
            assert_ne!(early.snapshot(), later.snapshot(), "{id}");
        }
    }

    #[test]
    fn empty_surfaces_render_without_looping() {
        let registry = PatternRegistry::new();
        let params = PatternParams::default();
        let colors = Colors::default();
        for (w, h) in [(0, 48), (64, 0), (0, 0)] {
            let mut surface = PixelSurface::new(w, h);
            for id in ["checkerboard", "sparse", "grating", "radial-motion"] {
                let mut ctx = RenderContext {
                    surface: &mut surface,
                    width: w as f64,
                    height: h as f64,
                    is_on: true,
                    time: 0.0,
                    params: &params,
                    colors: &colors,
                    neurofeedback: None,
                };
                registry.render(PatternMode::Clinical, id, &mut ctx);
            }
            assert_eq!(surface.pixel(0, 0), None);
        }
    }
}
