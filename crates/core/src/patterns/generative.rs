//! Generative and sacred-geometry patterns.
//!
//! Geometry is a function of elapsed time only: a sinusoidal "breathing"
//! scale and a linear rotation. The flicker state swaps foreground and
//! background. When a neurofeedback snapshot is present its band powers scale
//! the pattern's discrete complexity (circle, petal, triangle or octave count).

use std::f64::consts::{PI, TAU};

use super::noise::fractal_noise;
use super::{PatternRenderer, RenderContext};

const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653;

fn breathing(ctx: &RenderContext<'_>) -> f64 {
    1.0 + ctx.params.breathing_depth * (TAU * ctx.params.breathing_rate_hz * ctx.time).sin()
}

fn rotation(ctx: &RenderContext<'_>) -> f64 {
    (ctx.params.rotation_speed_deg * ctx.time).to_radians()
}

/// Complexity count after neurofeedback perturbation, kept within `[min, max]`.
fn modulated_count(ctx: &RenderContext<'_>, base: u32, min: u32, max: u32) -> u32 {
    let factor = ctx
        .neurofeedback
        .map(|nf| nf.complexity_factor(ctx.params.nf_influence))
        .unwrap_or(1.0);
    ((base as f64 * factor).round() as u32).clamp(min, max)
}

fn polar(center: (f64, f64), radius: f64, angle: f64) -> (f64, f64) {
    (center.0 + radius * angle.cos(), center.1 + radius * angle.sin())
}

/// Overlapping circles on two hexagonal-style rings.
pub struct FlowerOfLife;

impl PatternRenderer for FlowerOfLife {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let (fg, bg) = ctx.active_colors();
        let count = modulated_count(ctx, ctx.params.complexity, 3, 24);
        let center = ctx.center();
        let r = ctx.min_side() * 0.14 * breathing(ctx);
        let rot = rotation(ctx);
        let width = ctx.params.line_width;

        ctx.surface.fill(bg);
        ctx.surface.stroke_circle(center.0, center.1, r, width, fg);
        for k in 0..count {
            let angle = rot + TAU * k as f64 / count as f64;
            let inner = polar(center, r, angle);
            ctx.surface.stroke_circle(inner.0, inner.1, r, width, fg);
            let outer = polar(center, 2.0 * r, angle + PI / count as f64);
            ctx.surface.stroke_circle(outer.0, outer.1, r, width, fg);
        }
        ctx.surface.stroke_circle(center.0, center.1, 3.0 * r, width, fg);
    }
}

/// Interlocking up/down triangles around a central point.
pub struct SriYantra;

impl PatternRenderer for SriYantra {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let (fg, bg) = ctx.active_colors();
        let count = modulated_count(ctx, ctx.params.complexity, 3, 15);
        let center = ctx.center();
        let radius = ctx.min_side() * 0.45 * breathing(ctx);
        let rot = rotation(ctx);
        let width = ctx.params.line_width;

        ctx.surface.fill(bg);
        for i in 0..count {
            let size = radius * (1.0 - i as f64 / (count + 1) as f64);
            let pointing = if i % 2 == 0 { -PI / 2.0 } else { PI / 2.0 };
            let shift = (i as f64 - count as f64 / 2.0) * radius * 0.04;
            let origin = (center.0, center.1 + shift);
            let vertices: Vec<(f64, f64)> = (0..3)
                .map(|k| polar(origin, size, rot + pointing + TAU * k as f64 / 3.0))
                .collect();
            for k in 0..3 {
                ctx.surface
                    .stroke_line(vertices[k], vertices[(k + 1) % 3], width, fg);
            }
        }
        ctx.surface.stroke_circle(center.0, center.1, radius, width, fg);
        ctx.surface.fill_circle(center.0, center.1, width * 1.5, fg);
    }
}

/// Circles on two rings with every centre joined to every other.
pub struct Metatron;

impl PatternRenderer for Metatron {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let (fg, bg) = ctx.active_colors();
        let count = modulated_count(ctx, ctx.params.complexity, 3, 16);
        let center = ctx.center();
        let reach = ctx.min_side() * 0.4 * breathing(ctx);
        let rot = rotation(ctx);
        let width = ctx.params.line_width;

        let mut nodes = vec![center];
        for k in 0..count {
            let angle = rot + TAU * k as f64 / count as f64;
            nodes.push(polar(center, reach * 0.5, angle));
            nodes.push(polar(center, reach, angle));
        }

        ctx.surface.fill(bg);
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                ctx.surface.stroke_line(*a, *b, width * 0.5, fg);
            }
        }
        for node in &nodes {
            ctx.surface
                .stroke_circle(node.0, node.1, reach * 0.12, width, fg);
        }
    }
}

/// Petals radiating from the centre, each a tapering chain of discs.
pub struct Lotus;

impl PatternRenderer for Lotus {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let (fg, bg) = ctx.active_colors();
        let petals = modulated_count(ctx, ctx.params.complexity * 2, 3, 48);
        let center = ctx.center();
        let length = ctx.min_side() * 0.45 * breathing(ctx);
        let rot = rotation(ctx);
        let girth = length * 0.16 * (8.0 / petals as f64).min(1.5);

        ctx.surface.fill(bg);
        for k in 0..petals {
            let angle = rot + TAU * k as f64 / petals as f64;
            for step in 1..=10 {
                let t = step as f64 / 10.0;
                let point = polar(center, t * length, angle);
                ctx.surface
                    .fill_circle(point.0, point.1, (PI * t).sin() * girth, fg);
            }
        }
        ctx.surface
            .fill_circle(center.0, center.1, length * 0.12, bg);
    }
}

/// Phyllotaxis spiral of dots spaced by the golden angle.
pub struct Spiral;

impl PatternRenderer for Spiral {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let (fg, bg) = ctx.active_colors();
        let points = modulated_count(ctx, ctx.params.complexity * 40, 10, 2000);
        let center = ctx.center();
        let scale = breathing(ctx);
        let rot = rotation(ctx);
        let spacing = ctx.min_side() * 0.45 / (points as f64).sqrt();
        let dot = (spacing * 0.35).max(1.0);

        ctx.surface.fill(bg);
        for i in 0..points {
            let radius = spacing * (i as f64).sqrt() * scale;
            let point = polar(center, radius, i as f64 * GOLDEN_ANGLE + rot);
            ctx.surface.fill_circle(point.0, point.1, dot, fg);
        }
    }
}

/// Drifting fractal value-noise field painted in pixel blocks.
pub struct FractalNoise;

impl PatternRenderer for FractalNoise {
    fn render(&self, ctx: &mut RenderContext<'_>) {
        let (fg, bg) = ctx.active_colors();
        let octaves = modulated_count(ctx, ctx.params.octaves, 1, 10);
        let block = ctx.params.noise_block.max(1) as f64;
        let lattice = ctx.params.noise_scale.max(0.1) / ctx.width.max(1.0);
        let drift = ctx.time * ctx.params.motion_speed * 0.2;
        let scale = breathing(ctx);
        let (seed, dimension) = (ctx.params.seed, ctx.params.fractal_dimension);

        let mut y = 0.0;
        while y < ctx.height {
            let mut x = 0.0;
            while x < ctx.width {
                let value = fractal_noise(
                    seed,
                    x * lattice / scale + drift,
                    y * lattice / scale,
                    octaves,
                    dimension,
                );
                ctx.surface.fill_rect(x, y, block, block, bg.mix(fg, value));
                x += block;
            }
            y += block;
        }
    }
}
