//! Fractal value noise.
//!
//! Random values on an integer lattice, smoothly interpolated and summed over
//! octaves. This is value noise, not gradient (Perlin) noise: it is cheaper
//! and blockier, which is acceptable for a slowly drifting background.

/// Lattice value in `[0, 1)` for integer coordinates.
fn lattice(seed: u64, x: i64, y: i64) -> f64 {
    let mut h = seed
        ^ (x as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ (y as u64).wrapping_mul(0xc2b2_ae3d_27d4_eb4f);
    // splitmix64 finaliser
    h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^= h >> 31;
    (h >> 11) as f64 / (1u64 << 53) as f64
}

fn fade(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

/// Single-octave value noise in `[0, 1)`.
pub fn value_noise(seed: u64, x: f64, y: f64) -> f64 {
    let (x0, y0) = (x.floor(), y.floor());
    let (tx, ty) = (fade(x - x0), fade(y - y0));
    let (ix, iy) = (x0 as i64, y0 as i64);

    let a = lattice(seed, ix, iy);
    let b = lattice(seed, ix + 1, iy);
    let c = lattice(seed, ix, iy + 1);
    let d = lattice(seed, ix + 1, iy + 1);

    let top = a + (b - a) * tx;
    let bottom = c + (d - c) * tx;
    top + (bottom - top) * ty
}

/// Multi-octave sum normalised to `[0, 1)`. Frequency doubles per octave and
/// amplitude is multiplied by `0.5 * fractal_dimension`.
pub fn fractal_noise(seed: u64, x: f64, y: f64, octaves: u32, fractal_dimension: f64) -> f64 {
    let decay = 0.5 * fractal_dimension.clamp(0.2, 1.9);
    let mut amplitude = 1.0;
    let mut frequency = 1.0;
    let mut sum = 0.0;
    let mut norm = 0.0;
    for octave in 0..octaves.max(1) {
        sum += amplitude * value_noise(seed.wrapping_add(octave as u64), x * frequency, y * frequency);
        norm += amplitude;
        amplitude *= decay;
        frequency *= 2.0;
    }
    sum / norm
}
