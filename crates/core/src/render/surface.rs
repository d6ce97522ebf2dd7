use std::fmt;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{EntrainError, Result};

/// 8-bit RGBA color. Serialized as `#rrggbb` or `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::rgb(255, 255, 255);
    pub const BLACK: Rgba = Rgba::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Linear blend, `t = 0` gives `self`, `t = 1` gives `other`.
    pub fn mix(self, other: Rgba, t: f64) -> Rgba {
        let t = t.clamp(0.0, 1.0);
        let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
        Rgba {
            r: lerp(self.r, other.r),
            g: lerp(self.g, other.g),
            b: lerp(self.b, other.b),
            a: lerp(self.a, other.a),
        }
    }
}

impl TryFrom<String> for Rgba {
    type Error = EntrainError;

    fn try_from(value: String) -> Result<Self> {
        let hex = value.trim().trim_start_matches('#');
        let channel = |i: usize| {
            hex.get(i..i + 2)
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| EntrainError::msg(format!("invalid color `{value}`")))
        };
        match hex.len() {
            6 => Ok(Rgba::rgb(channel(0)?, channel(2)?, channel(4)?)),
            8 => Ok(Rgba {
                r: channel(0)?,
                g: channel(2)?,
                b: channel(4)?,
                a: channel(6)?,
            }),
            _ => Err(EntrainError::msg(format!("invalid color `{value}`"))),
        }
    }
}

impl From<Rgba> for String {
    fn from(value: Rgba) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 255 {
            write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

/// Captured surface contents, used to cache static patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Canvas-like drawing target. Coordinates are in pixels with the origin at
/// the top-left corner. Opacity and blur are post-hoc presentation
/// attributes, they never change stored pixel values.
pub trait Surface {
    fn size(&self) -> (u32, u32);

    /// A surface with zero area is treated as not yet mounted.
    fn is_ready(&self) -> bool {
        let (w, h) = self.size();
        w > 0 && h > 0
    }

    fn fill(&mut self, color: Rgba);
    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: Rgba);
    fn fill_circle(&mut self, cx: f64, cy: f64, radius: f64, color: Rgba);
    fn stroke_circle(&mut self, cx: f64, cy: f64, radius: f64, width: f64, color: Rgba);
    fn stroke_line(&mut self, from: (f64, f64), to: (f64, f64), width: f64, color: Rgba);
    fn set_pixel(&mut self, x: u32, y: u32, color: Rgba);

    fn set_opacity(&mut self, opacity: f64);
    fn set_blur(&mut self, radius_px: f64);

    fn snapshot(&self) -> Option<Frame>;
    /// Copies a snapshot back. Mismatched sizes are ignored.
    fn blit(&mut self, frame: &Frame);
}

/// In-memory RGBA8 surface.
#[derive(Debug, Clone)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    opacity: f64,
    blur: f64,
}

impl PixelSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
            opacity: 1.0,
            blur: 0.0,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 4];
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.index(x, y);
        Some(Rgba {
            r: self.pixels[i],
            g: self.pixels[i + 1],
            b: self.pixels[i + 2],
            a: self.pixels[i + 3],
        })
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    pub fn blur(&self) -> f64 {
        self.blur
    }

    /// Mean luminance in `[0, 1]` of the stored pixels.
    pub fn mean_luminance(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .pixels
            .chunks_exact(4)
            .map(|px| 0.2126 * px[0] as f64 + 0.7152 * px[1] as f64 + 0.0722 * px[2] as f64)
            .sum();
        sum / (self.pixels.len() / 4) as f64 / 255.0
    }

    /// Pixels as presented: RGB scaled by the opacity multiplier over black.
    pub fn composited(&self) -> Vec<u8> {
        let opacity = self.opacity.clamp(0.0, 1.0);
        self.pixels
            .chunks_exact(4)
            .flat_map(|px| {
                [
                    (px[0] as f64 * opacity).round() as u8,
                    (px[1] as f64 * opacity).round() as u8,
                    (px[2] as f64 * opacity).round() as u8,
                ]
            })
            .collect()
    }

    /// Writes the composited image as a binary PPM.
    pub fn write_ppm<W: Write>(&self, mut out: W) -> Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        out.write_all(&self.composited())?;
        Ok(())
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    fn put(&mut self, x: i64, y: i64, color: Rgba) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let i = self.index(x as u32, y as u32);
        self.pixels[i..i + 4].copy_from_slice(&[color.r, color.g, color.b, color.a]);
    }

    /// Visits pixel centres inside the clipped bounding box.
    fn scan(&mut self, min: (f64, f64), max: (f64, f64), color: Rgba, inside: impl Fn(f64, f64) -> bool) {
        let x0 = min.0.floor().max(0.0) as i64;
        let y0 = min.1.floor().max(0.0) as i64;
        let x1 = (max.0.ceil() as i64).min(self.width as i64);
        let y1 = (max.1.ceil() as i64).min(self.height as i64);
        for y in y0..y1 {
            for x in x0..x1 {
                if inside(x as f64 + 0.5, y as f64 + 0.5) {
                    self.put(x, y, color);
                }
            }
        }
    }
}

impl Surface for PixelSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fill(&mut self, color: Rgba) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&[color.r, color.g, color.b, color.a]);
        }
    }

    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: Rgba) {
        self.scan((x, y), (x + w, y + h), color, |px, py| {
            px >= x && px < x + w && py >= y && py < y + h
        });
    }

    fn fill_circle(&mut self, cx: f64, cy: f64, radius: f64, color: Rgba) {
        let r2 = radius * radius;
        self.scan((cx - radius, cy - radius), (cx + radius, cy + radius), color, |px, py| {
            (px - cx).powi(2) + (py - cy).powi(2) <= r2
        });
    }

    fn stroke_circle(&mut self, cx: f64, cy: f64, radius: f64, width: f64, color: Rgba) {
        let half = (width / 2.0).max(0.5);
        let outer = radius + half;
        self.scan((cx - outer, cy - outer), (cx + outer, cy + outer), color, |px, py| {
            let d = ((px - cx).powi(2) + (py - cy).powi(2)).sqrt();
            (d - radius).abs() <= half
        });
    }

    fn stroke_line(&mut self, from: (f64, f64), to: (f64, f64), width: f64, color: Rgba) {
        let half = (width / 2.0).max(0.5);
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let len2 = dx * dx + dy * dy;
        let min = (from.0.min(to.0) - half, from.1.min(to.1) - half);
        let max = (from.0.max(to.0) + half, from.1.max(to.1) + half);
        self.scan(min, max, color, |px, py| {
            let t = if len2 > 0.0 {
                (((px - from.0) * dx + (py - from.1) * dy) / len2).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let (nx, ny) = (from.0 + t * dx, from.1 + t * dy);
            (px - nx).powi(2) + (py - ny).powi(2) <= half * half
        });
    }

    fn set_pixel(&mut self, x: u32, y: u32, color: Rgba) {
        self.put(x as i64, y as i64, color);
    }

    fn set_opacity(&mut self, opacity: f64) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    fn set_blur(&mut self, radius_px: f64) {
        self.blur = radius_px.max(0.0);
    }

    fn snapshot(&self) -> Option<Frame> {
        Some(Frame {
            width: self.width,
            height: self.height,
            pixels: self.pixels.clone(),
        })
    }

    fn blit(&mut self, frame: &Frame) {
        if frame.width == self.width && frame.height == self.height {
            self.pixels.copy_from_slice(&frame.pixels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_hex_colors() {
        let color = Rgba::try_from("#10a0ff".to_string()).unwrap();
        assert_eq!(color, Rgba::rgb(0x10, 0xa0, 0xff));
        assert_eq!(color.to_string(), "#10a0ff");
        assert!(Rgba::try_from("#12".to_string()).is_err());
        assert!(Rgba::try_from("#zzzzzz".to_string()).is_err());
    }

    #[test]
    fn opacity_is_applied_only_when_compositing() {
        let mut surface = PixelSurface::new(2, 1);
        surface.fill(Rgba::WHITE);
        surface.set_opacity(0.5);
        assert_eq!(surface.pixel(0, 0), Some(Rgba::WHITE));
        assert_eq!(surface.composited()[0], 128);
    }

    #[test]
    fn shapes_stay_inside_bounds() {
        let mut surface = PixelSurface::new(10, 10);
        surface.fill_circle(0.0, 0.0, 30.0, Rgba::WHITE);
        surface.stroke_line((-5.0, 5.0), (50.0, 5.0), 2.0, Rgba::BLACK);
        assert_eq!(surface.pixel(9, 9), Some(Rgba::WHITE));
        assert_eq!(surface.pixel(3, 5), Some(Rgba::BLACK));
        assert_eq!(surface.pixel(10, 0), None);
    }

    #[test]
    fn zero_sized_surfaces_are_not_ready() {
        let surface = PixelSurface::new(0, 480);
        assert!(!surface.is_ready());
        assert!(PixelSurface::new(4, 4).is_ready());
    }

    #[test]
    fn blit_restores_snapshot() {
        let mut surface = PixelSurface::new(3, 3);
        surface.fill(Rgba::WHITE);
        let frame = surface.snapshot().unwrap();
        surface.fill(Rgba::BLACK);
        surface.blit(&frame);
        assert_eq!(surface.pixel(1, 1), Some(Rgba::WHITE));
    }
}
