//! Freehand signature capture on a fixed-resolution grayscale canvas.

use crate::error::OnboardError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const CANVAS_WIDTH: u32 = 600;
pub const CANVAS_HEIGHT: u32 = 200;
pub const BORDER_WIDTH: u32 = 2;
pub const BRUSH_RADIUS: f32 = 1.5;

pub const INK: u8 = 0;
pub const PAPER: u8 = 255;
pub const BORDER_SHADE: u8 = 200;

const DATA_URI_PREFIX: &str = "data:application/x-onboard-gray8+deflate;base64,";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Where the canvas is drawn on screen and at what size.
///
/// The rendered size rarely equals the logical resolution (CSS scaling, device pixel
/// ratio), so every pointer position is rescaled into canvas space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayTransform {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl DisplayTransform {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Result<Self, OnboardError> {
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            return Err(OnboardError::Validation(format!(
                "display size must be positive, got {width}x{height}"
            )));
        }
        Ok(Self {
            left,
            top,
            width,
            height,
        })
    }

    /// Canvas drawn unscaled at the origin.
    pub fn unscaled() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            width: CANVAS_WIDTH as f32,
            height: CANVAS_HEIGHT as f32,
        }
    }

    pub fn to_canvas(&self, screen: Point) -> Point {
        let x = (screen.x - self.left) * CANVAS_WIDTH as f32 / self.width;
        let y = (screen.y - self.top) * CANVAS_HEIGHT as f32 / self.height;
        Point {
            x: x.clamp(0.0, (CANVAS_WIDTH - 1) as f32),
            y: y.clamp(0.0, (CANVAS_HEIGHT - 1) as f32),
        }
    }
}

impl Default for DisplayTransform {
    fn default() -> Self {
        Self::unscaled()
    }
}

/// Encoded snapshot of the canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRaster {
    pub width: u32,
    pub height: u32,
    /// Row-major 8-bit gray pixels.
    pub pixels: Vec<u8>,
}

impl SignatureRaster {
    pub fn is_empty(&self) -> bool {
        !self.pixels.contains(&INK)
    }

    /// zlib-compressed pixels, directly usable as a PDF `FlateDecode` stream.
    pub fn deflate(&self) -> Result<Vec<u8>, OnboardError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.pixels)
            .and_then(|_| encoder.finish())
            .map_err(|e| OnboardError::Serialization(format!("raster compression failed: {e}")))
    }

    /// `data:` URI with a 4-byte big-endian size header followed by the deflated pixels.
    pub fn encode(&self) -> Result<String, OnboardError> {
        let width = u16::try_from(self.width)
            .map_err(|_| OnboardError::Serialization("raster too wide".to_string()))?;
        let height = u16::try_from(self.height)
            .map_err(|_| OnboardError::Serialization("raster too tall".to_string()))?;

        let mut payload = Vec::with_capacity(4 + self.pixels.len() / 8);
        payload.extend_from_slice(&width.to_be_bytes());
        payload.extend_from_slice(&height.to_be_bytes());
        payload.extend_from_slice(&self.deflate()?);
        Ok(format!("{DATA_URI_PREFIX}{}", BASE64.encode(payload)))
    }

    pub fn decode(encoded: &str) -> Result<Self, OnboardError> {
        let body = encoded.strip_prefix(DATA_URI_PREFIX).ok_or_else(|| {
            OnboardError::Serialization("unsupported signature image encoding".to_string())
        })?;
        let payload = BASE64
            .decode(body)
            .map_err(|e| OnboardError::Serialization(format!("signature base64: {e}")))?;
        if payload.len() < 4 {
            return Err(OnboardError::Serialization(
                "signature image header truncated".to_string(),
            ));
        }

        let width = u16::from_be_bytes([payload[0], payload[1]]) as u32;
        let height = u16::from_be_bytes([payload[2], payload[3]]) as u32;
        let mut pixels = Vec::new();
        ZlibDecoder::new(&payload[4..])
            .read_to_end(&mut pixels)
            .map_err(|e| OnboardError::Serialization(format!("signature inflate: {e}")))?;

        if pixels.len() != (width * height) as usize {
            return Err(OnboardError::Serialization(format!(
                "signature image has {} pixels, expected {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Pointer-driven drawing surface.
#[derive(Debug, Clone)]
pub struct SignaturePad {
    pixels: Vec<u8>,
    transform: DisplayTransform,
    last: Option<Point>,
    snapshot: Option<SignatureRaster>,
}

impl Default for SignaturePad {
    fn default() -> Self {
        Self::new(DisplayTransform::unscaled())
    }
}

impl SignaturePad {
    pub fn new(transform: DisplayTransform) -> Self {
        let mut pad = Self {
            pixels: vec![PAPER; (CANVAS_WIDTH * CANVAS_HEIGHT) as usize],
            transform,
            last: None,
            snapshot: None,
        };
        pad.draw_border();
        pad
    }

    /// Update after the canvas was resized or moved on screen.
    pub fn set_transform(&mut self, transform: DisplayTransform) {
        self.transform = transform;
    }

    pub fn pointer_down(&mut self, screen: Point) {
        let point = self.transform.to_canvas(screen);
        self.stamp(point);
        self.last = Some(point);
    }

    pub fn pointer_move(&mut self, screen: Point) {
        let Some(from) = self.last else {
            return;
        };
        let to = self.transform.to_canvas(screen);
        self.line(from, to);
        self.last = Some(to);
    }

    /// Ends the stroke and returns the fresh snapshot.
    pub fn pointer_up(&mut self) -> Option<&SignatureRaster> {
        self.last.take()?;
        self.snapshot = Some(self.raster());
        self.snapshot.as_ref()
    }

    /// Replay a whole stroke given in screen coordinates.
    pub fn stroke(&mut self, points: &[Point]) -> Option<&SignatureRaster> {
        let (first, rest) = points.split_first()?;
        self.pointer_down(*first);
        for point in rest {
            self.pointer_move(*point);
        }
        self.pointer_up()
    }

    /// Wipe all ink; the border stays.
    pub fn clear(&mut self) {
        self.pixels.fill(PAPER);
        self.draw_border();
        self.last = None;
        self.snapshot = None;
    }

    pub fn is_empty(&self) -> bool {
        !self.pixels.contains(&INK)
    }

    /// Snapshot taken at the last pointer release.
    pub fn snapshot(&self) -> Option<&SignatureRaster> {
        self.snapshot.as_ref()
    }

    pub fn raster(&self) -> SignatureRaster {
        SignatureRaster {
            width: CANVAS_WIDTH,
            height: CANVAS_HEIGHT,
            pixels: self.pixels.clone(),
        }
    }

    fn draw_border(&mut self) {
        for y in 0..CANVAS_HEIGHT {
            for x in 0..CANVAS_WIDTH {
                let on_border = x < BORDER_WIDTH
                    || y < BORDER_WIDTH
                    || x >= CANVAS_WIDTH - BORDER_WIDTH
                    || y >= CANVAS_HEIGHT - BORDER_WIDTH;
                if on_border {
                    self.pixels[(y * CANVAS_WIDTH + x) as usize] = BORDER_SHADE;
                }
            }
        }
    }

    fn line(&mut self, from: Point, to: Point) {
        let dx = to.x - from.x;
        let dy = to.y - from.y;
        let steps = (dx.abs().max(dy.abs()) * 2.0).ceil().max(1.0) as u32;
        for step in 0..=steps {
            let t = step as f32 / steps as f32;
            self.stamp(Point::new(from.x + dx * t, from.y + dy * t));
        }
    }

    fn stamp(&mut self, center: Point) {
        let reach = BRUSH_RADIUS.ceil() as i64;
        let cx = center.x.round() as i64;
        let cy = center.y.round() as i64;
        let min = BORDER_WIDTH as i64;
        let max_x = (CANVAS_WIDTH - BORDER_WIDTH) as i64;
        let max_y = (CANVAS_HEIGHT - BORDER_WIDTH) as i64;

        for y in (cy - reach)..=(cy + reach) {
            for x in (cx - reach)..=(cx + reach) {
                if x < min || y < min || x >= max_x || y >= max_y {
                    continue;
                }
                let (fx, fy) = ((x - cx) as f32, (y - cy) as f32);
                if fx * fx + fy * fy <= BRUSH_RADIUS * BRUSH_RADIUS {
                    self.pixels[(y as u32 * CANVAS_WIDTH + x as u32) as usize] = INK;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(raster: &SignatureRaster, x: u32, y: u32) -> u8 {
        raster.pixels[(y * raster.width + x) as usize]
    }

    #[test]
    fn new_pad_is_empty_but_has_border() {
        let pad = SignaturePad::default();
        assert!(pad.is_empty());
        let raster = pad.raster();
        assert_eq!(pixel(&raster, 0, 0), BORDER_SHADE);
        assert_eq!(pixel(&raster, 300, 100), PAPER);
    }

    #[test]
    fn stroke_produces_snapshot_on_release() {
        let mut pad = SignaturePad::default();
        pad.pointer_down(Point::new(50.0, 100.0));
        pad.pointer_move(Point::new(150.0, 120.0));
        assert!(pad.snapshot().is_none());

        let snapshot = pad.pointer_up().cloned().unwrap();
        assert!(!snapshot.is_empty());
        assert_eq!(pixel(&snapshot, 100, 110), INK);
        assert!(pad.pointer_up().is_none());
    }

    #[test]
    fn display_scaling_is_corrected() {
        // Canvas shown at half size, offset by (10, 20) on screen.
        let transform = DisplayTransform::new(10.0, 20.0, 300.0, 100.0).unwrap();
        let canvas = transform.to_canvas(Point::new(160.0, 70.0));
        assert_eq!(canvas, Point::new(300.0, 100.0));

        let clamped = transform.to_canvas(Point::new(-40.0, 500.0));
        assert_eq!(clamped, Point::new(0.0, (CANVAS_HEIGHT - 1) as f32));
        assert!(DisplayTransform::new(0.0, 0.0, 0.0, 10.0).is_err());
    }

    #[test]
    fn clear_wipes_ink_and_keeps_border() {
        let mut pad = SignaturePad::default();
        pad.stroke(&[Point::new(20.0, 20.0), Point::new(580.0, 180.0)]);
        assert!(!pad.is_empty());

        pad.clear();
        assert!(pad.is_empty());
        assert!(pad.snapshot().is_none());
        assert_eq!(pixel(&pad.raster(), 599, 199), BORDER_SHADE);
    }

    #[test]
    fn ink_never_covers_the_border() {
        let mut pad = SignaturePad::default();
        pad.stroke(&[Point::new(0.0, 0.0), Point::new(599.0, 0.0)]);
        assert!(pad.is_empty());

        pad.stroke(&[Point::new(0.0, 2.0), Point::new(599.0, 2.0)]);
        let raster = pad.raster();
        assert_eq!(pixel(&raster, 0, 0), BORDER_SHADE);
        assert_eq!(pixel(&raster, 300, 1), BORDER_SHADE);
        assert_eq!(pixel(&raster, 300, 2), INK);
    }

    #[test]
    fn encoded_snapshot_decodes_to_same_pixels() {
        let mut pad = SignaturePad::default();
        let raster = pad
            .stroke(&[Point::new(40.0, 40.0), Point::new(200.0, 160.0)])
            .cloned()
            .unwrap();

        let encoded = raster.encode().unwrap();
        assert!(encoded.starts_with("data:application/x-onboard-gray8+deflate;base64,"));
        assert_eq!(SignatureRaster::decode(&encoded).unwrap(), raster);
        assert!(SignatureRaster::decode("data:image/png;base64,AAAA").is_err());
    }
}
