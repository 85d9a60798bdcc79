//! Camera frame types.
//!
//! The camera collaborator hands back a [`RawImage`]; the acquire loop stamps it
//! with a sequence number and capture time, producing an immutable [`Frame`]
//! that is shared as `Arc<Frame>` across the fan-out edges.

use std::time::Duration;

/// Pixels exactly as retrieved from the device, before sequencing.
///
/// Always holds exactly `width * height` samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pixels: Vec<u16>,
}

impl RawImage {
    /// Create a raw image, checking that the pixel count matches the geometry.
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> anyhow::Result<Self> {
        let expected = (width as usize) * (height as usize);
        if pixels.len() != expected {
            anyhow::bail!(
                "Pixel count mismatch: expected {} for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            );
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Uniform image with every sample set to `value`.
    pub fn filled(width: u32, height: u32, value: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; (width as usize) * (height as usize)],
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major samples.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }
}

/// An immutable, sequenced camera frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    sequence: u64,
    captured_at: Duration,
    pixels: Vec<u16>,
}

impl Frame {
    /// Sequence a raw image.
    pub fn from_raw(raw: RawImage, sequence: u64, captured_at: Duration) -> Self {
        Self {
            width: raw.width,
            height: raw.height,
            sequence,
            captured_at,
            pixels: raw.pixels,
        }
    }

    /// Build a frame directly from samples.
    ///
    /// Used by the stack reader and by tests; the caller guarantees
    /// `pixels.len() == width * height`.
    pub fn from_pixels(width: u32, height: u32, sequence: u64, pixels: Vec<u16>) -> Self {
        debug_assert_eq!(pixels.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            sequence,
            captured_at: Duration::ZERO,
            pixels,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Monotonic capture sequence number assigned by the camera source.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Clock time at which the frame was retrieved.
    pub fn captured_at(&self) -> Duration {
        self.captured_at
    }

    /// Row-major samples.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Sample at (x, y), if inside the frame.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get((y as usize) * (self.width as usize) + (x as usize))
            .copied()
    }

    /// Whether two frames share geometry (required within one stack).
    pub fn same_shape(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }
}
