use serde::{Deserialize, Serialize};

/// Number of landmarks the aligner fits against.
pub const LANDMARK_COUNT: usize = 5;

/// A point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Five-point facial landmarks, in the order the predictor defines them.
/// Each index is tied to one facial feature; the order must never change.
pub type Landmarks = [Point; LANDMARK_COUNT];

/// Face rectangle with inclusive bounds, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl FaceRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Number of pixel columns covered (inclusive bounds).
    pub fn width(&self) -> i64 {
        self.right as i64 - self.left as i64 + 1
    }

    /// Number of pixel rows covered (inclusive bounds).
    pub fn height(&self) -> i64 {
        self.bottom as i64 - self.top as i64 + 1
    }
}

/// Chip geometry requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChipParams {
    /// Output edge length; the chip is `size`×`size`.
    pub size: u32,
    /// Context around the landmarks. 0.0 fits the canonical layout to the
    /// full chip; larger values widen the sampled field of view.
    pub padding: f32,
}

impl ChipParams {
    pub const fn new(size: u32, padding: f32) -> Self {
        Self { size, padding }
    }
}

impl Default for ChipParams {
    fn default() -> Self {
        // Input geometry of the dlib ResNet recognition model.
        Self { size: 150, padding: 0.25 }
    }
}

/// Row-major grid of 8-bit RGB samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImageGrid {
    width: usize,
    height: usize,
    /// Interleaved RGB, `width * height * 3` bytes.
    data: Vec<u8>,
}

impl RgbImageGrid {
    /// Wrap interleaved RGB bytes. Returns `None` if the length does not match.
    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        if data.len() != width * height * 3 {
            return None;
        }
        Some(Self { width, height, data })
    }

    pub(crate) fn from_raw_unchecked(width: usize, height: usize, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width * height * 3);
        Self { width, height, data }
    }

    /// A grid with every sample set to `rgb`.
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let data = rgb.iter().copied().cycle().take(width * height * 3).collect();
        Self { width, height, data }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// RGB sample at `(x, y)`. Panics if out of range.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let idx = (y * self.width + x) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }
}

/// An aligned S×S chip as the `1×S×S×3` float tensor fed to the embedding model.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedChip {
    size: usize,
    /// Channel-last RGB in [0, 1], row-major.
    data: Vec<f32>,
}

impl AlignedChip {
    /// Rescale an 8-bit chip grid into a [0, 1] tensor. The grid must be square.
    pub fn from_grid(grid: &RgbImageGrid) -> Self {
        debug_assert_eq!(grid.width(), grid.height(), "chip grid must be square");
        let data = grid.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self {
            size: grid.width(),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tensor shape `[1, S, S, 3]`.
    pub fn shape(&self) -> [usize; 4] {
        [1, self.size, self.size, 3]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Convert back to an 8-bit RGB image (for inspection and debugging).
    pub fn to_rgb_image(&self) -> image::RgbImage {
        let to_byte = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
        image::RgbImage::from_fn(self.size as u32, self.size as u32, |x, y| {
            let idx = (y as usize * self.size + x as usize) * 3;
            image::Rgb([
                to_byte(self.data[idx]),
                to_byte(self.data[idx + 1]),
                to_byte(self.data[idx + 2]),
            ])
        })
    }
}

/// Face template: a centered, unit-length embedding (or exactly zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub values: Vec<f32>,
    /// Recognition model that produced the raw embedding (e.g., "dlib_face_recognition_resnet_v1").
    pub model_version: Option<String>,
}

impl Template {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// L2 norm of the template values.
    pub fn norm(&self) -> f32 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt() as f32
    }

    /// True when every component is exactly zero (the zero-norm degenerate case).
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }
}
