//! Face alignment via 4-DOF similarity transform.
//!
//! Fits the five predicted landmarks to a canonical layout scaled by the chip
//! size and padding, then resamples the source grid into an S×S chip using
//! the inverse transform and bilinear interpolation.

use crate::landmarks::{LandmarkError, LandmarkPredictor};
use crate::types::{AlignedChip, ChipParams, FaceRect, Landmarks, Point, RgbImageGrid, LANDMARK_COUNT};
use thiserror::Error;

/// Canonical 5-point layout in unit-chip coordinates, matching the point
/// order of the dlib 5-point shape predictor.
const REFERENCE_LAYOUT_5: [(f64, f64); LANDMARK_COUNT] = [
    (0.8595674595992, 0.2134981538014), // image-right eye, outer corner
    (0.6460604764104, 0.2289674387677), // image-right eye, inner corner
    (0.1205750620789, 0.2137274526848), // image-left eye, outer corner
    (0.3340850613712, 0.2290642403242), // image-left eye, inner corner
    (0.4901123135679, 0.6277975316475), // base of the nose
];

const MIN_CHIP_SIZE: u32 = 2;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("face rectangle {rect:?} out of bounds for {width}x{height} image")]
    RectOutOfBounds {
        rect: FaceRect,
        width: usize,
        height: usize,
    },
    #[error("invalid chip size {0}: must be at least {min}", min = MIN_CHIP_SIZE)]
    InvalidChipSize(u32),
    #[error("invalid padding {0}: must be finite and non-negative")]
    InvalidPadding(f32),
    #[error("predictor returned {0} landmarks, expected {expected}", expected = LANDMARK_COUNT)]
    LandmarkCount(usize),
    #[error("predictor returned a non-finite landmark at index {0}")]
    NonFiniteLandmark(usize),
    #[error("landmarks are degenerate: no similarity transform fits them")]
    DegenerateTransform,
    #[error("predictor failed: {0}")]
    Predictor(#[from] LandmarkError),
}

/// A 2D similarity transform:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    a: f64,
    b: f64,
    tx: f64,
    ty: f64,
}

impl SimilarityTransform {
    pub fn apply(&self, (x, y): (f64, f64)) -> (f64, f64) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Uniform scale factor.
    pub fn scale(&self) -> f64 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    /// Rotation angle in radians.
    pub fn rotation(&self) -> f64 {
        self.b.atan2(self.a)
    }

    /// Row-major 2×3 matrix `[a, -b, tx, b, a, ty]`.
    pub fn matrix(&self) -> [f64; 6] {
        [self.a, -self.b, self.tx, self.b, self.a, self.ty]
    }

    /// Inverse transform, or `None` if the scale is zero.
    pub fn inverse(&self) -> Option<Self> {
        // M = [[a, -b], [b, a]], det = a^2 + b^2
        let det = self.a * self.a + self.b * self.b;
        if !det.is_finite() || det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Estimate the least-squares similarity transform mapping `src` onto `dst`.
///
/// Returns `None` if the points are degenerate (e.g., all coincident).
pub fn estimate_similarity_transform(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
) -> Option<SimilarityTransform> {
    if src.len() != dst.len() || src.len() < 2 {
        return None;
    }

    // Overdetermined system A * [a, b, tx, ty]^T = B, one row pair per point:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f64; 16]; // 4x4, row-major
    let mut atb = [0.0f64; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(&ata, &atb)?;
    let transform = SimilarityTransform { a, b, tx, ty };
    transform.inverse().map(|_| transform)
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f64; 16], atb: &[f64; 4]) -> Option<[f64; 4]> {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }
    let tol = 1e-12 * ata.iter().fold(1.0f64, |acc, v| acc.max(v.abs()));

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < tol {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Clamp each bound of `rect` into the image, rejecting collapsed results.
pub fn clamp_rect(rect: &FaceRect, width: usize, height: usize) -> Result<FaceRect, AlignError> {
    let out_of_bounds = || AlignError::RectOutOfBounds {
        rect: *rect,
        width,
        height,
    };
    if width == 0 || height == 0 {
        return Err(out_of_bounds());
    }

    let max_x = (width - 1).min(i32::MAX as usize) as i32;
    let max_y = (height - 1).min(i32::MAX as usize) as i32;
    let clamped = FaceRect {
        left: rect.left.clamp(0, max_x),
        top: rect.top.clamp(0, max_y),
        right: rect.right.clamp(0, max_x),
        bottom: rect.bottom.clamp(0, max_y),
    };

    if clamped.right <= clamped.left || clamped.bottom <= clamped.top {
        return Err(out_of_bounds());
    }
    Ok(clamped)
}

/// Check that the predictor produced exactly five finite points.
pub fn check_landmarks(points: &[Point]) -> Result<Landmarks, AlignError> {
    let landmarks: Landmarks = points
        .try_into()
        .map_err(|_| AlignError::LandmarkCount(points.len()))?;
    if let Some(index) = landmarks.iter().position(|p| !p.is_finite()) {
        return Err(AlignError::NonFiniteLandmark(index));
    }
    Ok(landmarks)
}

fn validate_params(params: &ChipParams) -> Result<(), AlignError> {
    if params.size < MIN_CHIP_SIZE {
        return Err(AlignError::InvalidChipSize(params.size));
    }
    if !params.padding.is_finite() || params.padding < 0.0 {
        return Err(AlignError::InvalidPadding(params.padding));
    }
    Ok(())
}

/// Resample `grid` into a `size`×`size` chip.
///
/// `chip_to_source` maps chip pixel coordinates to source coordinates.
/// Samples outside the source are clamped to the nearest edge pixel.
fn warp_bilinear(grid: &RgbImageGrid, chip_to_source: &SimilarityTransform, size: usize) -> RgbImageGrid {
    let max_x = (grid.width() - 1) as f64;
    let max_y = (grid.height() - 1) as f64;
    let mut output = Vec::with_capacity(size * size * 3);

    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = chip_to_source.apply((ox as f64, oy as f64));
            let sx = sx.clamp(0.0, max_x);
            let sy = sy.clamp(0.0, max_y);

            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            let x1 = (x0 + 1).min(grid.width() - 1);
            let y1 = (y0 + 1).min(grid.height() - 1);
            let fx = sx - x0 as f64;
            let fy = sy - y0 as f64;

            let tl = grid.pixel(x0, y0);
            let tr = grid.pixel(x1, y0);
            let bl = grid.pixel(x0, y1);
            let br = grid.pixel(x1, y1);

            for c in 0..3 {
                let val = tl[c] as f64 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f64 * fx * (1.0 - fy)
                    + bl[c] as f64 * (1.0 - fx) * fy
                    + br[c] as f64 * fx * fy;
                output.push(val.round().clamp(0.0, 255.0) as u8);
            }
        }
    }

    RgbImageGrid::from_raw_unchecked(size, size, output)
}

/// Aligns faces to a canonical 5-point layout.
#[derive(Debug, Clone)]
pub struct Aligner {
    reference: [(f64, f64); LANDMARK_COUNT],
}

impl Default for Aligner {
    fn default() -> Self {
        Self {
            reference: REFERENCE_LAYOUT_5,
        }
    }
}

impl Aligner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different canonical layout, in unit-chip coordinates.
    ///
    /// The recognition model is trained on chips cut with one specific layout;
    /// a mismatched layout silently degrades matching.
    pub fn with_reference_layout(layout: [Point; LANDMARK_COUNT]) -> Self {
        Self {
            reference: layout.map(|p| (p.x as f64, p.y as f64)),
        }
    }

    /// Canonical landmark positions in chip pixels for `params`.
    ///
    /// Padding shrinks the layout toward the chip center, widening the field
    /// of view while the landmarks keep their relative geometry.
    pub fn canonical_landmarks(&self, params: &ChipParams) -> [(f64, f64); LANDMARK_COUNT] {
        let size = params.size as f64;
        let padding = params.padding as f64;
        let denom = 1.0 + 2.0 * padding;
        self.reference
            .map(|(x, y)| (size * (padding + x) / denom, size * (padding + y) / denom))
    }

    /// Transform from source landmarks to canonical chip positions.
    pub fn transform(
        &self,
        landmarks: &Landmarks,
        params: &ChipParams,
    ) -> Result<SimilarityTransform, AlignError> {
        validate_params(params)?;
        let src = landmarks.map(|p| (p.x as f64, p.y as f64));
        let dst = self.canonical_landmarks(params);
        estimate_similarity_transform(&src, &dst).ok_or(AlignError::DegenerateTransform)
    }

    /// Cut the aligned chip for already-predicted landmarks.
    pub fn extract_chip(
        &self,
        grid: &RgbImageGrid,
        landmarks: &Landmarks,
        params: &ChipParams,
    ) -> Result<AlignedChip, AlignError> {
        let transform = self.transform(landmarks, params)?;
        let chip_to_source = transform.inverse().ok_or(AlignError::DegenerateTransform)?;

        tracing::debug!(
            scale = transform.scale(),
            rotation = transform.rotation(),
            size = params.size,
            padding = params.padding,
            "computed chip transform"
        );

        let chip = warp_bilinear(grid, &chip_to_source, params.size as usize);
        Ok(AlignedChip::from_grid(&chip))
    }

    /// Validate the rectangle, predict landmarks, and cut the aligned chip.
    pub fn align<P: LandmarkPredictor + ?Sized>(
        &self,
        grid: &RgbImageGrid,
        rect: &FaceRect,
        params: &ChipParams,
        predictor: &P,
    ) -> Result<AlignedChip, AlignError> {
        validate_params(params)?;
        let clamped = clamp_rect(rect, grid.width(), grid.height())?;

        let points = predictor.predict(grid, &clamped)?;
        let landmarks = check_landmarks(&points)?;

        self.extract_chip(grid, &landmarks, params)
    }
}
