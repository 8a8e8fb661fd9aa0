//! Five-point landmark prediction.
//!
//! The aligner only depends on [`LandmarkPredictor`]; [`OnnxLandmarkPredictor`]
//! is the shipped implementation, running a landmark regression model via
//! ONNX Runtime on the face rectangle.

use crate::types::{FaceRect, Point, RgbImageGrid};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Used when the model declares a dynamic input size.
const LANDMARK_DEFAULT_INPUT_SIZE: usize = 112;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("landmark model file not found: {0}")]
    ModelNotFound(String),
    #[error("landmark model rejected: {0}")]
    InvalidModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Predicts facial landmarks inside a face rectangle.
///
/// Implementations are shared by every call on a pipeline and may be invoked
/// from several threads at once, so they must tolerate concurrent `&self`
/// calls.
pub trait LandmarkPredictor: Send + Sync {
    /// Predict landmarks for the face in `rect`, which is already clamped to
    /// the grid. Points are in source pixel coordinates, in model order.
    fn predict(&self, grid: &RgbImageGrid, rect: &FaceRect) -> Result<Vec<Point>, LandmarkError>;
}

/// Landmark regression model via ONNX Runtime.
///
/// Expects a `[1, 3, H, W]` RGB input in [0, 1] and a flat output of `(x, y)`
/// pairs normalized to the input crop.
pub struct OnnxLandmarkPredictor {
    session: Mutex<Session>,
    input_size: usize,
}

impl OnnxLandmarkPredictor {
    /// Load the landmark ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, LandmarkError> {
        if !Path::new(model_path).exists() {
            return Err(LandmarkError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        if session.outputs().is_empty() {
            return Err(LandmarkError::InvalidModel(format!("{model_path} declares no outputs")));
        }

        // NCHW: take H from the declared input shape when it is static.
        let input_size = session
            .inputs()
            .first()
            .and_then(|i| i.dtype().tensor_shape())
            .and_then(|shape| shape.get(2).copied())
            .filter(|&h| h > 0)
            .map(|h| h as usize)
            .unwrap_or(LANDMARK_DEFAULT_INPUT_SIZE);

        tracing::info!(
            path = model_path,
            input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }

    /// Crop `rect` from the grid and resize it into a NCHW [0, 1] tensor.
    ///
    /// Bilinear resize with edge clamping, sampling at pixel centers.
    fn preprocess(grid: &RgbImageGrid, rect: &FaceRect, input_size: usize) -> Array4<f32> {
        let crop_w = rect.width() as f32;
        let crop_h = rect.height() as f32;
        let scale_x = crop_w / input_size as f32;
        let scale_y = crop_h / input_size as f32;
        let max_x = (grid.width() - 1) as f32;
        let max_y = (grid.height() - 1) as f32;

        let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));

        for y in 0..input_size {
            let src_y = (rect.top as f32 + (y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
            let y0 = src_y.floor() as usize;
            let y1 = (y0 + 1).min(grid.height() - 1);
            let fy = src_y - y0 as f32;

            for x in 0..input_size {
                let src_x = (rect.left as f32 + (x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
                let x0 = src_x.floor() as usize;
                let x1 = (x0 + 1).min(grid.width() - 1);
                let fx = src_x - x0 as f32;

                let tl = grid.pixel(x0, y0);
                let tr = grid.pixel(x1, y0);
                let bl = grid.pixel(x0, y1);
                let br = grid.pixel(x1, y1);

                for c in 0..3 {
                    let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                        + tr[c] as f32 * fx * (1.0 - fy)
                        + bl[c] as f32 * (1.0 - fx) * fy
                        + br[c] as f32 * fx * fy;
                    tensor[[0, c, y, x]] = val / 255.0;
                }
            }
        }

        tensor
    }

    /// Map crop-normalized `(x, y)` pairs back to source pixel coordinates.
    fn decode(raw: &[f32], rect: &FaceRect) -> Result<Vec<Point>, LandmarkError> {
        if raw.is_empty() || raw.len() % 2 != 0 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected (x, y) pairs, got {} values",
                raw.len()
            )));
        }

        let crop_w = rect.width() as f32;
        let crop_h = rect.height() as f32;

        Ok(raw
            .chunks_exact(2)
            .map(|xy| Point::new(rect.left as f32 + xy[0] * crop_w, rect.top as f32 + xy[1] * crop_h))
            .collect())
    }
}

impl LandmarkPredictor for OnnxLandmarkPredictor {
    fn predict(&self, grid: &RgbImageGrid, rect: &FaceRect) -> Result<Vec<Point>, LandmarkError> {
        let input = Self::preprocess(grid, rect, self.input_size);

        let mut session = self
            .session
            .lock()
            .map_err(|_| LandmarkError::InferenceFailed("landmark session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        let points = Self::decode(raw, rect)?;
        tracing::trace!(count = points.len(), ?rect, "predicted landmarks");
        Ok(points)
    }
}
