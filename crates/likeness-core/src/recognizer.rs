//! Face recognition model via ONNX Runtime.
//!
//! Maps an aligned `1×S×S×3` chip to a raw embedding vector. The raw vector
//! is not a template yet; see [`crate::template`] for centering and
//! normalization.

use crate::types::AlignedChip;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("recognition model rejected: {0}")]
    InvalidModel(String),
    #[error("chip is {actual}x{actual} but the model expects {expected}x{expected}")]
    InputSize { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an aligned chip to a raw embedding.
///
/// Implementations are shared by every call on a pipeline and may be invoked
/// from several threads at once, so they must tolerate concurrent `&self`
/// calls.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, chip: &AlignedChip) -> Result<Vec<f32>, RecognizerError>;

    /// Embedding length, when the model declares it up front.
    fn output_len(&self) -> Option<usize> {
        None
    }

    /// Identifier stamped on templates produced from this model.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// Recognition model taking NHWC `[1, S, S, 3]` RGB in [0, 1].
pub struct OnnxEmbeddingModel {
    session: Mutex<Session>,
    /// Chip size declared by the model input, if static.
    input_size: Option<usize>,
    /// Embedding length declared by the model output, if static.
    output_len: Option<usize>,
    model_version: String,
}

impl OnnxEmbeddingModel {
    /// Load the recognition ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let input_shape: Option<Vec<i64>> = session
            .inputs()
            .first()
            .and_then(|i| i.dtype().tensor_shape())
            .map(|shape| shape.to_vec());
        let output_shape: Option<Vec<i64>> = session
            .outputs()
            .first()
            .and_then(|o| o.dtype().tensor_shape())
            .map(|shape| shape.to_vec());

        if output_shape.is_none() {
            return Err(RecognizerError::InvalidModel(format!(
                "{model_path} has no tensor output"
            )));
        }

        let input_size = input_shape.as_deref().and_then(nhwc_input_size);
        let output_len = output_shape.as_deref().and_then(static_len);

        let model_version = Path::new(model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.to_string());

        tracing::info!(
            path = model_path,
            ?input_size,
            ?output_len,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            output_len,
            model_version,
        })
    }

    /// Copy the chip into an owned NHWC tensor.
    fn to_tensor(chip: &AlignedChip) -> Result<Array4<f32>, RecognizerError> {
        let [n, h, w, c] = chip.shape();
        Array4::from_shape_vec((n, h, w, c), chip.as_slice().to_vec())
            .map_err(|e| RecognizerError::InferenceFailed(format!("chip tensor: {e}")))
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn embed(&self, chip: &AlignedChip) -> Result<Vec<f32>, RecognizerError> {
        if let Some(expected) = self.input_size {
            if chip.size() != expected {
                return Err(RecognizerError::InputSize {
                    expected,
                    actual: chip.size(),
                });
            }
        }

        let input = Self::to_tensor(chip)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("recognition session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("model produced an empty embedding".into()));
        }
        if let Some(expected) = self.output_len {
            if raw.len() != expected {
                return Err(RecognizerError::InferenceFailed(format!(
                    "expected {expected}-dim embedding, got {}",
                    raw.len()
                )));
            }
        }

        Ok(raw)
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn model_version(&self) -> Option<&str> {
        Some(&self.model_version)
    }
}

/// Square spatial size of a `[N, H, W, 3]` input, if static.
fn nhwc_input_size(shape: &[i64]) -> Option<usize> {
    match shape {
        [_, h, w, 3] if *h > 0 && h == w => Some(*h as usize),
        _ => None,
    }
}

/// Element count of an output shape, treating a dynamic leading batch as 1.
fn static_len(shape: &[i64]) -> Option<usize> {
    let dims = match shape {
        [batch, rest @ ..] if !rest.is_empty() && *batch <= 1 => rest,
        all => all,
    };
    dims.iter()
        .try_fold(1usize, |acc, &d| (d > 0).then(|| acc * d as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RgbImageGrid;

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbeddingModel::load("/nonexistent/recognition.onnx").err().unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }

    #[test]
    fn test_to_tensor_is_nhwc() {
        let grid = RgbImageGrid::from_raw(2, 2, (0..12).map(|v| v * 20).collect()).unwrap();
        let chip = AlignedChip::from_grid(&grid);
        let tensor = OnnxEmbeddingModel::to_tensor(&chip).unwrap();
        assert_eq!(tensor.shape(), &[1, 2, 2, 3]);
        // Pixel (x=1, y=0) is the second RGB triple.
        assert!((tensor[[0, 0, 1, 0]] - 60.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 1, 2]] - 100.0 / 255.0).abs() < 1e-6);
        // Pixel (x=0, y=1) is the third.
        assert!((tensor[[0, 1, 0, 1]] - 140.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_nhwc_input_size() {
        assert_eq!(nhwc_input_size(&[1, 150, 150, 3]), Some(150));
        assert_eq!(nhwc_input_size(&[-1, 150, 150, 3]), Some(150));
        assert_eq!(nhwc_input_size(&[1, -1, -1, 3]), None);
        assert_eq!(nhwc_input_size(&[1, 3, 112, 112]), None);
    }

    #[test]
    fn test_static_len() {
        assert_eq!(static_len(&[1, 128]), Some(128));
        assert_eq!(static_len(&[-1, 128]), Some(128));
        assert_eq!(static_len(&[128]), Some(128));
        assert_eq!(static_len(&[1, -1]), None);
        assert_eq!(static_len(&[2, 64]), Some(128));
    }
}
