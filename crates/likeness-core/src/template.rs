//! Template post-processing: centering and L2 normalization.
//!
//! A raw embedding becomes comparable across images once the population
//! centroid (the reference vector) is subtracted and the result is scaled to
//! unit length.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Embedding-space centroid of the 128-dimensional dlib ResNet recognition model.
const DLIB_RESNET_V1_MEAN: [f32; 128] = [
    -0.1090, 0.0742, 0.0517, -0.0375, -0.0994, -0.0329, -0.0151, -0.1079,
    0.1378, -0.0923, 0.2127, -0.0365, -0.2286, -0.0445, -0.0124, 0.1445,
    -0.1405, -0.1195, -0.1007, -0.0680, 0.0226, 0.0363, 0.0200, 0.0452,
    -0.1115, -0.3154, -0.0861, -0.0857, 0.0347, -0.0633, -0.0212, 0.0540,
    -0.1759, -0.0452, 0.0316, 0.0744, -0.0404, -0.0740, 0.1908, 0.0074,
    -0.1750, 0.0011, 0.0608, 0.2374, 0.1846, 0.0242, 0.0188, -0.0836,
    0.1072, -0.2355, 0.0457, 0.1380, 0.0863, 0.0695, 0.0580, -0.1418,
    0.0218, 0.1214, -0.1886, 0.0353, 0.0607, -0.0795, -0.0504, -0.0594,
    0.2046, 0.1072, -0.1132, -0.1250, 0.1547, -0.1550, -0.0512, 0.0616,
    -0.1190, -0.1681, -0.2682, 0.0425, 0.3917, 0.1305, -0.1568, 0.0228,
    -0.0711, -0.0270, 0.0505, 0.0680, -0.0632, -0.0314, -0.0845, 0.0344,
    0.1964, -0.0246, -0.0093, 0.2210, 0.0085, 0.0091, 0.0245, 0.0508,
    -0.0919, -0.0210, -0.1102, -0.0185, 0.0413, -0.0808, 0.0042, 0.0965,
    -0.1852, 0.1417, -0.0140, -0.0215, 0.0028, -0.0162, -0.0834, -0.0259,
    0.1400, -0.2383, 0.1883, 0.1652, 0.0180, 0.1376, 0.0564, 0.0727,
    -0.0131, -0.0284, -0.1567, -0.0831, 0.0615, -0.0196, 0.0417, 0.0311,
];

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("raw embedding length {raw} does not match reference vector length {reference}")]
    LengthMismatch { raw: usize, reference: usize },
    #[error("raw embedding has a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("reference vector is empty")]
    EmptyReference,
    #[error("reference vector has a non-finite value at index {0}")]
    NonFiniteReference(usize),
    #[error("failed to read reference vector {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse reference vector {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Accepts either a bare JSON array or `{ "values": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ReferenceFile {
    Bare(Vec<f32>),
    Wrapped { values: Vec<f32> },
}

/// Process-wide embedding centroid, fixed for a pipeline's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceVector {
    values: Vec<f32>,
}

impl ReferenceVector {
    pub fn new(values: Vec<f32>) -> Result<Self, TemplateError> {
        if values.is_empty() {
            return Err(TemplateError::EmptyReference);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(TemplateError::NonFiniteReference(index));
        }
        Ok(Self { values })
    }

    /// An all-zero reference of length `len` (normalization without centering).
    pub fn zeros(len: usize) -> Result<Self, TemplateError> {
        Self::new(vec![0.0; len])
    }

    /// The embedded centroid for `dlib_face_recognition_resnet_v1`.
    pub fn dlib_resnet_v1() -> Self {
        Self {
            values: DLIB_RESNET_V1_MEAN.to_vec(),
        }
    }

    /// Load a reference vector from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path_str.clone(),
            source,
        })?;
        let values = match serde_json::from_str::<ReferenceFile>(&text) {
            Ok(ReferenceFile::Bare(values) | ReferenceFile::Wrapped { values }) => values,
            Err(source) => return Err(TemplateError::Parse { path: path_str, source }),
        };
        tracing::debug!(path = %path_str, len = values.len(), "loaded reference vector");
        Self::new(values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// Center `raw` on `reference` and scale it to unit length.
///
/// A centered vector with zero norm yields the all-zero vector; that is a
/// valid (if unusual) input, not an error. Lengths must match exactly.
pub fn normalize(raw: &[f32], reference: &ReferenceVector) -> Result<Vec<f32>, TemplateError> {
    if raw.len() != reference.len() {
        return Err(TemplateError::LengthMismatch {
            raw: raw.len(),
            reference: reference.len(),
        });
    }
    if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
        return Err(TemplateError::NonFinite(index));
    }

    // f64 keeps the difference and its square in range for any finite f32 pair.
    let centered: Vec<f64> = raw
        .iter()
        .zip(reference.as_slice())
        .map(|(&r, &m)| r as f64 - m as f64)
        .collect();

    let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();

    if norm > 0.0 {
        Ok(centered.into_iter().map(|v| (v / norm) as f32).collect())
    } else {
        Ok(vec![0.0; centered.len()])
    }
}
