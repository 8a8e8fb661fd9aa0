//! likeness-core: face alignment and template extraction.
//!
//! Converts a host RGBA bitmap plus a face rectangle into a canonical,
//! fixed-size aligned chip and then into a centered, unit-length face
//! template. Landmark prediction and embedding inference run via ONNX
//! Runtime behind the [`LandmarkPredictor`] and [`EmbeddingModel`] traits.

pub mod alignment;
pub mod landmarks;
pub mod pipeline;
pub mod pixels;
pub mod recognizer;
pub mod template;
pub mod types;

pub use alignment::{Aligner, SimilarityTransform};
pub use landmarks::{LandmarkPredictor, OnnxLandmarkPredictor};
pub use pipeline::{FacePipeline, PipelineError};
pub use pixels::{BitmapInfo, PixelBuffer, PixelFormat, RgbaBuffer};
pub use recognizer::{EmbeddingModel, OnnxEmbeddingModel};
pub use template::ReferenceVector;
pub use types::{AlignedChip, ChipParams, FaceRect, Landmarks, Point, RgbImageGrid, Template};
