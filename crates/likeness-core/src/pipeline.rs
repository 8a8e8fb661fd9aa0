//! End-to-end face template pipeline.
//!
//! Ingests a host bitmap, aligns the face in the given rectangle, runs the
//! recognition model on the chip and post-processes the raw embedding into a
//! template. Every stage error is folded into [`PipelineError`].

use crate::alignment::{AlignError, Aligner};
use crate::landmarks::{LandmarkPredictor, OnnxLandmarkPredictor};
use crate::pixels::{self, PixelBuffer, PixelError};
use crate::recognizer::{EmbeddingModel, OnnxEmbeddingModel, RecognizerError};
use crate::template::{self, ReferenceVector, TemplateError};
use crate::types::{AlignedChip, ChipParams, FaceRect, RgbImageGrid, Template};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Models missing or corrupt, or reference vector incompatible with the model.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Bad bitmap, face rectangle or chip parameters.
    #[error("invalid input: {0}")]
    InputValidation(String),
    #[error("landmark prediction failed: {0}")]
    Prediction(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<PixelError> for PipelineError {
    fn from(e: PixelError) -> Self {
        Self::InputValidation(e.to_string())
    }
}

impl From<AlignError> for PipelineError {
    fn from(e: AlignError) -> Self {
        match e {
            AlignError::RectOutOfBounds { .. }
            | AlignError::InvalidChipSize(_)
            | AlignError::InvalidPadding(_) => Self::InputValidation(e.to_string()),
            AlignError::LandmarkCount(_)
            | AlignError::NonFiniteLandmark(_)
            | AlignError::DegenerateTransform
            | AlignError::Predictor(_) => Self::Prediction(e.to_string()),
        }
    }
}

impl From<RecognizerError> for PipelineError {
    fn from(e: RecognizerError) -> Self {
        Self::Inference(e.to_string())
    }
}

impl From<TemplateError> for PipelineError {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::NonFinite(_) => Self::Inference(e.to_string()),
            _ => Self::Configuration(e.to_string()),
        }
    }
}

/// Face alignment and template extraction.
///
/// Holds only read-only state after construction; it is `Send + Sync`
/// whenever the predictor and model are, so one instance can serve calls
/// from several threads.
pub struct FacePipeline<P = OnnxLandmarkPredictor, M = OnnxEmbeddingModel> {
    aligner: Aligner,
    predictor: P,
    model: M,
    reference: ReferenceVector,
}

impl FacePipeline {
    /// Load both ONNX models. Any load failure is a configuration error.
    pub fn load(
        landmark_model: &str,
        recognition_model: &str,
        reference: ReferenceVector,
    ) -> Result<Self, PipelineError> {
        let predictor = OnnxLandmarkPredictor::load(landmark_model)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        let model = OnnxEmbeddingModel::load(recognition_model)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        Self::new(predictor, model, reference)
    }
}

impl<P: LandmarkPredictor, M: EmbeddingModel> FacePipeline<P, M> {
    /// Assemble a pipeline from its collaborators.
    ///
    /// Fails if the model declares an output length that differs from the
    /// reference vector.
    pub fn new(predictor: P, model: M, reference: ReferenceVector) -> Result<Self, PipelineError> {
        if let Some(output_len) = model.output_len() {
            if output_len != reference.len() {
                return Err(PipelineError::Configuration(format!(
                    "recognition model produces {output_len}-dim embeddings but the reference vector has {} values",
                    reference.len()
                )));
            }
        }

        tracing::info!(
            reference_len = reference.len(),
            model_version = model.model_version().unwrap_or("unknown"),
            "face pipeline ready"
        );

        Ok(Self {
            aligner: Aligner::default(),
            predictor,
            model,
            reference,
        })
    }

    /// Replace the default canonical layout.
    pub fn with_aligner(mut self, aligner: Aligner) -> Self {
        self.aligner = aligner;
        self
    }

    pub fn reference(&self) -> &ReferenceVector {
        &self.reference
    }

    pub fn aligner(&self) -> &Aligner {
        &self.aligner
    }

    /// Ingest `image` and cut the aligned chip for the face in `rect`.
    pub fn create_aligned_chip<B: PixelBuffer + ?Sized>(
        &self,
        image: &B,
        rect: FaceRect,
        params: ChipParams,
    ) -> Result<AlignedChip, PipelineError> {
        let grid = Self::ingest(image)?;
        self.align(&grid, &rect, &params)
    }

    /// Compute one template per face rectangle, ingesting `image` once.
    ///
    /// The first failing face fails the whole call; no partial list is returned.
    pub fn create_face_templates<B: PixelBuffer + ?Sized>(
        &self,
        image: &B,
        faces: &[FaceRect],
        params: ChipParams,
    ) -> Result<Vec<Template>, PipelineError> {
        let grid = Self::ingest(image)?;
        faces
            .iter()
            .map(|rect| {
                let chip = self.align(&grid, rect, &params)?;
                self.template_from_chip(&chip)
            })
            .collect()
    }

    /// Compute the face template for the face bounded by
    /// `left, top, right, bottom` (inclusive), using a `size`×`size` chip.
    #[allow(clippy::too_many_arguments)]
    pub fn create_face_template<B: PixelBuffer + ?Sized>(
        &self,
        image: &B,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        size: u32,
        padding: f32,
    ) -> Result<Template, PipelineError> {
        let rect = FaceRect::new(left, top, right, bottom);
        let chip = self.create_aligned_chip(image, rect, ChipParams::new(size, padding))?;
        self.template_from_chip(&chip)
    }

    fn ingest<B: PixelBuffer + ?Sized>(image: &B) -> Result<RgbImageGrid, PipelineError> {
        let grid = pixels::ingest(image)?;
        tracing::debug!(width = grid.width(), height = grid.height(), "ingested bitmap");
        Ok(grid)
    }

    fn align(
        &self,
        grid: &RgbImageGrid,
        rect: &FaceRect,
        params: &ChipParams,
    ) -> Result<AlignedChip, PipelineError> {
        let chip = self.aligner.align(grid, rect, params, &self.predictor)?;
        tracing::debug!(?rect, size = chip.size(), "aligned chip");
        Ok(chip)
    }

    /// Run the recognition model on an aligned chip and normalize the result.
    pub fn template_from_chip(&self, chip: &AlignedChip) -> Result<Template, PipelineError> {
        let raw = self.model.embed(chip)?;
        let values = template::normalize(&raw, &self.reference)?;

        let template = Template {
            values,
            model_version: self.model.model_version().map(str::to_owned),
        };
        tracing::debug!(len = template.len(), norm = template.norm(), "template computed");
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::LandmarkError;

    #[test]
    fn test_align_error_mapping() {
        let rect = FaceRect::new(5, 5, 5, 5);
        assert!(matches!(
            PipelineError::from(AlignError::RectOutOfBounds { rect, width: 4, height: 4 }),
            PipelineError::InputValidation(_)
        ));
        assert!(matches!(
            PipelineError::from(AlignError::InvalidChipSize(1)),
            PipelineError::InputValidation(_)
        ));
        assert!(matches!(
            PipelineError::from(AlignError::InvalidPadding(-1.0)),
            PipelineError::InputValidation(_)
        ));
        assert!(matches!(
            PipelineError::from(AlignError::LandmarkCount(68)),
            PipelineError::Prediction(_)
        ));
        assert!(matches!(
            PipelineError::from(AlignError::Predictor(LandmarkError::InferenceFailed("x".into()))),
            PipelineError::Prediction(_)
        ));
    }

    #[test]
    fn test_template_error_mapping() {
        assert!(matches!(
            PipelineError::from(TemplateError::LengthMismatch { raw: 512, reference: 128 }),
            PipelineError::Configuration(_)
        ));
        assert!(matches!(
            PipelineError::from(TemplateError::NonFinite(0)),
            PipelineError::Inference(_)
        ));
    }

    #[test]
    fn test_pixel_and_recognizer_error_mapping() {
        assert!(matches!(
            PipelineError::from(PixelError::NullPixels),
            PipelineError::InputValidation(_)
        ));
        assert!(matches!(
            PipelineError::from(RecognizerError::InferenceFailed("x".into())),
            PipelineError::Inference(_)
        ));
    }

    #[test]
    fn test_load_missing_models_is_configuration_error() {
        let err = FacePipeline::load(
            "/nonexistent/shape_predictor_5.onnx",
            "/nonexistent/recognition.onnx",
            ReferenceVector::dlib_resnet_v1(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    struct DeclaredLen(usize);

    impl EmbeddingModel for DeclaredLen {
        fn embed(&self, _: &AlignedChip) -> Result<Vec<f32>, RecognizerError> {
            Ok(vec![1.0; self.0])
        }

        fn output_len(&self) -> Option<usize> {
            Some(self.0)
        }
    }

    struct NoPredictor;

    impl LandmarkPredictor for NoPredictor {
        fn predict(
            &self,
            _: &RgbImageGrid,
            _: &FaceRect,
        ) -> Result<Vec<crate::types::Point>, LandmarkError> {
            Err(LandmarkError::InferenceFailed("unused".into()))
        }
    }

    #[test]
    fn test_new_rejects_declared_length_mismatch() {
        let err = FacePipeline::new(NoPredictor, DeclaredLen(512), ReferenceVector::dlib_resnet_v1())
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));

        assert!(FacePipeline::new(NoPredictor, DeclaredLen(128), ReferenceVector::dlib_resnet_v1()).is_ok());
    }
}
