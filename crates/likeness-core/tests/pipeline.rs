use likeness_core::landmarks::LandmarkError;
use likeness_core::pixels::{BitmapInfo, PixelBuffer, PixelError, PixelFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use likeness_core::recognizer::RecognizerError;
use likeness_core::{
    AlignedChip, Aligner, ChipParams, EmbeddingModel, FacePipeline, FaceRect, LandmarkPredictor,
    PipelineError, Point, ReferenceVector, RgbImageGrid, RgbaBuffer,
};

/// Places the canonical layout inside whatever rectangle it is given.
struct RectLayoutPredictor;

impl LandmarkPredictor for RectLayoutPredictor {
    fn predict(&self, _: &RgbImageGrid, rect: &FaceRect) -> Result<Vec<Point>, LandmarkError> {
        let unit = Aligner::default().canonical_landmarks(&ChipParams::new(1, 0.0));
        let w = rect.width() as f64 - 1.0;
        let h = rect.height() as f64 - 1.0;
        Ok(unit
            .iter()
            .map(|&(x, y)| Point::new((rect.left as f64 + x * w) as f32, (rect.top as f64 + y * h) as f32))
            .collect())
    }
}

struct CountPredictor(usize);

impl LandmarkPredictor for CountPredictor {
    fn predict(&self, _: &RgbImageGrid, rect: &FaceRect) -> Result<Vec<Point>, LandmarkError> {
        Ok((0..self.0)
            .map(|i| Point::new(rect.left as f32 + i as f32, rect.top as f32 + (i * i) as f32))
            .collect())
    }
}

/// Always returns the same raw embedding.
struct FixedModel(Vec<f32>);

impl EmbeddingModel for FixedModel {
    fn embed(&self, _: &AlignedChip) -> Result<Vec<f32>, RecognizerError> {
        Ok(self.0.clone())
    }
}

/// Deterministic 128-dim embedding derived from the chip content.
struct ChipHashModel;

impl EmbeddingModel for ChipHashModel {
    fn embed(&self, chip: &AlignedChip) -> Result<Vec<f32>, RecognizerError> {
        let mut out = vec![0.0f32; 128];
        for (i, v) in chip.as_slice().iter().enumerate() {
            out[(i * 31) % 128] += v * (((i % 7) as f32) - 3.0);
        }
        Ok(out)
    }

    fn output_len(&self) -> Option<usize> {
        Some(128)
    }

    fn model_version(&self) -> Option<&str> {
        Some("chip-hash")
    }
}

struct FailingModel;

impl EmbeddingModel for FailingModel {
    fn embed(&self, _: &AlignedChip) -> Result<Vec<f32>, RecognizerError> {
        Err(RecognizerError::InferenceFailed("session run failed".into()))
    }
}

/// Counts lock and unlock calls on a wrapped buffer.
struct CountingBuffer {
    inner: RgbaBuffer,
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl CountingBuffer {
    fn new(inner: RgbaBuffer) -> Self {
        Self {
            inner,
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        }
    }
}

impl PixelBuffer for CountingBuffer {
    fn info(&self) -> Result<BitmapInfo, PixelError> {
        self.inner.info()
    }

    fn lock_pixels(&self) -> Result<&[u8], PixelError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        self.inner.lock_pixels()
    }

    fn unlock_pixels(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        self.inner.unlock_pixels();
    }
}

/// Reports a valid RGBA bitmap but refuses to lock it.
struct UnlockableBitmap {
    unlocks: AtomicUsize,
}

impl PixelBuffer for UnlockableBitmap {
    fn info(&self) -> Result<BitmapInfo, PixelError> {
        Ok(BitmapInfo {
            width: 8,
            height: 8,
            stride: 32,
            format: PixelFormat::Rgba8888,
        })
    }

    fn lock_pixels(&self) -> Result<&[u8], PixelError> {
        Err(PixelError::LockFailed("bitmap recycled".into()))
    }

    fn unlock_pixels(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }
}

fn white(width: u32, height: u32) -> RgbaBuffer {
    RgbaBuffer::from_pixels(width, height, &vec![[255, 255, 255, 255]; (width * height) as usize])
}

fn gradient(width: u32, height: u32) -> RgbaBuffer {
    let pixels: Vec<[u8; 4]> = (0..height)
        .flat_map(|y| (0..width).map(move |x| [(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8, 255]))
        .collect();
    RgbaBuffer::from_pixels(width, height, &pixels)
}

fn l2(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[test]
fn test_white_image_end_to_end() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![3.0, 4.0]),
        ReferenceVector::zeros(2).unwrap(),
    )
    .unwrap();
    let image = white(4, 4);

    let chip = pipeline
        .create_aligned_chip(&image, FaceRect::new(0, 0, 3, 3), ChipParams::new(2, 0.0))
        .unwrap();
    assert_eq!(chip.shape(), [1, 2, 2, 3]);
    assert!(chip.as_slice().iter().all(|&v| v == 1.0));

    let template = pipeline.create_face_template(&image, 0, 0, 3, 3, 2, 0.0).unwrap();
    assert_eq!(template.len(), 2);
    assert!((template.values[0] - 0.6).abs() < 1e-6);
    assert!((template.values[1] - 0.8).abs() < 1e-6);
    assert_eq!(image.outstanding_locks(), 0);
}

#[test]
fn test_template_is_deterministic() {
    let pipeline =
        FacePipeline::new(RectLayoutPredictor, ChipHashModel, ReferenceVector::dlib_resnet_v1()).unwrap();
    let image = gradient(64, 64);

    let first = pipeline.create_face_template(&image, 12, 10, 51, 49, 150, 0.25).unwrap();
    let second = pipeline.create_face_template(&image, 12, 10, 51, 49, 150, 0.25).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.model_version.as_deref(), Some("chip-hash"));
}

#[test]
fn test_templates_are_unit_length_or_zero() {
    let pipeline =
        FacePipeline::new(RectLayoutPredictor, ChipHashModel, ReferenceVector::dlib_resnet_v1()).unwrap();
    let image = gradient(64, 64);

    for (rect, size, padding) in [
        ((0, 0, 63, 63), 150, 0.25),
        ((8, 4, 40, 36), 32, 0.0),
        ((20, 20, 60, 60), 64, 0.5),
        ((-10, -10, 30, 30), 16, 1.0),
    ] {
        let t = pipeline
            .create_face_template(&image, rect.0, rect.1, rect.2, rect.3, size, padding)
            .unwrap();
        assert_eq!(t.len(), 128);
        assert!(t.is_zero() || (l2(&t.values) - 1.0).abs() < 1e-5, "norm {}", l2(&t.values));
    }
}

#[test]
fn test_raw_equal_to_reference_gives_zero_template() {
    let reference = ReferenceVector::dlib_resnet_v1();
    let pipeline =
        FacePipeline::new(RectLayoutPredictor, FixedModel(reference.as_slice().to_vec()), reference).unwrap();

    let t = pipeline.create_face_template(&white(8, 8), 0, 0, 7, 7, 4, 0.0).unwrap();
    assert!(t.is_zero());
    assert_eq!(t.norm(), 0.0);
}

#[test]
fn test_collapsed_rect_is_input_validation() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![1.0]),
        ReferenceVector::zeros(1).unwrap(),
    )
    .unwrap();

    for (w, h) in [(4, 4), (16, 9), (100, 100)] {
        let image = white(w, h);
        for (l, t, r, b) in [(2, 0, 2, 3), (0, 1, 3, 1), (5000, 5000, 6000, 6000), (-20, -20, -10, -10)] {
            let err = pipeline.create_face_template(&image, l, t, r, b, 8, 0.0).unwrap_err();
            assert!(
                matches!(err, PipelineError::InputValidation(_)),
                "{w}x{h} rect ({l},{t},{r},{b}): {err}"
            );
        }
        assert_eq!(image.outstanding_locks(), 0);
    }
}

#[test]
fn test_bad_chip_params_are_input_validation() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![1.0]),
        ReferenceVector::zeros(1).unwrap(),
    )
    .unwrap();
    let image = white(8, 8);

    for (size, padding) in [(0, 0.0), (1, 0.25), (16, -0.5), (16, f32::NAN)] {
        let err = pipeline.create_face_template(&image, 0, 0, 7, 7, size, padding).unwrap_err();
        assert!(matches!(err, PipelineError::InputValidation(_)), "{size}/{padding}: {err}");
    }
}

#[test]
fn test_unsupported_format_is_input_validation() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![1.0]),
        ReferenceVector::zeros(1).unwrap(),
    )
    .unwrap();
    let image = white(4, 4).with_format(PixelFormat::Rgb565);

    let err = pipeline.create_face_template(&image, 0, 0, 3, 3, 2, 0.0).unwrap_err();
    assert!(matches!(err, PipelineError::InputValidation(_)));
}

#[test]
fn test_wrong_landmark_count_is_prediction_error() {
    let image = white(16, 16);
    for count in [0, 4, 6, 68] {
        let pipeline =
            FacePipeline::new(CountPredictor(count), FixedModel(vec![1.0]), ReferenceVector::zeros(1).unwrap())
                .unwrap();
        let err = pipeline.create_face_template(&image, 0, 0, 15, 15, 8, 0.0).unwrap_err();
        assert!(matches!(err, PipelineError::Prediction(_)), "{count}: {err}");
    }
}

#[test]
fn test_embedding_length_mismatch_is_configuration_error() {
    let pipeline =
        FacePipeline::new(RectLayoutPredictor, FixedModel(vec![0.5; 512]), ReferenceVector::dlib_resnet_v1())
            .unwrap();
    let err = pipeline.create_face_template(&white(8, 8), 0, 0, 7, 7, 4, 0.0).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[test]
fn test_engine_failures_are_inference_errors() {
    let image = white(8, 8);

    let failing = FacePipeline::new(RectLayoutPredictor, FailingModel, ReferenceVector::zeros(2).unwrap()).unwrap();
    let err = failing.create_face_template(&image, 0, 0, 7, 7, 4, 0.0).unwrap_err();
    assert!(matches!(err, PipelineError::Inference(_)));

    let garbage = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![1.0, f32::NAN]),
        ReferenceVector::zeros(2).unwrap(),
    )
    .unwrap();
    let err = garbage.create_face_template(&image, 0, 0, 7, 7, 4, 0.0).unwrap_err();
    assert!(matches!(err, PipelineError::Inference(_)));
}

#[test]
fn test_shared_pipeline_across_threads() {
    let pipeline =
        FacePipeline::new(RectLayoutPredictor, ChipHashModel, ReferenceVector::dlib_resnet_v1()).unwrap();
    let image = gradient(48, 48);
    let expected = pipeline.create_face_template(&image, 4, 4, 43, 43, 32, 0.25).unwrap();

    let (shared, pixels) = (&pipeline, &image);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(move || shared.create_face_template(pixels, 4, 4, 43, 43, 32, 0.25)))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), expected);
        }
    });
    assert_eq!(image.outstanding_locks(), 0);
}

#[test]
fn test_lock_failure_is_input_validation_without_unlock() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![1.0]),
        ReferenceVector::zeros(1).unwrap(),
    )
    .unwrap();
    let bitmap = UnlockableBitmap {
        unlocks: AtomicUsize::new(0),
    };

    let err = pipeline.create_face_template(&bitmap, 0, 0, 7, 7, 4, 0.0).unwrap_err();
    assert!(matches!(err, PipelineError::InputValidation(_)), "{err}");
    assert_eq!(bitmap.unlocks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_batch_templates_match_single_calls() {
    let pipeline =
        FacePipeline::new(RectLayoutPredictor, ChipHashModel, ReferenceVector::dlib_resnet_v1()).unwrap();
    let image = CountingBuffer::new(gradient(64, 64));
    let faces = [
        FaceRect::new(0, 0, 31, 31),
        FaceRect::new(32, 32, 63, 63),
        FaceRect::new(10, 20, 50, 60),
    ];
    let params = ChipParams::new(32, 0.25);

    let templates = pipeline.create_face_templates(&image, &faces, params).unwrap();
    assert_eq!(image.locks.load(Ordering::SeqCst), 1);
    assert_eq!(image.unlocks.load(Ordering::SeqCst), 1);

    assert_eq!(templates.len(), faces.len());
    for (face, template) in faces.iter().zip(&templates) {
        let single = pipeline
            .create_face_template(&image, face.left, face.top, face.right, face.bottom, 32, 0.25)
            .unwrap();
        assert_eq!(&single, template);
    }
    assert_ne!(templates[0], templates[1]);
}

#[test]
fn test_batch_fails_whole_call_on_bad_face() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![3.0, 4.0]),
        ReferenceVector::zeros(2).unwrap(),
    )
    .unwrap();
    let image = CountingBuffer::new(white(16, 16));
    let faces = [FaceRect::new(0, 0, 15, 15), FaceRect::new(4, 4, 4, 10)];

    let err = pipeline
        .create_face_templates(&image, &faces, ChipParams::new(8, 0.0))
        .unwrap_err();
    assert!(matches!(err, PipelineError::InputValidation(_)));
    assert_eq!(image.unlocks.load(Ordering::SeqCst), image.locks.load(Ordering::SeqCst));
}

#[test]
fn test_batch_with_no_faces_still_validates_bitmap() {
    let pipeline = FacePipeline::new(
        RectLayoutPredictor,
        FixedModel(vec![1.0]),
        ReferenceVector::zeros(1).unwrap(),
    )
    .unwrap();

    assert!(pipeline
        .create_face_templates(&white(4, 4), &[], ChipParams::default())
        .unwrap()
        .is_empty());

    let err = pipeline
        .create_face_templates(&white(4, 4).with_format(PixelFormat::Alpha8), &[], ChipParams::default())
        .unwrap_err();
    assert!(matches!(err, PipelineError::InputValidation(_)));
}
