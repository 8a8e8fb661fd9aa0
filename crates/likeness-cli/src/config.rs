use anyhow::{Context, Result};
use likeness_core::{ChipParams, ReferenceVector};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LANDMARK_MODEL_FILE: &str = "shape_predictor_5.onnx";
const RECOGNITION_MODEL_FILE: &str = "dlib_face_recognition_resnet_v1.onnx";

/// CLI configuration: optional TOML file, then `LIKENESS_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Landmark model path; relative paths resolve against `model_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmark_model: Option<PathBuf>,
    /// Recognition model path; relative paths resolve against `model_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition_model: Option<PathBuf>,
    /// JSON reference vector. The embedded dlib ResNet centroid when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_path: Option<PathBuf>,
    /// Default chip edge length.
    pub chip_size: u32,
    /// Default chip padding.
    pub padding: f32,
}

impl Default for Config {
    fn default() -> Self {
        let chip = ChipParams::default();
        Self {
            model_dir: default_model_dir(),
            landmark_model: None,
            recognition_model: None,
            reference_path: None,
            chip_size: chip.size,
            padding: chip.padding,
        }
    }
}

impl Config {
    /// Load from `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Apply `LIKENESS_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("LIKENESS_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("LIKENESS_LANDMARK_MODEL") {
            self.landmark_model = Some(PathBuf::from(path));
        }
        if let Some(path) = var("LIKENESS_RECOGNITION_MODEL") {
            self.recognition_model = Some(PathBuf::from(path));
        }
        if let Some(path) = var("LIKENESS_REFERENCE_PATH") {
            self.reference_path = Some(PathBuf::from(path));
        }
        self.chip_size = env_u32(&var, "LIKENESS_CHIP_SIZE", self.chip_size);
        self.padding = env_f32(&var, "LIKENESS_PADDING", self.padding);
    }

    /// Path to the 5-point landmark model.
    pub fn landmark_model_path(&self) -> String {
        self.resolve(self.landmark_model.as_deref(), LANDMARK_MODEL_FILE)
    }

    /// Path to the recognition model.
    pub fn recognition_model_path(&self) -> String {
        self.resolve(self.recognition_model.as_deref(), RECOGNITION_MODEL_FILE)
    }

    pub fn chip_params(&self) -> ChipParams {
        ChipParams::new(self.chip_size, self.padding)
    }

    pub fn reference(&self) -> Result<ReferenceVector> {
        match &self.reference_path {
            Some(path) => ReferenceVector::from_json_file(path)
                .with_context(|| format!("failed to load reference vector {}", path.display())),
            None => Ok(ReferenceVector::dlib_resnet_v1()),
        }
    }

    fn resolve(&self, configured: Option<&Path>, default_file: &str) -> String {
        self.model_dir
            .join(configured.unwrap_or(Path::new(default_file)))
            .to_string_lossy()
            .into_owned()
    }
}

/// `$XDG_DATA_HOME/likeness/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("likeness/models")
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
