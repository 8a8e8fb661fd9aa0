mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use likeness_core::{ChipParams, FacePipeline, FaceRect, RgbaBuffer, Template};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "likeness", version, about = "Face alignment and template extraction")]
struct Cli {
    /// TOML configuration file (LIKENESS_* environment variables take precedence)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the face template for a rectangle in an image and print it as JSON
    Template {
        /// Input image (any format the image crate decodes)
        image: PathBuf,
        /// Face rectangle as LEFT,TOP,RIGHT,BOTTOM (inclusive pixel bounds)
        #[arg(long, value_parser = parse_rect, allow_hyphen_values = true)]
        rect: FaceRect,
        /// Chip edge length in pixels
        #[arg(long)]
        size: Option<u32>,
        /// Context around the landmarks (0.0 = tight)
        #[arg(long)]
        padding: Option<f32>,
    },
    /// Write the aligned chip for a rectangle in an image to a PNG
    Chip {
        image: PathBuf,
        #[arg(long, value_parser = parse_rect, allow_hyphen_values = true)]
        rect: FaceRect,
        /// Output PNG path
        #[arg(short, long)]
        out: PathBuf,
        #[arg(long)]
        size: Option<u32>,
        #[arg(long)]
        padding: Option<f32>,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Serialize)]
struct TemplateOutput<'a> {
    image: &'a Path,
    rect: FaceRect,
    chip: ChipParams,
    #[serde(flatten)]
    template: Template,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Template {
            image,
            rect,
            size,
            padding,
        } => {
            let params = chip_params(&config, size, padding);
            let pipeline = load_pipeline(&config)?;
            let pixels = load_image(&image)?;

            let template = pipeline
                .create_face_template(
                    &pixels,
                    rect.left,
                    rect.top,
                    rect.right,
                    rect.bottom,
                    params.size,
                    params.padding,
                )
                .with_context(|| format!("failed to compute template for {}", image.display()))?;

            let output = TemplateOutput {
                image: &image,
                rect,
                chip: params,
                template,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Chip {
            image,
            rect,
            out,
            size,
            padding,
        } => {
            let params = chip_params(&config, size, padding);
            let pipeline = load_pipeline(&config)?;
            let pixels = load_image(&image)?;

            let chip = pipeline
                .create_aligned_chip(&pixels, rect, params)
                .with_context(|| format!("failed to align face in {}", image.display()))?;
            chip.to_rgb_image()
                .save(&out)
                .with_context(|| format!("failed to write {}", out.display()))?;

            tracing::info!(out = %out.display(), size = chip.size(), "wrote aligned chip");
            println!("{}", out.display());
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            println!("# landmark model:    {}", config.landmark_model_path());
            println!("# recognition model: {}", config.recognition_model_path());
        }
    }

    Ok(())
}

fn chip_params(config: &Config, size: Option<u32>, padding: Option<f32>) -> ChipParams {
    let defaults = config.chip_params();
    ChipParams::new(size.unwrap_or(defaults.size), padding.unwrap_or(defaults.padding))
}

fn load_pipeline(config: &Config) -> Result<FacePipeline> {
    let reference = config.reference()?;
    let pipeline = FacePipeline::load(
        &config.landmark_model_path(),
        &config.recognition_model_path(),
        reference,
    )?;
    Ok(pipeline)
}

fn load_image(path: &Path) -> Result<RgbaBuffer> {
    let img = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    tracing::debug!(width = img.width(), height = img.height(), "decoded image");
    // Decoded files carry straight alpha; drop it so ingestion does not
    // un-premultiply already straight colors.
    Ok(RgbaBuffer::from(&img.to_rgb8()))
}

/// Parse `LEFT,TOP,RIGHT,BOTTOM`.
fn parse_rect(s: &str) -> Result<FaceRect> {
    let bounds = s
        .split(',')
        .map(|v| v.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid rectangle bound in {s:?}"))?;
    match bounds[..] {
        [left, top, right, bottom] => Ok(FaceRect::new(left, top, right, bottom)),
        _ => bail!("expected LEFT,TOP,RIGHT,BOTTOM, got {} values", bounds.len()),
    }
}
