use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emotive_core::{
    Analysis, CascadeClassifier, DetectionParams, EmotionClassifier, EmotionPipeline, GrayFrame,
    NumericType,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_MODEL: &str = "models/emotion_model.onnx";
const DEFAULT_CASCADE: &str = "models/haarcascade_frontalface_default.xml";

#[derive(Parser)]
#[command(name = "emotive", about = "Emotive facial emotion recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict the emotion of the first face in an image
    Predict {
        /// Image file (any format the image crate decodes)
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: PathBuf,
        #[arg(long, default_value = DEFAULT_CASCADE)]
        cascade: PathBuf,
        /// Force the model input element type (e.g. float32, uint8)
        #[arg(long)]
        input_type: Option<NumericType>,
        /// Also print the full seven-way distribution
        #[arg(long)]
        all_scores: bool,
    },
    /// List the faces the cascade finds in an image
    Detect {
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_CASCADE)]
        cascade: PathBuf,
        #[arg(long, default_value_t = emotive_core::cascade::DEFAULT_SCALE_FACTOR)]
        scale_factor: f64,
        #[arg(long, default_value_t = emotive_core::cascade::DEFAULT_MIN_NEIGHBORS)]
        min_neighbors: u32,
    },
    /// Show the model's input and output signature
    Inspect {
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Predict {
            image,
            model,
            cascade,
            input_type,
            all_scores,
        } => {
            let frame = read_frame(&image)?;
            let detector = CascadeClassifier::load(&cascade)
                .with_context(|| format!("loading cascade {}", cascade.display()))?;
            let classifier = EmotionClassifier::load(&model, input_type)
                .with_context(|| format!("loading model {}", model.display()))?;
            let mut pipeline = EmotionPipeline::new(detector, classifier);

            match pipeline.analyze_frame(&frame)? {
                Analysis::NoFace => {
                    println!("{}", serde_json::json!({ "error": "No face detected" }));
                    return Ok(ExitCode::from(2));
                }
                Analysis::Face { prediction, scores } => {
                    let mut out = serde_json::to_value(prediction)?;
                    if all_scores {
                        out["scores"] = serde_json::to_value(scores)?;
                    }
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Detect {
            image,
            cascade,
            scale_factor,
            min_neighbors,
        } => {
            let frame = read_frame(&image)?;
            let params = DetectionParams {
                scale_factor,
                min_neighbors,
                ..DetectionParams::default()
            };
            let detector = CascadeClassifier::load(&cascade)
                .with_context(|| format!("loading cascade {}", cascade.display()))?
                .with_params(params)?;

            let faces = detector.detect(&frame);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "width": frame.width,
                    "height": frame.height,
                    "faces": faces,
                }))?
            );
        }
        Commands::Inspect { model } => {
            let classifier = EmotionClassifier::load(&model, None)
                .with_context(|| format!("loading model {}", model.display()))?;
            println!("{}", serde_json::to_string_pretty(classifier.info())?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_frame(path: &Path) -> Result<GrayFrame> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    GrayFrame::decode(&bytes).with_context(|| format!("decoding {}", path.display()))
}
