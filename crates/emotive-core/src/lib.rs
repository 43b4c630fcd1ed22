//! emotive-core: facial emotion recognition engine.
//!
//! Finds faces with a Haar cascade and classifies the first one with a
//! 48x48 grayscale CNN running on ONNX Runtime.

pub mod cascade;
pub mod cast;
pub mod classifier;
pub mod frame;
pub mod pipeline;
pub mod types;

pub use cascade::{CascadeClassifier, CascadeError, DetectionParams};
pub use cast::{Cast, CastError, CastTensor, NumericType};
pub use classifier::{ClassifierError, EmotionClassifier, InputLayout, ModelInfo};
pub use frame::{GrayFrame, ImageError};
pub use pipeline::{EmotionModel, EmotionPipeline, FaceAnalyzer, FaceDetector, PipelineError};
pub use types::{Analysis, Emotion, EmotionPrediction, EmotionScores, FaceRect};

/// The production pipeline: Haar cascade detector plus ONNX classifier.
pub type DefaultPipeline = EmotionPipeline<CascadeClassifier, EmotionClassifier>;
