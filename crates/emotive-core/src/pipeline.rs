//! End-to-end analysis: decode → grayscale → detect → crop/resize → classify.

use crate::cascade::CascadeClassifier;
use crate::classifier::{ClassifierError, EmotionClassifier, InputLayout, FACE_INPUT_SIZE};
use crate::frame::{GrayFrame, ImageError};
use crate::types::{Analysis, EmotionPrediction, EmotionScores, FaceRect};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image: {0}")]
    Image(#[from] ImageError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

impl PipelineError {
    /// True when the request payload is at fault rather than the service.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            PipelineError::Image(ImageError::Decode(_) | ImageError::Empty)
        )
    }
}

/// Finds face rectangles in a grayscale frame, in detector order.
pub trait FaceDetector {
    fn detect(&self, frame: &GrayFrame) -> Vec<FaceRect>;
}

/// Maps a preprocessed face tensor to an emotion distribution.
pub trait EmotionModel {
    fn layout(&self) -> InputLayout;
    fn classify(&mut self, face: &Array4<f32>) -> Result<EmotionScores, ClassifierError>;
}

/// Anything that turns an encoded image into an [`Analysis`].
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, image: &[u8]) -> Result<Analysis, PipelineError>;
}

impl FaceDetector for CascadeClassifier {
    fn detect(&self, frame: &GrayFrame) -> Vec<FaceRect> {
        CascadeClassifier::detect(self, frame)
    }
}

impl EmotionModel for EmotionClassifier {
    fn layout(&self) -> InputLayout {
        EmotionClassifier::layout(self)
    }

    fn classify(&mut self, face: &Array4<f32>) -> Result<EmotionScores, ClassifierError> {
        EmotionClassifier::classify(self, face)
    }
}

/// Crop `rect`, resize to 48x48 and scale pixels into [0, 1].
pub fn preprocess_face(
    frame: &GrayFrame,
    rect: &FaceRect,
    layout: InputLayout,
) -> Result<Array4<f32>, ImageError> {
    let size = FACE_INPUT_SIZE;
    let face = frame.crop(rect)?.resize(size as u32, size as u32);

    let mut tensor = Array4::<f32>::zeros(layout.shape());
    for y in 0..size {
        for x in 0..size {
            let value = face.data[y * size + x] as f32 / 255.0;
            match layout {
                InputLayout::Nhwc => tensor[[0, y, x, 0]] = value,
                InputLayout::Nchw => tensor[[0, 0, y, x]] = value,
            }
        }
    }
    Ok(tensor)
}

/// Detector plus classifier, run in sequence on each image.
pub struct EmotionPipeline<D, M> {
    detector: D,
    model: M,
}

impl<D: FaceDetector, M: EmotionModel> EmotionPipeline<D, M> {
    pub fn new(detector: D, model: M) -> Self {
        Self { detector, model }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Classify the first face the detector reports. Other faces are ignored.
    pub fn analyze_frame(&mut self, frame: &GrayFrame) -> Result<Analysis, PipelineError> {
        let faces = self.detector.detect(frame);
        tracing::debug!(
            width = frame.width,
            height = frame.height,
            faces = faces.len(),
            "face detection"
        );

        let Some(face) = faces.first().copied() else {
            return Ok(Analysis::NoFace);
        };

        let tensor = preprocess_face(frame, &face, self.model.layout())?;
        let scores = self.model.classify(&tensor)?;
        let prediction = EmotionPrediction::from_scores(&scores, face);

        tracing::debug!(
            emotion = %prediction.emotion,
            confidence = prediction.confidence,
            ?face,
            "emotion classified"
        );

        Ok(Analysis::Face { prediction, scores })
    }
}

impl<D, M> FaceAnalyzer for EmotionPipeline<D, M>
where
    D: FaceDetector + Send,
    M: EmotionModel + Send,
{
    fn analyze(&mut self, image: &[u8]) -> Result<Analysis, PipelineError> {
        let frame = GrayFrame::decode(image)?;
        self.analyze_frame(&frame)
    }
}
