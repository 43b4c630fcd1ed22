//! Facial emotion classifier via ONNX Runtime.
//!
//! Runs a 48x48 grayscale CNN exported to ONNX and returns a seven-way
//! distribution over [`Emotion`](crate::Emotion) categories.

use crate::cast::{Cast, CastError, CastTensor, NumericType};
use crate::types::{EmotionScores, EMOTION_COUNT};
use half::f16;
use ndarray::Array4;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{TensorRef, ValueType};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Side length of the square face crop the network consumes.
pub const FACE_INPUT_SIZE: usize = 48;
const FACE_INPUT_CHANNELS: usize = 1;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported model input: {0}")]
    UnsupportedInput(String),
    #[error("unsupported model output: {0}")]
    UnsupportedOutput(String),
    #[error("cast: {0}")]
    Cast(#[from] CastError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Memory layout of the model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputLayout {
    /// `[batch, height, width, channels]`, the Keras default.
    Nhwc,
    /// `[batch, channels, height, width]`.
    Nchw,
}

impl InputLayout {
    /// Guess the layout from a declared input shape (`-1` marks a dynamic dimension).
    pub fn from_shape(dims: &[i64]) -> Self {
        if dims.len() == 4 && dims[1] == FACE_INPUT_CHANNELS as i64 && dims[3] != FACE_INPUT_CHANNELS as i64 {
            InputLayout::Nchw
        } else {
            InputLayout::Nhwc
        }
    }

    /// Tensor shape for a single face.
    pub fn shape(self) -> (usize, usize, usize, usize) {
        match self {
            InputLayout::Nhwc => (1, FACE_INPUT_SIZE, FACE_INPUT_SIZE, FACE_INPUT_CHANNELS),
            InputLayout::Nchw => (1, FACE_INPUT_CHANNELS, FACE_INPUT_SIZE, FACE_INPUT_SIZE),
        }
    }
}

/// Map an ONNX element type onto a cast target.
pub fn numeric_type_for(ty: TensorElementType) -> Result<NumericType, CastError> {
    match ty {
        TensorElementType::Float16 => Ok(NumericType::Float16),
        TensorElementType::Float32 => Ok(NumericType::Float32),
        TensorElementType::Float64 => Ok(NumericType::Float64),
        TensorElementType::Int32 => Ok(NumericType::Int32),
        TensorElementType::Int64 => Ok(NumericType::Int64),
        TensorElementType::Uint8 => Ok(NumericType::Uint8),
        other => Err(CastError::UnsupportedElementType(format!("{other:?}"))),
    }
}

/// Element types the score output may use. Each is widened to `f32`.
fn output_numeric_type(ty: TensorElementType) -> Result<NumericType, ClassifierError> {
    match ty {
        TensorElementType::Float16 => Ok(NumericType::Float16),
        TensorElementType::Float32 => Ok(NumericType::Float32),
        TensorElementType::Float64 => Ok(NumericType::Float64),
        other => Err(ClassifierError::UnsupportedOutput(format!(
            "scores must be float16, float32 or float64, got {other:?}"
        ))),
    }
}

/// Turn raw model output into a distribution over the seven emotions.
///
/// Non-finite values are rejected; anything else that is not already a
/// distribution is soft-maxed.
fn scores_from_output(raw: &[f32]) -> Result<EmotionScores, ClassifierError> {
    let scores = EmotionScores::from_slice(raw).ok_or_else(|| {
        ClassifierError::InferenceFailed(format!(
            "expected {EMOTION_COUNT} scores, got {}",
            raw.len()
        ))
    })?;
    if let Some(bad) = raw.iter().find(|v| !v.is_finite()) {
        return Err(ClassifierError::InferenceFailed(format!(
            "model produced a non-finite score ({bad})"
        )));
    }
    Ok(scores.normalized())
}

/// Check that a declared input shape can take one 48x48 grayscale face.
fn check_input_shape(dims: &[i64], layout: InputLayout) -> Result<(), ClassifierError> {
    if dims.len() != 4 {
        return Err(ClassifierError::UnsupportedInput(format!(
            "expected a rank-4 image input, got shape {dims:?}"
        )));
    }
    let (_, a, b, c) = layout.shape();
    let expected = [a as i64, b as i64, c as i64];
    for (declared, want) in dims[1..].iter().zip(expected) {
        if *declared > 0 && *declared != want {
            return Err(ClassifierError::UnsupportedInput(format!(
                "shape {dims:?} does not accept a {FACE_INPUT_SIZE}x{FACE_INPUT_SIZE} grayscale face ({layout:?})"
            )));
        }
    }
    Ok(())
}

/// Static description of a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub path: String,
    pub input_name: String,
    pub input_shape: Vec<i64>,
    pub declared_type: String,
    pub input_type: NumericType,
    pub layout: InputLayout,
    pub outputs: Vec<String>,
    /// Element type of the first output, the score vector.
    pub output_type: NumericType,
}

/// ONNX emotion classifier. Loaded once, then used for every request.
pub struct EmotionClassifier {
    session: Session,
    cast: Cast,
    info: ModelInfo,
}

impl EmotionClassifier {
    /// Load the ONNX model from the given path.
    ///
    /// The input cast follows the element type the model declares unless
    /// `cast_override` forces one.
    pub fn load(
        model_path: impl AsRef<Path>,
        cast_override: Option<NumericType>,
    ) -> Result<Self, ClassifierError> {
        let path = model_path.as_ref();
        if !path.exists() {
            return Err(ClassifierError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(path)?;

        tracing::info!(
            path = %path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded emotion model"
        );

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| ClassifierError::UnsupportedInput("model has no inputs".into()))?;
        let (element_type, dims) = match input.dtype() {
            ValueType::Tensor { ty, shape, .. } => (*ty, shape.iter().copied().collect::<Vec<i64>>()),
            other => {
                return Err(ClassifierError::UnsupportedInput(format!(
                    "input is not a tensor: {other:?}"
                )))
            }
        };

        let layout = InputLayout::from_shape(&dims);
        check_input_shape(&dims, layout)?;

        let target = match cast_override {
            Some(t) => t,
            None => numeric_type_for(element_type)?,
        };

        let scores_output = session
            .outputs()
            .first()
            .ok_or_else(|| ClassifierError::UnsupportedOutput("model has no outputs".into()))?;
        let output_type = match scores_output.dtype() {
            ValueType::Tensor { ty, .. } => output_numeric_type(*ty)?,
            other => {
                return Err(ClassifierError::UnsupportedOutput(format!(
                    "output is not a tensor: {other:?}"
                )))
            }
        };
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        let info = ModelInfo {
            path: path.display().to_string(),
            input_name: input.name().to_string(),
            input_shape: dims,
            declared_type: format!("{element_type:?}"),
            input_type: target,
            layout,
            outputs,
            output_type,
        };
        tracing::info!(
            input_type = %target,
            output_type = %output_type,
            ?layout,
            "emotion model signature configured"
        );

        Ok(Self {
            session,
            cast: Cast::new(target),
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn layout(&self) -> InputLayout {
        self.info.layout
    }

    /// Classify one preprocessed face tensor shaped per [`InputLayout::shape`].
    pub fn classify(&mut self, face: &Array4<f32>) -> Result<EmotionScores, ClassifierError> {
        let expected = self.info.layout.shape();
        if face.dim() != expected {
            return Err(ClassifierError::InferenceFailed(format!(
                "face tensor has shape {:?}, expected {expected:?}",
                face.shape()
            )));
        }

        let tensor = self.cast.apply(face);
        let outputs = match &tensor {
            CastTensor::Float16(a) => self.session.run(ort::inputs![TensorRef::from_array_view(a.view())?])?,
            CastTensor::Float32(a) => self.session.run(ort::inputs![TensorRef::from_array_view(a.view())?])?,
            CastTensor::Float64(a) => self.session.run(ort::inputs![TensorRef::from_array_view(a.view())?])?,
            CastTensor::Int32(a) => self.session.run(ort::inputs![TensorRef::from_array_view(a.view())?])?,
            CastTensor::Int64(a) => self.session.run(ort::inputs![TensorRef::from_array_view(a.view())?])?,
            CastTensor::Uint8(a) => self.session.run(ort::inputs![TensorRef::from_array_view(a.view())?])?,
        };

        let extraction = |e: ort::Error| ClassifierError::InferenceFailed(format!("score extraction: {e}"));
        let raw: Vec<f32> = match self.info.output_type {
            NumericType::Float16 => {
                let (_, v) = outputs[0].try_extract_tensor::<f16>().map_err(extraction)?;
                v.iter().map(|x| x.to_f32()).collect()
            }
            NumericType::Float64 => {
                let (_, v) = outputs[0].try_extract_tensor::<f64>().map_err(extraction)?;
                v.iter().map(|&x| x as f32).collect()
            }
            _ => {
                let (_, v) = outputs[0].try_extract_tensor::<f32>().map_err(extraction)?;
                v.to_vec()
            }
        };

        scores_from_output(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_from_keras_shape() {
        assert_eq!(InputLayout::from_shape(&[-1, 48, 48, 1]), InputLayout::Nhwc);
        assert_eq!(InputLayout::from_shape(&[1, 48, 48, 1]), InputLayout::Nhwc);
    }

    #[test]
    fn test_layout_from_channels_first_shape() {
        assert_eq!(InputLayout::from_shape(&[1, 1, 48, 48]), InputLayout::Nchw);
        assert_eq!(InputLayout::from_shape(&[-1, 1, -1, -1]), InputLayout::Nchw);
    }

    #[test]
    fn test_layout_shapes() {
        assert_eq!(InputLayout::Nhwc.shape(), (1, 48, 48, 1));
        assert_eq!(InputLayout::Nchw.shape(), (1, 1, 48, 48));
    }

    #[test]
    fn test_check_input_shape() {
        assert!(check_input_shape(&[-1, 48, 48, 1], InputLayout::Nhwc).is_ok());
        assert!(check_input_shape(&[-1, -1, -1, 1], InputLayout::Nhwc).is_ok());
        assert!(check_input_shape(&[1, 1, 48, 48], InputLayout::Nchw).is_ok());
        assert!(check_input_shape(&[1, 64, 64, 1], InputLayout::Nhwc).is_err());
        assert!(check_input_shape(&[1, 48, 48, 3], InputLayout::Nhwc).is_err());
        assert!(check_input_shape(&[1, 2304], InputLayout::Nhwc).is_err());
    }

    #[test]
    fn test_numeric_type_mapping() {
        assert_eq!(numeric_type_for(TensorElementType::Float16), Ok(NumericType::Float16));
        assert_eq!(numeric_type_for(TensorElementType::Float32), Ok(NumericType::Float32));
        assert_eq!(numeric_type_for(TensorElementType::Float64), Ok(NumericType::Float64));
        assert_eq!(numeric_type_for(TensorElementType::Uint8), Ok(NumericType::Uint8));
        assert!(matches!(
            numeric_type_for(TensorElementType::String),
            Err(CastError::UnsupportedElementType(_))
        ));
    }

    #[test]
    fn test_load_missing_model() {
        let err = EmotionClassifier::load("/nonexistent/emotion.onnx", None).err().unwrap();
        assert!(matches!(err, ClassifierError::ModelNotFound(_)));
    }

    #[test]
    fn test_numeric_type_serializes_as_name() {
        assert_eq!(serde_json::to_string(&NumericType::Uint8).unwrap(), "\"uint8\"");
        assert_eq!(serde_json::to_string(&InputLayout::Nchw).unwrap(), "\"NCHW\"");
    }

    #[test]
    fn test_output_types() {
        assert_eq!(output_numeric_type(TensorElementType::Float16).unwrap(), NumericType::Float16);
        assert_eq!(output_numeric_type(TensorElementType::Float64).unwrap(), NumericType::Float64);
        assert!(matches!(
            output_numeric_type(TensorElementType::Int64),
            Err(ClassifierError::UnsupportedOutput(_))
        ));
    }

    #[test]
    fn test_scores_reject_non_finite() {
        for bad in [f32::INFINITY, f32::NEG_INFINITY, f32::NAN] {
            let mut raw = [0.0f32; 7];
            raw[3] = bad;
            let err = scores_from_output(&raw).unwrap_err();
            assert!(matches!(err, ClassifierError::InferenceFailed(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_scores_wrong_length() {
        assert!(matches!(
            scores_from_output(&[0.5, 0.5]),
            Err(ClassifierError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_scores_logits_softmaxed() {
        let scores = scores_from_output(&[0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(scores.is_distribution());
        let (emotion, confidence) = scores.argmax();
        assert_eq!(emotion, crate::Emotion::Happy);
        assert!((0.0..=1.0).contains(&confidence));
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn face(layout: InputLayout, value: f32) -> Array4<f32> {
        Array4::from_elem(layout.shape(), value)
    }

    #[test]
    fn test_onnx_float32_model() {
        let mut model = EmotionClassifier::load(fixture("emotion_f32.onnx"), None).unwrap();
        let info = model.info().clone();
        assert_eq!(info.input_type, NumericType::Float32);
        assert_eq!(info.output_type, NumericType::Float32);
        assert_eq!(info.layout, InputLayout::Nhwc);
        assert_eq!(info.input_shape, vec![1, 48, 48, 1]);

        let bright = model.classify(&face(InputLayout::Nhwc, 1.0)).unwrap();
        assert!(bright.is_distribution());
        assert_eq!(bright.argmax().0, crate::Emotion::Happy);
        assert!(bright.argmax().1 > 0.99);

        // All-zero logits: uniform, tie goes to the first label.
        let dark = model.classify(&face(InputLayout::Nhwc, 0.0)).unwrap();
        assert!(dark.0.iter().all(|&p| (p - 1.0 / 7.0).abs() < 1e-5));
        assert_eq!(dark.argmax().0, crate::Emotion::Angry);
    }

    #[test]
    fn test_onnx_logits_are_normalized() {
        let mut model = EmotionClassifier::load(fixture("emotion_logits.onnx"), None).unwrap();
        let scores = model.classify(&face(InputLayout::Nhwc, 0.5)).unwrap();
        assert!(scores.is_distribution());
        let (emotion, confidence) = scores.argmax();
        assert_eq!(emotion, crate::Emotion::Happy);
        assert!(confidence > 0.999 && confidence <= 1.0);
    }

    #[test]
    fn test_onnx_float16_output_widened() {
        let mut model = EmotionClassifier::load(fixture("emotion_f16_out.onnx"), None).unwrap();
        assert_eq!(model.info().output_type, NumericType::Float16);
        let scores = model.classify(&face(InputLayout::Nhwc, 1.0)).unwrap();
        assert!(scores.is_distribution());
        assert_eq!(scores.argmax().0, crate::Emotion::Happy);
    }

    #[test]
    fn test_onnx_float16_nchw_input() {
        let mut model = EmotionClassifier::load(fixture("emotion_f16_nchw.onnx"), None).unwrap();
        assert_eq!(model.info().input_type, NumericType::Float16);
        assert_eq!(model.layout(), InputLayout::Nchw);
        let scores = model.classify(&face(InputLayout::Nchw, 1.0)).unwrap();
        assert_eq!(scores.argmax().0, crate::Emotion::Happy);

        // A face laid out for the other layout is refused before inference.
        assert!(model.classify(&face(InputLayout::Nhwc, 1.0)).is_err());
    }

    #[test]
    fn test_onnx_cast_override() {
        let mut model =
            EmotionClassifier::load(fixture("emotion_f16_nchw.onnx"), Some(NumericType::Float32))
                .unwrap();
        assert_eq!(model.info().input_type, NumericType::Float32);
        // The session rejects float32 data for a float16 input.
        assert!(model.classify(&face(InputLayout::Nchw, 1.0)).is_err());
    }

    #[test]
    fn test_onnx_label_output_rejected_at_load() {
        let err = EmotionClassifier::load(fixture("emotion_label_out.onnx"), None)
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::UnsupportedOutput(_)), "{err}");
    }
}
