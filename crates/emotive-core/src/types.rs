use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of categories in the classifier output.
pub const EMOTION_COUNT: usize = 7;

/// Facial emotion category, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    /// Every category, indexed the same way as the model's output vector.
    pub const ALL: [Emotion; EMOTION_COUNT] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "Angry",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
            Emotion::Neutral => "Neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown emotion label: {s}"))
    }
}

/// Axis-aligned face rectangle in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when the rectangle is non-empty and lies entirely inside a
    /// `width` × `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0 && self.height > 0 && self.right() <= width && self.bottom() <= height
    }

    /// Intersect with the image bounds. Returns `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRect> {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let right = self.x.saturating_add(self.width).min(width);
        let bottom = self.y.saturating_add(self.height).min(height);
        if right <= x || bottom <= y {
            return None;
        }
        Some(FaceRect::new(x, y, right - x, bottom - y))
    }
}

/// Probability distribution over the seven emotion categories.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionScores(pub [f32; EMOTION_COUNT]);

/// Tolerance on the sum of a distribution before it is treated as logits.
const DISTRIBUTION_SUM_TOLERANCE: f32 = 1e-3;

impl EmotionScores {
    /// Build from a raw model output. Returns `None` unless exactly seven values are given.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let array: [f32; EMOTION_COUNT] = values.try_into().ok()?;
        Some(Self(array))
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.0[emotion.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.iter().copied().zip(self.0.iter().copied())
    }

    /// The winning category and its probability. Ties go to the lowest index.
    pub fn argmax(&self) -> (Emotion, f32) {
        let mut best = 0;
        for (i, &v) in self.0.iter().enumerate().skip(1) {
            if v > self.0[best] {
                best = i;
            }
        }
        (Emotion::ALL[best], self.0[best])
    }

    /// True if every value is in [0, 1] and the values sum to 1.
    pub fn is_distribution(&self) -> bool {
        let in_range = self.0.iter().all(|v| (0.0..=1.0).contains(v));
        let sum: f32 = self.0.iter().sum();
        in_range && (sum - 1.0).abs() <= DISTRIBUTION_SUM_TOLERANCE
    }

    /// Numerically stable softmax over the raw values.
    pub fn softmax(&self) -> Self {
        let max = self.0.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut out = [0.0f32; EMOTION_COUNT];
        let mut sum = 0.0f32;
        for (o, &v) in out.iter_mut().zip(self.0.iter()) {
            *o = (v - max).exp();
            sum += *o;
        }
        if sum > 0.0 {
            for o in out.iter_mut() {
                *o /= sum;
            }
        }
        Self(out)
    }

    /// Return `self` if it already is a distribution, otherwise its softmax.
    pub fn normalized(self) -> Self {
        if self.is_distribution() {
            self
        } else {
            self.softmax()
        }
    }
}

impl Serialize for EmotionScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(EMOTION_COUNT))?;
        for (emotion, p) in self.iter() {
            map.serialize_entry(emotion.label(), &p)?;
        }
        map.end()
    }
}

/// The reported result for one request: arg-max label, its probability, and
/// the face it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionPrediction {
    pub emotion: Emotion,
    pub confidence: f32,
    pub face: FaceRect,
}

impl EmotionPrediction {
    pub fn from_scores(scores: &EmotionScores, face: FaceRect) -> Self {
        let (emotion, confidence) = scores.argmax();
        Self { emotion, confidence, face }
    }
}

/// Outcome of running the full pipeline on one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    NoFace,
    Face {
        prediction: EmotionPrediction,
        scores: EmotionScores,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_order_matches_model_output() {
        let labels: Vec<&str> = Emotion::ALL.iter().map(|e| e.label()).collect();
        assert_eq!(
            labels,
            ["Angry", "Disgust", "Fear", "Happy", "Sad", "Surprise", "Neutral"]
        );
        for (i, e) in Emotion::ALL.iter().enumerate() {
            assert_eq!(e.index(), i);
            assert_eq!(Emotion::from_index(i), Some(*e));
        }
        assert_eq!(Emotion::from_index(7), None);
    }

    #[test]
    fn test_emotion_parse_case_insensitive() {
        assert_eq!("happy".parse::<Emotion>(), Ok(Emotion::Happy));
        assert_eq!("NEUTRAL".parse::<Emotion>(), Ok(Emotion::Neutral));
        assert!("bored".parse::<Emotion>().is_err());
    }

    #[test]
    fn test_emotion_serializes_as_label() {
        assert_eq!(serde_json::to_string(&Emotion::Surprise).unwrap(), "\"Surprise\"");
    }

    #[test]
    fn test_argmax_picks_highest() {
        let scores = EmotionScores([0.05, 0.0, 0.1, 0.6, 0.1, 0.05, 0.1]);
        let (emotion, p) = scores.argmax();
        assert_eq!(emotion, Emotion::Happy);
        assert_eq!(p, 0.6);
    }

    #[test]
    fn test_argmax_tie_goes_to_first() {
        let scores = EmotionScores([0.1, 0.3, 0.3, 0.1, 0.1, 0.05, 0.05]);
        assert_eq!(scores.argmax().0, Emotion::Disgust);
    }

    #[test]
    fn test_from_slice_requires_seven_values() {
        assert!(EmotionScores::from_slice(&[0.5, 0.5]).is_none());
        assert!(EmotionScores::from_slice(&[0.0; 8]).is_none());
        assert!(EmotionScores::from_slice(&[0.0; 7]).is_some());
    }

    #[test]
    fn test_normalized_keeps_distribution() {
        let scores = EmotionScores([0.1, 0.1, 0.1, 0.4, 0.1, 0.1, 0.1]);
        assert!(scores.is_distribution());
        assert_eq!(scores.normalized(), scores);
    }

    #[test]
    fn test_normalized_softmaxes_logits() {
        let logits = EmotionScores([1.0, -2.0, 0.5, 4.0, 0.0, 3.0, -1.0]);
        assert!(!logits.is_distribution());
        let probs = logits.normalized();
        assert!(probs.is_distribution());
        assert_eq!(probs.argmax().0, Emotion::Happy);
        assert!(probs.0.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_prediction_confidence_is_selected_probability() {
        let scores = EmotionScores([0.05, 0.05, 0.05, 0.05, 0.7, 0.05, 0.05]);
        let p = EmotionPrediction::from_scores(&scores, FaceRect::new(1, 2, 3, 4));
        assert_eq!(p.emotion, Emotion::Sad);
        assert_eq!(p.confidence, scores.get(Emotion::Sad));
    }

    #[test]
    fn test_scores_serialize_as_label_map() {
        let scores = EmotionScores([0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let v = serde_json::to_value(scores).unwrap();
        assert_eq!(v["Happy"], 1.0);
        assert_eq!(v.as_object().unwrap().len(), EMOTION_COUNT);
    }

    #[test]
    fn test_face_rect_bounds() {
        let r = FaceRect::new(10, 20, 30, 40);
        assert_eq!(r.right(), 40);
        assert_eq!(r.bottom(), 60);
        assert!(r.fits_within(40, 60));
        assert!(!r.fits_within(39, 60));
        assert!(!FaceRect::new(0, 0, 0, 5).fits_within(10, 10));
    }

    #[test]
    fn test_face_rect_clamp() {
        let r = FaceRect::new(90, 90, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(FaceRect::new(90, 90, 10, 10)));
        assert_eq!(FaceRect::new(100, 0, 5, 5).clamp_to(100, 100), None);
    }
}
