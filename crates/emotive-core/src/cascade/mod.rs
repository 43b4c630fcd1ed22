//! Haar cascade face detector.
//!
//! Loads an OpenCV boosted Haar cascade (`haarcascade_frontalface_default.xml`
//! and friends) and runs a multi-scale sliding-window search over an image
//! pyramid, followed by neighbour grouping.

mod grouping;
mod integral;
mod xml;

pub use grouping::group_rectangles;

use crate::frame::GrayFrame;
use crate::types::FaceRect;
use integral::IntegralImage;
use std::path::Path;
use thiserror::Error;

// --- Detection defaults ---
pub const DEFAULT_SCALE_FACTOR: f64 = 1.1;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 4;
/// Similarity tolerance used when grouping raw hits.
const GROUP_EPS: f64 = 0.2;
/// Pyramid levels above this factor are scanned at every pixel instead of every other.
const DENSE_SCAN_FACTOR: f64 = 2.0;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("failed to read cascade file: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("cascade is malformed: {0}")]
    Malformed(String),
    #[error("<{parent}> is missing <{element}>")]
    MissingElement { parent: String, element: String },
    #[error("<{element}> has invalid value {value:?}")]
    InvalidValue { element: String, value: String },
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
}

/// Knobs for [`CascadeClassifier::detect_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    /// Pyramid step between scales. Must be greater than 1.
    pub scale_factor: f64,
    /// Raw hits a cluster needs (exclusive) to be reported. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest window (width, height) to scan for.
    pub min_size: Option<(u32, u32)>,
    /// Largest window (width, height) to scan for.
    pub max_size: Option<(u32, u32)>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: None,
            max_size: None,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<(), CascadeError> {
        if !(self.scale_factor > 1.0) || !self.scale_factor.is_finite() {
            return Err(CascadeError::InvalidParams(format!(
                "scale factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
            if min.0 > max.0 || min.1 > max.1 {
                return Err(CascadeError::InvalidParams(format!(
                    "min size {min:?} exceeds max size {max:?}"
                )));
            }
        }
        Ok(())
    }
}

/// One rectangle of a Haar feature, in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HaarRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct HaarFeature {
    pub rects: Vec<HaarRect>,
}

/// Decision-tree node. A child value `<= 0` points at leaf `-child`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeNode {
    pub left: i32,
    pub right: i32,
    pub feature: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
pub(crate) struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone)]
pub(crate) struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl Cascade {
    /// Check every tree reference so evaluation can index without bounds failures.
    fn validate(&self) -> Result<(), CascadeError> {
        for (si, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Malformed(format!("stage {si} has no weak classifiers")));
            }
            for wc in &stage.classifiers {
                for node in &wc.nodes {
                    if node.feature >= self.features.len() {
                        return Err(CascadeError::Malformed(format!(
                            "stage {si} references feature {} of {}",
                            node.feature,
                            self.features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child > 0 {
                            (child as usize) < wc.nodes.len()
                        } else {
                            (child.unsigned_abs() as usize) < wc.leaves.len()
                        };
                        if !ok {
                            return Err(CascadeError::Malformed(format!(
                                "stage {si} has a dangling tree reference {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

enum WindowVerdict {
    Accepted,
    RejectedAt(usize),
}

/// A loaded Haar cascade plus the parameters it detects with.
pub struct CascadeClassifier {
    cascade: Cascade,
    params: DetectionParams,
}

impl CascadeClassifier {
    /// Load a cascade XML file from disk with default detection parameters.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::CascadeNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let classifier = Self::from_xml(&text)?;
        tracing::info!(
            path = %path.display(),
            window = ?classifier.window_size(),
            stages = classifier.cascade.stages.len(),
            features = classifier.cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(classifier)
    }

    pub fn from_xml(text: &str) -> Result<Self, CascadeError> {
        Ok(Self {
            cascade: xml::parse_cascade(text)?,
            params: DetectionParams::default(),
        })
    }

    pub fn with_params(mut self, params: DetectionParams) -> Result<Self, CascadeError> {
        params.validate()?;
        self.params = params;
        Ok(self)
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Training window size (width, height).
    pub fn window_size(&self) -> (u32, u32) {
        (self.cascade.window_width, self.cascade.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.cascade.stages.len()
    }

    /// Detect with the classifier's own parameters.
    pub fn detect(&self, frame: &GrayFrame) -> Vec<FaceRect> {
        self.detect_with(frame, &self.params)
    }

    /// Detect faces, returning grouped rectangles in the source frame's coordinates.
    ///
    /// Rectangles are clamped to the frame. Order follows the first raw hit of
    /// each group (smallest scale, then top-to-bottom, left-to-right).
    pub fn detect_with(&self, frame: &GrayFrame, params: &DetectionParams) -> Vec<FaceRect> {
        let raw = self.detect_raw(frame, params);
        let grouped = group_rectangles(&raw, params.min_neighbors, GROUP_EPS);
        let faces: Vec<FaceRect> = grouped
            .iter()
            .filter_map(|r| r.clamp_to(frame.width, frame.height))
            .collect();
        tracing::debug!(raw = raw.len(), faces = faces.len(), "cascade detection done");
        faces
    }

    /// Pyramid scale factors that fit the frame and the size limits.
    fn scales(&self, width: u32, height: u32, params: &DetectionParams) -> Vec<f64> {
        let (ww, wh) = self.window_size();
        let mut scales = Vec::new();
        if params.scale_factor <= 1.0 || !params.scale_factor.is_finite() {
            return scales;
        }

        let mut factor = 1.0f64;
        loop {
            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;
            let scaled_w = (width as f64 / factor).round() as u32;
            let scaled_h = (height as f64 / factor).round() as u32;

            // A level exactly the window's size still holds one window.
            if scaled_w < ww || scaled_h < wh {
                break;
            }
            if let Some((max_w, max_h)) = params.max_size {
                if win_w > max_w || win_h > max_h {
                    break;
                }
            }
            let too_small = params
                .min_size
                .is_some_and(|(min_w, min_h)| win_w < min_w || win_h < min_h);
            if !too_small {
                scales.push(factor);
            }
            factor *= params.scale_factor;
        }
        scales
    }

    /// Every accepted window across all pyramid levels, ungrouped.
    fn detect_raw(&self, frame: &GrayFrame, params: &DetectionParams) -> Vec<FaceRect> {
        let (ww, wh) = self.window_size();
        let mut hits = Vec::new();

        for factor in self.scales(frame.width, frame.height, params) {
            let scaled_w = (frame.width as f64 / factor).round() as u32;
            let scaled_h = (frame.height as f64 / factor).round() as u32;
            let level = if scaled_w == frame.width && scaled_h == frame.height {
                IntegralImage::new(frame)
            } else {
                IntegralImage::new(&frame.resize(scaled_w, scaled_h))
            };

            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;
            let step = if factor > DENSE_SCAN_FACTOR { 1 } else { 2 };
            let max_x = (scaled_w - ww) as usize;
            let max_y = (scaled_h - wh) as usize;

            let mut y = 0usize;
            while y <= max_y {
                let mut x = 0usize;
                while x <= max_x {
                    match self.evaluate_window(&level, x, y) {
                        WindowVerdict::Accepted => hits.push(FaceRect::new(
                            (x as f64 * factor).round() as u32,
                            (y as f64 * factor).round() as u32,
                            win_w,
                            win_h,
                        )),
                        // A first-stage reject is a strong negative; skip the neighbour too.
                        WindowVerdict::RejectedAt(0) => x += step,
                        WindowVerdict::RejectedAt(_) => {}
                    }
                    x += step;
                }
                y += step;
            }
        }
        hits
    }

    fn evaluate_window(&self, ii: &IntegralImage, x: usize, y: usize) -> WindowVerdict {
        let ww = self.cascade.window_width as usize;
        let wh = self.cascade.window_height as usize;
        let inv_norm = ii.inv_variance_norm(x + 1, y + 1, ww - 2, wh - 2);

        for (si, stage) in self.cascade.stages.iter().enumerate() {
            let mut sum = 0.0f64;
            for wc in &stage.classifiers {
                let mut idx: i32 = 0;
                loop {
                    let node = &wc.nodes[idx as usize];
                    let value = self.feature_value(node.feature, ii, x, y) * inv_norm;
                    idx = if value < node.threshold as f64 {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break;
                    }
                }
                sum += wc.leaves[idx.unsigned_abs() as usize] as f64;
            }
            if sum < stage.threshold as f64 {
                return WindowVerdict::RejectedAt(si);
            }
        }
        WindowVerdict::Accepted
    }

    fn feature_value(&self, feature: usize, ii: &IntegralImage, x: usize, y: usize) -> f64 {
        self.cascade.features[feature]
            .rects
            .iter()
            .map(|r| {
                let s = ii.rect_sum(
                    x + r.x as usize,
                    y + r.y as usize,
                    r.width as usize,
                    r.height as usize,
                );
                s as f64 * r.weight as f64
            })
            .sum()
    }
}

/// One-stage 8x8 cascade that fires on windows whose right half is brighter
/// than the left half.
#[cfg(test)]
pub(crate) const TEST_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>8</height>
  <width>8</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 8 8 -1.</_>
        <_>
          4 0 4 8 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;
