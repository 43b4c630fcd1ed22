//! OpenCV cascade XML reader.
//!
//! Builds a small element tree with quick-xml, then walks the
//! `<opencv_storage><cascade>` layout written by `opencv_traincascade`.

use super::{Cascade, CascadeError, HaarFeature, HaarRect, Stage, TreeNode, WeakClassifier};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::str::FromStr;

/// OpenCV subtracts this from every stage threshold at load time.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

/// Values per internal node for HAAR features: left, right, feature index, threshold.
const NODE_FIELDS: usize = 4;

/// Upper bound on rectangles per Haar feature.
const MAX_FEATURE_RECTS: usize = 3;

#[derive(Debug, Default)]
pub(crate) struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&XmlNode, CascadeError> {
        self.child(name).ok_or_else(|| CascadeError::MissingElement {
            parent: self.name.clone(),
            element: name.to_string(),
        })
    }

    /// Sequence entries, which OpenCV writes as `<_>` elements.
    fn items(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter(|c| c.name == "_")
    }

    fn value<T: FromStr>(&self) -> Result<T, CascadeError> {
        let text = self.text.trim();
        text.parse().map_err(|_| CascadeError::InvalidValue {
            element: self.name.clone(),
            value: text.to_string(),
        })
    }

    fn tokens(&self) -> impl Iterator<Item = &str> {
        self.text.split_whitespace()
    }
}

fn parse_token<T: FromStr>(element: &str, token: &str) -> Result<T, CascadeError> {
    token.parse().map_err(|_| CascadeError::InvalidValue {
        element: element.to_string(),
        value: token.to_string(),
    })
}

/// Parse a whole document into a tree rooted at a nameless document node.
pub(crate) fn parse_tree(text: &str) -> Result<XmlNode, CascadeError> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlNode> = vec![XmlNode::default()];

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                stack.push(XmlNode {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Default::default()
                });
            }
            Event::Empty(e) => {
                let node = XmlNode {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Default::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    if !top.text.is_empty() {
                        top.text.push(' ');
                    }
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::End(_) => {
                // The document node never gets an End event, so depth > 1 here.
                if stack.len() < 2 {
                    return Err(CascadeError::Malformed("unbalanced closing tag".into()));
                }
                if let Some(node) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(CascadeError::Malformed("unexpected end of document".into()));
    }
    stack
        .pop()
        .ok_or_else(|| CascadeError::Malformed("empty document".into()))
}

/// Parse an OpenCV new-format Haar cascade.
pub(crate) fn parse_cascade(text: &str) -> Result<Cascade, CascadeError> {
    let doc = parse_tree(text)?;
    let storage = doc.require("opencv_storage")?;

    let Some(root) = storage.child("cascade") else {
        // Old-format files name the root after the cascade and carry a <size> element.
        return Err(CascadeError::Unsupported(
            "old-style cascade layout (no <cascade> element)".into(),
        ));
    };

    let stage_type = root.require("stageType")?.text.trim().to_string();
    if stage_type != "BOOST" {
        return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
    }
    let feature_type = root.require("featureType")?.text.trim().to_string();
    if feature_type != "HAAR" {
        return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
    }

    let window_width: u32 = root.require("width")?.value()?;
    let window_height: u32 = root.require("height")?.value()?;
    if window_width < 3 || window_height < 3 {
        return Err(CascadeError::Malformed(format!(
            "window {window_width}x{window_height} is too small"
        )));
    }

    let stages = root
        .require("stages")?
        .items()
        .map(parse_stage)
        .collect::<Result<Vec<_>, _>>()?;
    if stages.is_empty() {
        return Err(CascadeError::Malformed("cascade has no stages".into()));
    }

    if let Some(declared) = root.child("stageNum") {
        let declared: usize = declared.value()?;
        if declared != stages.len() {
            tracing::warn!(declared, found = stages.len(), "cascade stageNum does not match stage list");
        }
    }

    let features = root
        .require("features")?
        .items()
        .map(|f| parse_feature(f, window_width, window_height))
        .collect::<Result<Vec<_>, _>>()?;

    let cascade = Cascade {
        window_width,
        window_height,
        stages,
        features,
    };
    cascade.validate()?;
    Ok(cascade)
}

fn parse_stage(node: &XmlNode) -> Result<Stage, CascadeError> {
    let threshold: f32 = node.require("stageThreshold")?.value()?;
    let classifiers = node
        .require("weakClassifiers")?
        .items()
        .map(parse_weak_classifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(node: &XmlNode) -> Result<WeakClassifier, CascadeError> {
    let internal = node.require("internalNodes")?;
    let tokens: Vec<&str> = internal.tokens().collect();
    if tokens.is_empty() || tokens.len() % NODE_FIELDS != 0 {
        return Err(CascadeError::Malformed(format!(
            "internalNodes has {} values, expected a multiple of {NODE_FIELDS}",
            tokens.len()
        )));
    }

    let nodes = tokens
        .chunks(NODE_FIELDS)
        .map(|chunk| -> Result<TreeNode, CascadeError> {
            Ok(TreeNode {
                left: parse_token("internalNodes", chunk[0])?,
                right: parse_token("internalNodes", chunk[1])?,
                feature: parse_token("internalNodes", chunk[2])?,
                threshold: parse_token("internalNodes", chunk[3])?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let leaves_node = node.require("leafValues")?;
    let leaves = leaves_node
        .tokens()
        .map(|t| parse_token("leafValues", t))
        .collect::<Result<Vec<f32>, _>>()?;

    Ok(WeakClassifier { nodes, leaves })
}

fn parse_feature(node: &XmlNode, window_width: u32, window_height: u32) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node.child("tilted") {
        let tilted: i32 = tilted.value()?;
        if tilted != 0 {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let mut rects = Vec::with_capacity(MAX_FEATURE_RECTS);
    for r in node.require("rects")?.items() {
        let tokens: Vec<&str> = r.tokens().collect();
        if tokens.len() != 5 {
            return Err(CascadeError::Malformed(format!(
                "feature rect needs 5 values, got {}",
                tokens.len()
            )));
        }
        let rect = HaarRect {
            x: parse_token("rects", tokens[0])?,
            y: parse_token("rects", tokens[1])?,
            width: parse_token("rects", tokens[2])?,
            height: parse_token("rects", tokens[3])?,
            weight: parse_token("rects", tokens[4])?,
        };
        if rect.x + rect.width > window_width || rect.y + rect.height > window_height {
            return Err(CascadeError::Malformed(format!(
                "feature rect {rect:?} exceeds the {window_width}x{window_height} window"
            )));
        }
        rects.push(rect);
    }

    if rects.is_empty() || rects.len() > MAX_FEATURE_RECTS {
        return Err(CascadeError::Malformed(format!(
            "Haar feature has {} rects",
            rects.len()
        )));
    }
    Ok(HaarFeature { rects })
}
