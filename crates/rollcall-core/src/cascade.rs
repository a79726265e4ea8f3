//! Boosted Haar cascade — model types, OpenCV XML loader, window evaluation.
//!
//! Supports the "new" OpenCV cascade layout (`<cascade>` root, BOOST stages,
//! HAAR features, depth-1 stump classifiers), which is what the stock
//! `haarcascade_frontalface_*.xml` files ship as. Tilted features and
//! tree-shaped weak classifiers are rejected at load time.

use image::GrayImage;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

const MAX_RECTS_PER_FEATURE: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// One weighted rectangle of a Haar-like feature, in window coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Depth-1 decision tree: `left` when the feature response is below
/// `threshold` (scaled by the window's variance norm), otherwise `right`.
#[derive(Debug, Clone, PartialEq)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub stumps: Vec<Stump>,
}

/// A validated Haar cascade ready for evaluation.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    features: Vec<HaarFeature>,
    stages: Vec<Stage>,
}

impl HaarCascade {
    pub fn new(
        window_width: u32,
        window_height: u32,
        features: Vec<HaarFeature>,
        stages: Vec<Stage>,
    ) -> Result<Self, CascadeError> {
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Malformed(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }
        if stages.is_empty() {
            return Err(CascadeError::Malformed("cascade has no stages".into()));
        }

        for (i, feature) in features.iter().enumerate() {
            if feature.rects.is_empty() || feature.rects.len() > MAX_RECTS_PER_FEATURE {
                return Err(CascadeError::Malformed(format!(
                    "feature {i} has {} rects, expected 1..={MAX_RECTS_PER_FEATURE}",
                    feature.rects.len()
                )));
            }
            for r in &feature.rects {
                if r.x + r.width > window_width || r.y + r.height > window_height {
                    return Err(CascadeError::Malformed(format!(
                        "feature {i} rect {},{} {}x{} exceeds the {window_width}x{window_height} window",
                        r.x, r.y, r.width, r.height
                    )));
                }
            }
        }

        for (s, stage) in stages.iter().enumerate() {
            if let Some(stump) = stage.stumps.iter().find(|st| st.feature >= features.len()) {
                return Err(CascadeError::Malformed(format!(
                    "stage {s} references feature {} of {}",
                    stump.feature,
                    features.len()
                )));
            }
        }

        Ok(Self {
            window_width,
            window_height,
            features,
            stages,
        })
    }

    /// Load an OpenCV cascade XML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse an OpenCV cascade XML document.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut builder = XmlBuilder::default();
        let mut path: Vec<String> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    builder.open(&path);
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(t) => {
                    let text = t.unescape()?;
                    builder.text(&path, text.trim())?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        builder.finish()
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage on the window whose top-left corner is (`x`, `y`).
    /// The window must lie inside the integral image.
    pub(crate) fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
        // Variance normalisation over the window minus a one-pixel border.
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = ii.sum(x + 1, y + 1, nw, nh) as f64;
        let sqsum = ii.sqsum(x + 1, y + 1, nw, nh) as f64;
        let nf = area * sqsum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut acc = 0.0f64;
            for stump in &stage.stumps {
                let response: f64 = self.features[stump.feature]
                    .rects
                    .iter()
                    .map(|r| r.weight as f64 * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
                    .sum();
                acc += if response < stump.threshold as f64 * nf {
                    stump.left as f64
                } else {
                    stump.right as f64
                };
            }
            if acc < stage.threshold as f64 {
                return false;
            }
        }
        true
    }
}

/// Summed-area tables for pixel values and squared pixel values.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    pub(crate) fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = gray.get_pixel(x as u32, y as u32).0[0] as u64;
                row += p;
                row_sq += p * p;
                let i = (y + 1) * stride + (x + 1);
                sum[i] = sum[i - stride] + row;
                sqsum[i] = sqsum[i - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn corners(&self, table: &[u64], x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let s = self.stride;
        table[y1 * s + x1] + table[y0 * s + x0] - table[y0 * s + x1] - table[y1 * s + x0]
    }

    pub(crate) fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        self.corners(&self.sum, x, y, w, h)
    }

    pub(crate) fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        self.corners(&self.sqsum, x, y, w, h)
    }
}

#[derive(Debug, Default)]
struct RawStump {
    nodes: Option<(usize, f32)>,
    leaves: Option<(f32, f32)>,
}

#[derive(Debug, Default)]
struct RawStage {
    threshold: Option<f32>,
    stumps: Vec<RawStump>,
}

/// Accumulates cascade parts while walking the XML event stream.
#[derive(Debug, Default)]
struct XmlBuilder {
    width: Option<u32>,
    height: Option<u32>,
    stages: Vec<RawStage>,
    features: Vec<HaarFeature>,
}

fn ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

fn parse_numbers(text: &str) -> Result<Vec<f32>, CascadeError> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f32>()
                .map_err(|_| CascadeError::Malformed(format!("not a number: {tok:?}")))
        })
        .collect()
}

fn parse_dimension(text: &str) -> Result<u32, CascadeError> {
    text.parse()
        .map_err(|_| CascadeError::Malformed(format!("bad window dimension: {text:?}")))
}

impl XmlBuilder {
    fn open(&mut self, path: &[String]) {
        if ends_with(path, &["cascade", "stages", "_"]) {
            self.stages.push(RawStage::default());
        } else if ends_with(path, &["stages", "_", "weakClassifiers", "_"]) {
            if let Some(stage) = self.stages.last_mut() {
                stage.stumps.push(RawStump::default());
            }
        } else if ends_with(path, &["cascade", "features", "_"]) {
            self.features.push(HaarFeature::default());
        }
    }

    fn text(&mut self, path: &[String], text: &str) -> Result<(), CascadeError> {
        if ends_with(path, &["cascade", "width"]) {
            self.width = Some(parse_dimension(text)?);
        } else if ends_with(path, &["cascade", "height"]) {
            self.height = Some(parse_dimension(text)?);
        } else if ends_with(path, &["cascade", "stageType"]) {
            if text != "BOOST" {
                return Err(CascadeError::Unsupported(format!("stage type {text}")));
            }
        } else if ends_with(path, &["cascade", "featureType"]) {
            if text != "HAAR" {
                return Err(CascadeError::Unsupported(format!("feature type {text}")));
            }
        } else if ends_with(path, &["stages", "_", "stageThreshold"]) {
            let stage = self.current_stage()?;
            stage.threshold = Some(single(parse_numbers(text)?, "stageThreshold")?);
        } else if ends_with(path, &["weakClassifiers", "_", "internalNodes"]) {
            let nodes = parse_numbers(text)?;
            if nodes.len() != 4 {
                return Err(CascadeError::Unsupported(format!(
                    "weak classifier with {} internal node values (only stumps are supported)",
                    nodes.len()
                )));
            }
            if nodes[2] < 0.0 {
                return Err(CascadeError::Malformed("negative feature index".into()));
            }
            self.current_stump()?.nodes = Some((nodes[2] as usize, nodes[3]));
        } else if ends_with(path, &["weakClassifiers", "_", "leafValues"]) {
            let leaves = parse_numbers(text)?;
            if leaves.len() != 2 {
                return Err(CascadeError::Unsupported(format!(
                    "weak classifier with {} leaf values (only stumps are supported)",
                    leaves.len()
                )));
            }
            self.current_stump()?.leaves = Some((leaves[0], leaves[1]));
        } else if ends_with(path, &["features", "_", "rects", "_"]) {
            let values = parse_numbers(text)?;
            if values.len() != 5 || values[..4].iter().any(|v| *v < 0.0) {
                return Err(CascadeError::Malformed(format!("bad feature rect: {text:?}")));
            }
            let feature = self
                .features
                .last_mut()
                .ok_or_else(|| CascadeError::Malformed("rect outside of a feature".into()))?;
            feature.rects.push(WeightedRect {
                x: values[0] as u32,
                y: values[1] as u32,
                width: values[2] as u32,
                height: values[3] as u32,
                weight: values[4],
            });
        } else if ends_with(path, &["features", "_", "tilted"]) && text != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
        Ok(())
    }

    fn current_stage(&mut self) -> Result<&mut RawStage, CascadeError> {
        self.stages
            .last_mut()
            .ok_or_else(|| CascadeError::Malformed("stage value outside of a stage".into()))
    }

    fn current_stump(&mut self) -> Result<&mut RawStump, CascadeError> {
        self.current_stage()?
            .stumps
            .last_mut()
            .ok_or_else(|| CascadeError::Malformed("weak classifier value outside of a classifier".into()))
    }

    fn finish(self) -> Result<HaarCascade, CascadeError> {
        let width = self
            .width
            .ok_or_else(|| CascadeError::Malformed("missing <cascade><width> (old-style cascades are not supported)".into()))?;
        let height = self
            .height
            .ok_or_else(|| CascadeError::Malformed("missing <cascade><height>".into()))?;

        let mut stages = Vec::with_capacity(self.stages.len());
        for (s, raw) in self.stages.into_iter().enumerate() {
            let threshold = raw
                .threshold
                .ok_or_else(|| CascadeError::Malformed(format!("stage {s} has no threshold")))?;
            let mut stumps = Vec::with_capacity(raw.stumps.len());
            for (i, stump) in raw.stumps.into_iter().enumerate() {
                match (stump.nodes, stump.leaves) {
                    (Some((feature, thr)), Some((left, right))) => stumps.push(Stump {
                        feature,
                        threshold: thr,
                        left,
                        right,
                    }),
                    _ => {
                        return Err(CascadeError::Malformed(format!(
                            "stage {s} weak classifier {i} is incomplete"
                        )))
                    }
                }
            }
            stages.push(Stage { threshold, stumps });
        }

        HaarCascade::new(width, height, self.features, stages)
    }
}

fn single(values: Vec<f32>, what: &str) -> Result<f32, CascadeError> {
    match values.as_slice() {
        [v] => Ok(*v),
        _ => Err(CascadeError::Malformed(format!("{what} expects one value"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    const TINY_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams><maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams><maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>0 -1 0 8.0000000000000004e-01</internalNodes>
          <leafValues>-1. 1.</leafValues>
        </_>
      </weakClassifiers>
    </_>
  </stages>
  <features>
    <_>
      <rects>
        <_>0 0 24 24 -1.</_>
        <_>0 12 24 12 2.</_>
      </rects>
      <tilted>0</tilted>
    </_>
  </features>
</cascade>
</opencv_storage>
"#;

    #[test]
    fn test_parse_tiny_cascade() {
        let cascade = HaarCascade::from_xml(TINY_CASCADE).unwrap();
        assert_eq!(cascade.window_size(), (24, 24));
        assert_eq!(cascade.stage_count(), 1);
        assert_eq!(cascade.features[0].rects.len(), 2);
        assert_eq!(cascade.features[0].rects[1].y, 12);
        assert_eq!(cascade.features[0].rects[1].weight, 2.0);
        let stump = &cascade.stages[0].stumps[0];
        assert_eq!(stump.feature, 0);
        assert!((stump.threshold - 0.8).abs() < 1e-6);
        assert_eq!((stump.left, stump.right), (-1.0, 1.0));
    }

    #[test]
    fn test_reject_tilted_features() {
        let xml = TINY_CASCADE.replace("<tilted>0</tilted>", "<tilted>1</tilted>");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_reject_tree_classifiers() {
        let xml = TINY_CASCADE.replace(
            "<internalNodes>0 -1 0 8.0000000000000004e-01</internalNodes>",
            "<internalNodes>1 -1 0 0.5 0 -2 0 0.1</internalNodes>",
        );
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_reject_lbp_cascade() {
        let xml = TINY_CASCADE.replace("<featureType>HAAR</featureType>", "<featureType>LBP</featureType>");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
    }

    #[test]
    fn test_reject_dangling_feature_index() {
        let xml = TINY_CASCADE.replace("0 -1 0 8.0000000000000004e-01", "0 -1 3 8.0000000000000004e-01");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
    }

    #[test]
    fn test_reject_missing_window() {
        let xml = TINY_CASCADE.replace("<width>24</width>", "");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            HaarCascade::from_file("/nonexistent/cascade.xml"),
            Err(CascadeError::NotFound(_))
        ));
    }

    #[test]
    fn test_integral_image_sums() {
        let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x + 4 * y) as u8]));
        let ii = IntegralImage::new(&gray);
        // Whole image: 0 + 1 + ... + 11
        assert_eq!(ii.sum(0, 0, 4, 3), 66);
        // Bottom-right 2x2: 6 + 7 + 10 + 11
        assert_eq!(ii.sum(2, 1, 2, 2), 34);
        assert_eq!(ii.sqsum(2, 1, 2, 2), 36 + 49 + 100 + 121);
    }

    #[test]
    fn test_evaluate_dark_over_bright() {
        let cascade = HaarCascade::from_xml(TINY_CASCADE).unwrap();

        // Dark top half over bright bottom half passes the stump.
        let face = GrayImage::from_fn(24, 24, |_, y| Luma([if y < 12 { 40 } else { 200 }]));
        assert!(cascade.evaluate(&IntegralImage::new(&face), 0, 0));

        // Inverted contrast fails.
        let inverted = GrayImage::from_fn(24, 24, |_, y| Luma([if y < 12 { 200 } else { 40 }]));
        assert!(!cascade.evaluate(&IntegralImage::new(&inverted), 0, 0));

        // Flat window has no response at all.
        let flat = GrayImage::from_pixel(24, 24, Luma([128]));
        assert!(!cascade.evaluate(&IntegralImage::new(&flat), 0, 0));
    }
}
