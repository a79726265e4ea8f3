//! Viola–Jones face detector over a boosted Haar cascade.
//!
//! Scans an image pyramid with the cascade window, then merges the raw hits
//! by neighbour voting so that each face yields one box.

use crate::cascade::{CascadeError, HaarCascade, IntegralImage};
use crate::input::to_grayscale;
use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

// --- Named constants (no magic numbers) ---
pub const DEFAULT_SCALE_FACTOR: f32 = 1.1;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 5;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 30;
/// Relative tolerance used when deciding that two hits describe the same face.
const GROUP_EPS: f32 = 0.2;

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f32,
    /// A grouped box needs strictly more raw hits than this to survive.
    /// Zero disables grouping and returns raw hits.
    pub min_neighbors: u32,
    /// Smallest face (square side, pixels) worth reporting.
    pub min_face_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
        }
    }
}

/// Pluggable face detection backend.
pub trait FaceDetector: Send + Sync {
    /// Locate faces in a grayscale image. Zero faces is an empty result.
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// Convert `image` to grayscale and run `detector` on it.
pub fn detect_faces(detector: &dyn FaceDetector, image: &DynamicImage) -> (Vec<BoundingBox>, GrayImage) {
    let gray = to_grayscale(image);
    let faces = detector.detect(&gray);
    tracing::debug!(
        width = gray.width(),
        height = gray.height(),
        faces = faces.len(),
        "face detection pass"
    );
    (faces, gray)
}

/// Haar-cascade detector.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Self {
        let params = DetectorParams {
            scale_factor: if params.scale_factor > 1.0 {
                params.scale_factor
            } else {
                tracing::warn!(
                    scale_factor = params.scale_factor,
                    "scale factor must exceed 1.0; using default"
                );
                DEFAULT_SCALE_FACTOR
            },
            ..params
        };
        Self { cascade, params }
    }

    /// Load an OpenCV cascade XML file.
    pub fn load(cascade_path: impl AsRef<Path>, params: DetectorParams) -> Result<Self, CascadeError> {
        Ok(Self::new(HaarCascade::from_file(cascade_path)?, params))
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Every window the cascade accepts, in original image coordinates.
    fn raw_hits(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let (img_w, img_h) = gray.dimensions();
        let (win_w, win_h) = self.cascade.window_size();
        let mut hits = Vec::new();

        let mut factor = 1.0f32;
        loop {
            let scaled_w = (img_w as f32 / factor).round() as u32;
            let scaled_h = (img_h as f32 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            let window_w = (win_w as f32 * factor).round() as u32;
            let window_h = (win_h as f32 * factor).round() as u32;
            if window_w >= self.params.min_face_size && window_h >= self.params.min_face_size {
                let scaled = if factor == 1.0 {
                    gray.clone()
                } else {
                    image::imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle)
                };
                let ii = IntegralImage::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };

                for y in (0..=scaled_h - win_h).step_by(step) {
                    for x in (0..=scaled_w - win_w).step_by(step) {
                        if self.cascade.evaluate(&ii, x, y) {
                            hits.push(BoundingBox::new(
                                ((x as f32 * factor).round() as u32).min(img_w - 1),
                                ((y as f32 * factor).round() as u32).min(img_h - 1),
                                window_w,
                                window_h,
                            ));
                        }
                    }
                }
            }

            factor *= self.params.scale_factor;
        }

        hits
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let hits = self.raw_hits(gray);
        let raw = hits.len();
        let (w, h) = gray.dimensions();
        let faces: Vec<BoundingBox> = group_rectangles(hits, self.params.min_neighbors, GROUP_EPS)
            .into_iter()
            .map(|mut b| {
                // Averaged boxes can poke past the border.
                b.width = b.width.min(w - b.x.min(w));
                b.height = b.height.min(h - b.y.min(h));
                b
            })
            .filter(|b| b.width > 0 && b.height > 0)
            .collect();
        tracing::debug!(raw_hits = raw, faces = faces.len(), "cascade scan complete");
        faces
    }
}

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Merge overlapping raw hits into averaged boxes.
///
/// Hits are clustered transitively by [`similar`]; each cluster becomes its
/// average box with `votes` = cluster size. Clusters with `votes <= threshold`
/// are dropped, as are weak clusters lying inside a stronger one.
/// A threshold of zero returns the hits unchanged.
pub fn group_rectangles(hits: Vec<BoundingBox>, threshold: u32, eps: f32) -> Vec<BoundingBox> {
    if threshold == 0 || hits.is_empty() {
        return hits;
    }

    let mut parent: Vec<usize> = (0..hits.len()).collect();
    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Accumulate per-cluster sums in first-seen order.
    let mut slot_of_root = vec![usize::MAX; hits.len()];
    let mut sums: Vec<[u64; 4]> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let root = find(&mut parent, i);
        if slot_of_root[root] == usize::MAX {
            slot_of_root[root] = sums.len();
            sums.push([0; 4]);
            counts.push(0);
        }
        let slot = slot_of_root[root];
        sums[slot][0] += hit.x as u64;
        sums[slot][1] += hit.y as u64;
        sums[slot][2] += hit.width as u64;
        sums[slot][3] += hit.height as u64;
        counts[slot] += 1;
    }

    let clusters: Vec<BoundingBox> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            BoundingBox {
                x: avg(s[0]),
                y: avg(s[1]),
                width: avg(s[2]),
                height: avg(s[3]),
                votes: n,
            }
        })
        .collect();

    let strong: Vec<&BoundingBox> = clusters.iter().filter(|c| c.votes > threshold).collect();

    strong
        .iter()
        .enumerate()
        .filter(|&(i, r1)| {
            !strong.iter().enumerate().any(|(j, r2)| {
                if i == j {
                    return false;
                }
                let dx = (r2.width as f32 * eps).round() as i64;
                let dy = (r2.height as f32 * eps).round() as i64;
                let inside = r1.x as i64 >= r2.x as i64 - dx
                    && r1.y as i64 >= r2.y as i64 - dy
                    && r1.right() as i64 <= r2.right() as i64 + dx
                    && r1.bottom() as i64 <= r2.bottom() as i64 + dy;
                inside && (r2.votes > r1.votes.max(3) || r1.votes < 3)
            })
        })
        .map(|(_, r)| **r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{HaarFeature, Stage, Stump, WeightedRect};
    use image::Luma;

    /// One-stump cascade firing on "dark band above bright band" windows.
    fn band_cascade() -> HaarCascade {
        let feature = HaarFeature {
            rects: vec![
                WeightedRect { x: 0, y: 0, width: 24, height: 24, weight: -1.0 },
                WeightedRect { x: 0, y: 12, width: 24, height: 12, weight: 2.0 },
            ],
        };
        let stage = Stage {
            threshold: 0.0,
            stumps: vec![Stump { feature: 0, threshold: 0.8, left: -1.0, right: 1.0 }],
        };
        HaarCascade::new(24, 24, vec![feature], vec![stage]).unwrap()
    }

    /// 60x60 synthetic "face" (dark upper half, bright lower half) on a flat background.
    fn paint_face(img: &mut GrayImage, left: u32, top: u32) {
        for y in top..top + 60 {
            for x in left..left + 60 {
                img.put_pixel(x, y, Luma([if y < top + 30 { 40 } else { 200 }]));
            }
        }
    }

    fn overlaps(a: &BoundingBox, b: &BoundingBox) -> bool {
        a.iou(b) > 0.0
    }

    fn test_params() -> DetectorParams {
        DetectorParams { scale_factor: 1.25, min_neighbors: 2, min_face_size: 24 }
    }

    #[test]
    fn test_default_params() {
        let p = DetectorParams::default();
        assert_eq!(p.scale_factor, 1.1);
        assert_eq!(p.min_neighbors, 5);
        assert_eq!(p.min_face_size, 30);
    }

    #[test]
    fn test_flat_image_has_no_faces() {
        let detector = CascadeDetector::new(band_cascade(), test_params());
        let gray = GrayImage::from_pixel(160, 120, Luma([128]));
        assert!(detector.detect(&gray).is_empty());
    }

    #[test]
    fn test_image_smaller_than_window() {
        let detector = CascadeDetector::new(band_cascade(), test_params());
        let gray = GrayImage::from_pixel(20, 20, Luma([128]));
        assert!(detector.detect(&gray).is_empty());
    }

    #[test]
    fn test_single_synthetic_face_is_found() {
        let detector = CascadeDetector::new(band_cascade(), test_params());
        let mut gray = GrayImage::from_pixel(200, 160, Luma([128]));
        paint_face(&mut gray, 70, 50);
        let face = BoundingBox::new(70, 50, 60, 60);

        let found = detector.detect(&gray);
        assert!(!found.is_empty());
        assert!(found.iter().all(|b| overlaps(b, &face)), "stray detections: {found:?}");
        assert!(found.iter().all(|b| b.votes > 2));
    }

    #[test]
    fn test_two_faces_are_both_found() {
        let detector = CascadeDetector::new(band_cascade(), test_params());
        let mut gray = GrayImage::from_pixel(320, 120, Luma([128]));
        paint_face(&mut gray, 20, 30);
        paint_face(&mut gray, 230, 30);
        let left = BoundingBox::new(20, 30, 60, 60);
        let right = BoundingBox::new(230, 30, 60, 60);

        let found = detector.detect(&gray);
        assert!(found.iter().any(|b| overlaps(b, &left)));
        assert!(found.iter().any(|b| overlaps(b, &right)));
    }

    #[test]
    fn test_min_face_size_above_image_suppresses_everything() {
        let params = DetectorParams { min_face_size: 500, ..test_params() };
        let detector = CascadeDetector::new(band_cascade(), params);
        let mut gray = GrayImage::from_pixel(200, 160, Luma([128]));
        paint_face(&mut gray, 70, 50);
        assert!(detector.detect(&gray).is_empty());
    }

    #[test]
    fn test_invalid_scale_factor_falls_back() {
        let params = DetectorParams { scale_factor: 1.0, ..test_params() };
        let detector = CascadeDetector::new(band_cascade(), params);
        assert_eq!(detector.params().scale_factor, DEFAULT_SCALE_FACTOR);
    }

    #[test]
    fn test_group_merges_similar_hits() {
        let hits = vec![
            BoundingBox::new(100, 100, 50, 50),
            BoundingBox::new(102, 101, 50, 50),
            BoundingBox::new(98, 99, 52, 52),
            BoundingBox::new(400, 400, 50, 50),
        ];
        let grouped = group_rectangles(hits, 2, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        let b = grouped[0];
        assert_eq!(b.votes, 3);
        assert_eq!((b.x, b.y, b.width, b.height), (100, 100, 51, 51));
    }

    #[test]
    fn test_group_threshold_is_strict() {
        let hits = vec![BoundingBox::new(10, 10, 40, 40), BoundingBox::new(11, 10, 40, 40)];
        assert!(group_rectangles(hits.clone(), 2, GROUP_EPS).is_empty());
        assert_eq!(group_rectangles(hits, 1, GROUP_EPS).len(), 1);
    }

    #[test]
    fn test_group_zero_threshold_returns_raw_hits() {
        let hits = vec![BoundingBox::new(10, 10, 40, 40), BoundingBox::new(11, 10, 40, 40)];
        assert_eq!(group_rectangles(hits, 0, GROUP_EPS).len(), 2);
    }

    #[test]
    fn test_group_drops_weak_box_inside_strong_box() {
        let mut hits = vec![BoundingBox::new(100, 100, 100, 100); 6];
        // Two hits of a much smaller box nested inside the big one.
        hits.push(BoundingBox::new(130, 130, 30, 30));
        hits.push(BoundingBox::new(131, 130, 30, 30));
        let grouped = group_rectangles(hits, 1, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width, 100);
        assert_eq!(grouped[0].votes, 6);
    }

    #[test]
    fn test_group_empty() {
        assert!(group_rectangles(vec![], 3, GROUP_EPS).is_empty());
    }
}
