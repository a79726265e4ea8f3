use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque numeric identity id, owned by the external identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for IdentityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Axis-aligned face box in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw cascade hits merged into this box (0 when ungrouped).
    #[serde(default)]
    pub votes: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, votes: 0 }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Intersection-over-Union between two boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        let inter = x2.saturating_sub(x1) as u64 * y2.saturating_sub(y1) as u64;
        let union = self.area() + other.area() - inter;

        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// Result of matching a face region against the trained model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub identity_id: IdentityId,
    /// Chi-square histogram distance. Lower = more similar.
    pub distance: f64,
}

/// Acceptance policy turning a raw distance into a user-facing confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// A prediction is accepted only when `distance < threshold`.
    pub threshold: f64,
}

pub const DEFAULT_MATCH_THRESHOLD: f64 = 80.0;

impl Default for MatchPolicy {
    fn default() -> Self {
        Self { threshold: DEFAULT_MATCH_THRESHOLD }
    }
}

impl MatchPolicy {
    /// Gate a prediction. Accepted matches report `100 - distance`;
    /// everything else is unknown with confidence 0.
    pub fn gate(&self, prediction: &Prediction) -> (Option<IdentityId>, f64) {
        if prediction.distance < self.threshold {
            let confidence = (100.0 - prediction.distance).clamp(0.0, 100.0);
            (Some(prediction.identity_id), confidence)
        } else {
            (None, 0.0)
        }
    }
}

/// One located face in a recognition frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Matched identity, `None` for unknown faces.
    pub identity_id: Option<IdentityId>,
    pub bbox: BoundingBox,
    /// 0–100, higher = better.
    pub confidence: f64,
    pub display_name: String,
}

impl Detection {
    pub fn is_known(&self) -> bool {
        self.identity_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(0, 0, 100, 100);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(20, 20, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 10, 10);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_gate_accepts_below_threshold() {
        let policy = MatchPolicy::default();
        let p = Prediction { identity_id: IdentityId(7), distance: 35.5 };
        let (id, confidence) = policy.gate(&p);
        assert_eq!(id, Some(IdentityId(7)));
        assert!((confidence - 64.5).abs() < 1e-9);
    }

    #[test]
    fn test_gate_rejects_at_threshold() {
        // distance == threshold is not a match
        let policy = MatchPolicy::default();
        let p = Prediction { identity_id: IdentityId(7), distance: 80.0 };
        assert_eq!(policy.gate(&p), (None, 0.0));
    }

    #[test]
    fn test_gate_custom_threshold() {
        let policy = MatchPolicy { threshold: 50.0 };
        let p = Prediction { identity_id: IdentityId(1), distance: 60.0 };
        assert_eq!(policy.gate(&p), (None, 0.0));
    }
}
