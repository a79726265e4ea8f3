//! rollcall-core — Face detection and recognition primitives.
//!
//! Detection uses a boosted Haar cascade (Viola–Jones) and recognition uses
//! Local Binary Pattern Histograms, both in pure Rust on 8-bit grayscale.

pub mod cascade;
pub mod detector;
pub mod input;
pub mod recognizer;
pub mod types;

pub use cascade::{CascadeError, HaarCascade};
pub use detector::{detect_faces, CascadeDetector, DetectorParams, FaceDetector};
pub use input::{ImageError, ImageInput};
pub use recognizer::{LbphModel, LbphParams, ModelState, RecognizerError};
pub use types::{BoundingBox, Detection, IdentityId, MatchPolicy, Prediction};
