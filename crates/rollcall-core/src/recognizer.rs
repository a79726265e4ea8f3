//! Local Binary Pattern Histogram (LBPH) face recognizer.
//!
//! Each face region becomes a grid of per-cell LBP histograms; prediction is
//! nearest neighbour over every training histogram under the alternative
//! chi-square distance. The trained state persists to a single checksummed
//! artifact.

use crate::types::{IdentityId, Prediction};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// --- Named constants ---
const ARTIFACT_MAGIC: &[u8; 8] = b"RCLBPH01";
const DIGEST_LEN: usize = 32;
const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model is not trained")]
    ModelNotTrained,
    #[error("face region {width}x{height} is too small for a {grid_x}x{grid_y} LBP grid")]
    RegionTooSmall {
        width: u32,
        height: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("model artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("model artifact i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt model artifact: {0}")]
    Corrupt(String),
    #[error("model encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// LBPH operator and grid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), RecognizerError> {
        if self.radius == 0 {
            return Err(RecognizerError::InvalidParams("radius must be >= 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(RecognizerError::InvalidParams(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(RecognizerError::InvalidParams("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    /// Number of distinct LBP codes.
    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of one spatial histogram.
    pub fn histogram_len(&self) -> usize {
        self.bins() * (self.grid_x * self.grid_y) as usize
    }
}

/// Trained LBPH state: one spatial histogram per training sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphParams,
    labels: Vec<IdentityId>,
    histograms: Vec<Vec<f32>>,
}

/// Process-wide recognizer state. Training always produces a whole new value.
#[derive(Debug, Clone, Default)]
pub enum ModelState {
    #[default]
    NotTrained,
    Trained(Arc<LbphModel>),
}

impl ModelState {
    pub fn is_trained(&self) -> bool {
        matches!(self, ModelState::Trained(_))
    }

    pub fn model(&self) -> Option<&Arc<LbphModel>> {
        match self {
            ModelState::Trained(model) => Some(model),
            ModelState::NotTrained => None,
        }
    }

    pub fn predict(&self, region: &GrayImage) -> Result<Prediction, RecognizerError> {
        match self {
            ModelState::Trained(model) => model.predict(region),
            ModelState::NotTrained => Err(RecognizerError::ModelNotTrained),
        }
    }
}

impl LbphModel {
    /// Train over every sample. Zero usable samples yields `NotTrained`.
    ///
    /// Samples too small for the grid are skipped with a warning rather than
    /// failing the whole training run.
    pub fn train<I>(params: LbphParams, samples: I) -> Result<ModelState, RecognizerError>
    where
        I: IntoIterator<Item = (IdentityId, GrayImage)>,
    {
        params.validate()?;

        let mut labels = Vec::new();
        let mut histograms = Vec::new();
        let mut skipped = 0usize;

        for (identity, region) in samples {
            match spatial_histogram(&region, &params) {
                Ok(hist) => {
                    labels.push(identity);
                    histograms.push(hist);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(identity = %identity, error = %e, "skipping training sample");
                }
            }
        }

        if labels.is_empty() {
            tracing::info!(skipped, "no usable training samples; model stays untrained");
            return Ok(ModelState::NotTrained);
        }

        tracing::info!(samples = labels.len(), skipped, "LBPH model trained");
        Ok(ModelState::Trained(Arc::new(Self {
            params,
            labels,
            histograms,
        })))
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    /// Distinct identities present in the model, sorted.
    pub fn identities(&self) -> Vec<IdentityId> {
        let mut ids = self.labels.clone();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Closest training sample to `region`.
    pub fn predict(&self, region: &GrayImage) -> Result<Prediction, RecognizerError> {
        let query = spatial_histogram(region, &self.params)?;

        let mut best: Option<Prediction> = None;
        for (label, hist) in self.labels.iter().zip(&self.histograms) {
            let distance = chi_square_alt(hist, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    identity_id: *label,
                    distance,
                });
            }
        }

        // A trained model always holds at least one sample.
        best.ok_or(RecognizerError::ModelNotTrained)
    }

    /// Serialize into the artifact layout: magic, SHA-256 of the body, body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecognizerError> {
        let body = rmp_serde::to_vec(self)?;
        let digest = Sha256::digest(&body);

        let mut out = Vec::with_capacity(ARTIFACT_MAGIC.len() + DIGEST_LEN + body.len());
        out.extend_from_slice(ARTIFACT_MAGIC);
        out.extend_from_slice(&digest);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecognizerError> {
        let header = ARTIFACT_MAGIC.len() + DIGEST_LEN;
        if bytes.len() < header {
            return Err(RecognizerError::Corrupt(format!("artifact is only {} bytes", bytes.len())));
        }
        if &bytes[..ARTIFACT_MAGIC.len()] != ARTIFACT_MAGIC {
            return Err(RecognizerError::Corrupt("bad magic".into()));
        }
        let (expected, body) = bytes[ARTIFACT_MAGIC.len()..].split_at(DIGEST_LEN);
        if Sha256::digest(body).as_slice() != expected {
            return Err(RecognizerError::Corrupt("checksum mismatch".into()));
        }

        let model: LbphModel =
            rmp_serde::from_slice(body).map_err(|e| RecognizerError::Corrupt(e.to_string()))?;
        model.check_consistency()?;
        Ok(model)
    }

    /// Write the artifact atomically (temp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecognizerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;

        tracing::info!(path = %path.display(), bytes = bytes.len(), samples = self.sample_count(), "model artifact saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecognizerError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RecognizerError::ArtifactNotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        let model = Self::from_bytes(&bytes)?;
        tracing::info!(path = %path.display(), samples = model.sample_count(), "model artifact restored");
        Ok(model)
    }

    fn check_consistency(&self) -> Result<(), RecognizerError> {
        self.params
            .validate()
            .map_err(|e| RecognizerError::Corrupt(e.to_string()))?;
        if self.labels.is_empty() {
            return Err(RecognizerError::Corrupt("model holds no samples".into()));
        }
        if self.labels.len() != self.histograms.len() {
            return Err(RecognizerError::Corrupt(format!(
                "{} labels but {} histograms",
                self.labels.len(),
                self.histograms.len()
            )));
        }
        let expected = self.params.histogram_len();
        if let Some(bad) = self.histograms.iter().find(|h| h.len() != expected) {
            return Err(RecognizerError::Corrupt(format!(
                "histogram of length {} where {expected} was expected",
                bad.len()
            )));
        }
        Ok(())
    }
}

/// Extended (circular) LBP codes with bilinear neighbour sampling.
/// Output is `(width - 2r) x (height - 2r)`, row-major.
fn lbp_codes(region: &GrayImage, params: &LbphParams) -> Result<(Vec<u32>, usize, usize), RecognizerError> {
    let (w, h) = (region.width() as usize, region.height() as usize);
    let r = params.radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return Err(RecognizerError::RegionTooSmall {
            width: region.width(),
            height: region.height(),
            grid_x: params.grid_x,
            grid_y: params.grid_y,
        });
    }

    let (out_w, out_h) = (w - 2 * r, h - 2 * r);
    let pixels = region.as_raw();
    let px = |x: usize, y: usize| pixels[y * w + x] as f32;
    let mut codes = vec![0u32; out_w * out_h];

    for n in 0..params.neighbors {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / params.neighbors as f32;
        let x = params.radius as f32 * angle.cos();
        let y = -(params.radius as f32) * angle.sin();

        let (fx, fy) = (x.floor() as isize, y.floor() as isize);
        let (cx, cy) = (x.ceil() as isize, y.ceil() as isize);
        let tx = x - fx as f32;
        let ty = y - fy as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            let (row_f, row_c) = ((i as isize + fy) as usize, (i as isize + cy) as usize);
            for j in r..w - r {
                let (col_f, col_c) = ((j as isize + fx) as usize, (j as isize + cx) as usize);
                let t = w1 * px(col_f, row_f) + w2 * px(col_c, row_f) + w3 * px(col_f, row_c) + w4 * px(col_c, row_c);
                let center = px(j, i);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[(i - r) * out_w + (j - r)] |= 1 << n;
                }
            }
        }
    }

    Ok((codes, out_w, out_h))
}

/// Concatenated per-cell LBP histograms, each normalised to sum 1.
fn spatial_histogram(region: &GrayImage, params: &LbphParams) -> Result<Vec<f32>, RecognizerError> {
    let (codes, lbp_w, lbp_h) = lbp_codes(region, params)?;
    let (grid_x, grid_y) = (params.grid_x as usize, params.grid_y as usize);
    let cell_w = lbp_w / grid_x;
    let cell_h = lbp_h / grid_y;
    if cell_w == 0 || cell_h == 0 {
        return Err(RecognizerError::RegionTooSmall {
            width: region.width(),
            height: region.height(),
            grid_x: params.grid_x,
            grid_y: params.grid_y,
        });
    }

    let bins = params.bins();
    let cell_total = (cell_w * cell_h) as f32;
    let mut hist = vec![0f32; params.histogram_len()];

    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let cell = &mut hist[(gy * grid_x + gx) * bins..][..bins];
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    cell[codes[y * lbp_w + x] as usize] += 1.0;
                }
            }
            for v in cell.iter_mut() {
                *v /= cell_total;
            }
        }
    }

    Ok(hist)
}

/// Alternative chi-square distance: Σ 2(a−b)² / (a+b).
fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let sum = x + y;
            if sum.abs() > f64::EPSILON {
                2.0 * (x - y) * (x - y) / sum
            } else {
                0.0
            }
        })
        .sum()
}
