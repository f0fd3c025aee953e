//! Robust planar homography estimation.
//!
//! Fits a 3×3 projective transform mapping current-image points onto
//! baseline-image points. Candidate models come from minimal 4-point
//! samples solved with the normalized direct linear transform; RANSAC
//! keeps the model with the largest consensus, which is then refit on
//! all of its inliers.
//!
//! An estimate is rejected (and the caller falls back to a plain resize)
//! when there are too few correspondences, too little consensus, or the
//! model is numerically unusable: non-finite, near-singular, or mirroring
//! the image somewhere in the inlier region.

use nalgebra::{Matrix3, SMatrix, SymmetricEigen, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::types::{FallbackReason, Point};

/// Correspondences needed to determine a homography.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Consensus needed to accept a model: the four points defining it plus
/// two independent confirmations.
pub const MIN_INLIERS: usize = MIN_CORRESPONDENCES + 2;

/// Accepted range for the local area scale factor at inlier points.
const AREA_SCALE_RANGE: (f64, f64) = (1e-2, 1e2);

/// Desired probability of drawing at least one all-inlier sample, used to
/// end RANSAC early.
const CONFIDENCE: f64 = 0.995;

const EPS: f64 = 1e-12;

/// A 3×3 projective transform.
///
/// Serialized as nine row-major values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f64; 9]", from = "[f64; 9]")]
pub struct Homography(Matrix3<f64>);

impl Homography {
    /// The identity transform.
    #[must_use]
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    /// Wrap a matrix.
    #[must_use]
    pub const fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self(matrix)
    }

    /// A pure translation.
    #[must_use]
    pub fn translation(dx: f64, dy: f64) -> Self {
        Self(Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0))
    }

    /// The underlying matrix.
    #[must_use]
    pub const fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    /// Matrix entries in row-major order.
    #[must_use]
    pub fn to_row_major(&self) -> [f64; 9] {
        let m = &self.0;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    /// Map a point. Returns `None` for points on the line at infinity.
    #[must_use]
    pub fn apply(&self, p: Point) -> Option<Point> {
        let v = self.0 * Vector3::new(p.x, p.y, 1.0);
        if !v[2].is_finite() || v[2].abs() <= EPS {
            return None;
        }
        let out = Point::new(v[0] / v[2], v[1] / v[2]);
        (out.x.is_finite() && out.y.is_finite()).then_some(out)
    }

    /// Whether every entry is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Local area scale factor (Jacobian determinant) at `p`.
    ///
    /// Negative values mean the transform mirrors the image around `p`.
    #[must_use]
    pub fn area_scale_at(&self, p: Point) -> f64 {
        let w = self.0[(2, 0)].mul_add(p.x, self.0[(2, 1)].mul_add(p.y, self.0[(2, 2)]));
        self.0.determinant() / (w * w * w)
    }

    /// Scale so the bottom-right entry is 1, when that is possible.
    fn normalized(self) -> Self {
        let h22 = self.0[(2, 2)];
        if h22.abs() > EPS {
            Self(self.0 / h22)
        } else {
            let norm = self.0.norm();
            if norm > EPS { Self(self.0 / norm) } else { self }
        }
    }
}

impl From<Homography> for [f64; 9] {
    fn from(h: Homography) -> Self {
        h.to_row_major()
    }
}

impl From<[f64; 9]> for Homography {
    fn from(v: [f64; 9]) -> Self {
        Self(Matrix3::from_row_slice(&v))
    }
}

/// A matched point pair: `from` in the current image, `to` in the
/// baseline image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Position in the current image.
    pub from: Point,
    /// Position in the baseline image.
    pub to: Point,
}

impl Correspondence {
    /// Create a correspondence.
    #[must_use]
    pub const fn new(from: Point, to: Point) -> Self {
        Self { from, to }
    }
}

/// Parameters for robust estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacParams {
    /// Minimum correspondences before estimation is attempted.
    pub min_matches: usize,
    /// Maximum reprojection error (pixels) for an inlier.
    pub threshold: f64,
    /// Iteration cap.
    pub iterations: u32,
    /// Sampler seed.
    pub seed: u64,
}

/// A accepted homography with the indices of its supporting inliers.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    /// The fitted transform.
    pub homography: Homography,
    /// Indices into the correspondence list.
    pub inliers: Vec<usize>,
    /// RANSAC iterations actually run.
    pub iterations: u32,
}

/// Fit a homography robustly.
///
/// # Errors
///
/// Returns [`FallbackReason::TooFewMatches`] when fewer than
/// `params.min_matches` correspondences are given, and
/// [`FallbackReason::DegenerateHomography`] when no acceptable model
/// exists. Sampling stops early once `cancel` is raised.
pub fn estimate(
    correspondences: &[Correspondence],
    params: &RansacParams,
    cancel: &CancelFlag,
) -> Result<Estimate, FallbackReason> {
    let required = params.min_matches.max(MIN_CORRESPONDENCES);
    if correspondences.len() < required {
        return Err(FallbackReason::TooFewMatches {
            found: correspondences.len(),
            required,
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let n = correspondences.len();
    let mut best: Option<(Homography, Vec<usize>, f64)> = None;
    let mut needed = params.iterations;
    let mut iterations = 0;

    while iterations < needed.min(params.iterations) && !cancel.is_cancelled() {
        iterations += 1;
        let indices = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES).into_vec();
        let sample: Vec<Correspondence> = indices.iter().map(|&i| correspondences[i]).collect();
        if has_collinear_triple(&sample) {
            continue;
        }
        let Some(model) = solve_dlt(&sample) else {
            continue;
        };
        let (inliers, error) = consensus(&model, correspondences, params.threshold);
        let better = best.as_ref().is_none_or(|(_, best_inliers, best_error)| {
            inliers.len() > best_inliers.len()
                || (inliers.len() == best_inliers.len() && error < *best_error)
        });
        if better {
            needed = adaptive_iterations(inliers.len(), n).unwrap_or(needed);
            best = Some((model, inliers, error));
        }
    }

    let Some((model, inliers, _)) = best else {
        tracing::debug!(iterations, "no non-degenerate sample found");
        return Err(FallbackReason::DegenerateHomography);
    };

    // Refit on the consensus set and re-score; keep the sample model if the
    // refit loses support.
    let (homography, inliers) = {
        let support: Vec<Correspondence> = inliers.iter().map(|&i| correspondences[i]).collect();
        match solve_dlt(&support) {
            Some(refit) => {
                let (refit_inliers, _) = consensus(&refit, correspondences, params.threshold);
                if refit_inliers.len() >= inliers.len() {
                    (refit, refit_inliers)
                } else {
                    (model, inliers)
                }
            }
            None => (model, inliers),
        }
    };

    if inliers.len() < MIN_INLIERS {
        tracing::debug!(inliers = inliers.len(), "consensus too small");
        return Err(FallbackReason::DegenerateHomography);
    }
    let support: Vec<Point> = inliers.iter().map(|&i| correspondences[i].from).collect();
    if is_degenerate(&homography, &support) {
        tracing::debug!(?homography, "rejecting degenerate homography");
        return Err(FallbackReason::DegenerateHomography);
    }

    tracing::debug!(
        inliers = inliers.len(),
        matches = n,
        iterations,
        "homography accepted"
    );
    Ok(Estimate {
        homography,
        inliers,
        iterations,
    })
}

/// Whether a model is unusable for warping: non-finite, singular, or
/// with a local area scale at any support point that is negative (mirror)
/// or outside [`AREA_SCALE_RANGE`].
#[must_use]
pub fn is_degenerate(homography: &Homography, support: &[Point]) -> bool {
    if !homography.is_finite() || homography.matrix().determinant().abs() <= EPS {
        return true;
    }
    support.iter().any(|&p| {
        let s = homography.area_scale_at(p);
        !s.is_finite() || s < AREA_SCALE_RANGE.0 || s > AREA_SCALE_RANGE.1
    })
}

/// Forward reprojection inliers and their summed squared error.
fn consensus(
    model: &Homography,
    correspondences: &[Correspondence],
    threshold: f64,
) -> (Vec<usize>, f64) {
    let limit = threshold * threshold;
    let mut error = 0.0;
    let inliers = correspondences
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let projected = model.apply(c.from)?;
            let d = projected.distance_squared(c.to);
            (d <= limit).then(|| {
                error += d;
                i
            })
        })
        .collect();
    (inliers, error)
}

/// Iterations needed to see an all-inlier sample with [`CONFIDENCE`],
/// given the current inlier ratio.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn adaptive_iterations(inliers: usize, total: usize) -> Option<u32> {
    let ratio = inliers as f64 / total as f64;
    let all_inlier = ratio.powi(4);
    if all_inlier >= 1.0 - EPS {
        return Some(1);
    }
    if all_inlier <= EPS {
        return None;
    }
    let n = (1.0 - CONFIDENCE).ln() / (1.0 - all_inlier).ln();
    n.is_finite().then(|| n.ceil().clamp(1.0, f64::from(u32::MAX)) as u32)
}

/// Whether any three of the sample points are (nearly) collinear in
/// either image.
fn has_collinear_triple(sample: &[Correspondence]) -> bool {
    let collinear = |a: Point, b: Point, c: Point| {
        let cross = (b.x - a.x).mul_add(c.y - a.y, -((b.y - a.y) * (c.x - a.x)));
        cross.abs() < 1e-6
    };
    for i in 0..sample.len() {
        for j in (i + 1)..sample.len() {
            for k in (j + 1)..sample.len() {
                if collinear(sample[i].from, sample[j].from, sample[k].from)
                    || collinear(sample[i].to, sample[j].to, sample[k].to)
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Similarity transform moving the centroid to the origin with mean
/// distance `sqrt(2)` from it.
fn normalizing_transform(points: &[Point]) -> Option<Matrix3<f64>> {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let centroid = Point::new(cx, cy);
    let mean = points.iter().map(|p| p.distance(centroid)).sum::<f64>() / n;
    if mean <= EPS || !mean.is_finite() {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn transform(t: &Matrix3<f64>, p: Point) -> (f64, f64) {
    let v = t * Vector3::new(p.x, p.y, 1.0);
    (v[0], v[1])
}

/// Normalized direct linear transform on four or more correspondences.
///
/// Solves `A h = 0` in the least-squares sense via the eigenvector of
/// `AᵀA` with the smallest eigenvalue.
fn solve_dlt(correspondences: &[Correspondence]) -> Option<Homography> {
    if correspondences.len() < MIN_CORRESPONDENCES {
        return None;
    }
    let from: Vec<Point> = correspondences.iter().map(|c| c.from).collect();
    let to: Vec<Point> = correspondences.iter().map(|c| c.to).collect();
    let t_from = normalizing_transform(&from)?;
    let t_to = normalizing_transform(&to)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (f, t) in from.iter().zip(&to) {
        let (x, y) = transform(&t_from, *f);
        let (u, v) = transform(&t_to, *t);
        let rows = [
            [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u],
            [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v],
        ];
        for row in &rows {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += row[i] * row[j];
                }
            }
        }
    }

    let eigen = SymmetricEigen::new(ata);
    let (smallest, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eigen.eigenvectors.column(smallest);
    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let denormalized = t_to.try_inverse()? * normalized * t_from;
    let homography = Homography(denormalized).normalized();
    homography.is_finite().then_some(homography)
}
