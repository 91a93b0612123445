//! Factored Gaussian covariances used by every proposal in the crate.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::error::{McmcError, Result};

/// Diagonal jitter added before retrying a failed factorization.
pub const JITTER: f64 = 1e-10;
const MAX_JITTER_TRIES: usize = 8;

/// A covariance matrix together with its Cholesky factor and log-determinant.
#[derive(Debug, Clone)]
pub struct GaussianCov {
    cov: DMatrix<f64>,
    chol: Cholesky<f64, Dyn>,
    log_det: f64,
}

impl GaussianCov {
    /// Factors `cov`; returns `None` if it is not symmetric positive-definite.
    pub fn try_new(cov: DMatrix<f64>) -> Option<Self> {
        if !cov.iter().all(|v| v.is_finite()) {
            return None;
        }
        let chol = Cholesky::new(cov.clone())?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        log_det.is_finite().then_some(Self { cov, chol, log_det })
    }

    /// Factors `cov`, adding geometrically growing diagonal jitter until it succeeds.
    pub fn with_jitter(cov: DMatrix<f64>) -> Result<Self> {
        if let Some(g) = Self::try_new(cov.clone()) {
            return Ok(g);
        }
        let n = cov.nrows();
        let mut jitter = JITTER;
        for _ in 0..MAX_JITTER_TRIES {
            let bumped = &cov + DMatrix::identity(n, n) * jitter;
            if let Some(g) = Self::try_new(bumped) {
                return Ok(g);
            }
            jitter *= 100.0;
        }
        Err(McmcError::NumericalInstability(
            "covariance is not positive-definite even after jitter".into(),
        ))
    }

    /// `scale * I` in `dim` dimensions.
    pub fn isotropic(dim: usize, scale: f64) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "proposal variance must be positive, got {scale}"
            )));
        }
        Self::try_new(DMatrix::identity(dim, dim) * scale).ok_or_else(|| {
            McmcError::InvalidConfig(format!("cannot factor {scale} * I in {dim} dimensions"))
        })
    }

    pub fn dim(&self) -> usize {
        self.cov.nrows()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// Returns a copy of this covariance inflated by `jitter * I`.
    pub fn inflated(&self, jitter: f64) -> Result<Self> {
        Self::with_jitter(&self.cov + DMatrix::identity(self.dim(), self.dim()) * jitter)
    }

    /// Draws `N(0, cov / variance_divisor)`.
    pub fn sample(&self, variance_divisor: f64, rng: &mut SmallRng) -> DVector<f64> {
        let z = DVector::from_iterator(
            self.dim(),
            (0..self.dim()).map(|_| rng.sample::<f64, _>(StandardNormal)),
        );
        (self.chol.l() * z) / variance_divisor.sqrt()
    }

    /// Log-density of `diff` under `N(0, cov / variance_divisor)`.
    pub fn log_density(&self, diff: &DVector<f64>, variance_divisor: f64) -> f64 {
        let d = self.dim() as f64;
        let solved = self.chol.solve(diff);
        let mahalanobis = variance_divisor * diff.dot(&solved);
        -0.5 * (d * (2.0 * PI).ln() + self.log_det - d * variance_divisor.ln() + mahalanobis)
    }

    /// `cov * v`.
    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.cov * v
    }
}
