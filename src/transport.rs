/*!
Transport maps used to precondition a target.

A [`TransportMap`] `T` pushes the target `π` forward to a reference space
where it looks closer to a standard Gaussian. Samplers run on the
[`Pushforward`] density

\[
\log \tilde\pi(r) = \log \pi(T^{-1}(r)) - \log \lvert \det \nabla T(T^{-1}(r)) \rvert
\]

and map their states back with `T⁻¹`. [`AffineMap`] is the built-in map;
[`TransportMapAdapter`] decides when to refit it from the chain history.
*/

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector};
use std::fmt::Debug;

use crate::distributions::TargetModel;
use crate::core::DEBUG_VERBOSITY;
use crate::error::{InstabilityGuard, McmcError, Result};
use crate::stats::RunningStatistics;

/// An invertible, differentiable map `T: R^d -> R^d`.
pub trait TransportMap: Debug {
    fn dim(&self) -> usize;

    /// `T(x)`.
    fn forward(&self, x: &DVector<f64>) -> DVector<f64>;

    /// `T⁻¹(r)`.
    fn inverse(&self, r: &DVector<f64>) -> DVector<f64>;

    /// `log |det ∇T(x)|`.
    fn log_det_jacobian(&self, x: &DVector<f64>) -> f64;

    /// Fits a new map to `samples`; `scale` regularizes the fit. The receiver is left untouched.
    fn refit_from(&self, samples: &[DVector<f64>], scale: f64) -> Result<Box<dyn TransportMap>>;
}

/**
Lower-triangular affine map `T(x) = L⁻¹(x - μ)`.

Refitting sets `μ` to the sample mean and `L` to the Cholesky factor of
`Cov(samples) + I / scale`, so the pushforward of a Gaussian target becomes
approximately standard normal.

# Examples

```rust
use muq_mcmc::transport::{AffineMap, TransportMap};
use nalgebra::dvector;

let identity = AffineMap::identity(2);
let samples = vec![dvector![1.0, 2.0], dvector![3.0, 2.5], dvector![2.0, 4.0]];
let fitted = identity.refit_from(&samples, 1e6).unwrap();
let x = dvector![2.5, 3.0];
let r = fitted.forward(&x);
assert!((fitted.inverse(&r) - x).norm() < 1e-12);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct AffineMap {
    shift: DVector<f64>,
    lower: DMatrix<f64>,
    log_det: f64,
}

impl AffineMap {
    pub fn identity(dim: usize) -> Self {
        Self {
            shift: DVector::zeros(dim),
            lower: DMatrix::identity(dim, dim),
            log_det: 0.0,
        }
    }

    /// Map with shift `mean` and factor `chol(cov)`.
    pub fn from_moments(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        if cov.nrows() != mean.len() || !cov.is_square() {
            return Err(McmcError::InvalidConfig(format!(
                "map covariance is {}x{}, mean has length {}",
                cov.nrows(),
                cov.ncols(),
                mean.len()
            )));
        }
        let lower = Cholesky::new(cov)
            .ok_or_else(|| {
                McmcError::NumericalInstability("map covariance is not positive-definite".into())
            })?
            .unpack();
        let log_det = -lower.diagonal().iter().map(|v| v.ln()).sum::<f64>();
        if !log_det.is_finite() {
            return Err(McmcError::NumericalInstability(
                "map covariance has a vanishing Cholesky pivot".into(),
            ));
        }
        Ok(Self {
            shift: mean,
            lower,
            log_det,
        })
    }

    pub fn shift(&self) -> &DVector<f64> {
        &self.shift
    }

    pub fn lower(&self) -> &DMatrix<f64> {
        &self.lower
    }
}

impl TransportMap for AffineMap {
    fn dim(&self) -> usize {
        self.shift.len()
    }

    fn forward(&self, x: &DVector<f64>) -> DVector<f64> {
        let centered = x - &self.shift;
        // Every constructor leaves L with a positive, finite diagonal.
        self.lower.solve_lower_triangular_unchecked(&centered)
    }

    fn inverse(&self, r: &DVector<f64>) -> DVector<f64> {
        &self.shift + &self.lower * r
    }

    fn log_det_jacobian(&self, _x: &DVector<f64>) -> f64 {
        self.log_det
    }

    fn refit_from(&self, samples: &[DVector<f64>], scale: f64) -> Result<Box<dyn TransportMap>> {
        if samples.len() < 2 {
            return Ok(Box::new(self.clone()));
        }
        let dim = self.dim();
        let mut moments = RunningStatistics::with_max_lag(dim, 0);
        samples.iter().for_each(|x| moments.update(x));
        let cov = moments.covariance() + DMatrix::identity(dim, dim) / scale;
        Ok(Box::new(Self::from_moments(moments.mean(), cov)?))
    }
}

/// The density of `T(X)` for `X ~ target`.
///
/// Gradient-free: samplers on a pushforward must use proposals that only
/// need log-densities.
pub struct Pushforward<'a> {
    target: &'a dyn TargetModel,
    map: &'a dyn TransportMap,
}

impl<'a> Pushforward<'a> {
    pub fn new(target: &'a dyn TargetModel, map: &'a dyn TransportMap) -> Self {
        Self { target, map }
    }
}

impl TargetModel for Pushforward<'_> {
    fn dim(&self) -> usize {
        self.map.dim()
    }

    fn log_density(&self, r: &DVector<f64>) -> f64 {
        let x = self.map.inverse(r);
        self.target.log_density(&x) - self.map.log_det_jacobian(&x)
    }
}

/// When the transport-map kernel refits its map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapSchedule {
    pub adapt_start: usize,
    pub adapt_stop: usize,
    pub adapt_gap: usize,
    /// Regularization passed to [`TransportMap::refit_from`].
    pub adapt_scale: f64,
}

impl MapSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.adapt_gap == 0 {
            return Err(McmcError::InvalidConfig("AdaptGap must be at least 1".into()));
        }
        if self.adapt_start > self.adapt_stop {
            return Err(McmcError::InvalidConfig(format!(
                "AdaptStart ({}) is after AdaptStop ({})",
                self.adapt_start, self.adapt_stop
            )));
        }
        if !(self.adapt_scale.is_finite() && self.adapt_scale > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "AdaptScale must be positive, got {}",
                self.adapt_scale
            )));
        }
        Ok(())
    }

    pub fn is_refit(&self, step: usize) -> bool {
        (self.adapt_start..=self.adapt_stop).contains(&step)
            && (step - self.adapt_start) % self.adapt_gap == 0
    }
}

/// Keeps the outer chain history and refits the map on schedule.
///
/// A refit that fails numerically keeps the previous map; only a streak of
/// failures longer than the instability bound aborts the run.
#[derive(Debug, Clone)]
pub struct TransportMapAdapter {
    schedule: MapSchedule,
    history: Vec<DVector<f64>>,
    n_refits: usize,
    guard: InstabilityGuard,
    verbose: u8,
}

impl TransportMapAdapter {
    pub fn new(schedule: MapSchedule) -> Result<Self> {
        schedule.validate()?;
        Ok(Self {
            schedule,
            history: Vec::new(),
            n_refits: 0,
            guard: InstabilityGuard::new(),
            verbose: 0,
        })
    }

    pub fn set_verbose(&mut self, verbose: u8) {
        self.verbose = verbose;
    }

    /// Number of refits that failed in a row, reset by the next successful refit.
    pub fn failed_refits(&self) -> usize {
        self.guard.consecutive()
    }

    pub fn schedule(&self) -> &MapSchedule {
        &self.schedule
    }

    pub fn n_refits(&self) -> usize {
        self.n_refits
    }

    /// Records the chain state of `step`; returns a refitted map if `step` is a refit step.
    pub fn observe(
        &mut self,
        step: usize,
        position: &DVector<f64>,
        map: &dyn TransportMap,
    ) -> Result<Option<Box<dyn TransportMap>>> {
        // Samples past the last refit are never used.
        if step <= self.schedule.adapt_stop {
            self.history.push(position.clone());
        }
        if !self.schedule.is_refit(step) {
            return Ok(None);
        }
        let refitted = match map.refit_from(&self.history, self.schedule.adapt_scale) {
            Ok(refitted) => refitted,
            Err(McmcError::NumericalInstability(reason)) => {
                self.guard.failure(&format!(
                    "step {step}: transport map refit failed, keeping previous map: {reason}"
                ))?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.guard.success();
        self.n_refits += 1;
        if self.verbose >= DEBUG_VERBOSITY {
            debug!(
                "step {step}: refitted transport map from {} samples",
                self.history.len()
            );
        }
        Ok(Some(refitted))
    }
}
