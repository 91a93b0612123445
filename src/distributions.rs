/*!
Target densities and the contract every sampler uses to evaluate them.

A [`TargetModel`] evaluates the (unnormalized) log-density of a position and,
when it can, its gradient and a positive-definite local metric. Samplers never
mutate a target: all evaluations are pure functions of the position, so
delayed-rejection and tree-building kernels may call them speculatively.

# Examples

```rust
use muq_mcmc::distributions::{Boomerang, Gaussian, TargetModel};
use nalgebra::{dvector, dmatrix};

let gauss = Gaussian::new(dvector![0.0, 0.0], dmatrix![1.0, 0.0; 0.0, 3.0]).unwrap();
let lp = gauss.log_density(&dvector![0.5, -0.5]);
assert!(lp.is_finite());

let banana = Boomerang::default();
let grad = banana.gradient(&dvector![0.0, 1.0]).unwrap();
assert_eq!(grad.len(), 2);
```
*/

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use std::f64::consts::PI;

use crate::error::{McmcError, Result};

/// A target probability density known up to a normalizing constant.
pub trait TargetModel {
    /// Dimension of the target's domain.
    fn dim(&self) -> usize;

    /// Log of the (unnormalized) density at `x`. May return `-inf` outside the support.
    fn log_density(&self, x: &DVector<f64>) -> f64;

    /// Gradient of the log-density at `x`.
    fn gradient(&self, _x: &DVector<f64>) -> Result<DVector<f64>> {
        Err(McmcError::NotDifferentiable)
    }

    /// Positive-definite local metric at `x` (e.g. a Gauss-Newton Hessian).
    fn metric(&self, _x: &DVector<f64>) -> Result<DMatrix<f64>> {
        Err(McmcError::NoMetric)
    }

    /// Whether [`TargetModel::gradient`] is implemented.
    fn supports_gradient(&self) -> bool {
        false
    }

    /// Whether [`TargetModel::metric`] is implemented.
    fn supports_metric(&self) -> bool {
        false
    }
}

/// Target capabilities a proposal or kernel needs at every state it visits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub gradient: bool,
    pub metric: bool,
}

impl Requirements {
    pub const NONE: Requirements = Requirements {
        gradient: false,
        metric: false,
    };
    pub const GRADIENT: Requirements = Requirements {
        gradient: true,
        metric: false,
    };
    pub const METRIC: Requirements = Requirements {
        gradient: true,
        metric: true,
    };

    pub fn union(self, other: Requirements) -> Requirements {
        Requirements {
            gradient: self.gradient || other.gradient,
            metric: self.metric || other.metric,
        }
    }

    /// Fails if `target` lacks a capability these requirements name.
    pub fn check(&self, target: &dyn TargetModel) -> Result<()> {
        if self.gradient && !target.supports_gradient() {
            return Err(McmcError::NotDifferentiable);
        }
        if self.metric && !target.supports_metric() {
            return Err(McmcError::NoMetric);
        }
        Ok(())
    }
}

/**
A multivariate Gaussian target with full covariance.

The precision matrix doubles as the (constant) metric, so the Gaussian works
with every proposal in the crate.
*/
#[derive(Debug, Clone)]
pub struct Gaussian {
    pub mean: DVector<f64>,
    pub cov: DMatrix<f64>,
    precision: DMatrix<f64>,
    log_normalizer: f64,
}

impl Gaussian {
    /// Creates a Gaussian; fails unless `cov` is square, matches `mean` and is positive-definite.
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        let d = mean.len();
        if cov.nrows() != d || cov.ncols() != d {
            return Err(McmcError::InvalidConfig(format!(
                "covariance is {}x{}, expected {d}x{d}",
                cov.nrows(),
                cov.ncols()
            )));
        }
        let chol: Cholesky<f64, Dyn> = Cholesky::new(cov.clone()).ok_or_else(|| {
            McmcError::InvalidConfig("Gaussian covariance is not positive-definite".into())
        })?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        let precision = chol.inverse();
        let log_normalizer = -0.5 * (d as f64 * (2.0 * PI).ln() + log_det);
        Ok(Self {
            mean,
            cov,
            precision,
            log_normalizer,
        })
    }

    /// Standard normal in `d` dimensions.
    pub fn standard(d: usize) -> Self {
        Self {
            mean: DVector::zeros(d),
            cov: DMatrix::identity(d, d),
            precision: DMatrix::identity(d, d),
            log_normalizer: -0.5 * d as f64 * (2.0 * PI).ln(),
        }
    }

    /// Fully normalized log-density.
    pub fn normalized_log_density(&self, x: &DVector<f64>) -> f64 {
        self.log_density(x) + self.log_normalizer
    }
}

impl TargetModel for Gaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn log_density(&self, x: &DVector<f64>) -> f64 {
        let diff = x - &self.mean;
        -0.5 * diff.dot(&(&self.precision * &diff))
    }

    fn gradient(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(-(&self.precision * (x - &self.mean)))
    }

    fn metric(&self, _x: &DVector<f64>) -> Result<DMatrix<f64>> {
        Ok(self.precision.clone())
    }

    fn supports_gradient(&self) -> bool {
        true
    }

    fn supports_metric(&self) -> bool {
        true
    }
}

/**
The two-dimensional "boomerang" (banana) density.

With reference variables `r0 = x0 / a` and `r1 = a x1 - a b (r0^2 + a^2)` the
log-density is `-(r0^2 + r1^2) / 2`. The map `x -> r` has unit Jacobian
determinant, so `r` is standard normal under the target. The metric is the
Gauss-Newton approximation `J^T J` with `J = dr/dx`, which is positive-definite
everywhere.
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boomerang {
    pub a: f64,
    pub b: f64,
}

impl Default for Boomerang {
    fn default() -> Self {
        Self { a: 1.0, b: 1.0 }
    }
}

impl Boomerang {
    fn residual(&self, x: &DVector<f64>) -> DVector<f64> {
        let (a, b) = (self.a, self.b);
        let r0 = x[0] / a;
        let r1 = a * x[1] - a * b * (r0 * r0 + a * a);
        DVector::from_vec(vec![r0, r1])
    }

    /// Jacobian `dr/dx` of the reference map.
    pub fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let (a, b) = (self.a, self.b);
        DMatrix::from_row_slice(2, 2, &[1.0 / a, 0.0, -2.0 * b * x[0] / a, a])
    }
}

impl TargetModel for Boomerang {
    fn dim(&self) -> usize {
        2
    }

    fn log_density(&self, x: &DVector<f64>) -> f64 {
        -0.5 * self.residual(x).norm_squared()
    }

    fn gradient(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(-(self.jacobian(x).transpose() * self.residual(x)))
    }

    fn metric(&self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        let jac = self.jacobian(x);
        Ok(jac.transpose() * jac)
    }

    fn supports_gradient(&self) -> bool {
        true
    }

    fn supports_metric(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    /// Central finite-difference gradient used to check analytic gradients.
    fn numeric_gradient(target: &dyn TargetModel, x: &DVector<f64>) -> DVector<f64> {
        let h = 1e-6;
        DVector::from_iterator(
            x.len(),
            (0..x.len()).map(|i| {
                let mut up = x.clone();
                let mut down = x.clone();
                up[i] += h;
                down[i] -= h;
                (target.log_density(&up) - target.log_density(&down)) / (2.0 * h)
            }),
        )
    }

    #[test]
    fn gaussian_normalized_density_matches_closed_form() {
        let gauss = Gaussian::new(dvector![0.0, 0.0], dmatrix![1.0, 0.0; 0.0, 1.0]).unwrap();
        let p = gauss.normalized_log_density(&dvector![1.0, 0.0]).exp();
        let true_p = (-0.5f64).exp() / (2.0 * PI);
        assert!((p - true_p).abs() < 1e-12, "got {p}, expected {true_p}");
    }

    #[test]
    fn gaussian_rejects_bad_covariance() {
        let not_pd = Gaussian::new(dvector![0.0, 0.0], dmatrix![1.0, 2.0; 2.0, 1.0]);
        assert!(matches!(not_pd, Err(McmcError::InvalidConfig(_))));
        let wrong_shape = Gaussian::new(dvector![0.0], dmatrix![1.0, 0.0; 0.0, 1.0]);
        assert!(matches!(wrong_shape, Err(McmcError::InvalidConfig(_))));
    }

    #[test]
    fn gaussian_gradient_matches_finite_differences() {
        let gauss = Gaussian::new(dvector![1.0, -2.0], dmatrix![4.0, 2.0; 2.0, 3.0]).unwrap();
        let x = dvector![0.3, 0.7];
        let analytic = gauss.gradient(&x).unwrap();
        assert_abs_diff_eq!(analytic, numeric_gradient(&gauss, &x), epsilon = 1e-6);
    }

    #[test]
    fn boomerang_gradient_matches_finite_differences() {
        let banana = Boomerang { a: 1.3, b: 0.7 };
        for x in [dvector![0.0, 1.0], dvector![1.5, -0.4], dvector![-0.8, 2.2]] {
            let analytic = banana.gradient(&x).unwrap();
            assert_abs_diff_eq!(analytic, numeric_gradient(&banana, &x), epsilon = 1e-5);
        }
    }

    #[test]
    fn boomerang_gradient_matches_expanded_form() {
        // a = b = 1 expansion of -J^T r.
        let banana = Boomerang::default();
        let x = dvector![0.5, 2.0];
        let grad = banana.gradient(&x).unwrap();
        let g0 = -(x[0] * (2.0 - 2.0 * x[1] + 2.0 * x[0] * x[0] + 1.0));
        let g1 = 1.0 - x[1] + x[0] * x[0];
        assert_abs_diff_eq!(grad, dvector![g0, g1], epsilon = 1e-12);
    }

    #[test]
    fn boomerang_metric_is_positive_definite() {
        let banana = Boomerang::default();
        let metric = banana.metric(&dvector![2.0, -1.0]).unwrap();
        assert_abs_diff_eq!(metric[(0, 1)], metric[(1, 0)], epsilon = 1e-12);
        assert!(Cholesky::new(metric).is_some());
    }

    #[test]
    fn requirements_check_capabilities() {
        struct Flat;
        impl TargetModel for Flat {
            fn dim(&self) -> usize {
                1
            }
            fn log_density(&self, _x: &DVector<f64>) -> f64 {
                0.0
            }
        }
        assert!(Requirements::NONE.check(&Flat).is_ok());
        assert_eq!(
            Requirements::GRADIENT.check(&Flat),
            Err(McmcError::NotDifferentiable)
        );
        let metric_only = Requirements {
            gradient: false,
            metric: true,
        };
        assert_eq!(metric_only.check(&Flat), Err(McmcError::NoMetric));
        assert!(Requirements::METRIC.check(&Boomerang::default()).is_ok());
    }
}
