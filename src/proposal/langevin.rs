use nalgebra::DMatrix;
use std::borrow::Cow;

use super::{langevin_drift, Moments, Proposal};
use crate::core::State;
use crate::distributions::Requirements;
use crate::error::{McmcError, Result};
use crate::gaussian::GaussianCov;

fn check_step_size(step_size: f64) -> Result<()> {
    if step_size.is_finite() && step_size > 0.0 {
        Ok(())
    } else {
        Err(McmcError::InvalidConfig(format!(
            "StepSize must be positive, got {step_size}"
        )))
    }
}

/**
Preconditioned MALA.

`q(. | x) = N(x + h²/2 Σ ∇log p(x), h² Σ)` for a fixed preconditioner `Σ`
(`prop_size * I` unless a covariance is given).
*/
#[derive(Debug, Clone)]
pub struct PreMalaProposal {
    cov: GaussianCov,
    step_size: f64,
}

impl PreMalaProposal {
    pub fn new(cov: GaussianCov, step_size: f64) -> Result<Self> {
        check_step_size(step_size)?;
        Ok(Self { cov, step_size })
    }

    pub fn isotropic(dim: usize, prop_size: f64, step_size: f64) -> Result<Self> {
        Self::new(GaussianCov::isotropic(dim, prop_size)?, step_size)
    }

    pub fn with_covariance(cov: DMatrix<f64>, step_size: f64) -> Result<Self> {
        let cov = GaussianCov::try_new(cov).ok_or_else(|| {
            McmcError::InvalidConfig("preconditioner is not positive-definite".into())
        })?;
        Self::new(cov, step_size)
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }
}

impl Proposal for PreMalaProposal {
    fn requirements(&self) -> Requirements {
        Requirements::GRADIENT
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn moments(&self, from: &State) -> Result<Moments<'_>> {
        let drift = langevin_drift(&self.cov, from.gradient()?, self.step_size);
        Ok(Moments {
            mean: &from.position + drift,
            cov: Cow::Borrowed(&self.cov),
            variance_divisor: 1.0 / (self.step_size * self.step_size),
        })
    }

    fn name(&self) -> &'static str {
        "PreMALA"
    }
}

/**
Simplified manifold MALA (Girolami & Calderhead 2011).

The local metric `G(x)` replaces the fixed preconditioner:
`q(. | x) = N(x + h²/2 G(x)⁻¹ ∇log p(x), h² G(x)⁻¹)`. The derivative terms of
the metric are dropped, so the drift is exact only for constant metrics.
*/
#[derive(Debug, Clone)]
pub struct MmalaProposal {
    step_size: f64,
}

impl MmalaProposal {
    pub fn new(step_size: f64) -> Result<Self> {
        check_step_size(step_size)?;
        Ok(Self { step_size })
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    fn inverse_metric(state: &State) -> Result<GaussianCov> {
        let metric = state.metric()?;
        let inverse = metric.clone().try_inverse().ok_or_else(|| {
            McmcError::NumericalInstability("local metric is singular".into())
        })?;
        // Symmetrize before factoring; the inverse picks up rounding asymmetry.
        let symmetric = (&inverse + inverse.transpose()) * 0.5;
        GaussianCov::with_jitter(symmetric)
    }
}

impl Proposal for MmalaProposal {
    fn requirements(&self) -> Requirements {
        Requirements::METRIC
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn moments(&self, from: &State) -> Result<Moments<'_>> {
        let cov = Self::inverse_metric(from)?;
        let drift = langevin_drift(&cov, from.gradient()?, self.step_size);
        Ok(Moments {
            mean: &from.position + drift,
            cov: Cow::Owned(cov),
            variance_divisor: 1.0 / (self.step_size * self.step_size),
        })
    }

    fn name(&self) -> &'static str {
        "MMALA"
    }
}
