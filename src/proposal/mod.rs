/*!
Proposal distributions for Metropolis-Hastings style kernels.

Every proposal in this module is Gaussian, `q(. | x) = N(m(x), C(x) / s)`,
where the implementation supplies the mean `m(x)` and factored covariance
`C(x)` through [`Proposal::moments`] and `s` is a variance divisor. Kernels use
the divisor to shrink a proposal for later delayed-rejection stages without
refactoring its covariance.

| Proposal | mean | covariance | adapts |
|---|---|---|---|
| [`MhProposal`] | `x` | fixed `Σ` | no |
| [`AmProposal`] | `x` | `s_d Cov(chain) + εI` | yes |
| [`PreMalaProposal`] | `x + h²/2 Σ∇log p(x)` | `h² Σ` | no |
| [`MmalaProposal`] | `x + h²/2 G(x)⁻¹∇log p(x)` | `h² G(x)⁻¹` | no |
| [`AmalaProposal`] | `x + clamp(h²/2 Σ∇log p(x))` | `h² Σ`, `Σ` adapted | yes |
*/

mod adaptive;
mod langevin;
mod random_walk;

pub use adaptive::{AdaptSchedule, AmProposal, AmalaProposal, CovarianceAdapter};
pub use langevin::{MmalaProposal, PreMalaProposal};
pub use random_walk::MhProposal;

use nalgebra::DVector;
use rand::rngs::SmallRng;
use std::borrow::Cow;

use crate::core::State;
use crate::distributions::Requirements;
use crate::error::Result;
use crate::gaussian::GaussianCov;

/// Mean and covariance `cov / variance_divisor` of a Gaussian proposal at one state.
#[derive(Debug, Clone)]
pub struct Moments<'a> {
    pub mean: DVector<f64>,
    pub cov: Cow<'a, GaussianCov>,
    pub variance_divisor: f64,
}

/// A rule generating a candidate state from the current one.
pub trait Proposal {
    /// Capabilities the proposal needs cached in the states it is given.
    fn requirements(&self) -> Requirements;

    /// `true` when `q(y | x) = q(x | y)`, so proposal densities cancel in the acceptance ratio.
    fn is_symmetric(&self) -> bool;

    /// Moments of `q(. | from)`.
    fn moments(&self, from: &State) -> Result<Moments<'_>>;

    /// Draws a candidate position from `q(. | current)` with its variance divided by `variance_divisor`.
    fn propose_scaled(
        &mut self,
        current: &State,
        variance_divisor: f64,
        rng: &mut SmallRng,
    ) -> Result<DVector<f64>> {
        let m = self.moments(current)?;
        let noise = m.cov.sample(m.variance_divisor * variance_divisor, rng);
        Ok(m.mean + noise)
    }

    /// Draws a candidate position from `q(. | current)`.
    fn propose(&mut self, current: &State, rng: &mut SmallRng) -> Result<DVector<f64>> {
        self.propose_scaled(current, 1.0, rng)
    }

    /// `log q(to | from)` for the proposal with its variance divided by `variance_divisor`.
    fn log_density_scaled(&self, from: &State, to: &State, variance_divisor: f64) -> Result<f64> {
        let m = self.moments(from)?;
        let diff = &to.position - &m.mean;
        Ok(m.cov.log_density(&diff, m.variance_divisor * variance_divisor))
    }

    /// `log q(to | from)`.
    fn log_density(&self, from: &State, to: &State) -> Result<f64> {
        self.log_density_scaled(from, to, 1.0)
    }

    /// Feeds the chain state produced at `step`; a no-op for non-adaptive proposals.
    fn adapt(&mut self, _step: usize, _state: &State) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;

    /// Sets the chain's verbosity; adaptation ticks are logged at level 3.
    fn set_verbose(&mut self, _verbose: u8) {}
}

impl<P: Proposal + ?Sized> Proposal for Box<P> {
    fn requirements(&self) -> Requirements {
        (**self).requirements()
    }

    fn is_symmetric(&self) -> bool {
        (**self).is_symmetric()
    }

    fn moments(&self, from: &State) -> Result<Moments<'_>> {
        (**self).moments(from)
    }

    fn propose_scaled(
        &mut self,
        current: &State,
        variance_divisor: f64,
        rng: &mut SmallRng,
    ) -> Result<DVector<f64>> {
        (**self).propose_scaled(current, variance_divisor, rng)
    }

    fn log_density_scaled(&self, from: &State, to: &State, variance_divisor: f64) -> Result<f64> {
        (**self).log_density_scaled(from, to, variance_divisor)
    }

    fn adapt(&mut self, step: usize, state: &State) -> Result<()> {
        (**self).adapt(step, state)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn set_verbose(&mut self, verbose: u8) {
        (**self).set_verbose(verbose)
    }
}

/// Drift `h²/2 * cov * gradient` of a Langevin proposal.
pub(crate) fn langevin_drift(cov: &GaussianCov, gradient: &DVector<f64>, step_size: f64) -> DVector<f64> {
    cov.apply(gradient) * (0.5 * step_size * step_size)
}
