//! Adaptive Metropolis (Haario et al. 2001) and adaptive MALA with truncated drift (Atchadé 2006).

use log::debug;
use nalgebra::{DMatrix, DVector};
use std::borrow::Cow;

use super::{langevin_drift, Moments, Proposal};
use crate::core::{State, DEBUG_VERBOSITY};
use crate::distributions::Requirements;
use crate::error::{InstabilityGuard, McmcError, Result};
use crate::gaussian::{GaussianCov, JITTER};
use crate::stats::RunningStatistics;

/// When to replace a proposal covariance with the scaled chain covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptSchedule {
    /// First step at which adaptation happens.
    pub start: usize,
    /// Steps between adaptations.
    pub interval: usize,
    /// Multiplier `s_d` applied to the sample covariance.
    pub scale: f64,
}

impl AdaptSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(McmcError::InvalidConfig("AdaptSteps must be at least 1".into()));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "AdaptScale must be positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }

    /// Whether `step` is an adaptation tick.
    pub fn is_tick(&self, step: usize) -> bool {
        step >= self.start && (step - self.start) % self.interval == 0
    }
}

/**
Covariance adaptation shared by [`AmProposal`] and [`AmalaProposal`].

Every observed chain state updates Welford running moments in `O(dim^2)`. At a
scheduled tick the covariance becomes `scale * Cov(chain) + 1e-10 I`. If that
matrix cannot be factored, the last valid covariance is kept with extra
jitter and the failure is counted.
*/
#[derive(Debug, Clone)]
pub struct CovarianceAdapter {
    cov: GaussianCov,
    schedule: AdaptSchedule,
    history: RunningStatistics,
    guard: InstabilityGuard,
    n_adapted: usize,
    verbose: u8,
}

impl CovarianceAdapter {
    pub fn new(initial: GaussianCov, schedule: AdaptSchedule) -> Result<Self> {
        schedule.validate()?;
        let dim = initial.dim();
        Ok(Self {
            cov: initial,
            schedule,
            history: RunningStatistics::with_max_lag(dim, 0),
            guard: InstabilityGuard::new(),
            n_adapted: 0,
            verbose: 0,
        })
    }

    pub fn current(&self) -> &GaussianCov {
        &self.cov
    }

    pub fn schedule(&self) -> &AdaptSchedule {
        &self.schedule
    }

    /// Number of ticks at which the covariance was actually replaced.
    pub fn n_adapted(&self) -> usize {
        self.n_adapted
    }

    pub fn set_verbose(&mut self, verbose: u8) {
        self.verbose = verbose;
    }

    pub fn observe(&mut self, step: usize, position: &DVector<f64>) -> Result<()> {
        self.history.update(position);
        if !self.schedule.is_tick(step) || self.history.count() < 2 {
            return Ok(());
        }
        let dim = self.cov.dim();
        let proposed =
            self.history.covariance() * self.schedule.scale + DMatrix::identity(dim, dim) * JITTER;
        match GaussianCov::try_new(proposed) {
            Some(cov) => {
                self.cov = cov;
                self.n_adapted += 1;
                self.guard.success();
                if self.verbose >= DEBUG_VERBOSITY {
                    debug!(
                        "step {step}: adapted proposal covariance from {} samples",
                        self.history.count()
                    );
                }
            }
            None => {
                let bump = JITTER * 10f64.powi(self.guard.consecutive() as i32 + 1);
                self.cov = self.cov.inflated(bump)?;
                self.guard
                    .failure(&format!("step {step}: adapted covariance is not positive-definite"))?;
            }
        }
        Ok(())
    }
}

/**
Adaptive Metropolis proposal.

Behaves like a random walk with covariance `prop_size * I` until the first
adaptation tick, after which the covariance tracks the scaled chain covariance.
*/
#[derive(Debug, Clone)]
pub struct AmProposal {
    adapter: CovarianceAdapter,
}

impl AmProposal {
    pub fn new(dim: usize, prop_size: f64, schedule: AdaptSchedule) -> Result<Self> {
        let initial = GaussianCov::isotropic(dim, prop_size)?;
        Ok(Self {
            adapter: CovarianceAdapter::new(initial, schedule)?,
        })
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        self.adapter.current().matrix()
    }

    pub fn adapter(&self) -> &CovarianceAdapter {
        &self.adapter
    }
}

impl Proposal for AmProposal {
    fn requirements(&self) -> Requirements {
        Requirements::NONE
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn moments(&self, from: &State) -> Result<Moments<'_>> {
        Ok(Moments {
            mean: from.position.clone(),
            cov: Cow::Borrowed(self.adapter.current()),
            variance_divisor: 1.0,
        })
    }

    fn adapt(&mut self, step: usize, state: &State) -> Result<()> {
        self.adapter.observe(step, &state.position)
    }

    fn set_verbose(&mut self, verbose: u8) {
        self.adapter.set_verbose(verbose);
    }

    fn name(&self) -> &'static str {
        "AM"
    }
}

/**
Adaptive MALA proposal with a truncated drift.

The mean is shifted by the Langevin drift `h²/2 Σ ∇log p(x)`, rescaled to have
norm at most `max_drift`; `Σ` adapts on the AM schedule.
*/
#[derive(Debug, Clone)]
pub struct AmalaProposal {
    adapter: CovarianceAdapter,
    step_size: f64,
    max_drift: f64,
}

impl AmalaProposal {
    pub fn new(
        dim: usize,
        prop_size: f64,
        schedule: AdaptSchedule,
        step_size: f64,
        max_drift: f64,
    ) -> Result<Self> {
        if !(max_drift.is_finite() && max_drift > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "MaxDrift must be positive, got {max_drift}"
            )));
        }
        if !(step_size.is_finite() && step_size > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "StepSize must be positive, got {step_size}"
            )));
        }
        let initial = GaussianCov::isotropic(dim, prop_size)?;
        Ok(Self {
            adapter: CovarianceAdapter::new(initial, schedule)?,
            step_size,
            max_drift,
        })
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        self.adapter.current().matrix()
    }

    pub fn adapter(&self) -> &CovarianceAdapter {
        &self.adapter
    }

    /// Truncated drift at `state`.
    pub fn drift(&self, state: &State) -> Result<DVector<f64>> {
        let drift = langevin_drift(self.adapter.current(), state.gradient()?, self.step_size);
        let norm = drift.norm();
        if norm > self.max_drift {
            Ok(drift * (self.max_drift / norm))
        } else {
            Ok(drift)
        }
    }
}

impl Proposal for AmalaProposal {
    fn requirements(&self) -> Requirements {
        Requirements::GRADIENT
    }

    fn is_symmetric(&self) -> bool {
        false
    }

    fn moments(&self, from: &State) -> Result<Moments<'_>> {
        Ok(Moments {
            mean: &from.position + self.drift(from)?,
            cov: Cow::Borrowed(self.adapter.current()),
            variance_divisor: 1.0 / (self.step_size * self.step_size),
        })
    }

    fn adapt(&mut self, step: usize, state: &State) -> Result<()> {
        self.adapter.observe(step, &state.position)
    }

    fn set_verbose(&mut self, verbose: u8) {
        self.adapter.set_verbose(verbose);
    }

    fn name(&self) -> &'static str {
        "AMALA"
    }
}
