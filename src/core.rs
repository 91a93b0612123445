//! Chain states and the transition-kernel contract shared by every sampler.

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::distributions::{Requirements, TargetModel};
use crate::error::{McmcError, Result};

/// Verbosity at which kernels, proposals and adapters log every adaptation event.
pub const DEBUG_VERBOSITY: u8 = 3;

/// A point in the target's domain together with the evaluations cached at it.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub position: DVector<f64>,
    pub log_density: f64,
    pub gradient: Option<DVector<f64>>,
    pub metric: Option<DMatrix<f64>>,
}

impl State {
    /// Evaluates `target` at `position`, caching whatever `needs` asks for.
    ///
    /// Gradients and metrics are only evaluated where the log-density is
    /// finite; states outside the support are always rejected anyway.
    pub fn evaluate(
        target: &dyn TargetModel,
        position: DVector<f64>,
        needs: Requirements,
    ) -> Result<Self> {
        if position.len() != target.dim() {
            return Err(McmcError::InvalidConfig(format!(
                "state has dimension {}, target expects {}",
                position.len(),
                target.dim()
            )));
        }
        let log_density = target.log_density(&position);
        let finite = log_density.is_finite();
        let gradient = if needs.gradient && finite {
            Some(target.gradient(&position)?)
        } else {
            None
        };
        let metric = if needs.metric && finite {
            Some(target.metric(&position)?)
        } else {
            None
        };
        Ok(Self {
            position,
            log_density,
            gradient,
            metric,
        })
    }

    pub fn dim(&self) -> usize {
        self.position.len()
    }

    /// Gradient cached at this state.
    pub fn gradient(&self) -> Result<&DVector<f64>> {
        self.gradient.as_ref().ok_or(McmcError::NotDifferentiable)
    }

    /// Metric cached at this state.
    pub fn metric(&self) -> Result<&DMatrix<f64>> {
        self.metric.as_ref().ok_or(McmcError::NoMetric)
    }
}

/// Outcome of one kernel step: the next chain state and whether it is a new point.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: State,
    pub accepted: bool,
}

impl Transition {
    pub fn accepted(state: State) -> Self {
        Self {
            state,
            accepted: true,
        }
    }

    pub fn rejected(current: &State) -> Self {
        Self {
            state: current.clone(),
            accepted: false,
        }
    }
}

/// Advances a chain by one state.
///
/// `step` is the 1-based index of the transition being produced; kernels use it
/// for their adaptation and staging schedules. Rejection is a normal outcome
/// (`accepted == false`, the current state repeats), never an error.
pub trait TransitionKernel {
    /// Target capabilities the kernel needs cached in every state it receives.
    fn requirements(&self) -> Requirements;

    fn step(
        &mut self,
        step: usize,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition>;

    /// Short human-readable name used in log output.
    fn name(&self) -> &'static str;

    /// Sets the chain's verbosity; kernels only emit per-step `debug!` output at level 3.
    fn set_verbose(&mut self, _verbose: u8) {}
}

/**
Metropolis-Hastings log acceptance ratio

\[
\log \alpha = \left[\log p(y) + \log q(x \mid y)\right] - \left[\log p(x) + \log q(y \mid x)\right].
\]

Pass `None` for the proposal terms of a symmetric proposal; the ratio then
reduces to the log-density difference exactly.
*/
pub fn log_acceptance_ratio(
    current: &State,
    candidate: &State,
    log_q_forward_backward: Option<(f64, f64)>,
) -> f64 {
    if candidate.log_density == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let delta = candidate.log_density - current.log_density;
    match log_q_forward_backward {
        None => delta,
        Some((forward, backward)) => delta + backward - forward,
    }
}

/// Draws `u ~ U(0, 1)` and accepts when `ln u < log_alpha`.
pub fn accept(log_alpha: f64, rng: &mut SmallRng) -> bool {
    let u: f64 = rng.gen();
    u.ln() < log_alpha
}
