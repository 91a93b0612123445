//! The No-U-Turn sampler (Hoffman & Gelman 2014, Algorithm 3) with dual-averaging step sizes.

use log::debug;
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Exp1, StandardNormal};

use crate::core::{State, Transition, TransitionKernel, DEBUG_VERBOSITY};
use crate::distributions::{Requirements, TargetModel};
use crate::error::{McmcError, Result};

/// A trajectory point whose energy error exceeds this is treated as divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;
/// Halvings/doublings tried by the step-size heuristic before giving up.
const MAX_HEURISTIC_ITERATIONS: usize = 100;

/// Tuning of [`NutsKernel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NutsOptions {
    /// Trees stop doubling after this many levels.
    pub max_tree_depth: usize,
    /// Average acceptance statistic targeted by dual averaging.
    pub target_accept: f64,
    /// Initial step size; chosen by a heuristic at the first step when `None`.
    pub step_size: Option<f64>,
    /// Steps during which the step size adapts; frozen afterwards.
    pub adapt_steps: usize,
}

impl Default for NutsOptions {
    fn default() -> Self {
        Self {
            max_tree_depth: 10,
            target_accept: 0.8,
            step_size: None,
            adapt_steps: 1000,
        }
    }
}

impl NutsOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=20).contains(&self.max_tree_depth) {
            return Err(McmcError::InvalidConfig(format!(
                "MaxTreeDepth must be in 1..=20, got {}",
                self.max_tree_depth
            )));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(McmcError::InvalidConfig(format!(
                "TargetAccept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if let Some(eps) = self.step_size {
            if !(eps.is_finite() && eps > 0.0) {
                return Err(McmcError::InvalidConfig(format!(
                    "StepSize must be positive, got {eps}"
                )));
            }
        }
        Ok(())
    }
}

/// Nesterov dual averaging of `log(step size)` (Hoffman & Gelman, section 3.2.1).
#[derive(Debug, Clone, PartialEq)]
struct DualAveraging {
    mu: f64,
    h_bar: f64,
    log_eps_bar: f64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(epsilon: f64) -> Self {
        Self {
            mu: (10.0 * epsilon).ln(),
            h_bar: 0.0,
            log_eps_bar: 0.0,
        }
    }

    /// Feeds the acceptance statistic of adaptation step `m` (from 1); returns the next step size.
    fn update(&mut self, m: usize, target_accept: f64, accept_stat: f64) -> f64 {
        let m = m as f64;
        let eta = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - eta) * self.h_bar + eta * (target_accept - accept_stat);
        let log_eps = self.mu - m.sqrt() / Self::GAMMA * self.h_bar;
        let weight = m.powf(-Self::KAPPA);
        self.log_eps_bar = weight * log_eps + (1.0 - weight) * self.log_eps_bar;
        log_eps.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Position, momentum and gradient of one point of a trajectory.
#[derive(Debug, Clone)]
struct Phase {
    position: DVector<f64>,
    momentum: DVector<f64>,
    gradient: DVector<f64>,
    log_density: f64,
}

impl Phase {
    /// Log of the joint density `p(x) exp(-|r|²/2)`; `-inf` off the support.
    fn joint(&self) -> f64 {
        if self.log_density.is_finite() {
            self.log_density - 0.5 * self.momentum.norm_squared()
        } else {
            f64::NEG_INFINITY
        }
    }

    fn leapfrog(&self, epsilon: f64, target: &dyn TargetModel) -> Result<Phase> {
        let momentum = &self.momentum + &self.gradient * (0.5 * epsilon);
        let position = &self.position + &momentum * epsilon;
        let log_density = target.log_density(&position);
        let gradient = if log_density.is_finite() {
            target.gradient(&position)?
        } else {
            DVector::zeros(position.len())
        };
        let momentum = momentum + &gradient * (0.5 * epsilon);
        Ok(Phase {
            position,
            momentum,
            gradient,
            log_density,
        })
    }
}

/// A subtree built by [`NutsKernel::build_tree`].
struct Subtree {
    minus: Phase,
    plus: Phase,
    candidate: Phase,
    /// Points inside the slice.
    n: usize,
    /// No U-turn and no divergence so far.
    valid: bool,
    /// Sum of the acceptance statistics of all leaves, and their count.
    alpha: f64,
    n_alpha: usize,
    divergent: bool,
}

/// `true` while neither end of the trajectory has started moving back towards the other.
fn no_u_turn(minus: &Phase, plus: &Phase) -> bool {
    let span = &plus.position - &minus.position;
    span.dot(&minus.momentum) >= 0.0 && span.dot(&plus.momentum) >= 0.0
}

fn sample_momentum(dim: usize, rng: &mut SmallRng) -> DVector<f64> {
    DVector::from_iterator(dim, (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)))
}

/**
No-U-Turn sampler with an identity mass matrix.

Each step draws a momentum and a slice variable, then doubles a leapfrog
trajectory forwards or backwards in time until it makes a U-turn, diverges or
reaches `max_tree_depth`. The next state is drawn uniformly from the points of
the trajectory inside the slice. During the first `adapt_steps` steps the step
size follows dual averaging towards `target_accept`; afterwards it is frozen at
the averaged value.
*/
#[derive(Debug, Clone)]
pub struct NutsKernel {
    options: NutsOptions,
    epsilon: Option<f64>,
    averaging: Option<DualAveraging>,
    divergences: usize,
    verbose: u8,
}

impl NutsKernel {
    pub fn new(target: &dyn TargetModel, options: NutsOptions) -> Result<Self> {
        options.validate()?;
        Requirements::GRADIENT.check(target)?;
        Ok(Self {
            options,
            epsilon: options.step_size,
            averaging: options.step_size.map(DualAveraging::new),
            divergences: 0,
            verbose: 0,
        })
    }

    /// Current leapfrog step size, once it has been chosen.
    pub fn step_size(&self) -> Option<f64> {
        self.epsilon
    }

    /// Number of trajectories that stopped on a divergence.
    pub fn divergences(&self) -> usize {
        self.divergences
    }

    /// Doubles the step size while single leapfrog steps accept with probability above 1/2,
    /// or halves it while they accept with less.
    fn find_reasonable_epsilon(start: &Phase, target: &dyn TargetModel) -> Result<f64> {
        let mut epsilon = 1.0;
        let joint0 = start.joint();
        let mut next = start.leapfrog(epsilon, target)?;
        let mut iterations = 0;
        while !next.joint().is_finite() {
            epsilon *= 0.5;
            next = start.leapfrog(epsilon, target)?;
            iterations += 1;
            if iterations > MAX_HEURISTIC_ITERATIONS {
                return Err(McmcError::NumericalInstability(
                    "no step size keeps a leapfrog step inside the support".into(),
                ));
            }
        }

        let mut log_ratio = next.joint() - joint0;
        let direction: f64 = if log_ratio > 0.5f64.ln() { 1.0 } else { -1.0 };
        iterations = 0;
        while direction * log_ratio > -direction * 2.0f64.ln() {
            epsilon *= 2.0f64.powf(direction);
            next = start.leapfrog(epsilon, target)?;
            log_ratio = next.joint() - joint0;
            iterations += 1;
            if iterations > MAX_HEURISTIC_ITERATIONS || !log_ratio.is_finite() {
                break;
            }
        }
        Ok(epsilon)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_tree(
        edge: &Phase,
        log_u: f64,
        direction: f64,
        depth: usize,
        epsilon: f64,
        joint0: f64,
        target: &dyn TargetModel,
        rng: &mut SmallRng,
    ) -> Result<Subtree> {
        if depth == 0 {
            let leaf = edge.leapfrog(direction * epsilon, target)?;
            let joint = leaf.joint();
            let divergent = joint <= log_u - DIVERGENCE_THRESHOLD;
            let alpha = if joint.is_finite() {
                (joint - joint0).exp().min(1.0)
            } else {
                0.0
            };
            return Ok(Subtree {
                minus: leaf.clone(),
                plus: leaf.clone(),
                n: (log_u < joint) as usize,
                valid: !divergent,
                alpha,
                n_alpha: 1,
                divergent,
                candidate: leaf,
            });
        }

        let mut tree =
            Self::build_tree(edge, log_u, direction, depth - 1, epsilon, joint0, target, rng)?;
        if !tree.valid {
            return Ok(tree);
        }
        let outer_edge = if direction < 0.0 { &tree.minus } else { &tree.plus };
        let other = Self::build_tree(
            outer_edge,
            log_u,
            direction,
            depth - 1,
            epsilon,
            joint0,
            target,
            rng,
        )?;

        let total = tree.n + other.n;
        if total > 0 && rng.gen::<f64>() < other.n as f64 / total as f64 {
            tree.candidate = other.candidate;
        }
        if direction < 0.0 {
            tree.minus = other.minus;
        } else {
            tree.plus = other.plus;
        }
        tree.n = total;
        tree.valid = other.valid && no_u_turn(&tree.minus, &tree.plus);
        tree.alpha += other.alpha;
        tree.n_alpha += other.n_alpha;
        tree.divergent |= other.divergent;
        Ok(tree)
    }
}

impl TransitionKernel for NutsKernel {
    fn requirements(&self) -> Requirements {
        Requirements::GRADIENT
    }

    fn step(
        &mut self,
        step: usize,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let start = Phase {
            position: current.position.clone(),
            momentum: sample_momentum(current.dim(), rng),
            gradient: current.gradient()?.clone(),
            log_density: current.log_density,
        };
        let epsilon = match self.epsilon {
            Some(eps) => eps,
            None => {
                let eps = Self::find_reasonable_epsilon(&start, target)?;
                if self.verbose >= DEBUG_VERBOSITY {
                    debug!("step {step}: initial NUTS step size {eps:.4}");
                }
                self.averaging = Some(DualAveraging::new(eps));
                self.epsilon = Some(eps);
                eps
            }
        };

        let joint0 = start.joint();
        let log_u = joint0 - rng.sample::<f64, _>(Exp1);
        let mut minus = start.clone();
        let mut plus = start;
        let mut chosen: Option<Phase> = None;
        let mut n = 1;
        let mut alpha = 0.0;
        let mut n_alpha = 0;
        let mut divergent = false;

        for depth in 0..self.options.max_tree_depth {
            let direction = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            let edge = if direction < 0.0 { &minus } else { &plus };
            let tree =
                Self::build_tree(edge, log_u, direction, depth, epsilon, joint0, target, rng)?;

            if tree.valid && rng.gen::<f64>() < (tree.n as f64 / n as f64).min(1.0) {
                chosen = Some(tree.candidate);
            }
            if direction < 0.0 {
                minus = tree.minus;
            } else {
                plus = tree.plus;
            }
            n += tree.n;
            alpha = tree.alpha;
            n_alpha = tree.n_alpha;
            divergent |= tree.divergent;
            if !(tree.valid && no_u_turn(&minus, &plus)) {
                break;
            }
        }
        if divergent {
            self.divergences += 1;
            if self.verbose >= DEBUG_VERBOSITY {
                debug!("step {step}: divergent trajectory with step size {epsilon:.4}");
            }
        }

        if step <= self.options.adapt_steps {
            if let Some(averaging) = self.averaging.as_mut() {
                let accept_stat = if n_alpha > 0 { alpha / n_alpha as f64 } else { 0.0 };
                self.epsilon = Some(averaging.update(step, self.options.target_accept, accept_stat));
            }
        } else if step == self.options.adapt_steps + 1 {
            if let Some(averaging) = &self.averaging {
                if self.options.adapt_steps > 0 {
                    self.epsilon = Some(averaging.final_step_size());
                    if self.verbose >= DEBUG_VERBOSITY {
                        debug!("NUTS step size frozen at {:.4}", averaging.final_step_size());
                    }
                }
            }
        }

        Ok(match chosen {
            Some(phase) => Transition::accepted(State {
                position: phase.position,
                log_density: phase.log_density,
                gradient: Some(phase.gradient),
                metric: None,
            }),
            None => Transition::rejected(current),
        })
    }

    fn name(&self) -> &'static str {
        "NUTS"
    }

    fn set_verbose(&mut self, verbose: u8) {
        self.verbose = verbose;
    }
}
