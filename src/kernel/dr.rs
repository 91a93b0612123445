use log::debug;
use rand::rngs::SmallRng;

use super::{evaluate_candidate, recover};
use crate::core::{accept, State, Transition, TransitionKernel, DEBUG_VERBOSITY};
use crate::distributions::{Requirements, TargetModel};
use crate::error::{InstabilityGuard, McmcError, Result};
use crate::proposal::{AdaptSchedule, AmProposal, Proposal};

/// One delayed-rejection stage: which proposal to draw from and how much to shrink its variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrStage {
    pub proposal: usize,
    pub variance_divisor: f64,
}

/**
Delayed-rejection kernel (Tierney & Mira 1999; Green & Mira 2001).

After a rejection at stage `k` the kernel draws again from the same current
state with stage `k + 1`. The stage-`k` acceptance probability carries the
rejection probabilities of all earlier stages along the forward path and along
the reversed path, which keeps the chain reversible for any number of stages.

Full staging runs only for steps `1..=num_steps`; later steps use the first
stage alone. Proposals keep adapting on every step either way.
*/
pub struct DrKernel {
    proposals: Vec<Box<dyn Proposal>>,
    stages: Vec<DrStage>,
    num_steps: usize,
    needs: Requirements,
    guard: InstabilityGuard,
    verbose: u8,
}

impl DrKernel {
    pub fn new(
        target: &dyn TargetModel,
        proposals: Vec<Box<dyn Proposal>>,
        stages: Vec<DrStage>,
        num_steps: usize,
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(McmcError::InvalidConfig(
                "delayed rejection needs at least one stage".into(),
            ));
        }
        for stage in &stages {
            if stage.proposal >= proposals.len() {
                return Err(McmcError::InvalidConfig(format!(
                    "stage refers to proposal {} but only {} exist",
                    stage.proposal,
                    proposals.len()
                )));
            }
            if !(stage.variance_divisor.is_finite() && stage.variance_divisor > 0.0) {
                return Err(McmcError::InvalidConfig(format!(
                    "stage scale must be positive, got {}",
                    stage.variance_divisor
                )));
            }
        }
        let needs = proposals
            .iter()
            .fold(Requirements::NONE, |acc, p| acc.union(p.requirements()));
        needs.check(target)?;
        Ok(Self {
            proposals,
            stages,
            num_steps,
            needs,
            guard: InstabilityGuard::new(),
            verbose: 0,
        })
    }

    /// `count` stages of one proposal; stage `k` (from 0) divides its variance by `scale^k`.
    pub fn scaled(
        target: &dyn TargetModel,
        proposal: Box<dyn Proposal>,
        count: usize,
        scale: f64,
        num_steps: usize,
    ) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(McmcError::InvalidConfig(format!(
                "DR scale must be positive, got {scale}"
            )));
        }
        let stages = (0..count)
            .map(|k| DrStage {
                proposal: 0,
                variance_divisor: scale.powi(k as i32),
            })
            .collect();
        Self::new(target, vec![proposal], stages, num_steps)
    }

    /// One stage per proposal, in order.
    pub fn explicit(
        target: &dyn TargetModel,
        proposals: Vec<Box<dyn Proposal>>,
        num_steps: usize,
    ) -> Result<Self> {
        let stages = (0..proposals.len())
            .map(|proposal| DrStage {
                proposal,
                variance_divisor: 1.0,
            })
            .collect();
        Self::new(target, proposals, stages, num_steps)
    }

    /// DRAM: delayed rejection whose stages all shrink one adaptive Metropolis proposal.
    pub fn dram(
        target: &dyn TargetModel,
        prop_size: f64,
        schedule: AdaptSchedule,
        count: usize,
        scale: f64,
        num_steps: usize,
    ) -> Result<Self> {
        let am = AmProposal::new(target.dim(), prop_size, schedule)?;
        Self::scaled(target, Box::new(am), count, scale, num_steps)
    }

    pub fn stages(&self) -> &[DrStage] {
        &self.stages
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Number of stages attempted at `step` at most.
    pub fn stages_at(&self, step: usize) -> usize {
        if step <= self.num_steps {
            self.stages.len()
        } else {
            1
        }
    }

    fn stage_log_density(&self, stage: usize, from: &State, to: &State) -> Result<f64> {
        let DrStage {
            proposal,
            variance_divisor,
        } = self.stages[stage];
        self.proposals[proposal].log_density_scaled(from, to, variance_divisor)
    }

    /**
    Log acceptance probability of the last state of `path = [x, y_1, .., y_k]`
    given that stages `1..k` rejected `y_1..y_{k-1}`.

    Numerator and denominator follow the reversed path `[y_k, y_{k-1}, .., x]`
    and the forward path respectively, each term of the product
    `prod_i (1 - alpha_i)` evaluated recursively on the matching prefix.
    */
    fn log_alpha(&self, path: &[&State]) -> Result<f64> {
        let k = path.len() - 1;
        let first = path[0];
        let last = path[k];
        if !last.log_density.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }

        let mut numerator = last.log_density;
        let mut denominator = first.log_density;
        for i in 1..=k {
            let stage = self.stages[i - 1];
            // The outermost term cancels exactly for a symmetric proposal.
            if i == k && self.proposals[stage.proposal].is_symmetric() {
                continue;
            }
            numerator += self.stage_log_density(i - 1, last, path[k - i])?;
            denominator += self.stage_log_density(i - 1, first, path[i])?;
        }

        for i in 1..k {
            let forward = self.log_alpha(&path[..=i])?;
            let reversed: Vec<&State> = path.iter().rev().take(i + 1).copied().collect();
            let backward = self.log_alpha(&reversed)?;
            numerator += log_rejection(backward);
            denominator += log_rejection(forward);
            if numerator == f64::NEG_INFINITY {
                return Ok(f64::NEG_INFINITY);
            }
        }
        Ok(numerator - denominator)
    }
}

/// `ln(1 - min(1, exp(log_alpha)))`.
fn log_rejection(log_alpha: f64) -> f64 {
    if log_alpha >= 0.0 {
        f64::NEG_INFINITY
    } else {
        (-log_alpha.exp()).ln_1p()
    }
}

impl TransitionKernel for DrKernel {
    fn requirements(&self) -> Requirements {
        self.needs
    }

    fn step(
        &mut self,
        step: usize,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let mut path = vec![current.clone()];
        let mut transition = Transition::rejected(current);

        for stage in 0..self.stages_at(step) {
            let DrStage {
                proposal,
                variance_divisor,
            } = self.stages[stage];
            let drawn = self.proposals[proposal].propose_scaled(current, variance_divisor, rng);
            let Some(position) = recover(drawn, &mut self.guard)? else {
                break;
            };
            let candidate = evaluate_candidate(target, position, self.needs, &mut self.guard)?;
            path.push(candidate);

            let refs: Vec<&State> = path.iter().collect();
            let Some(log_alpha) = recover(self.log_alpha(&refs), &mut self.guard)? else {
                break;
            };
            if accept(log_alpha, rng) {
                if stage > 0 && self.verbose >= DEBUG_VERBOSITY {
                    debug!("step {step}: accepted at delayed-rejection stage {}", stage + 1);
                }
                if let Some(state) = path.pop() {
                    transition = Transition::accepted(state);
                }
                break;
            }
        }

        for proposal in self.proposals.iter_mut() {
            proposal.adapt(step, &transition.state)?;
        }
        Ok(transition)
    }

    fn name(&self) -> &'static str {
        "DR"
    }

    fn set_verbose(&mut self, verbose: u8) {
        self.verbose = verbose;
        for proposal in self.proposals.iter_mut() {
            proposal.set_verbose(verbose);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_acceptance_ratio;
    use crate::distributions::Gaussian;
    use crate::proposal::{MhProposal, Moments};
    use approx::assert_abs_diff_eq;
    use nalgebra::{dvector, DVector};
    use rand::SeedableRng;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Random walk that counts how many candidates it has drawn.
    struct Counting {
        inner: MhProposal,
        draws: Rc<Cell<usize>>,
    }

    impl Proposal for Counting {
        fn requirements(&self) -> Requirements {
            Requirements::NONE
        }

        fn is_symmetric(&self) -> bool {
            true
        }

        fn moments(&self, from: &State) -> Result<Moments<'_>> {
            self.inner.moments(from)
        }

        fn propose_scaled(
            &mut self,
            current: &State,
            variance_divisor: f64,
            rng: &mut SmallRng,
        ) -> Result<DVector<f64>> {
            self.draws.set(self.draws.get() + 1);
            self.inner.propose_scaled(current, variance_divisor, rng)
        }

        fn name(&self) -> &'static str {
            "Counting"
        }
    }

    /// Density supported on a single point: every move away from the origin is rejected.
    struct Spike;

    impl TargetModel for Spike {
        fn dim(&self) -> usize {
            2
        }

        fn log_density(&self, x: &DVector<f64>) -> f64 {
            if x.iter().all(|v| *v == 0.0) {
                0.0
            } else {
                f64::NEG_INFINITY
            }
        }
    }

    #[test]
    fn staging_stops_after_num_steps() {
        let draws = Rc::new(Cell::new(0));
        let counting = Counting {
            inner: MhProposal::isotropic(2, 1.0).unwrap(),
            draws: Rc::clone(&draws),
        };
        let mut kernel = DrKernel::scaled(&Spike, Box::new(counting), 3, 2.0, 10).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let start = State::evaluate(&Spike, dvector![0.0, 0.0], Requirements::NONE).unwrap();

        for step in 1..=10 {
            kernel.step(step, &Spike, &start, &mut rng).unwrap();
        }
        assert_eq!(draws.get(), 30);
        for step in 11..=25 {
            kernel.step(step, &Spike, &start, &mut rng).unwrap();
        }
        assert_eq!(draws.get(), 30 + 15);
    }

    #[test]
    fn stage_divisors_are_powers_of_scale() {
        let target = Gaussian::standard(2);
        let kernel =
            DrKernel::scaled(&target, Box::new(MhProposal::isotropic(2, 1.0).unwrap()), 3, 2.0, 5)
                .unwrap();
        let divisors: Vec<f64> = kernel.stages().iter().map(|s| s.variance_divisor).collect();
        assert_eq!(divisors, vec![1.0, 2.0, 4.0]);
        assert_eq!(kernel.stages_at(5), 3);
        assert_eq!(kernel.stages_at(6), 1);
    }

    #[test]
    fn first_stage_matches_metropolis_ratio() {
        let target = Gaussian::standard(2);
        let kernel =
            DrKernel::scaled(&target, Box::new(MhProposal::isotropic(2, 1.0).unwrap()), 2, 2.0, 5)
                .unwrap();
        let x = State::evaluate(&target, dvector![0.3, 0.1], Requirements::NONE).unwrap();
        let y = State::evaluate(&target, dvector![1.3, -0.8], Requirements::NONE).unwrap();
        assert_eq!(
            kernel.log_alpha(&[&x, &y]).unwrap(),
            log_acceptance_ratio(&x, &y, None)
        );
    }

    #[test]
    fn second_stage_matches_closed_form() {
        let target = Gaussian::standard(1);
        let prop_size = 4.0;
        let kernel = DrKernel::scaled(
            &target,
            Box::new(MhProposal::isotropic(1, prop_size).unwrap()),
            2,
            2.0,
            5,
        )
        .unwrap();
        let x = State::evaluate(&target, dvector![0.2], Requirements::NONE).unwrap();
        let y1 = State::evaluate(&target, dvector![2.5], Requirements::NONE).unwrap();
        let y2 = State::evaluate(&target, dvector![-0.4], Requirements::NONE).unwrap();

        let log_q1 = |a: f64, b: f64| {
            -0.5 * ((2.0 * std::f64::consts::PI * prop_size).ln() + (a - b).powi(2) / prop_size)
        };
        let alpha1 = |from: &State, to: &State| (to.log_density - from.log_density).exp().min(1.0);
        let expected = y2.log_density + log_q1(y2.position[0], y1.position[0])
            + (1.0 - alpha1(&y2, &y1)).ln()
            - x.log_density
            - log_q1(x.position[0], y1.position[0])
            - (1.0 - alpha1(&x, &y1)).ln();

        assert_abs_diff_eq!(
            kernel.log_alpha(&[&x, &y1, &y2]).unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn explicit_stages_use_each_proposal() {
        let target = Gaussian::standard(2);
        let proposals: Vec<Box<dyn Proposal>> = vec![
            Box::new(MhProposal::isotropic(2, 3.0).unwrap()),
            Box::new(MhProposal::isotropic(2, 1.0).unwrap()),
        ];
        let kernel = DrKernel::explicit(&target, proposals, 100).unwrap();
        assert_eq!(
            kernel.stages(),
            &[
                DrStage {
                    proposal: 0,
                    variance_divisor: 1.0
                },
                DrStage {
                    proposal: 1,
                    variance_divisor: 1.0
                }
            ]
        );
    }

    #[test]
    fn rejects_empty_or_bad_stages() {
        let target = Gaussian::standard(2);
        let proposal = || Box::new(MhProposal::isotropic(2, 1.0).unwrap()) as Box<dyn Proposal>;
        assert!(DrKernel::scaled(&target, proposal(), 0, 2.0, 10).is_err());
        assert!(DrKernel::scaled(&target, proposal(), 2, 0.0, 10).is_err());
        assert!(DrKernel::explicit(&target, Vec::new(), 10).is_err());
    }
}
