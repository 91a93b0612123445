use rand::rngs::SmallRng;

use super::{evaluate_candidate, recover};
use crate::core::{accept, log_acceptance_ratio, State, Transition, TransitionKernel};
use crate::distributions::{Requirements, TargetModel};
use crate::error::{InstabilityGuard, Result};
use crate::proposal::Proposal;

/**
Metropolis-Hastings kernel: one proposal, one accept/reject test per step.

After every step the proposal sees the resulting chain state, so adaptive
proposals (AM, AMALA) keep their own schedule regardless of burn-in.

# Examples

```rust
use muq_mcmc::core::{State, TransitionKernel};
use muq_mcmc::distributions::{Gaussian, Requirements};
use muq_mcmc::kernel::MhKernel;
use muq_mcmc::proposal::MhProposal;
use nalgebra::dvector;
use rand::{rngs::SmallRng, SeedableRng};

let target = Gaussian::standard(2);
let mut kernel = MhKernel::new(&target, MhProposal::isotropic(2, 1.0).unwrap()).unwrap();
let mut rng = SmallRng::seed_from_u64(42);
let start = State::evaluate(&target, dvector![0.0, 0.0], Requirements::NONE).unwrap();
let next = kernel.step(1, &target, &start, &mut rng).unwrap();
assert_eq!(next.state.dim(), 2);
```
*/
#[derive(Debug, Clone)]
pub struct MhKernel<P: Proposal> {
    proposal: P,
    guard: InstabilityGuard,
}

impl<P: Proposal> MhKernel<P> {
    /// Fails with `NotDifferentiable`/`NoMetric` if `target` cannot serve the proposal.
    pub fn new(target: &dyn TargetModel, proposal: P) -> Result<Self> {
        proposal.requirements().check(target)?;
        Ok(Self {
            proposal,
            guard: InstabilityGuard::new(),
        })
    }

    pub fn proposal(&self) -> &P {
        &self.proposal
    }

    fn transition(
        &mut self,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let needs = self.proposal.requirements();
        let Some(position) = recover(self.proposal.propose(current, rng), &mut self.guard)? else {
            return Ok(Transition::rejected(current));
        };
        let candidate = evaluate_candidate(target, position, needs, &mut self.guard)?;

        let correction = if self.proposal.is_symmetric() || !candidate.log_density.is_finite() {
            None
        } else {
            let forward = self.proposal.log_density(current, &candidate);
            let backward = self.proposal.log_density(&candidate, current);
            match (
                recover(forward, &mut self.guard)?,
                recover(backward, &mut self.guard)?,
            ) {
                (Some(f), Some(b)) => Some((f, b)),
                _ => return Ok(Transition::rejected(current)),
            }
        };

        let log_alpha = log_acceptance_ratio(current, &candidate, correction);
        if accept(log_alpha, rng) {
            Ok(Transition::accepted(candidate))
        } else {
            Ok(Transition::rejected(current))
        }
    }
}

impl<P: Proposal> TransitionKernel for MhKernel<P> {
    fn requirements(&self) -> Requirements {
        self.proposal.requirements()
    }

    fn step(
        &mut self,
        step: usize,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let transition = self.transition(target, current, rng)?;
        self.proposal.adapt(step, &transition.state)?;
        Ok(transition)
    }

    fn name(&self) -> &'static str {
        "MHKernel"
    }

    fn set_verbose(&mut self, verbose: u8) {
        self.proposal.set_verbose(verbose);
    }
}
