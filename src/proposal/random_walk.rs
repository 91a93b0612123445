use nalgebra::DMatrix;
use std::borrow::Cow;

use super::{Moments, Proposal};
use crate::core::State;
use crate::distributions::Requirements;
use crate::error::{McmcError, Result};
use crate::gaussian::GaussianCov;

/**
Random-walk proposal: the candidate is the current position plus zero-mean
Gaussian noise with a fixed covariance.

# Examples

```rust
use muq_mcmc::core::State;
use muq_mcmc::distributions::{Gaussian, Requirements};
use muq_mcmc::proposal::{MhProposal, Proposal};
use nalgebra::dvector;
use rand::{rngs::SmallRng, SeedableRng};

let target = Gaussian::standard(2);
let mut proposal = MhProposal::isotropic(2, 2.88).unwrap();
let current = State::evaluate(&target, dvector![0.0, 0.0], Requirements::NONE).unwrap();
let candidate = proposal.propose(&current, &mut SmallRng::seed_from_u64(1)).unwrap();
assert_eq!(candidate.len(), 2);
```
*/
#[derive(Debug, Clone)]
pub struct MhProposal {
    cov: GaussianCov,
}

impl MhProposal {
    pub fn new(cov: GaussianCov) -> Self {
        Self { cov }
    }

    /// Proposal with covariance `prop_size * I`.
    pub fn isotropic(dim: usize, prop_size: f64) -> Result<Self> {
        Ok(Self::new(GaussianCov::isotropic(dim, prop_size)?))
    }

    /// Proposal with a user-supplied covariance; fails unless it is positive-definite.
    pub fn with_covariance(cov: DMatrix<f64>) -> Result<Self> {
        GaussianCov::try_new(cov)
            .map(Self::new)
            .ok_or_else(|| McmcError::InvalidConfig("proposal covariance is not positive-definite".into()))
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        self.cov.matrix()
    }
}

impl Proposal for MhProposal {
    fn requirements(&self) -> Requirements {
        Requirements::NONE
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn moments(&self, from: &State) -> Result<Moments<'_>> {
        Ok(Moments {
            mean: from.position.clone(),
            cov: Cow::Borrowed(&self.cov),
            variance_divisor: 1.0,
        })
    }

    fn name(&self) -> &'static str {
        "MHProposal"
    }
}
