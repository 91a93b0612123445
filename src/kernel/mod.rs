/*!
Transition kernels: the accept/reject machinery built around proposals.

- [`MhKernel`] runs one proposal and one Metropolis-Hastings test per step.
- [`DrKernel`] retries rejected proposals from the same state with further
  stages (delayed rejection); [`DrKernel::dram`] builds the DRAM variant.
- [`TransportMapKernel`] runs an inner chain on the pushforward of the target
  through a periodically refitted [`TransportMap`](crate::transport::TransportMap).
- [`NutsKernel`] is the slice No-U-Turn sampler with dual-averaging step sizes.

Every kernel validates the target's capabilities when it is constructed, so a
missing gradient or metric is reported before the first step.
*/

mod dr;
mod mh;
mod nuts;
mod transport_map;

pub use dr::{DrKernel, DrStage};
pub use mh::MhKernel;
pub use nuts::{NutsKernel, NutsOptions};
pub use transport_map::TransportMapKernel;

use nalgebra::DVector;

use crate::core::State;
use crate::distributions::{Requirements, TargetModel};
use crate::error::{InstabilityGuard, McmcError, Result};

/// Evaluates a candidate, treating a NaN log-density as a recoverable failure.
///
/// A NaN candidate is returned with log-density `-inf` so it is rejected; the
/// failure counts towards the guard's bound. Finite candidates reset the guard.
pub(crate) fn evaluate_candidate(
    target: &dyn TargetModel,
    position: DVector<f64>,
    needs: Requirements,
    guard: &mut InstabilityGuard,
) -> Result<State> {
    let mut state = State::evaluate(target, position, needs)?;
    if state.log_density.is_nan() {
        guard.failure("candidate log-density is NaN")?;
        state.log_density = f64::NEG_INFINITY;
    } else if state.log_density.is_finite() {
        guard.success();
    }
    Ok(state)
}

/// Turns a recoverable numerical failure into `None`, counting it in `guard`.
pub(crate) fn recover<T>(result: Result<T>, guard: &mut InstabilityGuard) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(McmcError::NumericalInstability(what)) => {
            guard.failure(&what)?;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MAX_CONSECUTIVE_FAILURES;
    use nalgebra::dvector;

    struct NanTarget;

    impl TargetModel for NanTarget {
        fn dim(&self) -> usize {
            1
        }

        fn log_density(&self, x: &DVector<f64>) -> f64 {
            if x[0] > 0.0 {
                f64::NAN
            } else {
                -0.5 * x[0] * x[0]
            }
        }
    }

    #[test]
    fn nan_candidates_are_rejected_then_escalate() {
        let mut guard = InstabilityGuard::new();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            let state =
                evaluate_candidate(&NanTarget, dvector![1.0], Requirements::NONE, &mut guard)
                    .unwrap();
            assert_eq!(state.log_density, f64::NEG_INFINITY);
        }
        let err = evaluate_candidate(&NanTarget, dvector![1.0], Requirements::NONE, &mut guard)
            .unwrap_err();
        assert!(matches!(err, McmcError::NumericalInstability(_)));
    }

    #[test]
    fn finite_candidate_resets_guard() {
        let mut guard = InstabilityGuard::new();
        evaluate_candidate(&NanTarget, dvector![1.0], Requirements::NONE, &mut guard).unwrap();
        assert_eq!(guard.consecutive(), 1);
        evaluate_candidate(&NanTarget, dvector![-1.0], Requirements::NONE, &mut guard).unwrap();
        assert_eq!(guard.consecutive(), 0);
    }

    #[test]
    fn recover_only_swallows_instability() {
        let mut guard = InstabilityGuard::new();
        let swallowed: Result<f64> = Err(McmcError::NumericalInstability("singular".into()));
        assert_eq!(recover(swallowed, &mut guard).unwrap(), None);
        let fatal: Result<f64> = Err(McmcError::NoMetric);
        assert_eq!(recover(fatal, &mut guard).unwrap_err(), McmcError::NoMetric);
    }
}
