//! Adaptation and staging schedules observed through the public kernel API.
//!
//! The kernels are stepped by hand here so that their proposals stay
//! reachable after the run.

use muq_mcmc::core::{State, TransitionKernel};
use muq_mcmc::distributions::{Gaussian, Requirements, TargetModel};
use muq_mcmc::kernel::{DrKernel, MhKernel};
use muq_mcmc::proposal::{AdaptSchedule, AmProposal, AmalaProposal};
use nalgebra::{dmatrix, dvector};
use rand::rngs::SmallRng;
use rand::SeedableRng;

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SIZE: usize = 5_000;
    const SEED: u64 = 42;

    fn target() -> Gaussian {
        Gaussian::new(dvector![0.0, 0.0], dmatrix![1.0, 0.0; 0.0, 3.0]).unwrap()
    }

    fn run<K: TransitionKernel>(kernel: &mut K, target: &dyn TargetModel, steps: usize) {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut state =
            State::evaluate(target, dvector![0.0, 0.0], kernel.requirements()).unwrap();
        for step in 1..=steps {
            state = kernel.step(step, target, &state, &mut rng).unwrap().state;
        }
    }

    fn schedule() -> AdaptSchedule {
        AdaptSchedule {
            start: 100,
            interval: 100,
            scale: 1.0,
        }
    }

    #[test]
    fn am_covariance_tracks_target() {
        let target = target();
        let proposal = AmProposal::new(2, 0.5, schedule()).unwrap();
        let mut kernel = MhKernel::new(&target, proposal).unwrap();
        run(&mut kernel, &target, SAMPLE_SIZE);

        let adapter = kernel.proposal().adapter();
        assert_eq!(adapter.n_adapted(), SAMPLE_SIZE / 100);
        let cov = kernel.proposal().covariance();
        assert!(
            (cov[(0, 0)] - 1.0).abs() < 0.3,
            "adapted cov[0,0] = {}",
            cov[(0, 0)]
        );
        assert!(
            (cov[(1, 1)] - 3.0).abs() < 0.9,
            "adapted cov[1,1] = {}",
            cov[(1, 1)]
        );
    }

    #[test]
    fn am_is_unchanged_before_start() {
        let target = target();
        let late = AdaptSchedule {
            start: 1_000,
            ..schedule()
        };
        let mut kernel = MhKernel::new(&target, AmProposal::new(2, 0.5, late).unwrap()).unwrap();
        run(&mut kernel, &target, 999);
        assert_eq!(kernel.proposal().adapter().n_adapted(), 0);
        assert_eq!(*kernel.proposal().covariance(), dmatrix![0.5, 0.0; 0.0, 0.5]);
    }

    #[test]
    fn amala_is_unchanged_before_start() {
        let target = target();
        let proposal = AmalaProposal::new(2, 0.5, schedule(), 0.9, 5.0).unwrap();
        let mut kernel = MhKernel::new(&target, proposal).unwrap();
        assert_eq!(kernel.requirements(), Requirements::GRADIENT);
        run(&mut kernel, &target, 99);
        assert_eq!(kernel.proposal().adapter().n_adapted(), 0);
        assert_eq!(*kernel.proposal().covariance(), dmatrix![0.5, 0.0; 0.0, 0.5]);
    }

    #[test]
    fn amala_covariance_tracks_target() {
        let target = target();
        let proposal = AmalaProposal::new(2, 0.5, schedule(), 0.9, 5.0).unwrap();
        let mut kernel = MhKernel::new(&target, proposal).unwrap();
        run(&mut kernel, &target, SAMPLE_SIZE);

        assert_eq!(kernel.proposal().adapter().n_adapted(), SAMPLE_SIZE / 100);
        let cov = kernel.proposal().covariance();
        assert!(
            (cov[(0, 0)] - 1.0).abs() < 0.3,
            "adapted cov[0,0] = {}",
            cov[(0, 0)]
        );
        assert!(
            (cov[(1, 1)] - 3.0).abs() < 0.9,
            "adapted cov[1,1] = {}",
            cov[(1, 1)]
        );
    }

    #[test]
    fn dram_stages_switch_off_after_num_steps() {
        let target = target();
        let mut kernel = DrKernel::dram(&target, 2.0, schedule(), 3, 2.0, 200).unwrap();
        let divisors: Vec<f64> = kernel.stages().iter().map(|s| s.variance_divisor).collect();
        assert_eq!(divisors, vec![1.0, 2.0, 4.0]);
        assert_eq!(kernel.stages_at(200), 3);
        assert_eq!(kernel.stages_at(201), 1);
        run(&mut kernel, &target, 400);
        assert_eq!(kernel.name(), "DR");
    }
}
