//! End-to-end checks of the driver on a 2D Gaussian with covariance `diag(1, 3)`.
//!
//! 1. `mh_recovers_moments`: the random-walk kernel recovers mean and covariance.
//! 2. `statistics_match_raw_chain`: the running accumulator agrees with the kept chain.
//! 3. The ignored tests run every kernel for long enough to check stationarity tightly.

use muq_mcmc::chain::SampleResult;
use muq_mcmc::distributions::Gaussian;
use muq_mcmc::McmcConfig;
use nalgebra::{dmatrix, dvector};
use serde_json::{json, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;
    use ndarray_stats::CorrelationExt;

    const SAMPLE_SIZE: usize = 10_000;
    const BURNIN: usize = 1_000;
    const SEED: u64 = 42;

    fn target() -> Gaussian {
        Gaussian::new(dvector![0.0, 0.0], dmatrix![1.0, 0.0; 0.0, 3.0]).unwrap()
    }

    fn run(kernel: Value, steps: usize, burn_in: usize) -> SampleResult {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = McmcConfig::from_json_value(json!({
            "Steps": steps,
            "BurnIn": burn_in,
            "Seed": SEED,
            "Kernel": kernel,
        }))
        .expect("valid configuration");
        let target = target();
        config
            .build(&target)
            .expect("kernel builds")
            .sample(&target, &[0.0, 0.0])
            .expect("chain runs")
    }

    fn mh_kernel() -> Value {
        json!({
            "Method": "MHKernel",
            "Proposal": { "Name": "MHProposal", "PropSize": 2.88 }
        })
    }

    fn assert_moments(result: &SampleResult, mean_tol: [f64; 2], cov_tol: f64) {
        let mean = result.mean();
        let cov = result.covariance();
        assert!(
            mean[0].abs() < mean_tol[0],
            "mean[0] = {} not within {}",
            mean[0],
            mean_tol[0]
        );
        assert!(
            mean[1].abs() < mean_tol[1],
            "mean[1] = {} not within {}",
            mean[1],
            mean_tol[1]
        );
        assert!(
            (cov[(0, 0)] - 1.0).abs() < cov_tol,
            "cov[0,0] = {} should be close to 1",
            cov[(0, 0)]
        );
        assert!(
            (cov[(1, 1)] - 3.0).abs() < 3.0 * cov_tol,
            "cov[1,1] = {} should be close to 3",
            cov[(1, 1)]
        );
        assert!(
            cov[(0, 1)].abs() < 2.0 * cov_tol,
            "cov[0,1] = {} should be close to 0",
            cov[(0, 1)]
        );
    }

    #[test]
    fn mh_recovers_moments() {
        let result = run(mh_kernel(), SAMPLE_SIZE, BURNIN);
        assert_eq!(result.statistics.count(), SAMPLE_SIZE - BURNIN);
        assert!(
            result.acceptance_rate > 0.2 && result.acceptance_rate < 0.8,
            "acceptance rate {} is implausible",
            result.acceptance_rate
        );
        assert_moments(&result, [0.1, 0.2], 0.15);
    }

    #[test]
    fn statistics_match_raw_chain() {
        let result = run(mh_kernel(), SAMPLE_SIZE, BURNIN);
        let chain = result.chain.as_ref().expect("chain is kept by default");
        assert_eq!(chain.len(), SAMPLE_SIZE);

        let samples = chain.to_array();
        let post = samples.slice(s![BURNIN.., ..]);
        let expected = post.t().cov(1.0).expect("non-empty chain");
        let cov = result.covariance();
        for i in 0..2 {
            for j in 0..2 {
                assert!(
                    (expected[[i, j]] - cov[(i, j)]).abs() < 1e-8,
                    "cov[{i},{j}]: chain {} vs accumulator {}",
                    expected[[i, j]],
                    cov[(i, j)]
                );
            }
        }

        let ess = result.effective_sample_size();
        assert!(ess.iter().all(|&e| e > 100.0 && e <= (SAMPLE_SIZE - BURNIN) as f64 * 1.5));
    }

    #[test]
    #[ignore = "Slow test: run only when explicitly requested"]
    fn mh_detailed_balance_long_run() {
        let result = run(mh_kernel(), 200_000, 10_000);
        assert_moments(&result, [0.05, 0.05], 0.05);
    }

    #[test]
    #[ignore = "Slow test: run only when explicitly requested"]
    fn dram_detailed_balance_long_run() {
        let kernel = json!({
            "Method": "DR",
            "NumSteps": 50_000,
            "Stages": { "Scaled": {
                "Proposal": {
                    "Name": "AM", "PropSize": 4.0, "AdaptSteps": 100,
                    "AdaptStart": 1_000, "AdaptScale": 2.88
                },
                "Count": 3,
                "Scale": 2.0
            } }
        });
        let result = run(kernel, 200_000, 10_000);
        assert_moments(&result, [0.05, 0.05], 0.05);
    }

    #[test]
    #[ignore = "Slow test: run only when explicitly requested"]
    fn premala_detailed_balance_long_run() {
        let kernel = json!({
            "Method": "MHKernel",
            "Proposal": {
                "Name": "PreMALA", "PropSize": 1.0,
                "PropCov": [[1.0, 0.0], [0.0, 3.0]], "StepSize": 1.2
            }
        });
        let result = run(kernel, 200_000, 10_000);
        assert_moments(&result, [0.05, 0.05], 0.05);
    }

    #[test]
    #[ignore = "Slow test: run only when explicitly requested"]
    fn nuts_detailed_balance_long_run() {
        let result = run(json!({ "Method": "NUTS" }), 100_000, 5_000);
        assert_moments(&result, [0.05, 0.05], 0.05);
    }
}
