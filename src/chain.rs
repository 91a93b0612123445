/*!
The single-chain driver.

[`SingleChainMcmc`] owns a transition kernel and a random number generator and
runs the step loop: every state is kept in the raw [`Chain`], states after
burn-in also feed a [`RunningStatistics`] accumulator, and kernels keep
adapting through burn-in on their own schedules.

# Examples

```rust
use muq_mcmc::chain::{ChainOptions, SingleChainMcmc};
use muq_mcmc::distributions::Gaussian;
use muq_mcmc::kernel::MhKernel;
use muq_mcmc::proposal::MhProposal;

let target = Gaussian::standard(2);
let kernel = MhKernel::new(&target, MhProposal::isotropic(2, 2.88).unwrap()).unwrap();
let options = ChainOptions { steps: 2_000, burn_in: 200, ..ChainOptions::default() };
let mut mcmc = SingleChainMcmc::new(Box::new(kernel), options).unwrap().set_seed(42);
let result = mcmc.sample(&target, &[0.0, 0.0]).unwrap();
assert_eq!(result.chain.as_ref().unwrap().len(), 2_000);
assert_eq!(result.statistics.count(), 1_800);
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::config::McmcConfig;
use crate::core::{State, Transition, TransitionKernel, DEBUG_VERBOSITY};
use crate::distributions::TargetModel;
use crate::error::{McmcError, Result};
use crate::stats::{ess_columns, AcceptanceTracker, RunningStatistics, DEFAULT_MAX_LAG};

/// Width of the sliding window behind the progress bar's acceptance rate.
const ACCEPTANCE_WINDOW: usize = 100;

/// Run length and output options of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    /// Total number of steps, burn-in included.
    pub steps: usize,
    /// Leading steps excluded from the statistics.
    pub burn_in: usize,
    /// 0 silent, 1 summary, 2 progress bar, 3 adaptation details.
    pub verbose: u8,
    /// Keep every state in [`SampleResult::chain`].
    pub keep_chain: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            steps: 10_000,
            burn_in: 1_000,
            verbose: 0,
            keep_chain: true,
        }
    }
}

impl ChainOptions {
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(McmcError::InvalidConfig("Steps must be positive".into()));
        }
        if self.steps < self.burn_in {
            return Err(McmcError::InvalidConfig(format!(
                "Steps ({}) is smaller than BurnIn ({})",
                self.steps, self.burn_in
            )));
        }
        Ok(())
    }
}

/// Every state a chain produced, burn-in included.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    states: Vec<State>,
    burn_in: usize,
}

impl Chain {
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn burn_in(&self) -> usize {
        self.burn_in
    }

    /// States that entered the statistics.
    pub fn post_burn_in(&self) -> &[State] {
        &self.states[self.burn_in.min(self.states.len())..]
    }

    /// Positions as a `[len, dim]` array, one row per step.
    pub fn to_array(&self) -> Array2<f64> {
        positions_to_array(&self.states)
    }

    /// Effective sample size of each dimension over the post-burn-in states.
    pub fn effective_sample_size(&self) -> Array1<f64> {
        ess_columns(positions_to_array(self.post_burn_in()).view())
    }
}

fn positions_to_array(states: &[State]) -> Array2<f64> {
    let dim = states.first().map_or(0, State::dim);
    Array2::from_shape_fn((states.len(), dim), |(i, j)| states[i].position[j])
}

/// What [`SingleChainMcmc::sample`] returns.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// Moments of the post-burn-in states.
    pub statistics: RunningStatistics,
    /// The raw chain, if it was kept.
    pub chain: Option<Chain>,
    /// Fraction of accepted steps over the whole run.
    pub acceptance_rate: f64,
}

impl SampleResult {
    pub fn mean(&self) -> DVector<f64> {
        self.statistics.mean()
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        self.statistics.covariance()
    }

    /// Effective sample size per dimension.
    ///
    /// Uses the full post-burn-in chain when it was kept and the accumulator's
    /// bounded lag window otherwise.
    pub fn effective_sample_size(&self) -> DVector<f64> {
        match &self.chain {
            Some(chain) if !chain.post_burn_in().is_empty() => DVector::from_iterator(
                self.statistics.dim(),
                chain.effective_sample_size().iter().copied(),
            ),
            _ => self.statistics.effective_sample_size(),
        }
    }
}

/**
Single-chain MCMC driver.

The driver holds one [`SmallRng`]; every random draw of a run, including those
of nested chains inside a kernel, comes from it. Two runs with the same seed,
start point and kernel configuration therefore produce identical chains.
*/
pub struct SingleChainMcmc {
    kernel: Box<dyn TransitionKernel>,
    options: ChainOptions,
    rng: SmallRng,
}

impl SingleChainMcmc {
    const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

    /**
    Creates a driver around `kernel`.

    # Errors

    `InvalidConfig` if `options.steps` is zero or smaller than `options.burn_in`.
    */
    pub fn new(mut kernel: Box<dyn TransitionKernel>, options: ChainOptions) -> Result<Self> {
        options.validate()?;
        kernel.set_verbose(options.verbose);
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            kernel,
            options,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    /// Builds the kernel and driver described by `config` for `target`.
    pub fn from_config(target: &dyn TargetModel, config: &McmcConfig) -> Result<Self> {
        config.build(target)
    }

    /// Sets a new seed for the random number generator.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    pub fn kernel(&self) -> &dyn TransitionKernel {
        self.kernel.as_ref()
    }

    /// Runs one kernel step with an external generator, for chains nested in a kernel.
    pub fn advance(
        &mut self,
        step: usize,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        self.kernel.step(step, target, current, rng)
    }

    /**
    Runs the chain from `start`.

    # Arguments

    * `target` - The density to sample; must provide what the kernel requires.
    * `start` - Initial position. It is not part of the returned chain.

    # Returns

    The statistics of the post-burn-in states, the chain itself if
    `keep_chain` is set, and the overall acceptance rate.
    */
    pub fn sample(&mut self, target: &dyn TargetModel, start: &[f64]) -> Result<SampleResult> {
        let needs = self.kernel.requirements();
        needs.check(target)?;
        let mut current = State::evaluate(target, DVector::from_column_slice(start), needs)?;
        if !current.log_density.is_finite() {
            return Err(McmcError::NumericalInstability(format!(
                "start point has log-density {}",
                current.log_density
            )));
        }

        let ChainOptions {
            steps,
            burn_in,
            verbose,
            keep_chain,
        } = self.options;
        let mut statistics = RunningStatistics::with_max_lag(current.dim(), DEFAULT_MAX_LAG);
        let mut states = Vec::with_capacity(if keep_chain { steps } else { 0 });
        let mut tracker = AcceptanceTracker::new(ACCEPTANCE_WINDOW);

        let pb = (verbose >= 2).then(|| progress_bar(steps, self.kernel.name()));
        let mut last_update = Instant::now();

        for step in 1..=steps {
            let transition = self.kernel.step(step, target, &current, &mut self.rng)?;
            tracker.record(transition.accepted);
            current = transition.state;

            if step > burn_in {
                statistics.update(&current.position);
            }
            if keep_chain {
                states.push(current.clone());
            }
            if step == burn_in && verbose >= DEBUG_VERBOSITY {
                debug!(
                    "burn-in finished after {step} steps, acceptance rate {:.3}",
                    tracker.overall()
                );
            }

            if let Some(pb) = &pb {
                if last_update.elapsed() >= Self::UPDATE_INTERVAL || step == steps {
                    pb.set_position(step as u64);
                    pb.set_message(format!("AcceptRate={:.3}", tracker.recent()));
                    last_update = Instant::now();
                }
            }
        }
        if let Some(pb) = pb {
            pb.finish_with_message(format!("AcceptRate={:.3}", tracker.overall()));
        }

        let result = SampleResult {
            statistics,
            chain: keep_chain.then_some(Chain { states, burn_in }),
            acceptance_rate: tracker.overall(),
        };
        if verbose >= 1 {
            log_summary(self.kernel.name(), &result);
        }
        Ok(result)
    }
}

fn progress_bar(steps: usize, prefix: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(steps as u64);
    let style = ProgressStyle::default_bar()
        .template("{prefix:8} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb.set_prefix(prefix);
    pb
}

fn log_summary(kernel: &str, result: &SampleResult) {
    let ess = result.effective_sample_size();
    info!(
        "{kernel}: {} samples after burn-in, acceptance rate {:.3}",
        result.statistics.count(),
        result.acceptance_rate
    );
    info!("{kernel}: mean {:?}", result.mean().as_slice());
    info!(
        "{kernel}: ESS min {:.1} max {:.1}",
        ess.min(),
        ess.max()
    );
}
