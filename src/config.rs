/*!
Declarative sampler configuration.

The structs mirror the MUQ option names (`Steps`, `BurnIn`, `PropSize`, ...)
and are read from JSON. Unknown keys, unknown method or proposal names and
out-of-range values are all reported as [`McmcError::InvalidConfig`] before a
single step is taken.

# Examples

```rust
use muq_mcmc::config::McmcConfig;
use muq_mcmc::distributions::Boomerang;

let config = McmcConfig::from_json_str(r#"{
    "Steps": 2000,
    "BurnIn": 200,
    "Seed": 7,
    "Kernel": {
        "Method": "DR",
        "NumSteps": 500,
        "Stages": {
            "Scaled": {
                "Proposal": {
                    "Name": "AM",
                    "PropSize": 2.0,
                    "AdaptSteps": 2,
                    "AdaptStart": 100,
                    "AdaptScale": 1.5
                },
                "Count": 2,
                "Scale": 2.0
            }
        }
    }
}"#).unwrap();

let target = Boomerang::default();
let result = config.build(&target).unwrap().sample(&target, &[0.0, 1.0]).unwrap();
assert_eq!(result.statistics.count(), 1800);
```
*/

use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainOptions, SingleChainMcmc};
use crate::core::TransitionKernel;
use crate::distributions::TargetModel;
use crate::error::{McmcError, Result};
use crate::kernel::{DrKernel, MhKernel, NutsKernel, NutsOptions, TransportMapKernel};
use crate::proposal::{
    AdaptSchedule, AmProposal, AmalaProposal, MhProposal, MmalaProposal, PreMalaProposal, Proposal,
};
use crate::transport::{AffineMap, MapSchedule, Pushforward, TransportMapAdapter};

fn default_true() -> bool {
    true
}

fn default_step_size() -> f64 {
    1.0
}

fn default_max_tree_depth() -> usize {
    10
}

fn default_target_accept() -> f64 {
    0.8
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(McmcError::InvalidConfig(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

/// Top-level configuration of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct McmcConfig {
    pub steps: usize,
    pub burn_in: usize,
    #[serde(default)]
    pub verbose: u8,
    /// Fixed seed; drawn from the thread RNG when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_true")]
    pub keep_chain: bool,
    pub kernel: KernelConfig,
}

/// Kernel family, selected by `"Method"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Method", deny_unknown_fields)]
pub enum KernelConfig {
    #[serde(rename = "MHKernel", rename_all = "PascalCase")]
    Mh { proposal: ProposalConfig },
    #[serde(rename = "DR", rename_all = "PascalCase")]
    Dr {
        /// Steps `1..=NumSteps` run every stage; later steps only the first.
        num_steps: usize,
        stages: DrStagesConfig,
    },
    #[serde(rename = "TransportMap", rename_all = "PascalCase")]
    TransportMap {
        adapt_start: usize,
        adapt_stop: usize,
        adapt_gap: usize,
        adapt_scale: f64,
        sub_method: Box<KernelConfig>,
        /// Verbosity of the inner chain; inherits `Verbose` when absent.
        #[serde(default)]
        sub_verbose: Option<u8>,
    },
    #[serde(rename = "NUTS", rename_all = "PascalCase")]
    Nuts {
        #[serde(default = "default_max_tree_depth")]
        max_tree_depth: usize,
        #[serde(default = "default_target_accept")]
        target_accept: f64,
        #[serde(default)]
        step_size: Option<f64>,
        /// Defaults to `BurnIn`.
        #[serde(default)]
        adapt_steps: Option<usize>,
    },
}

/// How the stages of a delayed-rejection kernel are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum DrStagesConfig {
    /// `Count` stages of one proposal, each dividing the variance by a further factor `Scale`.
    #[serde(rename_all = "PascalCase")]
    Scaled {
        proposal: ProposalConfig,
        count: usize,
        scale: f64,
    },
    /// One stage per listed proposal.
    Explicit(Vec<ProposalConfig>),
}

/// Proposal family, selected by `"Name"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Name", deny_unknown_fields)]
pub enum ProposalConfig {
    #[serde(rename = "MHProposal", rename_all = "PascalCase")]
    Mh {
        prop_size: f64,
        /// Full covariance, row by row; replaces `PropSize * I`.
        #[serde(default)]
        prop_cov: Option<Vec<Vec<f64>>>,
    },
    #[serde(rename = "AM", rename_all = "PascalCase")]
    Am {
        prop_size: f64,
        adapt_steps: usize,
        adapt_start: usize,
        adapt_scale: f64,
    },
    #[serde(rename = "PreMALA", rename_all = "PascalCase")]
    PreMala {
        prop_size: f64,
        #[serde(default)]
        prop_cov: Option<Vec<Vec<f64>>>,
        #[serde(default = "default_step_size")]
        step_size: f64,
    },
    #[serde(rename = "MMALA", rename_all = "PascalCase")]
    Mmala {
        #[serde(default = "default_step_size")]
        step_size: f64,
    },
    #[serde(rename = "AMALA", rename_all = "PascalCase")]
    Amala {
        prop_size: f64,
        adapt_steps: usize,
        adapt_start: usize,
        adapt_scale: f64,
        max_drift: f64,
        #[serde(default = "default_step_size")]
        step_size: f64,
    },
}

impl McmcConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn options(&self) -> ChainOptions {
        ChainOptions {
            steps: self.steps,
            burn_in: self.burn_in,
            verbose: self.verbose,
            keep_chain: self.keep_chain,
        }
    }

    /// Checks everything that does not depend on the target.
    pub fn validate(&self) -> Result<()> {
        self.options().validate()?;
        self.kernel.validate()
    }

    /// Builds a driver for `target`; fails if the target lacks a capability the kernel needs.
    pub fn build(&self, target: &dyn TargetModel) -> Result<SingleChainMcmc> {
        self.validate()?;
        if self.verbose >= 2 {
            info!("resolved configuration: {}", serde_json::to_string(self)?);
        }
        let options = self.options();
        let kernel = self.kernel.build(target, &options)?;
        let mcmc = SingleChainMcmc::new(kernel, options)?;
        Ok(match self.seed {
            Some(seed) => mcmc.set_seed(seed),
            None => mcmc,
        })
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            KernelConfig::Mh { proposal } => proposal.validate(),
            KernelConfig::Dr { stages, .. } => match stages {
                DrStagesConfig::Scaled {
                    proposal,
                    count,
                    scale,
                } => {
                    if *count == 0 {
                        return Err(McmcError::InvalidConfig(
                            "DR needs at least one stage".into(),
                        ));
                    }
                    positive("DR Scale", *scale)?;
                    proposal.validate()
                }
                DrStagesConfig::Explicit(proposals) => {
                    if proposals.is_empty() {
                        return Err(McmcError::InvalidConfig(
                            "DR needs at least one stage".into(),
                        ));
                    }
                    proposals.iter().try_for_each(ProposalConfig::validate)
                }
            },
            KernelConfig::TransportMap { sub_method, .. } => {
                self.map_schedule().map_or(Ok(()), |s| s.validate())?;
                sub_method.validate()
            }
            KernelConfig::Nuts { .. } => self.nuts_options(0).map_or(Ok(()), |o| o.validate()),
        }
    }

    fn map_schedule(&self) -> Option<MapSchedule> {
        match *self {
            KernelConfig::TransportMap {
                adapt_start,
                adapt_stop,
                adapt_gap,
                adapt_scale,
                ..
            } => Some(MapSchedule {
                adapt_start,
                adapt_stop,
                adapt_gap,
                adapt_scale,
            }),
            _ => None,
        }
    }

    /// Settings of a nested chain: the outer ones, with `SubVerbose` overriding the verbosity.
    fn inner_options(&self, options: &ChainOptions) -> ChainOptions {
        match *self {
            KernelConfig::TransportMap {
                sub_verbose: Some(verbose),
                ..
            } => ChainOptions {
                verbose,
                ..*options
            },
            _ => *options,
        }
    }

    fn nuts_options(&self, burn_in: usize) -> Option<NutsOptions> {
        match *self {
            KernelConfig::Nuts {
                max_tree_depth,
                target_accept,
                step_size,
                adapt_steps,
            } => Some(NutsOptions {
                max_tree_depth,
                target_accept,
                step_size,
                adapt_steps: adapt_steps.unwrap_or(burn_in),
            }),
            _ => None,
        }
    }

    /// Builds the kernel; `options` supplies the burn-in length and the inner chain settings.
    pub fn build(
        &self,
        target: &dyn TargetModel,
        options: &ChainOptions,
    ) -> Result<Box<dyn TransitionKernel>> {
        let dim = target.dim();
        let kernel: Box<dyn TransitionKernel> = match self {
            KernelConfig::Mh { proposal } => {
                Box::new(MhKernel::new(target, proposal.build(dim)?)?)
            }
            KernelConfig::Dr { num_steps, stages } => match stages {
                DrStagesConfig::Scaled {
                    proposal,
                    count,
                    scale,
                } => Box::new(DrKernel::scaled(
                    target,
                    proposal.build(dim)?,
                    *count,
                    *scale,
                    *num_steps,
                )?),
                DrStagesConfig::Explicit(proposals) => {
                    let built = proposals
                        .iter()
                        .map(|p| p.build(dim))
                        .collect::<Result<Vec<_>>>()?;
                    Box::new(DrKernel::explicit(target, built, *num_steps)?)
                }
            },
            KernelConfig::TransportMap { sub_method, .. } => {
                let schedule = self.map_schedule().ok_or_else(|| {
                    McmcError::InvalidConfig("transport map schedule missing".into())
                })?;
                // The inner chain runs on the pushforward, which only has a log-density.
                let identity = AffineMap::identity(dim);
                let inner_kernel = sub_method.build(&Pushforward::new(target, &identity), options)?;
                let inner = SingleChainMcmc::new(inner_kernel, self.inner_options(options))?;
                Box::new(TransportMapKernel::new(
                    target,
                    inner,
                    Box::new(AffineMap::identity(dim)),
                    TransportMapAdapter::new(schedule)?,
                )?)
            }
            KernelConfig::Nuts { .. } => {
                let nuts = self.nuts_options(options.burn_in).ok_or_else(|| {
                    McmcError::InvalidConfig("NUTS options missing".into())
                })?;
                Box::new(NutsKernel::new(target, nuts)?)
            }
        };
        Ok(kernel)
    }
}

fn covariance_matrix(rows: &[Vec<f64>], dim: usize) -> Result<DMatrix<f64>> {
    if rows.len() != dim || rows.iter().any(|row| row.len() != dim) {
        return Err(McmcError::InvalidConfig(format!(
            "PropCov must be a {dim}x{dim} matrix"
        )));
    }
    Ok(DMatrix::from_fn(dim, dim, |i, j| rows[i][j]))
}

impl ProposalConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ProposalConfig::Mh { prop_size, .. } => positive("PropSize", *prop_size),
            ProposalConfig::Am {
                prop_size,
                adapt_steps,
                adapt_start,
                adapt_scale,
            } => {
                positive("PropSize", *prop_size)?;
                schedule(*adapt_start, *adapt_steps, *adapt_scale).validate()
            }
            ProposalConfig::PreMala {
                prop_size,
                step_size,
                ..
            } => {
                positive("PropSize", *prop_size)?;
                positive("StepSize", *step_size)
            }
            ProposalConfig::Mmala { step_size } => positive("StepSize", *step_size),
            ProposalConfig::Amala {
                prop_size,
                adapt_steps,
                adapt_start,
                adapt_scale,
                max_drift,
                step_size,
            } => {
                positive("PropSize", *prop_size)?;
                positive("MaxDrift", *max_drift)?;
                positive("StepSize", *step_size)?;
                schedule(*adapt_start, *adapt_steps, *adapt_scale).validate()
            }
        }
    }

    /// Builds the proposal for a `dim`-dimensional target.
    pub fn build(&self, dim: usize) -> Result<Box<dyn Proposal>> {
        self.validate()?;
        let proposal: Box<dyn Proposal> = match self {
            ProposalConfig::Mh {
                prop_size,
                prop_cov,
            } => match prop_cov {
                Some(rows) => Box::new(MhProposal::with_covariance(covariance_matrix(rows, dim)?)?),
                None => Box::new(MhProposal::isotropic(dim, *prop_size)?),
            },
            ProposalConfig::Am {
                prop_size,
                adapt_steps,
                adapt_start,
                adapt_scale,
            } => Box::new(AmProposal::new(
                dim,
                *prop_size,
                schedule(*adapt_start, *adapt_steps, *adapt_scale),
            )?),
            ProposalConfig::PreMala {
                prop_size,
                prop_cov,
                step_size,
            } => match prop_cov {
                Some(rows) => Box::new(PreMalaProposal::with_covariance(
                    covariance_matrix(rows, dim)?,
                    *step_size,
                )?),
                None => Box::new(PreMalaProposal::isotropic(dim, *prop_size, *step_size)?),
            },
            ProposalConfig::Mmala { step_size } => Box::new(MmalaProposal::new(*step_size)?),
            ProposalConfig::Amala {
                prop_size,
                adapt_steps,
                adapt_start,
                adapt_scale,
                max_drift,
                step_size,
            } => Box::new(AmalaProposal::new(
                dim,
                *prop_size,
                schedule(*adapt_start, *adapt_steps, *adapt_scale),
                *step_size,
                *max_drift,
            )?),
        };
        Ok(proposal)
    }
}

fn schedule(start: usize, interval: usize, scale: f64) -> AdaptSchedule {
    AdaptSchedule {
        start,
        interval,
        scale,
    }
}
