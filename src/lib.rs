//! Single-chain MCMC with random-walk, adaptive, Langevin, delayed-rejection,
//! transport-map and No-U-Turn kernels.

pub mod chain;
pub mod config;
pub mod core;
pub mod distributions;
pub mod error;
pub mod gaussian;
pub mod io;
pub mod kernel;
pub mod proposal;
pub mod stats;
pub mod transport;

pub use chain::{Chain, ChainOptions, SampleResult, SingleChainMcmc};
pub use config::McmcConfig;
pub use error::{McmcError, Result};
