//! Error type shared by every sampler component.

use thiserror::Error;

/// Consecutive numerical failures tolerated before a chain gives up.
pub const MAX_CONSECUTIVE_FAILURES: usize = 10;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum McmcError {
    /// Malformed or inconsistent configuration, reported before sampling starts.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target model cannot evaluate a gradient.
    #[error("target model does not provide a gradient")]
    NotDifferentiable,

    /// The target model cannot evaluate a local metric.
    #[error("target model does not provide a metric")]
    NoMetric,

    /// A numerical failure that kept recurring after local recovery.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
}

pub type Result<T> = std::result::Result<T, McmcError>;

impl From<serde_json::Error> for McmcError {
    fn from(err: serde_json::Error) -> Self {
        McmcError::InvalidConfig(err.to_string())
    }
}

/// Counts consecutive recoverable failures and escalates once the bound is hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstabilityGuard {
    consecutive: usize,
}

impl InstabilityGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful evaluation, resetting the failure streak.
    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Records a failure. Returns an error once `MAX_CONSECUTIVE_FAILURES` is exceeded.
    pub fn failure(&mut self, what: &str) -> Result<()> {
        self.consecutive += 1;
        log::warn!(
            "{what} (consecutive failure {}/{})",
            self.consecutive,
            MAX_CONSECUTIVE_FAILURES
        );
        if self.consecutive > MAX_CONSECUTIVE_FAILURES {
            return Err(McmcError::NumericalInstability(format!(
                "{what}: persisted for {} consecutive steps",
                self.consecutive
            )));
        }
        Ok(())
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }
}
