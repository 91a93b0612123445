use nalgebra::DVector;
use rand::rngs::SmallRng;

use crate::chain::SingleChainMcmc;
use crate::core::{State, Transition, TransitionKernel};
use crate::distributions::{Requirements, TargetModel};
use crate::error::{McmcError, Result};
use crate::transport::{Pushforward, TransportMap, TransportMapAdapter};

/**
Transport-map accelerated kernel (Parno & Marzouk 2018).

The kernel owns an inner chain that samples the pushforward of the target
through the current map. Each outer step advances the inner chain by one step
from the image of the current state and maps the result back through `T⁻¹`.

The inner chain's Metropolis-Hastings test against the pushforward density is
exactly the test against the true target: the change of variables multiplies
numerator and denominator by the same Jacobian factors, so no second test is
needed. A refit only changes the map between steps, never within one.
*/
pub struct TransportMapKernel {
    inner: SingleChainMcmc,
    map: Box<dyn TransportMap>,
    adapter: TransportMapAdapter,
    /// The image of the last outer state under the current map.
    reference: Option<(DVector<f64>, State)>,
}

impl TransportMapKernel {
    /// Fails with `NotDifferentiable`/`NoMetric` if the inner kernel needs derivatives,
    /// since the pushforward has none.
    pub fn new(
        target: &dyn TargetModel,
        inner: SingleChainMcmc,
        map: Box<dyn TransportMap>,
        adapter: TransportMapAdapter,
    ) -> Result<Self> {
        if map.dim() != target.dim() {
            return Err(McmcError::InvalidConfig(format!(
                "transport map has dimension {}, target has {}",
                map.dim(),
                target.dim()
            )));
        }
        inner
            .kernel()
            .requirements()
            .check(&Pushforward::new(target, map.as_ref()))?;
        Ok(Self {
            inner,
            map,
            adapter,
            reference: None,
        })
    }

    pub fn map(&self) -> &dyn TransportMap {
        self.map.as_ref()
    }

    pub fn adapter(&self) -> &TransportMapAdapter {
        &self.adapter
    }
}

/// Image of `current` under the map, reusing the cached inner state when it matches.
fn reference_state(
    cached: &Option<(DVector<f64>, State)>,
    map: &dyn TransportMap,
    pushforward: &Pushforward<'_>,
    current: &State,
) -> Result<State> {
    if let Some((position, state)) = cached {
        if *position == current.position {
            return Ok(state.clone());
        }
    }
    State::evaluate(pushforward, map.forward(&current.position), Requirements::NONE)
}

impl TransitionKernel for TransportMapKernel {
    fn requirements(&self) -> Requirements {
        Requirements::NONE
    }

    fn step(
        &mut self,
        step: usize,
        target: &dyn TargetModel,
        current: &State,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let transition = {
            let pushforward = Pushforward::new(target, self.map.as_ref());
            let reference =
                reference_state(&self.reference, self.map.as_ref(), &pushforward, current)?;
            let inner = self.inner.advance(step, &pushforward, &reference, rng)?;
            if inner.accepted {
                let x = self.map.inverse(&inner.state.position);
                let state = State::evaluate(target, x, Requirements::NONE)?;
                self.reference = Some((state.position.clone(), inner.state));
                Transition::accepted(state)
            } else {
                self.reference = Some((current.position.clone(), reference));
                Transition::rejected(current)
            }
        };

        if let Some(refitted) =
            self.adapter
                .observe(step, &transition.state.position, self.map.as_ref())?
        {
            self.map = refitted;
            self.reference = None;
        }
        Ok(transition)
    }

    fn name(&self) -> &'static str {
        "TransportMap"
    }

    /// Only the adapter follows the outer level; the inner chain keeps the verbosity it was built with.
    fn set_verbose(&mut self, verbose: u8) {
        self.adapter.set_verbose(verbose);
    }
}
