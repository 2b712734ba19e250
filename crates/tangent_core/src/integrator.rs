//! The integrator engine contract.
//!
//! An engine owns a forward system `f` and optionally a backward system `g`,
//! and runs them through a fixed state machine:
//!
//! `Uninitialized → Initialized → ForwardReady → ForwardDone → AdjointReady → AdjointDone`
//!
//! Any failure during a reset or integration moves the engine to `Failed`;
//! only `reset()` brings it back. Concrete backends live in [`backend`].

pub mod backend;
pub mod phase;

use crate::augment;
use crate::derivative::{self, Function};
use crate::error::{IntegratorError, Result};
use crate::layout::StateLayout;
use crate::traits::{CopyMap, DaeRef};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegratorState {
    Uninitialized,
    Initialized,
    ForwardReady,
    ForwardDone,
    AdjointReady,
    AdjointDone,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-10,
        }
    }
}

/// Backend options. Fixed-step methods use `fixed_steps`; adaptive ones use the tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    pub abstol: f64,
    pub reltol: f64,
    pub initial_step: Option<f64>,
    pub min_step: f64,
    pub max_step: Option<f64>,
    pub max_steps: usize,
    pub fixed_steps: usize,
    pub newton: NewtonSettings,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            abstol: 1e-10,
            reltol: 1e-8,
            initial_step: None,
            min_step: 1e-12,
            max_step: None,
            max_steps: 100_000,
            fixed_steps: 200,
            newton: NewtonSettings::default(),
        }
    }
}

/// Counters for one integration direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounters {
    pub steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
    pub newton_iterations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegratorStats {
    pub forward: StepCounters,
    pub backward: StepCounters,
}

/// Values fed to the engine: initial state, parameters, and terminal backward state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratorInput {
    pub x0: Vec<f64>,
    pub p: Vec<f64>,
    pub rx0: Vec<f64>,
    pub rp: Vec<f64>,
}

/// Values published by the engine at its current forward and backward times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratorOutput {
    pub xf: Vec<f64>,
    pub qf: Vec<f64>,
    pub rxf: Vec<f64>,
    pub rqf: Vec<f64>,
}

/// Structural dependency bits for the four input and four output blocks.
///
/// Inputs are `(x0, p, rx0, rp)`, outputs `(xf, qf, rxf, rqf)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPattern {
    pub inputs: [Vec<u64>; 4],
    pub outputs: [Vec<u64>; 4],
}

impl DependencyPattern {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            inputs: [
                vec![0; layout.nx],
                vec![0; layout.np],
                vec![0; layout.nrx],
                vec![0; layout.nrp],
            ],
            outputs: [
                vec![0; layout.nx],
                vec![0; layout.nq],
                vec![0; layout.nrx],
                vec![0; layout.nrq],
            ],
        }
    }
}

fn union(blocks: &[Vec<u64>]) -> u64 {
    blocks.iter().flatten().fold(0, |acc, bits| acc | bits)
}

/// Data shared by every backend: systems, horizon, options, I/O, and the state machine.
#[derive(Clone)]
pub struct IntegratorCore {
    pub(crate) f: DaeRef,
    pub(crate) g: Option<DaeRef>,
    t0: f64,
    tf: f64,
    pub options: IntegratorOptions,
    pub declared_layout: Option<StateLayout>,
    pub input: IntegratorInput,
    pub(crate) output: IntegratorOutput,
    pub(crate) layout: Option<StateLayout>,
    pub(crate) state: IntegratorState,
    pub(crate) stats: IntegratorStats,
}

impl IntegratorCore {
    pub fn new(f: DaeRef, g: Option<DaeRef>, t0: f64, tf: f64) -> Self {
        Self {
            f,
            g,
            t0,
            tf,
            options: IntegratorOptions::default(),
            declared_layout: None,
            input: IntegratorInput::default(),
            output: IntegratorOutput::default(),
            layout: None,
            state: IntegratorState::Uninitialized,
            stats: IntegratorStats::default(),
        }
    }

    pub fn f(&self) -> &DaeRef {
        &self.f
    }

    pub fn g(&self) -> Option<&DaeRef> {
        self.g.as_ref()
    }

    pub fn has_backward(&self) -> bool {
        self.g.is_some()
    }

    pub fn t0(&self) -> f64 {
        self.t0
    }

    pub fn tf(&self) -> f64 {
        self.tf
    }

    pub fn state(&self) -> IntegratorState {
        self.state
    }

    pub fn output(&self) -> &IntegratorOutput {
        &self.output
    }

    pub fn stats(&self) -> &IntegratorStats {
        &self.stats
    }

    pub fn layout(&self) -> Result<&StateLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| IntegratorError::invalid("integrator has not been initialized"))
    }

    /// Validates horizon and systems, freezes the layout, and sizes unset inputs.
    pub(crate) fn initialize(&mut self) -> Result<StateLayout> {
        if !self.t0.is_finite() || !self.tf.is_finite() {
            return Err(IntegratorError::configuration(format!(
                "integration horizon must be finite, got [{}, {}]",
                self.t0, self.tf
            )));
        }
        if self.t0 > self.tf {
            return Err(IntegratorError::configuration(format!(
                "integration horizon runs backwards: t0 = {} > tf = {}",
                self.t0, self.tf
            )));
        }

        let layout = StateLayout::from_functions(self.f.as_ref(), self.g.as_deref())?;
        if let Some(declared) = &self.declared_layout {
            layout.check_declared(declared, self.g.is_some())?;
        }

        let fill = |values: &mut Vec<f64>, n: usize| {
            if values.is_empty() {
                values.resize(n, 0.0);
            }
        };
        fill(&mut self.input.x0, layout.nx);
        fill(&mut self.input.p, layout.np);
        fill(&mut self.input.rx0, layout.nrx);
        fill(&mut self.input.rp, layout.nrp);

        self.output = IntegratorOutput {
            xf: vec![0.0; layout.nx],
            qf: vec![0.0; layout.nq],
            rxf: vec![0.0; layout.nrx],
            rqf: vec![0.0; layout.nrq],
        };
        self.layout = Some(layout);
        self.state = IntegratorState::Initialized;
        Ok(layout)
    }

    pub(crate) fn check_inputs(&self) -> Result<StateLayout> {
        let layout = *self.layout()?;
        let checks = [
            ("x0", self.input.x0.len(), layout.nx),
            ("p", self.input.p.len(), layout.np),
            ("rx0", self.input.rx0.len(), layout.nrx),
            ("rp", self.input.rp.len(), layout.nrp),
        ];
        for (name, found, expected) in checks {
            if found != expected {
                return Err(IntegratorError::invalid(format!(
                    "input {name} has length {found}, expected {expected}"
                )));
            }
        }
        Ok(layout)
    }

    pub(crate) fn require(&self, operation: &str, allowed: &[IntegratorState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(IntegratorError::invalid(format!(
                "{operation} is not allowed in state {:?}",
                self.state
            )))
        }
    }

    /// Records the outcome of a state transition; errors leave the engine `Failed`.
    pub(crate) fn settle(&mut self, result: Result<IntegratorState>) -> Result<()> {
        match result {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "integrator failed");
                self.state = IntegratorState::Failed;
                Err(err)
            }
        }
    }

    /// Replaces the system handles with deep copies, sharing preserved through `copies`.
    pub fn deep_copy_members(&mut self, copies: &mut CopyMap) {
        self.f = copies.copy(&self.f);
        self.g = self.g.as_ref().map(|g| copies.copy(g));
    }
}

/// The engine interface. Concrete backends supply the numerics; evaluation
/// orchestration, augmentation and derivative generation are shared.
pub trait Integrator: Send {
    fn core(&self) -> &IntegratorCore;

    fn core_mut(&mut self) -> &mut IntegratorCore;

    /// Short backend name used in logs and statistics.
    fn name(&self) -> &'static str;

    /// Independent deep copy with the same backend and configuration.
    fn clone_integrator(&self) -> Box<dyn Integrator>;

    /// New, uninitialized engine of the same backend bound to another system pair.
    fn create(&self, f: DaeRef, g: Option<DaeRef>) -> Box<dyn Integrator>;

    fn init(&mut self) -> Result<()>;

    /// Brings the forward problem back to `t0` using the current inputs.
    fn reset(&mut self) -> Result<()>;

    /// Advances the forward problem to `t_out`.
    fn integrate(&mut self, t_out: f64) -> Result<()>;

    /// Brings the backward problem to `tf`. Needs a completed forward pass.
    fn reset_adj(&mut self) -> Result<()>;

    /// Advances the backward problem down to `t_out`.
    fn integrate_adj(&mut self, t_out: f64) -> Result<()>;

    fn print_stats(&self, sink: &mut dyn io::Write) -> io::Result<()>;

    fn input_mut(&mut self) -> &mut IntegratorInput {
        &mut self.core_mut().input
    }

    fn output(&self) -> &IntegratorOutput {
        self.core().output()
    }

    /// Whether structural dependency seeds can be propagated in the given direction.
    fn sp_can_evaluate(&self, _fwd: bool) -> bool {
        true
    }

    /// Propagates dependency bits through the integrator.
    ///
    /// Forward outputs `xf, qf` depend on `x0, p`; backward outputs depend on all inputs.
    fn sp_evaluate(&self, fwd: bool, pattern: &mut DependencyPattern) -> Result<()> {
        if !self.sp_can_evaluate(fwd) {
            return Err(IntegratorError::unsupported(format!(
                "{} does not propagate sparsity in {} mode",
                self.name(),
                if fwd { "forward" } else { "reverse" }
            )));
        }

        if fwd {
            let forward_bits = union(&pattern.inputs[..2]);
            let all_bits = forward_bits | union(&pattern.inputs[2..]);
            for (k, block) in pattern.outputs.iter_mut().enumerate() {
                let bits = if k < 2 { forward_bits } else { all_bits };
                block.iter_mut().for_each(|entry| *entry = bits);
            }
        } else {
            let forward_bits = union(&pattern.outputs[..2]);
            let backward_bits = union(&pattern.outputs[2..]);
            for (k, block) in pattern.inputs.iter_mut().enumerate() {
                let bits = if k < 2 {
                    forward_bits | backward_bits
                } else {
                    backward_bits
                };
                block.iter_mut().for_each(|entry| *entry |= bits);
            }
            pattern
                .outputs
                .iter_mut()
                .for_each(|block| block.iter_mut().for_each(|entry| *entry = 0));
        }
        Ok(())
    }

    /// Runs one forward pass to `tf` and, when a backward problem is attached, one
    /// backward pass to `t0`. `nfdir`/`nadir` must already be carried by the
    /// attached (augmented) systems.
    fn evaluate(&mut self, nfdir: usize, nadir: usize) -> Result<()> {
        let layout = *self.core().layout()?;
        if nfdir + 1 > layout.nrhs {
            return Err(IntegratorError::unsupported(format!(
                "{nfdir} forward directions requested, the attached system carries {}",
                layout.nrhs - 1
            )));
        }
        if nadir > 0 && !self.core().has_backward() {
            return Err(IntegratorError::unsupported(
                "adjoint directions requested without a backward system",
            ));
        }

        let (t0, tf) = (self.core().t0(), self.core().tf());
        debug!(backend = self.name(), nfdir, nadir, t0, tf, "evaluating integrator");
        self.reset()?;
        self.integrate(tf)?;
        if self.core().has_backward() {
            self.reset_adj()?;
            self.integrate_adj(t0)?;
        }
        Ok(())
    }

    /// Builds the system pair carrying `nfwd` forward and `nadj` adjoint directions.
    fn get_augmented(&self, nfwd: usize, nadj: usize) -> Result<(DaeRef, Option<DaeRef>)> {
        augment::get_augmented(self.core(), nfwd, nadj)
    }

    /// Wraps an engine around the augmented pair as a differentiable [`Function`].
    fn get_derivative(&self, nfwd: usize, nadj: usize) -> Result<Arc<dyn Function>> {
        derivative::get_derivative(self, nfwd, nadj)
    }
}
