//! Engines built from a one-step method and the shared step-size driver.

use super::phase::{BackwardPhase, ForwardPhase, Trajectory};
use super::{Integrator, IntegratorCore, IntegratorOptions, IntegratorState, StepCounters};
use crate::error::{IntegratorError, Result};
use crate::layout::StateLayout;
use crate::solvers::{self, BackwardEuler, PhaseState, PhaseSystem, Rk4, Stepper, Tsit5};
use crate::traits::{CopyMap, DaeRef};
use std::io;
use tracing::debug;

use IntegratorState::*;

/// An [`Integrator`] driving forward and backward phases with the stepper `S`.
#[derive(Clone)]
pub struct StepperIntegrator<S: Stepper> {
    core: IntegratorCore,
    forward_stepper: S,
    backward_stepper: S,
    forward: PhaseState,
    backward: PhaseState,
    trajectory: Trajectory,
}

pub type Rk4Integrator = StepperIntegrator<Rk4>;
pub type Tsit5Integrator = StepperIntegrator<Tsit5>;
pub type BackwardEulerIntegrator = StepperIntegrator<BackwardEuler>;

impl<S: Stepper> StepperIntegrator<S> {
    pub fn new(f: DaeRef, g: Option<DaeRef>, t0: f64, tf: f64) -> Self {
        Self::with_stepper(S::default(), f, g, t0, tf)
    }

    pub fn with_stepper(stepper: S, f: DaeRef, g: Option<DaeRef>, t0: f64, tf: f64) -> Self {
        Self {
            core: IntegratorCore::new(f, g, t0, tf),
            forward_stepper: stepper.clone(),
            backward_stepper: stepper,
            forward: PhaseState::default(),
            backward: PhaseState::default(),
            trajectory: Trajectory::default(),
        }
    }

    pub fn with_options(mut self, options: IntegratorOptions) -> Self {
        self.core.options = options;
        self
    }

    pub fn with_declared_layout(mut self, layout: StateLayout) -> Self {
        self.core.declared_layout = Some(layout);
        self
    }

    fn initial_step(&self) -> f64 {
        let span = self.core.tf() - self.core.t0();
        if span <= 0.0 {
            return 1.0;
        }
        match self.forward_stepper.error_order() {
            Some(_) => self.core.options.initial_step.unwrap_or(1e-3 * span),
            None => span / self.core.options.fixed_steps.max(1) as f64,
        }
    }

    fn round_off(&self) -> f64 {
        64.0 * f64::EPSILON * self.core.t0().abs().max(self.core.tf().abs()).max(1.0)
    }

    fn publish_forward(&mut self, layout: &StateLayout) {
        let (x, q) = self.forward.y.split_at(layout.nx);
        self.core.output.xf.copy_from_slice(x);
        self.core.output.qf.copy_from_slice(q);
    }

    fn publish_backward(&mut self, layout: &StateLayout) {
        let (rx, rq) = self.backward.y.split_at(layout.nrx);
        self.core.output.rxf.copy_from_slice(rx);
        self.core.output.rqf.copy_from_slice(rq);
    }

    fn reset_forward(&mut self, layout: &StateLayout) -> Result<IntegratorState> {
        let (t0, tf) = (self.core.t0(), self.core.tf());
        let h0 = self.initial_step();
        self.core.stats.forward = StepCounters::default();

        let state = &mut self.forward;
        state.t = t0;
        state.h = h0;
        state.y[..layout.nx].copy_from_slice(&self.core.input.x0);
        state.y[layout.nx..].fill(0.0);
        state.z.fill(0.0);

        let phase = ForwardPhase::new(self.core.f.as_ref(), &self.core.input.p, layout);
        let mut ydot = vec![0.0; phase.n_diff()];
        let iterations = solvers::solve_algebraic(
            &phase,
            t0,
            &state.y,
            &mut state.z,
            &mut ydot,
            &self.core.options.newton,
        )?;
        self.core.stats.forward.newton_iterations += iterations;
        self.core.stats.forward.rhs_evaluations += phase.evaluations();

        self.trajectory.clear(layout.nx, layout.nz);
        self.trajectory
            .push(t0, &state.y[..layout.nx], &ydot[..layout.nx], &state.z);
        self.publish_forward(layout);
        Ok(if t0 == tf { ForwardDone } else { ForwardReady })
    }

    fn advance_forward(&mut self, layout: &StateLayout, t_out: f64) -> Result<IntegratorState> {
        let nx = layout.nx;
        let phase = ForwardPhase::new(self.core.f.as_ref(), &self.core.input.p, layout);
        let trajectory = &mut self.trajectory;
        let mut ydot = vec![0.0; phase.n_diff()];
        let mut residual = vec![0.0; layout.nz];

        let outcome = solvers::advance(
            &mut self.forward_stepper,
            &phase,
            &mut self.forward,
            t_out,
            &self.core.options,
            &mut self.core.stats.forward,
            |state| {
                phase.eval(state.t, &state.y, &state.z, &mut ydot, &mut residual);
                trajectory.push(state.t, &state.y[..nx], &ydot[..nx], &state.z);
            },
        );
        self.core.stats.forward.rhs_evaluations += phase.evaluations();
        outcome?;

        self.publish_forward(layout);
        debug!(
            t = self.forward.t,
            steps = self.core.stats.forward.steps,
            checkpoints = self.trajectory.len(),
            "forward integration reached target"
        );
        Ok(if self.forward.t == self.core.tf() {
            ForwardDone
        } else {
            ForwardReady
        })
    }

    fn reset_backward(&mut self, layout: &StateLayout) -> Result<IntegratorState> {
        let (t0, tf) = (self.core.t0(), self.core.tf());
        let h0 = self.initial_step();
        self.core.stats.backward = StepCounters::default();
        let g = self
            .core
            .g
            .as_deref()
            .ok_or_else(|| IntegratorError::unsupported("no backward system attached"))?;

        let state = &mut self.backward;
        state.t = tf;
        state.h = h0;
        state.y[..layout.nrx].copy_from_slice(&self.core.input.rx0);
        state.y[layout.nrx..].fill(0.0);
        state.z.fill(0.0);

        let phase = BackwardPhase::new(
            self.core.f.as_ref(),
            g,
            &self.core.input.rp,
            &self.core.input.p,
            &self.trajectory,
            &self.core.options.newton,
            layout,
        );
        let mut ydot = vec![0.0; phase.n_diff()];
        let iterations = solvers::solve_algebraic(
            &phase,
            tf,
            &state.y,
            &mut state.z,
            &mut ydot,
            &self.core.options.newton,
        )?;
        self.core.stats.backward.newton_iterations += iterations;
        self.core.stats.backward.rhs_evaluations += phase.evaluations();

        self.publish_backward(layout);
        Ok(if t0 == tf { AdjointDone } else { AdjointReady })
    }

    fn advance_backward(&mut self, layout: &StateLayout, t_out: f64) -> Result<IntegratorState> {
        let g = self
            .core
            .g
            .as_deref()
            .ok_or_else(|| IntegratorError::unsupported("no backward system attached"))?;
        let phase = BackwardPhase::new(
            self.core.f.as_ref(),
            g,
            &self.core.input.rp,
            &self.core.input.p,
            &self.trajectory,
            &self.core.options.newton,
            layout,
        );

        let outcome = solvers::advance(
            &mut self.backward_stepper,
            &phase,
            &mut self.backward,
            t_out,
            &self.core.options,
            &mut self.core.stats.backward,
            |_| {},
        );
        self.core.stats.backward.rhs_evaluations += phase.evaluations();
        outcome?;

        self.publish_backward(layout);
        Ok(if self.backward.t == self.core.t0() {
            AdjointDone
        } else {
            AdjointReady
        })
    }
}

impl<S: Stepper + 'static> Integrator for StepperIntegrator<S> {
    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        self.forward_stepper.name()
    }

    fn clone_integrator(&self) -> Box<dyn Integrator> {
        let mut copy = self.clone();
        copy.core.deep_copy_members(&mut CopyMap::new());
        Box::new(copy)
    }

    fn create(&self, f: DaeRef, g: Option<DaeRef>) -> Box<dyn Integrator> {
        let engine = Self::with_stepper(
            self.forward_stepper.clone(),
            f,
            g,
            self.core.t0(),
            self.core.tf(),
        )
        .with_options(self.core.options.clone());
        Box::new(engine)
    }

    fn init(&mut self) -> Result<()> {
        let layout = self.core.initialize()?;
        self.forward_stepper.resize(layout.nx + layout.nq, layout.nz);
        self.backward_stepper
            .resize(layout.nrx + layout.nrq, layout.nrz);
        self.forward = PhaseState::new(layout.nx + layout.nq, layout.nz);
        self.backward = PhaseState::new(layout.nrx + layout.nrq, layout.nrz);
        self.trajectory.clear(layout.nx, layout.nz);
        debug!(
            backend = self.name(),
            nx = layout.nx,
            nz = layout.nz,
            nq = layout.nq,
            np = layout.np,
            nrx = layout.nrx,
            nrz = layout.nrz,
            nrq = layout.nrq,
            nrp = layout.nrp,
            nrhs = layout.nrhs,
            "initialized integrator"
        );
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.core.require(
            "reset",
            &[
                Initialized,
                ForwardReady,
                ForwardDone,
                AdjointReady,
                AdjointDone,
                Failed,
            ],
        )?;
        let layout = self.core.check_inputs()?;
        let result = self.reset_forward(&layout);
        self.core.settle(result)
    }

    fn integrate(&mut self, t_out: f64) -> Result<()> {
        self.core
            .require("integrate", &[ForwardReady, ForwardDone])?;
        let layout = *self.core.layout()?;
        let (t_current, tf) = (self.forward.t, self.core.tf());
        let slack = self.round_off();
        if !t_out.is_finite() || t_out < t_current - slack || t_out > tf + slack {
            return Err(IntegratorError::invalid(format!(
                "integrate target {t_out} lies outside [{t_current}, {tf}]"
            )));
        }
        let result = self.advance_forward(&layout, t_out.clamp(t_current, tf));
        self.core.settle(result)
    }

    fn reset_adj(&mut self) -> Result<()> {
        if !self.core.has_backward() {
            return Err(IntegratorError::unsupported(
                "reset_adj needs a backward system",
            ));
        }
        self.core
            .require("reset_adj", &[ForwardDone, AdjointReady, AdjointDone])?;
        let layout = self.core.check_inputs()?;
        let result = self.reset_backward(&layout);
        self.core.settle(result)
    }

    fn integrate_adj(&mut self, t_out: f64) -> Result<()> {
        if !self.core.has_backward() {
            return Err(IntegratorError::unsupported(
                "integrate_adj needs a backward system",
            ));
        }
        self.core
            .require("integrate_adj", &[AdjointReady, AdjointDone])?;
        let layout = *self.core.layout()?;
        let (t0, t_current) = (self.core.t0(), self.backward.t);
        let slack = self.round_off();
        if !t_out.is_finite() || t_out < t0 - slack || t_out > t_current + slack {
            return Err(IntegratorError::invalid(format!(
                "integrate_adj target {t_out} lies outside [{t0}, {t_current}]"
            )));
        }
        let result = self.advance_backward(&layout, t_out.clamp(t0, t_current));
        self.core.settle(result)
    }

    fn print_stats(&self, sink: &mut dyn io::Write) -> io::Result<()> {
        let stats = self.core.stats();
        writeln!(sink, "{} integrator, state {:?}", self.name(), self.core.state())?;
        for (label, counters) in [("forward", &stats.forward), ("backward", &stats.backward)] {
            writeln!(
                sink,
                "  {label:<8} steps: {:>6}  rejected: {:>5}  rhs evaluations: {:>7}  newton iterations: {:>6}",
                counters.steps,
                counters.rejected_steps,
                counters.rhs_evaluations,
                counters.newton_iterations
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BackwardEulerIntegrator, Rk4Integrator, Tsit5Integrator};
    use crate::autodiff::Differentiable;
    use crate::equation_engine::ExpressionModel;
    use crate::error::IntegratorError;
    use crate::integrator::{DependencyPattern, Integrator, IntegratorOptions, IntegratorState};
    use crate::layout::StateLayout;
    use crate::traits::DaeRef;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    /// x' = a x, q' = x
    fn decay() -> DaeRef {
        Differentiable::shared(
            ExpressionModel::forward(&["x"], &[], &["a"], &["a*x"], &[], &["x"]).expect("model"),
        )
    }

    /// x' = -z, 0 = z - k x, q' = x
    fn algebraic_decay() -> DaeRef {
        Differentiable::shared(
            ExpressionModel::forward(&["x"], &["z"], &["k"], &["-z"], &["z - k*x"], &["x"])
                .expect("model"),
        )
    }

    /// Reversed-time l' = a l, rq' = x l, reading x and a from the forward problem.
    fn costate() -> DaeRef {
        let inputs: [&[&str]; 6] = [&["l"], &[], &[], &["x"], &[], &["a"]];
        let outputs: [&[&str]; 3] = [&["a*l"], &[], &["x*l"]];
        Differentiable::shared(ExpressionModel::new(&inputs, &outputs).expect("model"))
    }

    fn decay_engine(t_end: f64) -> Tsit5Integrator {
        let mut engine = Tsit5Integrator::new(decay(), None, 0.0, t_end);
        engine.init().expect("init");
        engine.input_mut().x0 = vec![2.0];
        engine.input_mut().p = vec![-0.7];
        engine
    }

    #[test]
    fn forward_pass_matches_closed_form() {
        let mut engine = decay_engine(1.5);
        engine.evaluate(0, 0).expect("evaluate");

        let a: f64 = -0.7;
        let xf = 2.0 * (a * 1.5).exp();
        assert_relative_eq!(engine.output().xf[0], xf, max_relative = 1e-6);
        assert_relative_eq!(engine.output().qf[0], (xf - 2.0) / a, max_relative = 1e-6);
        assert_eq!(engine.core().state(), IntegratorState::ForwardDone);
    }

    #[test]
    fn algebraic_states_and_quadratures_follow_closed_form() {
        let k: f64 = 0.8;
        let exact_x = 3.0 * (-k * 2.0).exp();
        let exact_q = 3.0 * (1.0 - (-k * 2.0).exp()) / k;

        let mut adaptive = Tsit5Integrator::new(algebraic_decay(), None, 0.0, 2.0);
        adaptive.init().expect("init");
        adaptive.input_mut().x0 = vec![3.0];
        adaptive.input_mut().p = vec![k];
        adaptive.evaluate(0, 0).expect("evaluate");
        assert_relative_eq!(adaptive.output().xf[0], exact_x, max_relative = 1e-6);
        assert_relative_eq!(adaptive.output().qf[0], exact_q, max_relative = 1e-6);

        let options = IntegratorOptions {
            fixed_steps: 4000,
            ..IntegratorOptions::default()
        };
        let mut implicit =
            BackwardEulerIntegrator::new(algebraic_decay(), None, 0.0, 2.0).with_options(options);
        implicit.init().expect("init");
        implicit.input_mut().x0 = vec![3.0];
        implicit.input_mut().p = vec![k];
        implicit.evaluate(0, 0).expect("evaluate");
        assert_relative_eq!(implicit.output().xf[0], exact_x, max_relative = 1e-3);
        assert_relative_eq!(implicit.output().qf[0], exact_q, max_relative = 1e-3);
    }

    #[test]
    fn backward_pass_matches_closed_form() {
        let (a, t_end, l_end): (f64, f64, f64) = (-0.4, 1.2, 1.5);
        let mut engine = Tsit5Integrator::new(decay(), Some(costate()), 0.0, t_end);
        engine.init().expect("init");
        engine.input_mut().x0 = vec![2.0];
        engine.input_mut().p = vec![a];
        engine.input_mut().rx0 = vec![l_end];
        engine.evaluate(0, 0).expect("evaluate");

        // l(t) = l_T e^{a (T - t)}, so x l = 2 l_T e^{a T} is constant.
        let growth = (a * t_end).exp();
        assert_relative_eq!(engine.output().rxf[0], l_end * growth, max_relative = 1e-6);
        assert_relative_eq!(
            engine.output().rqf[0],
            2.0 * l_end * growth * t_end,
            max_relative = 1e-5
        );
        assert_eq!(engine.core().state(), IntegratorState::AdjointDone);
        assert!(engine.core().stats().backward.steps > 0);
    }

    #[test]
    fn zero_length_integrate_leaves_state_alone() {
        let mut engine = decay_engine(1.0);
        engine.reset().expect("reset");
        engine.integrate(0.0).expect("integrate");
        assert_eq!(engine.output().xf, vec![2.0]);
        assert_eq!(engine.output().qf, vec![0.0]);
        assert_eq!(engine.core().state(), IntegratorState::ForwardReady);
        assert_eq!(engine.core().stats().forward.steps, 0);
    }

    #[test]
    fn integrates_in_segments() {
        let mut engine = decay_engine(1.0);
        engine.reset().expect("reset");
        engine.integrate(0.25).expect("first segment");
        assert_relative_eq!(
            engine.output().xf[0],
            2.0 * (-0.7f64 * 0.25).exp(),
            max_relative = 1e-6
        );
        engine.integrate(1.0).expect("second segment");
        assert_relative_eq!(
            engine.output().xf[0],
            2.0 * (-0.7f64).exp(),
            max_relative = 1e-6
        );

        let err = engine.integrate(0.5).unwrap_err();
        assert!(matches!(err, IntegratorError::InvalidRequest(_)));
        let err = engine.integrate(2.0).unwrap_err();
        assert!(matches!(err, IntegratorError::InvalidRequest(_)));
    }

    #[test]
    fn reset_adj_without_backward_system_is_unsupported() {
        let mut engine = decay_engine(1.0);
        engine.evaluate(0, 0).expect("evaluate");
        let before = engine.output().clone();

        let err = engine.reset_adj().unwrap_err();
        assert!(matches!(err, IntegratorError::Unsupported(_)));
        assert_eq!(engine.output(), &before);
        assert_eq!(engine.core().state(), IntegratorState::ForwardDone);
    }

    #[test]
    fn integrate_adj_without_backward_system_is_unsupported() {
        let mut engine = decay_engine(1.0);
        engine.evaluate(0, 0).expect("evaluate");
        let before = engine.output().clone();
        let steps = engine.core().stats().forward.steps;

        let err = engine.integrate_adj(0.0).unwrap_err();
        assert!(matches!(err, IntegratorError::Unsupported(_)));
        assert_eq!(engine.output(), &before);
        assert_eq!(engine.core().state(), IntegratorState::ForwardDone);
        assert_eq!(engine.core().stats().forward.steps, steps);
    }

    #[test]
    fn reset_adj_needs_a_finished_forward_pass() {
        let mut engine = Tsit5Integrator::new(decay(), Some(costate()), 0.0, 1.0);
        engine.init().expect("init");
        engine.reset().expect("reset");
        let err = engine.reset_adj().unwrap_err();
        assert!(matches!(err, IntegratorError::InvalidRequest(_)));
    }

    #[test]
    fn operations_before_init_are_rejected() {
        let mut engine = Rk4Integrator::new(decay(), None, 0.0, 1.0);
        assert!(matches!(
            engine.reset().unwrap_err(),
            IntegratorError::InvalidRequest(_)
        ));
        assert!(matches!(
            engine.evaluate(0, 0).unwrap_err(),
            IntegratorError::InvalidRequest(_)
        ));
    }

    #[test]
    fn clones_evaluate_identically_and_independently() {
        let mut engine = decay_engine(1.0);
        let mut copy = engine.clone_integrator();
        assert!(!Arc::ptr_eq(engine.core().f(), copy.core().f()));

        engine.evaluate(0, 0).expect("original");
        copy.evaluate(0, 0).expect("copy");
        assert_eq!(engine.output(), copy.output());

        copy.input_mut().x0 = vec![5.0];
        copy.evaluate(0, 0).expect("copy again");
        assert_ne!(engine.output().xf, copy.output().xf);
    }

    #[test]
    fn declared_backward_states_without_backward_system_fail() {
        let declared = StateLayout {
            nx: 1,
            nq: 1,
            np: 1,
            nrx: 1,
            ..StateLayout::default()
        };
        let mut engine =
            Rk4Integrator::new(decay(), None, 0.0, 1.0).with_declared_layout(declared);
        let err = engine.init().unwrap_err();
        assert!(matches!(err, IntegratorError::Configuration(_)));
    }

    #[test]
    fn rejects_reversed_or_infinite_horizons() {
        let mut reversed = Rk4Integrator::new(decay(), None, 1.0, 0.0);
        assert!(matches!(
            reversed.init().unwrap_err(),
            IntegratorError::Configuration(_)
        ));
        let mut unbounded = Rk4Integrator::new(decay(), None, 0.0, f64::INFINITY);
        assert!(matches!(
            unbounded.init().unwrap_err(),
            IntegratorError::Configuration(_)
        ));
    }

    #[test]
    fn mismatched_inputs_are_invalid_requests() {
        let mut engine = decay_engine(1.0);
        engine.input_mut().x0 = vec![1.0, 2.0];
        let err = engine.reset().unwrap_err();
        assert!(matches!(err, IntegratorError::InvalidRequest(_)));
        assert!(format!("{err}").contains("x0"));
    }

    #[test]
    fn failure_is_sticky_until_reset() {
        // x' = x^2 escapes to infinity at t = 1 for x0 = 1.
        let blowup = Differentiable::shared(
            ExpressionModel::forward(&["x"], &[], &[], &["x^2"], &[], &[]).expect("model"),
        );
        let options = IntegratorOptions {
            max_steps: 2000,
            ..IntegratorOptions::default()
        };
        let mut engine = Tsit5Integrator::new(blowup, None, 0.0, 2.0).with_options(options);
        engine.init().expect("init");
        engine.input_mut().x0 = vec![1.0];

        let err = engine.evaluate(0, 0).unwrap_err();
        assert!(matches!(err, IntegratorError::Integration { .. }));
        assert_eq!(engine.core().state(), IntegratorState::Failed);
        assert!(matches!(
            engine.integrate(2.0).unwrap_err(),
            IntegratorError::InvalidRequest(_)
        ));

        engine.input_mut().x0 = vec![-1.0];
        engine.evaluate(0, 0).expect("recovered");
        assert_relative_eq!(engine.output().xf[0], -1.0 / 3.0, max_relative = 1e-6);
    }

    #[test]
    fn step_budget_exhaustion_is_an_integration_error() {
        let options = IntegratorOptions {
            max_steps: 10,
            fixed_steps: 100,
            ..IntegratorOptions::default()
        };
        let mut engine = Rk4Integrator::new(decay(), None, 0.0, 1.0).with_options(options);
        engine.init().expect("init");
        let err = engine.evaluate(0, 0).unwrap_err();
        assert!(matches!(err, IntegratorError::Integration { .. }));
        assert!(format!("{err}").contains("max_steps"));
    }

    #[test]
    fn step_budget_counts_from_the_last_reset() {
        let options = IntegratorOptions {
            max_steps: 60,
            fixed_steps: 100,
            ..IntegratorOptions::default()
        };
        let mut engine = Rk4Integrator::new(decay(), None, 0.0, 1.0).with_options(options);
        engine.init().expect("init");
        engine.reset().expect("reset");
        engine.integrate(0.5).expect("first half fits the budget");
        assert_eq!(engine.core().stats().forward.steps, 50);

        let err = engine.integrate(1.0).unwrap_err();
        assert!(format!("{err}").contains("max_steps = 60"));

        engine.reset().expect("reset");
        engine.integrate(0.5).expect("budget restored by reset");
    }

    #[test]
    fn forward_reset_keeps_backward_counters() {
        let mut engine = Rk4Integrator::new(decay(), Some(costate()), 0.0, 1.0);
        engine.init().expect("init");
        engine.input_mut().x0 = vec![1.0];
        engine.input_mut().p = vec![-0.5];
        engine.input_mut().rx0 = vec![1.0];
        engine.evaluate(0, 0).expect("evaluate");
        let backward = engine.core().stats().backward;
        assert!(backward.steps > 0);

        engine.reset().expect("reset");
        assert_eq!(engine.core().stats().backward, backward);
        assert_eq!(engine.core().stats().forward.steps, 0);
    }

    #[test]
    fn evaluate_checks_requested_directions() {
        let mut engine = decay_engine(1.0);
        assert!(matches!(
            engine.evaluate(1, 0).unwrap_err(),
            IntegratorError::Unsupported(_)
        ));
        assert!(matches!(
            engine.evaluate(0, 1).unwrap_err(),
            IntegratorError::Unsupported(_)
        ));
        assert_eq!(engine.core().state(), IntegratorState::Initialized);
    }

    #[test]
    fn create_keeps_backend_and_options() {
        let options = IntegratorOptions {
            fixed_steps: 17,
            ..IntegratorOptions::default()
        };
        let engine = Rk4Integrator::new(decay(), None, 0.0, 1.0).with_options(options);
        let other = engine.create(algebraic_decay(), None);
        assert_eq!(other.name(), "rk4");
        assert_eq!(other.core().options.fixed_steps, 17);
        assert_eq!(other.core().state(), IntegratorState::Uninitialized);
    }

    #[test]
    fn sparsity_separates_forward_and_backward_outputs() {
        let mut engine = Tsit5Integrator::new(decay(), Some(costate()), 0.0, 1.0);
        engine.init().expect("init");
        let layout = *engine.core().layout().expect("layout");

        let mut pattern = DependencyPattern::new(&layout);
        pattern.inputs[0][0] = 0b01;
        pattern.inputs[2][0] = 0b10;
        engine.sp_evaluate(true, &mut pattern).expect("forward");
        assert_eq!(pattern.outputs[0], vec![0b01]);
        assert_eq!(pattern.outputs[1], vec![0b01]);
        assert_eq!(pattern.outputs[2], vec![0b11]);

        let mut pattern = DependencyPattern::new(&layout);
        pattern.outputs[1][0] = 0b100;
        engine.sp_evaluate(false, &mut pattern).expect("reverse");
        assert_eq!(pattern.inputs[0], vec![0b100]);
        assert_eq!(pattern.inputs[1], vec![0b100]);
        assert_eq!(pattern.inputs[2], vec![0]);
        assert_eq!(pattern.outputs[1], vec![0]);
    }

    #[test]
    fn prints_statistics() {
        let mut engine = decay_engine(1.0);
        engine.evaluate(0, 0).expect("evaluate");
        let mut sink = Vec::new();
        engine.print_stats(&mut sink).expect("write");
        let text = String::from_utf8(sink).expect("utf8");
        assert!(text.starts_with("tsit5 integrator"));
        assert!(text.contains("forward"));
        assert!(text.contains("rhs evaluations"));
    }
}
