use crate::error::{IntegratorError, Result};
use crate::integrator::{IntegratorOptions, NewtonSettings, StepCounters};
use nalgebra::{DMatrix, DVector};

/// A semi-explicit DAE seen from one integration direction:
/// `y' = F(t, y, z)`, `0 = G(t, y, z)`.
pub trait PhaseSystem {
    fn n_diff(&self) -> usize;

    fn n_alg(&self) -> usize;

    /// Writes `F` into `ydot` and `G` into `residual`.
    fn eval(&self, t: f64, y: &[f64], z: &[f64], ydot: &mut [f64], residual: &mut [f64]);
}

/// Current point of one integration direction plus the step size to try next.
#[derive(Debug, Clone, Default)]
pub struct PhaseState {
    pub t: f64,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub h: f64,
}

impl PhaseState {
    pub fn new(n_diff: usize, n_alg: usize) -> Self {
        Self {
            t: 0.0,
            y: vec![0.0; n_diff],
            z: vec![0.0; n_alg],
            h: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// A candidate is available; `error` is the scaled local error for adaptive methods.
    Completed { error: Option<f64> },
    /// An implicit or algebraic solve failed; the step should be retried smaller.
    NewtonFailure,
}

/// One-step method over a [`PhaseSystem`].
pub trait Stepper: Clone + Default + Send {
    fn name(&self) -> &'static str;

    /// Order of the embedded error estimate, `None` for fixed-step methods.
    fn error_order(&self) -> Option<usize>;

    fn resize(&mut self, n_diff: usize, n_alg: usize);

    /// Attempts a step of signed size `h` from `from`. The candidate is read back
    /// with [`Stepper::proposal`].
    fn step(
        &mut self,
        system: &dyn PhaseSystem,
        options: &IntegratorOptions,
        from: &PhaseState,
        h: f64,
        counters: &mut StepCounters,
    ) -> StepOutcome;

    fn proposal(&self) -> (&[f64], &[f64]);
}

/// Newton iteration on `residual(u) = 0` with a forward-difference Jacobian.
/// Returns the number of iterations taken.
pub fn newton_solve(
    t: f64,
    unknowns: &mut [f64],
    settings: &NewtonSettings,
    mut residual: impl FnMut(&[f64], &mut [f64]),
) -> Result<usize> {
    let dim = unknowns.len();
    if dim == 0 {
        return Ok(0);
    }

    let mut current = vec![0.0; dim];
    let mut perturbed = vec![0.0; dim];
    let mut work = unknowns.to_vec();
    let mut jacobian = DMatrix::zeros(dim, dim);
    residual(unknowns, &mut current);
    let mut iterations = 0usize;

    loop {
        let norm = l2_norm(&current);
        if !norm.is_finite() {
            return Err(IntegratorError::integration(
                t,
                "Newton residual is not finite",
            ));
        }
        if norm <= settings.tolerance {
            return Ok(iterations);
        }
        if iterations >= settings.max_steps {
            return Err(IntegratorError::integration(
                t,
                format!(
                    "Newton solver failed to converge in {} steps (‖r‖ = {norm:e})",
                    settings.max_steps
                ),
            ));
        }

        work.copy_from_slice(unknowns);
        for j in 0..dim {
            let h = f64::EPSILON.sqrt() * unknowns[j].abs().max(1.0);
            work[j] = unknowns[j] + h;
            residual(&work, &mut perturbed);
            work[j] = unknowns[j];
            for i in 0..dim {
                jacobian[(i, j)] = (perturbed[i] - current[i]) / h;
            }
        }

        let delta = jacobian
            .clone()
            .lu()
            .solve(&DVector::from_column_slice(&current))
            .ok_or_else(|| IntegratorError::integration(t, "Newton Jacobian is singular"))?;
        for (value, step) in unknowns.iter_mut().zip(delta.iter()) {
            *value -= settings.damping * step;
        }

        iterations += 1;
        residual(unknowns, &mut current);
    }
}

/// Makes `z` consistent with `(t, y)` and leaves `F(t, y, z)` in `ydot`.
pub fn solve_algebraic(
    system: &dyn PhaseSystem,
    t: f64,
    y: &[f64],
    z: &mut [f64],
    ydot: &mut [f64],
    settings: &NewtonSettings,
) -> Result<usize> {
    let mut residual = vec![0.0; system.n_alg()];
    let iterations = if system.n_alg() == 0 {
        0
    } else {
        let mut scratch = vec![0.0; system.n_diff()];
        newton_solve(t, z, settings, |candidate, out| {
            system.eval(t, y, candidate, &mut scratch, out)
        })?
    };
    system.eval(t, y, z, ydot, &mut residual);
    Ok(iterations)
}

fn stage(
    system: &dyn PhaseSystem,
    options: &IntegratorOptions,
    t: f64,
    y: &[f64],
    z: &mut [f64],
    k: &mut [f64],
    counters: &mut StepCounters,
) -> bool {
    match solve_algebraic(system, t, y, z, k, &options.newton) {
        Ok(iterations) => {
            counters.newton_iterations += iterations;
            true
        }
        Err(_) => false,
    }
}

/// Classic Runge-Kutta 4th order, fixed step. Algebraic states are solved at every stage.
#[derive(Debug, Clone, Default)]
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
    y_new: Vec<f64>,
    z_new: Vec<f64>,
}

impl Stepper for Rk4 {
    fn name(&self) -> &'static str {
        "rk4"
    }

    fn error_order(&self) -> Option<usize> {
        None
    }

    fn resize(&mut self, n_diff: usize, n_alg: usize) {
        for buffer in [
            &mut self.k1,
            &mut self.k2,
            &mut self.k3,
            &mut self.k4,
            &mut self.tmp,
            &mut self.y_new,
        ] {
            *buffer = vec![0.0; n_diff];
        }
        self.z_new = vec![0.0; n_alg];
    }

    fn step(
        &mut self,
        system: &dyn PhaseSystem,
        options: &IntegratorOptions,
        from: &PhaseState,
        h: f64,
        counters: &mut StepCounters,
    ) -> StepOutcome {
        let Self {
            k1,
            k2,
            k3,
            k4,
            tmp,
            y_new,
            z_new,
        } = self;
        let (t0, y) = (from.t, &from.y);
        z_new.copy_from_slice(&from.z);

        // k1 = F(t, y)
        if !stage(system, options, t0, y, z_new, k1, counters) {
            return StepOutcome::NewtonFailure;
        }

        // k2 = F(t + h/2, y + h*k1/2)
        for i in 0..y.len() {
            tmp[i] = y[i] + 0.5 * h * k1[i];
        }
        if !stage(system, options, t0 + 0.5 * h, tmp, z_new, k2, counters) {
            return StepOutcome::NewtonFailure;
        }

        // k3 = F(t + h/2, y + h*k2/2)
        for i in 0..y.len() {
            tmp[i] = y[i] + 0.5 * h * k2[i];
        }
        if !stage(system, options, t0 + 0.5 * h, tmp, z_new, k3, counters) {
            return StepOutcome::NewtonFailure;
        }

        // k4 = F(t + h, y + h*k3)
        for i in 0..y.len() {
            tmp[i] = y[i] + h * k3[i];
        }
        if !stage(system, options, t0 + h, tmp, z_new, k4, counters) {
            return StepOutcome::NewtonFailure;
        }

        for i in 0..y.len() {
            y_new[i] = y[i] + h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
        }

        if system.n_alg() > 0 && !stage(system, options, t0 + h, y_new, z_new, tmp, counters) {
            return StepOutcome::NewtonFailure;
        }
        StepOutcome::Completed { error: None }
    }

    fn proposal(&self) -> (&[f64], &[f64]) {
        (&self.y_new, &self.z_new)
    }
}

const TSIT5_C: [f64; 6] = [0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0];

const TSIT5_A: [&[f64]; 6] = [
    &[0.161],
    &[-0.008480655492356989, 0.335480655492357],
    &[2.897153057105493, -6.359448489975075, 4.3622954328695815],
    &[
        5.325864828439257,
        -11.748883564062828,
        7.4955393428898365,
        -0.09249506636175525,
    ],
    &[
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.028269050394068383,
    ],
    &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436081,
        2.324710524099774,
    ],
];

// Difference between the 5th and embedded 4th order weights, k7 included.
const TSIT5_BTILDE: [f64; 7] = [
    -0.0017800110522257773,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    0.015151515151515152,
];

/// Tsitouras 5/4 with an embedded error estimate.
#[derive(Debug, Clone, Default)]
pub struct Tsit5 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    y_new: Vec<f64>,
    z_new: Vec<f64>,
}

impl Stepper for Tsit5 {
    fn name(&self) -> &'static str {
        "tsit5"
    }

    fn error_order(&self) -> Option<usize> {
        Some(4)
    }

    fn resize(&mut self, n_diff: usize, n_alg: usize) {
        for buffer in self.k.iter_mut() {
            *buffer = vec![0.0; n_diff];
        }
        self.tmp = vec![0.0; n_diff];
        self.y_new = vec![0.0; n_diff];
        self.z_new = vec![0.0; n_alg];
    }

    fn step(
        &mut self,
        system: &dyn PhaseSystem,
        options: &IntegratorOptions,
        from: &PhaseState,
        h: f64,
        counters: &mut StepCounters,
    ) -> StepOutcome {
        let Self {
            k,
            tmp,
            y_new,
            z_new,
        } = self;
        let (t0, y) = (from.t, &from.y);
        z_new.copy_from_slice(&from.z);

        if !stage(system, options, t0, y, z_new, &mut k[0], counters) {
            return StepOutcome::NewtonFailure;
        }

        // Rows 0..=4 of A build stage inputs and row 5 holds the solution
        // weights, so the last stage evaluates F at the new point.
        for s in 1..7 {
            let weights = TSIT5_A[s - 1];
            let target = if s < 6 { &mut tmp[..] } else { &mut y_new[..] };
            for i in 0..y.len() {
                let increment: f64 = weights.iter().zip(k.iter()).map(|(a, kj)| a * kj[i]).sum();
                target[i] = y[i] + h * increment;
            }
            let t_stage = t0 + TSIT5_C[s - 1] * h;
            if !stage(system, options, t_stage, target, z_new, &mut k[s], counters) {
                return StepOutcome::NewtonFailure;
            }
        }

        let mut sum = 0.0;
        for i in 0..y.len() {
            let estimate: f64 = TSIT5_BTILDE
                .iter()
                .zip(k.iter())
                .map(|(b, kj)| b * kj[i])
                .sum::<f64>()
                * h;
            let scale = options.abstol + options.reltol * y[i].abs().max(y_new[i].abs());
            sum += (estimate / scale).powi(2);
        }
        let error = if y.is_empty() {
            0.0
        } else {
            (sum / y.len() as f64).sqrt()
        };
        StepOutcome::Completed { error: Some(error) }
    }

    fn proposal(&self) -> (&[f64], &[f64]) {
        (&self.y_new, &self.z_new)
    }
}

/// Backward Euler, fixed step. Each step solves for `[y1; z1]` together.
#[derive(Debug, Clone, Default)]
pub struct BackwardEuler {
    unknowns: Vec<f64>,
    rhs: Vec<f64>,
    y_new: Vec<f64>,
    z_new: Vec<f64>,
}

impl Stepper for BackwardEuler {
    fn name(&self) -> &'static str {
        "backward-euler"
    }

    fn error_order(&self) -> Option<usize> {
        None
    }

    fn resize(&mut self, n_diff: usize, n_alg: usize) {
        self.unknowns = vec![0.0; n_diff + n_alg];
        self.rhs = vec![0.0; n_diff];
        self.y_new = vec![0.0; n_diff];
        self.z_new = vec![0.0; n_alg];
    }

    fn step(
        &mut self,
        system: &dyn PhaseSystem,
        options: &IntegratorOptions,
        from: &PhaseState,
        h: f64,
        counters: &mut StepCounters,
    ) -> StepOutcome {
        let Self {
            unknowns,
            rhs,
            y_new,
            z_new,
        } = self;
        let n = from.y.len();
        let t1 = from.t + h;
        unknowns[..n].copy_from_slice(&from.y);
        unknowns[n..].copy_from_slice(&from.z);

        // r = [y1 - y - h F(t1, y1, z1); G(t1, y1, z1)]
        let solved = newton_solve(t1, unknowns, &options.newton, |u, r| {
            let (r_diff, r_alg) = r.split_at_mut(n);
            system.eval(t1, &u[..n], &u[n..], rhs, r_alg);
            for i in 0..n {
                r_diff[i] = u[i] - from.y[i] - h * rhs[i];
            }
        });

        match solved {
            Ok(iterations) => {
                counters.newton_iterations += iterations;
                y_new.copy_from_slice(&unknowns[..n]);
                z_new.copy_from_slice(&unknowns[n..]);
                StepOutcome::Completed { error: None }
            }
            Err(_) => StepOutcome::NewtonFailure,
        }
    }

    fn proposal(&self) -> (&[f64], &[f64]) {
        (&self.y_new, &self.z_new)
    }
}

/// Advances `state` to `t_out` (either direction), calling `on_step` after every accepted step.
pub fn advance<S: Stepper>(
    stepper: &mut S,
    system: &dyn PhaseSystem,
    state: &mut PhaseState,
    t_out: f64,
    options: &IntegratorOptions,
    counters: &mut StepCounters,
    mut on_step: impl FnMut(&PhaseState),
) -> Result<()> {
    let direction = if t_out >= state.t { 1.0 } else { -1.0 };
    let max_step = options.max_step.unwrap_or(f64::INFINITY);

    loop {
        let remaining = (t_out - state.t).abs();
        let round_off = 64.0 * f64::EPSILON * state.t.abs().max(t_out.abs()).max(1.0);
        if remaining <= round_off {
            state.t = t_out;
            return Ok(());
        }
        if counters.steps >= options.max_steps {
            return Err(IntegratorError::integration(
                state.t,
                format!("exceeded max_steps = {}", options.max_steps),
            ));
        }

        let mut h = state.h.min(max_step).min(remaining);
        let last = remaining - h <= round_off;
        if last {
            h = remaining;
        }

        match stepper.step(system, options, state, direction * h, counters) {
            StepOutcome::Completed { error } => {
                let (y_new, z_new) = stepper.proposal();
                if y_new.iter().chain(z_new).any(|v| !v.is_finite()) {
                    return Err(IntegratorError::integration(
                        state.t,
                        "state became non-finite",
                    ));
                }

                if let (Some(order), Some(error)) = (stepper.error_order(), error) {
                    let exponent = -1.0 / (order as f64 + 1.0);
                    if error > 1.0 {
                        counters.rejected_steps += 1;
                        state.h = h * (0.9 * error.powf(exponent)).max(0.2);
                        if state.h < options.min_step {
                            return Err(IntegratorError::integration(
                                state.t,
                                format!(
                                    "step size {:e} fell below min_step = {:e}",
                                    state.h, options.min_step
                                ),
                            ));
                        }
                        continue;
                    }
                    let factor = if error == 0.0 {
                        5.0
                    } else {
                        (0.9 * error.powf(exponent)).clamp(0.2, 5.0)
                    };
                    if !last || h * factor > state.h {
                        state.h = h * factor;
                    }
                }

                state.t = if last { t_out } else { state.t + direction * h };
                state.y.copy_from_slice(y_new);
                state.z.copy_from_slice(z_new);
                counters.steps += 1;
                on_step(state);
            }
            StepOutcome::NewtonFailure => {
                counters.rejected_steps += 1;
                state.h = 0.5 * h;
                if state.h < options.min_step {
                    return Err(IntegratorError::integration(
                        state.t,
                        format!(
                            "Newton iteration failed and step size {:e} fell below min_step = {:e}",
                            state.h, options.min_step
                        ),
                    ));
                }
            }
        }
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
