//! Views of the forward and backward systems as [`PhaseSystem`]s, and the
//! stored forward trajectory the backward phase reads from.

use super::NewtonSettings;
use crate::layout::StateLayout;
use crate::solvers::{newton_solve, PhaseSystem};
use crate::traits::DaeFunction;
use std::cell::{Cell, RefCell};
use tracing::trace;

/// Forward problem with `y = [x, q]`.
pub(crate) struct ForwardPhase<'a> {
    f: &'a dyn DaeFunction,
    p: &'a [f64],
    nx: usize,
    nq: usize,
    nz: usize,
    evaluations: Cell<usize>,
}

impl<'a> ForwardPhase<'a> {
    pub(crate) fn new(f: &'a dyn DaeFunction, p: &'a [f64], layout: &StateLayout) -> Self {
        Self {
            f,
            p,
            nx: layout.nx,
            nq: layout.nq,
            nz: layout.nz,
            evaluations: Cell::new(0),
        }
    }

    pub(crate) fn evaluations(&self) -> usize {
        self.evaluations.get()
    }
}

impl PhaseSystem for ForwardPhase<'_> {
    fn n_diff(&self) -> usize {
        self.nx + self.nq
    }

    fn n_alg(&self) -> usize {
        self.nz
    }

    fn eval(&self, t: f64, y: &[f64], z: &[f64], ydot: &mut [f64], residual: &mut [f64]) {
        let (xdot, qdot) = ydot.split_at_mut(self.nx);
        let inputs: [&[f64]; 3] = [&y[..self.nx], z, self.p];
        let mut outputs: [&mut [f64]; 3] = [xdot, residual, qdot];
        self.f.eval(t, &inputs, &mut outputs);
        self.evaluations.set(self.evaluations.get() + 1);
    }
}

/// Backward problem with `y = [rx, rq]`, stepped in `t` with negated right-hand sides.
///
/// Forward differential states come from the trajectory; forward algebraic
/// states are re-solved at the interpolated point.
pub(crate) struct BackwardPhase<'a> {
    f: &'a dyn DaeFunction,
    g: &'a dyn DaeFunction,
    rp: &'a [f64],
    p: &'a [f64],
    trajectory: &'a Trajectory,
    newton: &'a NewtonSettings,
    nq: usize,
    nrx: usize,
    nrq: usize,
    nrz: usize,
    x: RefCell<Vec<f64>>,
    z: RefCell<Vec<f64>>,
    evaluations: Cell<usize>,
}

impl<'a> BackwardPhase<'a> {
    pub(crate) fn new(
        f: &'a dyn DaeFunction,
        g: &'a dyn DaeFunction,
        rp: &'a [f64],
        p: &'a [f64],
        trajectory: &'a Trajectory,
        newton: &'a NewtonSettings,
        layout: &StateLayout,
    ) -> Self {
        Self {
            f,
            g,
            rp,
            p,
            trajectory,
            newton,
            nq: layout.nq,
            nrx: layout.nrx,
            nrq: layout.nrq,
            nrz: layout.nrz,
            x: RefCell::new(vec![0.0; layout.nx]),
            z: RefCell::new(vec![0.0; layout.nz]),
            evaluations: Cell::new(0),
        }
    }

    pub(crate) fn evaluations(&self) -> usize {
        self.evaluations.get()
    }

    fn refine_algebraics(&self, t: f64, x: &[f64], z: &mut [f64]) {
        if z.is_empty() {
            return;
        }
        let mut ode = vec![0.0; x.len()];
        let mut quad = vec![0.0; self.nq];
        let mut candidate = z.to_vec();
        let solved = newton_solve(t, &mut candidate, self.newton, |zc, residual| {
            let inputs: [&[f64]; 3] = [x, zc, self.p];
            self.f
                .eval(t, &inputs, &mut [&mut ode[..], residual, &mut quad[..]]);
        });
        match solved {
            Ok(_) => z.copy_from_slice(&candidate),
            Err(err) => trace!(t, error = %err, "kept interpolated algebraic states"),
        }
    }
}

impl PhaseSystem for BackwardPhase<'_> {
    fn n_diff(&self) -> usize {
        self.nrx + self.nrq
    }

    fn n_alg(&self) -> usize {
        self.nrz
    }

    fn eval(&self, t: f64, y: &[f64], z: &[f64], ydot: &mut [f64], residual: &mut [f64]) {
        let mut x = self.x.borrow_mut();
        let mut xz = self.z.borrow_mut();
        self.trajectory.interpolate(t, &mut x[..], &mut xz[..]);
        self.refine_algebraics(t, &x, &mut xz);
        {
            let (rxdot, rqdot) = ydot.split_at_mut(self.nrx);
            let inputs: [&[f64]; 6] = [&y[..self.nrx], z, self.rp, &x[..], &xz[..], self.p];
            let mut outputs: [&mut [f64]; 3] = [rxdot, residual, rqdot];
            self.g.eval(t, &inputs, &mut outputs);
        }
        for value in ydot.iter_mut() {
            *value = -*value;
        }
        self.evaluations.set(self.evaluations.get() + 1);
    }
}

/// Accepted forward points with state derivatives, for dense output of `x` and `z`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Trajectory {
    nx: usize,
    nz: usize,
    times: Vec<f64>,
    states: Vec<f64>,
    derivatives: Vec<f64>,
    algebraics: Vec<f64>,
}

impl Trajectory {
    pub(crate) fn clear(&mut self, nx: usize, nz: usize) {
        self.nx = nx;
        self.nz = nz;
        self.times.clear();
        self.states.clear();
        self.derivatives.clear();
        self.algebraics.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.times.len()
    }

    pub(crate) fn push(&mut self, t: f64, x: &[f64], xdot: &[f64], z: &[f64]) {
        if self.times.last().is_some_and(|&last| t <= last) {
            return;
        }
        self.times.push(t);
        self.states.extend_from_slice(x);
        self.derivatives.extend_from_slice(xdot);
        self.algebraics.extend_from_slice(z);
    }

    /// Cubic Hermite interpolation for `x`, linear for `z`. Clamps outside the stored range.
    pub(crate) fn interpolate(&self, t: f64, x: &mut [f64], z: &mut [f64]) {
        let n = self.times.len();
        if n == 0 {
            x.fill(0.0);
            z.fill(0.0);
            return;
        }
        if n == 1 {
            x.copy_from_slice(&self.states[..self.nx]);
            z.copy_from_slice(&self.algebraics[..self.nz]);
            return;
        }

        let i = self.times.partition_point(|&ti| ti <= t).clamp(1, n - 1) - 1;
        let (t0, t1) = (self.times[i], self.times[i + 1]);
        let h = t1 - t0;
        let s = ((t - t0) / h).clamp(0.0, 1.0);

        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;

        let (x0, x1) = (
            self.node(&self.states, self.nx, i),
            self.node(&self.states, self.nx, i + 1),
        );
        let (d0, d1) = (
            self.node(&self.derivatives, self.nx, i),
            self.node(&self.derivatives, self.nx, i + 1),
        );
        for k in 0..self.nx {
            x[k] = h00 * x0[k] + h10 * h * d0[k] + h01 * x1[k] + h11 * h * d1[k];
        }

        let (z0, z1) = (
            self.node(&self.algebraics, self.nz, i),
            self.node(&self.algebraics, self.nz, i + 1),
        );
        for k in 0..self.nz {
            z[k] = (1.0 - s) * z0[k] + s * z1[k];
        }
    }

    fn node<'s>(&self, values: &'s [f64], size: usize, i: usize) -> &'s [f64] {
        &values[i * size..(i + 1) * size]
    }
}
