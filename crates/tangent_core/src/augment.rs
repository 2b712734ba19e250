//! Augmented system pairs carrying derivative directions.
//!
//! Every augmented vector is block-contiguous per quantity: the primal block
//! first, then one block per forward direction, then one block per adjoint
//! direction for quantities that carry adjoint states.
//!
//! * [`ForwardAugmented`] appends `nfwd` tangent copies to a forward or a
//!   backward system. Each tangent block obeys the linearised equations, so the
//!   extra differential states are forward sensitivities.
//! * [`AdjointAugmented`] is the backward system of an adjoint augmentation.
//!   For direction `d` its differential state is the costate `λ_d`, its
//!   algebraic state is the multiplier `ν_d`, its parameter block is the
//!   quadrature seed `w_d`, and its quadrature accumulates the parameter
//!   sensitivity. In reversed time
//!   `(λ̇_d, 0, ṙq_d) = (f_xᵀ, f_zᵀ, f_pᵀ) · (λ_d, ν_d, w_d)`, plus the
//!   `(g_xᵀ, g_zᵀ, g_pᵀ)` source terms when a backward system `g` is attached.
//! * [`CostateAugmented`] carries the adjoint `(μ_d, η_d)` of an attached
//!   backward problem. That adjoint runs forward in time, so it joins the
//!   forward system: `μ̇_d = g_rxᵀ · (μ_d, η_d, σ_d)` and
//!   `0 = g_rzᵀ · (μ_d, η_d, σ_d)`, with `σ_d` the seed on `rqf`. The products
//!   are taken at `rx = rz = 0`, which is exact when `g` is affine in its
//!   backward states (every adjoint system is).
//!
//! All wrappers provide `jvp` and `vjp` when the wrapped systems are twice
//! differentiable, so an augmented pair can itself be augmented once more.

use crate::autodiff::check_blocks;
use crate::error::{IntegratorError, Result};
use crate::integrator::IntegratorCore;
use crate::layout::{block, block_mut, StateLayout};
use crate::traits::{CopyMap, DaeFunction, DaeRef, Signature};
use std::sync::Arc;
use tracing::{debug, error};

fn poison(outputs: &mut [&mut [f64]]) {
    for out in outputs.iter_mut() {
        out.fill(f64::NAN);
    }
}

fn zeros(sizes: &[usize]) -> Vec<Vec<f64>> {
    sizes.iter().map(|&n| vec![0.0; n]).collect()
}

fn views(blocks: &[Vec<f64>]) -> Vec<&[f64]> {
    blocks.iter().map(Vec::as_slice).collect()
}

fn views_mut(blocks: &mut [Vec<f64>]) -> Vec<&mut [f64]> {
    blocks.iter_mut().map(Vec::as_mut_slice).collect()
}

fn contract(seeds: &[&[f64]], values: &[Vec<f64>]) -> f64 {
    seeds
        .iter()
        .zip(values)
        .flat_map(|(s, v)| s.iter().zip(v))
        .map(|(s, v)| s * v)
        .sum()
}

/// `Jᵀ · adj_seeds`, assembled one Jacobian column at a time from `jvp`.
fn vjp_by_columns(
    function: &dyn DaeFunction,
    t: f64,
    inputs: &[&[f64]],
    adj_seeds: &[&[f64]],
    sensitivities: &mut [&mut [f64]],
) -> Result<()> {
    let signature = function.signature();
    check_blocks("inputs", inputs, &signature.inputs)?;
    check_blocks("adjoint seeds", adj_seeds, &signature.outputs)?;

    let mut unit = zeros(&signature.inputs);
    let mut column = zeros(&signature.outputs);
    for b in 0..unit.len() {
        for j in 0..unit[b].len() {
            unit[b][j] = 1.0;
            function.jvp(t, inputs, &views(&unit), &mut views_mut(&mut column))?;
            unit[b][j] = 0.0;
            sensitivities[b][j] = contract(adj_seeds, &column);
        }
    }
    Ok(())
}

/// Derivative of `J(u)ᵀ · s` along `(du, ds)`: `J(u)ᵀ · ds + [s · F''(e_i, du)]_i`.
fn vjp_tangent(
    function: &dyn DaeFunction,
    t: f64,
    inputs: &[&[f64]],
    adj_seeds: &[&[f64]],
    d_inputs: &[&[f64]],
    d_adj_seeds: &[&[f64]],
    out: &mut [&mut [f64]],
) -> Result<()> {
    function.vjp(t, inputs, d_adj_seeds, out)?;

    let signature = function.signature();
    let mut unit = zeros(&signature.inputs);
    let still = zeros(&signature.inputs);
    let mut curvature = zeros(&signature.outputs);
    for b in 0..unit.len() {
        for j in 0..unit[b].len() {
            unit[b][j] = 1.0;
            function.second_jvp(
                t,
                inputs,
                &views(&unit),
                d_inputs,
                &views(&still),
                &mut views_mut(&mut curvature),
            )?;
            unit[b][j] = 0.0;
            out[b][j] += contract(adj_seeds, &curvature);
        }
    }
    Ok(())
}

/// `Jᵀ · adj_seeds` at `inputs`, or its derivative along `along = (d_inputs, d_adj_seeds)`.
fn transpose(
    function: &dyn DaeFunction,
    t: f64,
    inputs: &[&[f64]],
    adj_seeds: &[&[f64]],
    along: Option<(&[&[f64]], &[&[f64]])>,
    out: &mut [&mut [f64]],
) -> Result<()> {
    match along {
        None => function.vjp(t, inputs, adj_seeds, out),
        Some((d_inputs, d_adj_seeds)) => {
            vjp_tangent(function, t, inputs, adj_seeds, d_inputs, d_adj_seeds, out)
        }
    }
}

/// A system with `nfwd` tangent directions stacked behind the primal, block by block.
///
/// Wraps either a forward system `(x, z, p) -> (ode, alg, quad)` or a backward
/// system `(rx, rz, rp, x, z, p) -> (rode, ralg, rquad)` reading a
/// forward-augmented trajectory.
#[derive(Clone)]
pub struct ForwardAugmented {
    inner: DaeRef,
    nfwd: usize,
    input_sizes: Vec<usize>,
    output_sizes: Vec<usize>,
}

impl ForwardAugmented {
    /// Tangent copies of a forward system.
    pub fn forward(f: DaeRef, nfwd: usize, layout: &StateLayout) -> Self {
        Self {
            inner: f,
            nfwd,
            input_sizes: vec![layout.nx, layout.nz, layout.np],
            output_sizes: vec![layout.nx, layout.nz, layout.nq],
        }
    }

    /// Tangent copies of a backward system.
    pub fn backward(g: DaeRef, nfwd: usize, layout: &StateLayout) -> Self {
        Self {
            inner: g,
            nfwd,
            input_sizes: vec![
                layout.nrx, layout.nrz, layout.nrp, layout.nx, layout.nz, layout.np,
            ],
            output_sizes: vec![layout.nrx, layout.nrz, layout.nrq],
        }
    }

    fn inputs_at<'a>(&self, inputs: &[&'a [f64]], d: usize) -> Vec<&'a [f64]> {
        inputs
            .iter()
            .zip(&self.input_sizes)
            .map(|(values, &size)| block(values, size, d))
            .collect()
    }

    fn outputs_at<'a>(&self, outputs: &'a mut [&mut [f64]], d: usize) -> Vec<&'a mut [f64]> {
        outputs
            .iter_mut()
            .zip(&self.output_sizes)
            .map(|(values, &size)| block_mut(values, size, d))
            .collect()
    }
}

impl DaeFunction for ForwardAugmented {
    fn signature(&self) -> Signature {
        let m = 1 + self.nfwd;
        Signature::new(
            self.input_sizes.iter().map(|n| n * m).collect(),
            self.output_sizes.iter().map(|n| n * m).collect(),
        )
    }

    fn eval(&self, t: f64, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        if inputs.len() != self.input_sizes.len() || outputs.len() != self.output_sizes.len() {
            error!(
                inputs = inputs.len(),
                outputs = outputs.len(),
                "forward-augmented system called with wrong arity"
            );
            return poison(outputs);
        }

        let primal = self.inputs_at(inputs, 0);
        self.inner.eval(t, &primal, &mut self.outputs_at(outputs, 0));

        for d in 1..=self.nfwd {
            let seeds = self.inputs_at(inputs, d);
            let mut tangents = self.outputs_at(outputs, d);
            if let Err(err) = self.inner.jvp(t, &primal, &seeds, &mut tangents) {
                error!(error = %err, direction = d - 1, "forward sensitivity evaluation failed");
                poison(&mut tangents);
            }
        }
    }

    fn is_differentiable(&self) -> bool {
        self.inner.is_twice_differentiable()
    }

    fn jvp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
        tangents: &mut [&mut [f64]],
    ) -> Result<()> {
        let signature = self.signature();
        check_blocks("inputs", inputs, &signature.inputs)?;
        check_blocks("seeds", seeds, &signature.inputs)?;

        let primal = self.inputs_at(inputs, 0);
        let d_primal = self.inputs_at(seeds, 0);
        self.inner
            .jvp(t, &primal, &d_primal, &mut self.outputs_at(tangents, 0))?;

        // Block d is J·s_d; along (du, ds_d) it moves by J·ds_d + F''(s_d, du).
        for d in 1..=self.nfwd {
            let direction = self.inputs_at(inputs, d);
            let d_direction = self.inputs_at(seeds, d);
            self.inner.second_jvp(
                t,
                &primal,
                &direction,
                &d_primal,
                &d_direction,
                &mut self.outputs_at(tangents, d),
            )?;
        }
        Ok(())
    }

    fn vjp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        adj_seeds: &[&[f64]],
        sensitivities: &mut [&mut [f64]],
    ) -> Result<()> {
        vjp_by_columns(self, t, inputs, adj_seeds, sensitivities)
    }

    fn forward_directions(&self) -> usize {
        self.nfwd
    }

    fn deep_copy(&self, copies: &mut CopyMap) -> DaeRef {
        Arc::new(Self {
            inner: copies.copy(&self.inner),
            ..self.clone()
        })
    }
}

/// Primal and seed views of an [`AdjointAugmented`] input.
struct AdjointView<'a> {
    /// Primal `(x, z, p)`.
    forward: [&'a [f64]; 3],
    /// Primal `(rx, rz, rp, x, z, p)`; the backward blocks are empty without `g`.
    backward: [&'a [f64]; 6],
    /// Primal-plus-tangent region of every input, as read by the stacked `g`.
    stacked: [&'a [f64]; 6],
    lambda: &'a [f64],
    nu: &'a [f64],
    weights: &'a [f64],
    mu: &'a [f64],
    eta: &'a [f64],
    sigma: &'a [f64],
}

impl<'a> AdjointView<'a> {
    fn forward_seeds(&self, b: &StateLayout, d: usize) -> [&'a [f64]; 3] {
        [
            block(self.lambda, b.nx, d),
            block(self.nu, b.nz, d),
            block(self.weights, b.nq, d),
        ]
    }

    fn backward_seeds(&self, b: &StateLayout, d: usize) -> [&'a [f64]; 3] {
        [
            block(self.mu, b.nrx, d),
            block(self.eta, b.nrz, d),
            block(self.sigma, b.nrq, d),
        ]
    }
}

/// Backward system of an adjoint augmentation, one transposed sweep per direction.
///
/// Input blocks: `rx = [rx stack, λ]`, `rz = [rz stack, ν]`, `rp = [rp stack, w]`,
/// then the forward-system inputs of the paired [`CostateAugmented`] (or plain
/// forward-augmented) system. Output `rquad` holds the stacked `rquad` of `g`,
/// then `(p̄_d, rp̄_d)` per direction.
#[derive(Clone)]
pub struct AdjointAugmented {
    f: DaeRef,
    g: Option<DaeRef>,
    /// `g` itself, or its forward-augmented form when forward directions are stacked.
    stacked_g: Option<DaeRef>,
    nfwd: usize,
    nadj: usize,
    base: StateLayout,
}

impl AdjointAugmented {
    pub fn new(
        f: DaeRef,
        g: Option<DaeRef>,
        nfwd: usize,
        nadj: usize,
        base: &StateLayout,
    ) -> Self {
        let stacked_g = g.as_ref().map(|g| -> DaeRef {
            if nfwd > 0 {
                Arc::new(ForwardAugmented::backward(Arc::clone(g), nfwd, base))
            } else {
                Arc::clone(g)
            }
        });
        Self {
            f,
            g,
            stacked_g,
            nfwd,
            nadj,
            base: *base,
        }
    }

    fn view<'a>(&self, inputs: &[&'a [f64]]) -> Result<AdjointView<'a>> {
        check_blocks("inputs", inputs, &self.signature().inputs)?;
        let (b, m) = (&self.base, 1 + self.nfwd);
        let (rx, lambda) = inputs[0].split_at(b.nrx * m);
        let (rz, nu) = inputs[1].split_at(b.nrz * m);
        let (rp, weights) = inputs[2].split_at(b.nrp * m);
        let (x, mu) = inputs[3].split_at(b.nx * m);
        let (z, eta) = inputs[4].split_at(b.nz * m);
        let (p, tail) = inputs[5].split_at(b.np * m);
        // The forward system also carries a copy of the primal rp ahead of σ.
        let sigma = &tail[b.nrp..];

        let forward = [block(x, b.nx, 0), block(z, b.nz, 0), block(p, b.np, 0)];
        Ok(AdjointView {
            forward,
            backward: [
                block(rx, b.nrx, 0),
                block(rz, b.nrz, 0),
                block(rp, b.nrp, 0),
                forward[0],
                forward[1],
                forward[2],
            ],
            stacked: [rx, rz, rp, x, z, p],
            lambda,
            nu,
            weights,
            mu,
            eta,
            sigma,
        })
    }

    /// Writes the adjoint right-hand sides of every direction, or their
    /// derivatives when `along` is given.
    fn adjoint_blocks(
        &self,
        t: f64,
        at: &AdjointView<'_>,
        along: Option<&AdjointView<'_>>,
        rode: &mut [f64],
        ralg: &mut [f64],
        rquad: &mut [f64],
    ) -> Result<()> {
        let b = &self.base;
        for d in 0..self.nadj {
            let (p_bar, rp_bar) = block_mut(rquad, b.np + b.nrp, d).split_at_mut(b.np);
            let mut sensitivities = [block_mut(rode, b.nx, d), block_mut(ralg, b.nz, d), p_bar];

            let seeds = at.forward_seeds(b, d);
            let tangent = along.map(|v| (v.forward, v.forward_seeds(b, d)));
            transpose(
                self.f.as_ref(),
                t,
                &at.forward,
                &seeds,
                tangent.as_ref().map(|(u, s)| (&u[..], &s[..])),
                &mut sensitivities,
            )?;

            let Some(g) = &self.g else {
                continue;
            };
            let mut rx_bar = vec![0.0; b.nrx];
            let mut rz_bar = vec![0.0; b.nrz];
            let mut coupling = [vec![0.0; b.nx], vec![0.0; b.nz], vec![0.0; b.np]];
            let seeds = at.backward_seeds(b, d);
            let tangent = along.map(|v| (v.backward, v.backward_seeds(b, d)));
            {
                let [x_bar, z_bar, p_bar] = &mut coupling;
                transpose(
                    g.as_ref(),
                    t,
                    &at.backward,
                    &seeds,
                    tangent.as_ref().map(|(u, s)| (&u[..], &s[..])),
                    &mut [
                        rx_bar.as_mut_slice(),
                        rz_bar.as_mut_slice(),
                        rp_bar,
                        x_bar.as_mut_slice(),
                        z_bar.as_mut_slice(),
                        p_bar.as_mut_slice(),
                    ],
                )?;
            }
            for (target, source) in sensitivities.iter_mut().zip(&coupling) {
                target.iter_mut().zip(source).for_each(|(s, c)| *s += c);
            }
        }
        Ok(())
    }

    fn split_outputs<'o>(
        &self,
        outputs: &'o mut [&mut [f64]],
    ) -> Option<([&'o mut [f64]; 3], [&'o mut [f64]; 3])> {
        let [rode, ralg, rquad] = outputs else {
            return None;
        };
        let (b, m) = (&self.base, 1 + self.nfwd);
        let (rode_g, rode_adj) = rode.split_at_mut(b.nrx * m);
        let (ralg_g, ralg_adj) = ralg.split_at_mut(b.nrz * m);
        let (rquad_g, rquad_adj) = rquad.split_at_mut(b.nrq * m);
        Some(([rode_g, ralg_g, rquad_g], [rode_adj, ralg_adj, rquad_adj]))
    }
}

impl DaeFunction for AdjointAugmented {
    fn signature(&self) -> Signature {
        let (b, m, a) = (&self.base, 1 + self.nfwd, self.nadj);
        Signature::new(
            vec![
                b.nrx * m + b.nx * a,
                b.nrz * m + b.nz * a,
                b.nrp * m + b.nq * a,
                b.nx * m + b.nrx * a,
                b.nz * m + b.nrz * a,
                b.np * m + b.nrp + b.nrq * a,
            ],
            vec![
                b.nrx * m + b.nx * a,
                b.nrz * m + b.nz * a,
                b.nrq * m + (b.np + b.nrp) * a,
            ],
        )
    }

    fn eval(&self, t: f64, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        let view = match self.view(inputs) {
            Ok(view) => view,
            Err(err) => {
                error!(error = %err, "adjoint system called with misshapen inputs");
                return poison(outputs);
            }
        };
        let Some((mut stacked, [rode, ralg, rquad])) = self.split_outputs(outputs) else {
            error!(blocks = outputs.len(), "adjoint system called with wrong arity");
            return poison(outputs);
        };

        if let Some(g) = &self.stacked_g {
            g.eval(t, &view.stacked, &mut stacked);
        }
        if let Err(err) = self.adjoint_blocks(t, &view, None, rode, ralg, rquad) {
            error!(error = %err, "adjoint sensitivity evaluation failed");
            poison(&mut [rode, ralg, rquad]);
        }
    }

    fn is_differentiable(&self) -> bool {
        self.f.is_twice_differentiable()
            && self.g.as_ref().map_or(true, |g| g.is_twice_differentiable())
    }

    fn jvp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
        tangents: &mut [&mut [f64]],
    ) -> Result<()> {
        let at = self.view(inputs)?;
        let along = self.view(seeds)?;
        let Some((mut stacked, [rode, ralg, rquad])) = self.split_outputs(tangents) else {
            return Err(IntegratorError::invalid(
                "adjoint system tangents: expected 3 blocks",
            ));
        };
        if let Some(g) = &self.stacked_g {
            g.jvp(t, &at.stacked, &along.stacked, &mut stacked)?;
        }
        self.adjoint_blocks(t, &at, Some(&along), rode, ralg, rquad)
    }

    fn vjp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        adj_seeds: &[&[f64]],
        sensitivities: &mut [&mut [f64]],
    ) -> Result<()> {
        vjp_by_columns(self, t, inputs, adj_seeds, sensitivities)
    }

    fn forward_directions(&self) -> usize {
        self.nfwd
    }

    fn deep_copy(&self, copies: &mut CopyMap) -> DaeRef {
        Arc::new(Self {
            f: copies.copy(&self.f),
            g: self.g.as_ref().map(|g| copies.copy(g)),
            stacked_g: self.stacked_g.as_ref().map(|g| copies.copy(g)),
            ..self.clone()
        })
    }
}

/// Primal and seed views of a [`CostateAugmented`] input.
struct CostateView<'a> {
    /// Primal-plus-tangent region of `(x, z, p)`.
    stacked: [&'a [f64]; 3],
    /// `(rx, rz, rp, x, z, p)` at which `g` is linearised, with `rx = rz = 0`.
    backward: [&'a [f64]; 6],
    mu: &'a [f64],
    eta: &'a [f64],
    sigma: &'a [f64],
}

impl<'a> CostateView<'a> {
    fn seeds(&self, b: &StateLayout, d: usize) -> [&'a [f64]; 3] {
        [
            block(self.mu, b.nrx, d),
            block(self.eta, b.nrz, d),
            block(self.sigma, b.nrq, d),
        ]
    }
}

/// Forward system extended with the adjoint of an attached backward problem.
///
/// Input blocks: `x = [x stack, μ]`, `z = [z stack, η]`,
/// `p = [p stack, rp, σ]`, where `rp` is the primal backward parameter.
#[derive(Clone)]
pub struct CostateAugmented {
    /// The forward system, forward-augmented when tangents are stacked.
    inner: DaeRef,
    g: DaeRef,
    nfwd: usize,
    nadj: usize,
    base: StateLayout,
    rest_rx: Vec<f64>,
    rest_rz: Vec<f64>,
}

impl CostateAugmented {
    pub fn new(inner: DaeRef, g: DaeRef, nfwd: usize, nadj: usize, base: &StateLayout) -> Self {
        Self {
            inner,
            g,
            nfwd,
            nadj,
            base: *base,
            rest_rx: vec![0.0; base.nrx],
            rest_rz: vec![0.0; base.nrz],
        }
    }

    fn view<'a>(&'a self, inputs: &[&'a [f64]]) -> Result<CostateView<'a>> {
        check_blocks("inputs", inputs, &self.signature().inputs)?;
        let (b, m) = (&self.base, 1 + self.nfwd);
        let (x, mu) = inputs[0].split_at(b.nx * m);
        let (z, eta) = inputs[1].split_at(b.nz * m);
        let (p, tail) = inputs[2].split_at(b.np * m);
        let (rp, sigma) = tail.split_at(b.nrp);
        Ok(CostateView {
            stacked: [x, z, p],
            backward: [
                self.rest_rx.as_slice(),
                self.rest_rz.as_slice(),
                rp,
                block(x, b.nx, 0),
                block(z, b.nz, 0),
                block(p, b.np, 0),
            ],
            mu,
            eta,
            sigma,
        })
    }

    /// Writes `(μ̇_d, η residual_d)` for every direction, or their derivatives
    /// when `along` is given.
    fn costate_blocks(
        &self,
        t: f64,
        at: &CostateView<'_>,
        along: Option<&CostateView<'_>>,
        ode: &mut [f64],
        alg: &mut [f64],
    ) -> Result<()> {
        let b = &self.base;
        // Sensitivities to (rp, x, z, p) are not part of the costate dynamics.
        let mut unused = [
            vec![0.0; b.nrp],
            vec![0.0; b.nx],
            vec![0.0; b.nz],
            vec![0.0; b.np],
        ];
        for d in 0..self.nadj {
            let seeds = at.seeds(b, d);
            let tangent = along.map(|v| (v.backward, v.seeds(b, d)));
            let [rp_bar, x_bar, z_bar, p_bar] = &mut unused;
            transpose(
                self.g.as_ref(),
                t,
                &at.backward,
                &seeds,
                tangent.as_ref().map(|(u, s)| (&u[..], &s[..])),
                &mut [
                    block_mut(ode, b.nrx, d),
                    block_mut(alg, b.nrz, d),
                    rp_bar.as_mut_slice(),
                    x_bar.as_mut_slice(),
                    z_bar.as_mut_slice(),
                    p_bar.as_mut_slice(),
                ],
            )?;
        }
        Ok(())
    }
}

impl DaeFunction for CostateAugmented {
    fn signature(&self) -> Signature {
        let (b, m, a) = (&self.base, 1 + self.nfwd, self.nadj);
        Signature::new(
            vec![
                b.nx * m + b.nrx * a,
                b.nz * m + b.nrz * a,
                b.np * m + b.nrp + b.nrq * a,
            ],
            vec![b.nx * m + b.nrx * a, b.nz * m + b.nrz * a, b.nq * m],
        )
    }

    fn eval(&self, t: f64, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        let view = match self.view(inputs) {
            Ok(view) => view,
            Err(err) => {
                error!(error = %err, "costate system called with misshapen inputs");
                return poison(outputs);
            }
        };
        let [ode, alg, quad] = outputs else {
            error!(blocks = outputs.len(), "costate system called with wrong arity");
            return poison(outputs);
        };
        let (b, m) = (&self.base, 1 + self.nfwd);
        let (ode_fwd, ode_adj) = ode.split_at_mut(b.nx * m);
        let (alg_fwd, alg_adj) = alg.split_at_mut(b.nz * m);

        self.inner
            .eval(t, &view.stacked, &mut [ode_fwd, alg_fwd, &mut **quad]);
        if let Err(err) = self.costate_blocks(t, &view, None, ode_adj, alg_adj) {
            error!(error = %err, "costate evaluation failed");
            poison(&mut [ode_adj, alg_adj]);
        }
    }

    fn is_differentiable(&self) -> bool {
        self.inner.is_differentiable() && self.g.is_twice_differentiable()
    }

    fn jvp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        seeds: &[&[f64]],
        tangents: &mut [&mut [f64]],
    ) -> Result<()> {
        let at = self.view(inputs)?;
        let along = self.view(seeds)?;
        let [ode, alg, quad] = tangents else {
            return Err(IntegratorError::invalid(
                "costate system tangents: expected 3 blocks",
            ));
        };
        let (b, m) = (&self.base, 1 + self.nfwd);
        let (ode_fwd, ode_adj) = ode.split_at_mut(b.nx * m);
        let (alg_fwd, alg_adj) = alg.split_at_mut(b.nz * m);

        self.inner.jvp(
            t,
            &at.stacked,
            &along.stacked,
            &mut [ode_fwd, alg_fwd, &mut **quad],
        )?;
        self.costate_blocks(t, &at, Some(&along), ode_adj, alg_adj)
    }

    fn vjp(
        &self,
        t: f64,
        inputs: &[&[f64]],
        adj_seeds: &[&[f64]],
        sensitivities: &mut [&mut [f64]],
    ) -> Result<()> {
        vjp_by_columns(self, t, inputs, adj_seeds, sensitivities)
    }

    fn forward_directions(&self) -> usize {
        self.nfwd
    }

    fn deep_copy(&self, copies: &mut CopyMap) -> DaeRef {
        Arc::new(Self {
            inner: copies.copy(&self.inner),
            g: copies.copy(&self.g),
            ..self.clone()
        })
    }
}

/// Builds the `(f, g)` pair carrying `nfwd` forward and `nadj` adjoint directions.
///
/// With no directions the engine's own handles come back unchanged.
pub fn get_augmented(
    core: &IntegratorCore,
    nfwd: usize,
    nadj: usize,
) -> Result<(DaeRef, Option<DaeRef>)> {
    let f = core.f();
    let g = core.g();
    if nfwd == 0 && nadj == 0 {
        return Ok((Arc::clone(f), g.cloned()));
    }

    if !f.is_differentiable() {
        return Err(IntegratorError::unsupported(
            "forward system provides no derivatives to augment",
        ));
    }
    if g.is_some_and(|g| !g.is_differentiable()) {
        return Err(IntegratorError::unsupported(
            "backward system provides no derivatives to augment",
        ));
    }

    let layout = StateLayout::from_functions(f.as_ref(), g.map(|g| g.as_ref()))?;
    let forward: DaeRef = if nfwd > 0 {
        Arc::new(ForwardAugmented::forward(Arc::clone(f), nfwd, &layout))
    } else {
        Arc::clone(f)
    };

    let (f_aug, g_aug): (DaeRef, Option<DaeRef>) = match (g, nadj) {
        (Some(g), 0) if nfwd > 0 => (
            forward,
            Some(Arc::new(ForwardAugmented::backward(Arc::clone(g), nfwd, &layout))),
        ),
        (g, 0) => (forward, g.cloned()),
        (None, _) => (
            forward,
            Some(Arc::new(AdjointAugmented::new(
                Arc::clone(f),
                None,
                nfwd,
                nadj,
                &layout,
            ))),
        ),
        (Some(g), _) => (
            Arc::new(CostateAugmented::new(
                forward,
                Arc::clone(g),
                nfwd,
                nadj,
                &layout,
            )),
            Some(Arc::new(AdjointAugmented::new(
                Arc::clone(f),
                Some(Arc::clone(g)),
                nfwd,
                nadj,
                &layout,
            ))),
        ),
    };

    debug!(nfwd, nadj, backward = g_aug.is_some(), "built augmented system pair");
    Ok((f_aug, g_aug))
}

#[cfg(test)]
mod tests {
    use super::{get_augmented, views, views_mut, zeros};
    use crate::autodiff::{Differentiable, Opaque};
    use crate::equation_engine::ExpressionModel;
    use crate::error::IntegratorError;
    use crate::integrator::backend::{Rk4Integrator, Tsit5Integrator};
    use crate::integrator::{Integrator, IntegratorCore};
    use crate::layout::StateLayout;
    use crate::traits::{CopyMap, DaeRef};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn oscillator_model() -> ExpressionModel {
        ExpressionModel::forward(
            &["x", "v"],
            &["z"],
            &["w", "c"],
            &["v", "-w*x - c*z"],
            &["z - v"],
            &["x^2"],
        )
        .expect("model")
    }

    fn oscillator() -> DaeRef {
        Differentiable::shared(oscillator_model())
    }

    fn costate() -> DaeRef {
        let inputs: [&[&str]; 6] = [&["l"], &[], &[], &["x", "v"], &["z"], &["w", "c"]];
        let outputs: [&[&str]; 3] = [&["w*l"], &[], &["l*x"]];
        Differentiable::shared(ExpressionModel::new(&inputs, &outputs).expect("model"))
    }

    fn layout(f: &DaeRef, g: Option<&DaeRef>) -> StateLayout {
        StateLayout::from_functions(f.as_ref(), g.map(|g| g.as_ref())).expect("layout")
    }

    #[test]
    fn no_directions_returns_the_same_handles() {
        let f = oscillator();
        let g = costate();
        let core = IntegratorCore::new(Arc::clone(&f), Some(Arc::clone(&g)), 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 0, 0).expect("augment");
        assert!(Arc::ptr_eq(&f, &f_aug));
        assert!(Arc::ptr_eq(&g, &g_aug.expect("backward")));
    }

    #[test]
    fn forward_augmentation_scales_every_block() {
        let core = IntegratorCore::new(oscillator(), Some(costate()), 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 2, 0).expect("augment");
        let g_aug = g_aug.expect("backward");

        let augmented = layout(&f_aug, Some(&g_aug));
        assert_eq!(augmented.nx, 6);
        assert_eq!(augmented.nz, 3);
        assert_eq!(augmented.np, 6);
        assert_eq!(augmented.nq, 3);
        assert_eq!(augmented.nrx, 3);
        assert_eq!(augmented.nrq, 3);
        assert_eq!(augmented.nrhs, 3);
        assert!(f_aug.is_differentiable());
        assert!(!f_aug.is_twice_differentiable());
    }

    #[test]
    fn adjoint_augmentation_derives_backward_blocks() {
        let f = oscillator();
        let core = IntegratorCore::new(Arc::clone(&f), None, 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 1, 2).expect("augment");
        let g_aug = g_aug.expect("derived backward system");

        let augmented = layout(&f_aug, Some(&g_aug));
        assert_eq!(augmented.nrx, 4);
        assert_eq!(augmented.nrz, 2);
        assert_eq!(augmented.nrp, 2);
        assert_eq!(augmented.nrq, 4);
        assert_eq!(augmented.nx, 4);
    }

    #[test]
    fn forward_blocks_are_jacobian_products() {
        let f = oscillator();
        let core = IntegratorCore::new(Arc::clone(&f), None, 0.0, 1.0);
        let (f_aug, _) = get_augmented(&core, 1, 0).expect("augment");

        // primal (x, v) = (1, 2), z = 0.5, (w, c) = (3, 0.1); tangent along x and w.
        let x = [1.0, 2.0, 1.0, 0.0];
        let z = [0.5, 0.0];
        let p = [3.0, 0.1, 1.0, 0.0];
        let mut ode = [0.0; 4];
        let mut alg = [0.0; 2];
        let mut quad = [0.0; 2];
        let inputs: [&[f64]; 3] = [&x, &z, &p];
        f_aug.eval(0.0, &inputs, &mut [&mut ode[..], &mut alg[..], &mut quad[..]]);

        assert_relative_eq!(ode[1], -3.0 - 0.05, epsilon = 1e-12);
        // d(-w x - c z) = -w dx - x dw
        assert_relative_eq!(ode[3], -3.0 - 1.0, epsilon = 1e-12);
        assert_relative_eq!(alg[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(quad[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn adjoint_blocks_are_transposed_products() {
        let f = oscillator();
        let core = IntegratorCore::new(Arc::clone(&f), None, 0.0, 1.0);
        let (_, g_aug) = get_augmented(&core, 0, 1).expect("augment");
        let g_aug = g_aug.expect("backward");

        let lambda = [0.5, -1.0];
        let nu = [2.0];
        let weights = [3.0];
        let x = [1.0, 2.0];
        let z = [0.5];
        let p = [3.0, 0.1];
        let inputs: [&[f64]; 6] = [&lambda, &nu, &weights, &x, &z, &p];
        let mut rode = [0.0; 2];
        let mut ralg = [0.0; 1];
        let mut rquad = [0.0; 2];
        g_aug.eval(0.0, &inputs, &mut [&mut rode[..], &mut ralg[..], &mut rquad[..]]);

        // f_x^T: ∂/∂x = (0, -w, 0, 2x), ∂/∂v = (1, 0, -1, 0) over (ode0, ode1, alg, quad)
        assert_relative_eq!(rode[0], -1.0 * -3.0 + 3.0 * 2.0, epsilon = 1e-12);
        assert_relative_eq!(rode[1], 0.5 - 2.0, epsilon = 1e-12);
        // ∂/∂z = (0, -c, 1, 0)
        assert_relative_eq!(ralg[0], -1.0 * -0.1 + 2.0, epsilon = 1e-12);
        // ∂/∂w = (0, -x, 0, 0), ∂/∂c = (0, -z, 0, 0)
        assert_relative_eq!(rquad[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(rquad[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn adjoint_augmentation_with_backward_system_couples_both_problems() {
        let core = IntegratorCore::new(oscillator(), Some(costate()), 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 1, 2).expect("augment");
        let g_aug = g_aug.expect("backward");

        let augmented = layout(&f_aug, Some(&g_aug));
        // Forward: stacked (x, v) plus one costate l per direction.
        assert_eq!(augmented.nx, 2 * 2 + 2);
        assert_eq!(augmented.nz, 2);
        // Stacked (w, c), the primal rp (empty here) and one rq seed per direction.
        assert_eq!(augmented.np, 2 * 2 + 2);
        assert_eq!(augmented.nq, 2);
        // Backward: stacked l plus (x, v) adjoints per direction.
        assert_eq!(augmented.nrx, 2 + 2 * 2);
        assert_eq!(augmented.nrz, 2);
        assert_eq!(augmented.nrp, 2);
        // Stacked rq, then (p̄, rp̄) per direction.
        assert_eq!(augmented.nrq, 2 + 2 * 2);
        assert_eq!(augmented.nrhs, 2);
    }

    #[test]
    fn backward_system_adjoint_adds_source_terms() {
        let core = IntegratorCore::new(oscillator(), Some(costate()), 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 0, 1).expect("augment");
        let g_aug = g_aug.expect("backward");

        // (x, v) = (1, 2), z = 0.5, (w, c) = (3, 0.1); μ = 0.4 and σ = 1.5 seed rqf.
        let x = [1.0, 2.0, 0.4];
        let z = [0.5];
        let p = [3.0, 0.1, 1.5];
        let mut ode = [0.0; 3];
        let mut alg = [0.0; 1];
        let mut quad = [0.0; 1];
        let inputs: [&[f64]; 3] = [&x, &z, &p];
        f_aug.eval(0.0, &inputs, &mut [&mut ode[..], &mut alg[..], &mut quad[..]]);
        // μ' = ∂(w l)/∂l μ + ∂(l x)/∂l σ
        assert_relative_eq!(ode[2], 3.0 * 0.4 + 1.0 * 1.5, epsilon = 1e-12);
        assert_relative_eq!(quad[0], 1.0, epsilon = 1e-12);

        let rx = [0.7, 0.5, -1.0];
        let rz = [2.0];
        let rp = [3.0];
        let inputs: [&[f64]; 6] = [&rx, &rz, &rp, &x, &z, &p];
        let mut rode = [0.0; 3];
        let mut ralg = [0.0; 1];
        let mut rquad = [0.0; 3];
        g_aug.eval(0.0, &inputs, &mut [&mut rode[..], &mut ralg[..], &mut rquad[..]]);

        assert_relative_eq!(rode[0], 3.0 * 0.7, epsilon = 1e-12);
        assert_relative_eq!(rquad[0], 0.7 * 1.0, epsilon = 1e-12);
        // f_xᵀ terms as without g, plus σ ∂(l x)/∂x on the x costate.
        assert_relative_eq!(rode[1], 3.0 + 6.0 + 1.5 * 0.7, epsilon = 1e-12);
        assert_relative_eq!(rode[2], 0.5 - 2.0, epsilon = 1e-12);
        assert_relative_eq!(ralg[0], 0.1 + 2.0, epsilon = 1e-12);
        // p̄_w picks up μ ∂(w l)/∂w.
        assert_relative_eq!(rquad[1], 1.0 + 0.4 * 0.7, epsilon = 1e-12);
        assert_relative_eq!(rquad[2], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn opaque_systems_cannot_be_augmented() {
        let core = IntegratorCore::new(Opaque::shared(oscillator_model()), None, 0.0, 1.0);
        assert!(matches!(
            get_augmented(&core, 1, 0),
            Err(IntegratorError::Unsupported(_))
        ));
        assert!(get_augmented(&core, 0, 0).is_ok());
    }

    #[test]
    fn augmented_pairs_can_be_augmented_once_more() {
        let core = IntegratorCore::new(oscillator(), Some(costate()), 0.0, 1.0);
        let (f1, g1) = get_augmented(&core, 1, 0).expect("first level");
        let nested = IntegratorCore::new(f1, g1, 0.0, 1.0);
        let (f2, g2) = get_augmented(&nested, 1, 0).expect("second level");
        let g2 = g2.expect("backward");

        let second = layout(&f2, Some(&g2));
        assert_eq!(second.nx, 8);
        assert_eq!(second.nrx, 4);
        assert_eq!(second.nrhs, 2);

        let deeper = IntegratorCore::new(f2, Some(g2), 0.0, 1.0);
        assert!(matches!(
            get_augmented(&deeper, 1, 0),
            Err(IntegratorError::Unsupported(_))
        ));

        let plain = IntegratorCore::new(oscillator(), None, 0.0, 1.0);
        let (f1, g1) = get_augmented(&plain, 0, 1).expect("adjoint level");
        let nested = IntegratorCore::new(f1, g1, 0.0, 1.0);
        assert!(get_augmented(&nested, 0, 1).is_ok());
    }

    fn sample(sizes: &[usize], phase: f64) -> Vec<Vec<f64>> {
        let mut k = 0.0;
        sizes
            .iter()
            .map(|&n| {
                (0..n)
                    .map(|_| {
                        k += 1.0;
                        (k * phase).sin()
                    })
                    .collect()
            })
            .collect()
    }

    fn dot(a: &[Vec<f64>], b: &[Vec<f64>]) -> f64 {
        a.iter()
            .flatten()
            .zip(b.iter().flatten())
            .map(|(x, y)| x * y)
            .sum()
    }

    /// Checks `jvp` against central differences of `eval`, and `vjp` against `jvp`.
    fn assert_consistent_derivatives(function: &DaeRef) {
        assert!(function.is_differentiable());
        let signature = function.signature();
        let (t, step) = (0.3, 1e-6);
        let u = sample(&signature.inputs, 0.7);
        let v = sample(&signature.inputs, 1.3);
        let w = sample(&signature.outputs, 2.1);

        let mut jv = zeros(&signature.outputs);
        function
            .jvp(t, &views(&u), &views(&v), &mut views_mut(&mut jv))
            .expect("jvp");
        let mut jtw = zeros(&signature.inputs);
        function
            .vjp(t, &views(&u), &views(&w), &mut views_mut(&mut jtw))
            .expect("vjp");

        let shifted = |scale: f64| {
            let moved: Vec<Vec<f64>> = u
                .iter()
                .zip(&v)
                .map(|(a, b)| a.iter().zip(b).map(|(a, b)| a + scale * b).collect())
                .collect();
            let mut out = zeros(&signature.outputs);
            function.eval(t, &views(&moved), &mut views_mut(&mut out));
            out
        };
        let (plus, minus) = (shifted(step), shifted(-step));
        for (b, block) in jv.iter().enumerate() {
            for (k, &value) in block.iter().enumerate() {
                let fd = (plus[b][k] - minus[b][k]) / (2.0 * step);
                assert_relative_eq!(value, fd, epsilon = 1e-6, max_relative = 1e-6);
            }
        }
        assert_relative_eq!(dot(&jv, &w), dot(&v, &jtw), epsilon = 1e-10, max_relative = 1e-10);
    }

    #[test]
    fn augmented_systems_have_consistent_derivatives() {
        let with_costate = IntegratorCore::new(oscillator(), Some(costate()), 0.0, 1.0);
        let plain = IntegratorCore::new(oscillator(), None, 0.0, 1.0);

        let (f_aug, g_aug) = get_augmented(&with_costate, 1, 0).expect("forward");
        assert_consistent_derivatives(&f_aug);
        assert_consistent_derivatives(&g_aug.expect("backward"));

        let (f_aug, g_aug) = get_augmented(&with_costate, 1, 1).expect("combined");
        assert_consistent_derivatives(&f_aug);
        assert_consistent_derivatives(&g_aug.expect("backward"));

        let (_, g_aug) = get_augmented(&plain, 0, 2).expect("adjoint");
        assert_consistent_derivatives(&g_aug.expect("backward"));
    }

    #[test]
    fn augmented_copies_share_one_inner_copy() {
        let f = oscillator();
        let core = IntegratorCore::new(Arc::clone(&f), None, 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 1, 1).expect("augment");
        let g_aug = g_aug.expect("backward");

        let mut copies = CopyMap::new();
        copies.copy(&f_aug);
        copies.copy(&g_aug);
        // Both wrappers plus the one forward system they share.
        assert_eq!(copies.len(), 3);

        let core = IntegratorCore::new(oscillator(), Some(costate()), 0.0, 1.0);
        let (f_aug, g_aug) = get_augmented(&core, 1, 1).expect("augment");
        let mut copies = CopyMap::new();
        copies.copy(&f_aug);
        copies.copy(&g_aug.expect("backward"));
        // Two wrappers per side, plus one copy each of f and g.
        assert_eq!(copies.len(), 6);
    }

    #[test]
    fn primal_trajectory_is_unaffected_by_forward_directions() {
        let decay = Differentiable::shared(
            ExpressionModel::forward(&["x"], &[], &["a"], &["a*x"], &[], &["x"])
                .expect("model"),
        );
        let mut plain = Rk4Integrator::new(Arc::clone(&decay), None, 0.0, 1.0);
        plain.init().expect("init");
        plain.input_mut().x0 = vec![1.5];
        plain.input_mut().p = vec![-0.3];
        plain.evaluate(0, 0).expect("plain");

        let (f_aug, g_aug) = plain.get_augmented(2, 0).expect("augment");
        let mut augmented = plain.create(f_aug, g_aug);
        augmented.init().expect("init");
        augmented.input_mut().x0 = vec![1.5, 1.0, 0.0];
        augmented.input_mut().p = vec![-0.3, 0.0, 1.0];
        augmented.evaluate(2, 0).expect("augmented");

        assert_eq!(augmented.output().xf[0], plain.output().xf[0]);
        assert_eq!(augmented.output().qf[0], plain.output().qf[0]);
    }

    #[test]
    fn adaptive_primal_stays_within_tolerance_under_augmentation() {
        let f = oscillator();
        let mut plain = Tsit5Integrator::new(Arc::clone(&f), None, 0.0, 2.0);
        plain.init().expect("init");
        plain.input_mut().x0 = vec![1.0, 0.0];
        plain.input_mut().p = vec![4.0, 0.2];
        plain.evaluate(0, 0).expect("plain");

        let (f_aug, g_aug) = plain.get_augmented(1, 0).expect("augment");
        let mut augmented = plain.create(f_aug, g_aug);
        augmented.init().expect("init");
        augmented.input_mut().x0 = vec![1.0, 0.0, 0.0, 1.0];
        augmented.input_mut().p = vec![4.0, 0.2, 0.0, 0.0];
        augmented.evaluate(1, 0).expect("augmented");

        for k in 0..2 {
            assert_relative_eq!(
                augmented.output().xf[k],
                plain.output().xf[k],
                epsilon = 1e-6
            );
        }
    }
}
