//! Integrators exposed as callable functions, and their derivative functions.

use crate::error::{IntegratorError, Result};
use crate::integrator::{Integrator, IntegratorState};
use crate::layout::{block, stack_blocks, StateLayout};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A block-structured numeric function.
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    fn input_sizes(&self) -> Vec<usize>;

    fn output_sizes(&self) -> Vec<usize>;

    fn call(&self, inputs: &[Vec<f64>]) -> Result<Vec<Vec<f64>>>;

    /// Derivative function with `nfwd` forward and `nadj` adjoint directions.
    ///
    /// Functions backed by an integrator differentiate their engine. For a
    /// derivative function that engine is the augmented one, so the nested
    /// function's blocks are the stacked `[x0, p, rx0, rp]` and
    /// `[xf, qf, rxf, rqf]` vectors of that engine.
    fn derivative(&self, _nfwd: usize, _nadj: usize) -> Result<Arc<dyn Function>> {
        Err(IntegratorError::unsupported(format!(
            "{} cannot be differentiated",
            self.name()
        )))
    }
}

fn check_call(function: &dyn Function, inputs: &[Vec<f64>]) -> Result<()> {
    let expected = function.input_sizes();
    if inputs.len() != expected.len() {
        return Err(IntegratorError::invalid(format!(
            "{} takes {} inputs, got {}",
            function.name(),
            expected.len(),
            inputs.len()
        )));
    }
    for (index, (values, &size)) in inputs.iter().zip(&expected).enumerate() {
        if values.len() != size {
            return Err(IntegratorError::invalid(format!(
                "{}: input {index} has length {}, expected {size}",
                function.name(),
                values.len()
            )));
        }
    }
    Ok(())
}

fn lock(engine: &Mutex<Box<dyn Integrator>>) -> Result<MutexGuard<'_, Box<dyn Integrator>>> {
    engine
        .lock()
        .map_err(|_| IntegratorError::invalid("integrator lock poisoned by an earlier panic"))
}

/// The primal map `(x0, p, rx0, rp) -> (xf, qf, rxf, rqf)` of an engine.
pub struct IntegratorFunction {
    name: String,
    layout: StateLayout,
    engine: Mutex<Box<dyn Integrator>>,
}

impl IntegratorFunction {
    /// Wraps an engine, initializing it first if needed.
    pub fn new(name: impl Into<String>, mut engine: Box<dyn Integrator>) -> Result<Self> {
        if engine.core().state() == IntegratorState::Uninitialized {
            engine.init()?;
        }
        let layout = *engine.core().layout()?;
        Ok(Self {
            name: name.into(),
            layout,
            engine: Mutex::new(engine),
        })
    }
}

impl Function for IntegratorFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_sizes(&self) -> Vec<usize> {
        let l = &self.layout;
        vec![l.nx, l.np, l.nrx, l.nrp]
    }

    fn output_sizes(&self) -> Vec<usize> {
        let l = &self.layout;
        vec![l.nx, l.nq, l.nrx, l.nrq]
    }

    fn call(&self, inputs: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        check_call(self, inputs)?;
        let mut engine = lock(&self.engine)?;
        {
            let input = engine.input_mut();
            input.x0.clone_from(&inputs[0]);
            input.p.clone_from(&inputs[1]);
            input.rx0.clone_from(&inputs[2]);
            input.rp.clone_from(&inputs[3]);
        }
        engine.evaluate(0, 0)?;
        let out = engine.output();
        Ok(vec![
            out.xf.clone(),
            out.qf.clone(),
            out.rxf.clone(),
            out.rqf.clone(),
        ])
    }

    fn derivative(&self, nfwd: usize, nadj: usize) -> Result<Arc<dyn Function>> {
        lock(&self.engine)?.get_derivative(nfwd, nadj)
    }
}

/// Derivative of an integrator with `nfwd` forward and `nadj` adjoint directions.
///
/// Inputs: `[x0, p, rx0, rp]`, then `[x0, p, rx0, rp]` seeds per forward
/// direction, then `[xf, qf, rxf, rqf]` seeds per adjoint direction.
/// Outputs: `[xf, qf, rxf, rqf]`, then their sensitivities per forward
/// direction, then `[x0, p, rx0, rp]` sensitivities per adjoint direction.
/// The `rx0` and `rp` adjoint blocks are empty without a backward problem.
///
/// The augmented engine stacks the adjoint seeds behind the forward ones:
/// `x0 = [x0 stack, rxf seeds]`, `p = [p stack, rp, rqf seeds]`,
/// `rx0 = [rx0 stack, xf seeds]` and `rp = [rp stack, qf seeds]`.
pub struct DerivativeFunction {
    name: String,
    base: StateLayout,
    nfwd: usize,
    nadj: usize,
    engine: Mutex<Box<dyn Integrator>>,
}

impl DerivativeFunction {
    fn primal_sizes(&self) -> [usize; 4] {
        let b = &self.base;
        [b.nx, b.np, b.nrx, b.nrp]
    }

    fn result_sizes(&self) -> [usize; 4] {
        let b = &self.base;
        [b.nx, b.nq, b.nrx, b.nrq]
    }

    /// Stacks the primal block `k` with its seed block from every forward direction.
    fn stack_forward(&self, inputs: &[Vec<f64>], k: usize) -> Vec<f64> {
        stack_blocks((0..=self.nfwd).map(|d| inputs[4 * d + k].as_slice()))
    }

    /// Stacks block `k` of every adjoint seed group.
    fn stack_adjoint(&self, inputs: &[Vec<f64>], k: usize) -> Vec<f64> {
        let offset = 4 * (1 + self.nfwd);
        stack_blocks((0..self.nadj).map(|a| inputs[offset + 4 * a + k].as_slice()))
    }
}

impl Function for DerivativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(4 * (1 + self.nfwd + self.nadj));
        for _ in 0..=self.nfwd {
            sizes.extend(self.primal_sizes());
        }
        for _ in 0..self.nadj {
            sizes.extend(self.result_sizes());
        }
        sizes
    }

    fn output_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(4 * (1 + self.nfwd + self.nadj));
        for _ in 0..=self.nfwd {
            sizes.extend(self.result_sizes());
        }
        for _ in 0..self.nadj {
            sizes.extend(self.primal_sizes());
        }
        sizes
    }

    fn call(&self, inputs: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        check_call(self, inputs)?;
        let mut engine = lock(&self.engine)?;
        {
            let input = engine.input_mut();
            input.x0 = [self.stack_forward(inputs, 0), self.stack_adjoint(inputs, 2)].concat();
            input.p = self.stack_forward(inputs, 1);
            if self.nadj > 0 {
                input.p.extend_from_slice(&inputs[3]);
                input.p.extend(self.stack_adjoint(inputs, 3));
            }
            input.rx0 = [self.stack_forward(inputs, 2), self.stack_adjoint(inputs, 0)].concat();
            input.rp = [self.stack_forward(inputs, 3), self.stack_adjoint(inputs, 1)].concat();
        }
        engine.evaluate(self.nfwd, self.nadj)?;

        let out = engine.output();
        let (b, m) = (&self.base, 1 + self.nfwd);
        let mut results = Vec::with_capacity(4 * (1 + self.nfwd + self.nadj));
        for d in 0..=self.nfwd {
            results.push(block(&out.xf, b.nx, d).to_vec());
            results.push(block(&out.qf, b.nq, d).to_vec());
            results.push(block(&out.rxf, b.nrx, d).to_vec());
            results.push(block(&out.rqf, b.nrq, d).to_vec());
        }
        // Adjoint states of the forward problem end at t0, those of the
        // backward problem at tf.
        let x0_adj = &out.rxf[b.nrx * m..];
        let rx0_adj = &out.xf[b.nx * m..];
        let param_adj = &out.rqf[b.nrq * m..];
        for a in 0..self.nadj {
            let (p_bar, rp_bar) = block(param_adj, b.np + b.nrp, a).split_at(b.np);
            results.push(block(x0_adj, b.nx, a).to_vec());
            results.push(p_bar.to_vec());
            results.push(block(rx0_adj, b.nrx, a).to_vec());
            results.push(rp_bar.to_vec());
        }
        Ok(results)
    }

    fn derivative(&self, nfwd: usize, nadj: usize) -> Result<Arc<dyn Function>> {
        lock(&self.engine)?.get_derivative(nfwd, nadj)
    }
}

/// Builds the derivative function of `engine` by re-instantiating its backend
/// on the augmented system pair.
pub fn get_derivative<I: Integrator + ?Sized>(
    engine: &I,
    nfwd: usize,
    nadj: usize,
) -> Result<Arc<dyn Function>> {
    let core = engine.core();
    let base = StateLayout::from_functions(core.f().as_ref(), core.g().map(|g| g.as_ref()))?;
    let (f_aug, g_aug) = engine.get_augmented(nfwd, nadj)?;

    let mut derivative = engine.create(f_aug, g_aug);
    derivative.init()?;
    debug!(backend = engine.name(), nfwd, nadj, "created derivative integrator");

    Ok(Arc::new(DerivativeFunction {
        name: format!("{}_fwd{nfwd}_adj{nadj}", engine.name()),
        base,
        nfwd,
        nadj,
        engine: Mutex::new(derivative),
    }))
}
