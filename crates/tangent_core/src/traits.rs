use crate::error::{IntegratorError, Result};
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A trait for types that can be used as scalars in DAE models.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Block sizes of a function's inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl Signature {
    pub fn new(inputs: Vec<usize>, outputs: Vec<usize>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input(&self, index: usize) -> usize {
        self.inputs.get(index).copied().unwrap_or(0)
    }

    pub fn output(&self, index: usize) -> usize {
        self.outputs.get(index).copied().unwrap_or(0)
    }

    pub fn total_inputs(&self) -> usize {
        self.inputs.iter().sum()
    }

    pub fn total_outputs(&self) -> usize {
        self.outputs.iter().sum()
    }
}

/// A DAE right-hand side written once, generically over the scalar type.
///
/// Implementing this for `f64`, [`Dual`](crate::autodiff::Dual) and
/// [`HyperDual`](crate::autodiff::HyperDual) is what lets
/// [`Differentiable`](crate::autodiff::Differentiable) derive exact first- and
/// second-order derivatives.
pub trait DaeModel<T: Scalar> {
    /// Returns the block sizes of inputs and outputs.
    fn signature(&self) -> Signature;

    /// Evaluates the model.
    /// t: current time
    /// inputs: one slice per input block
    /// outputs: one buffer per output block, fully overwritten
    fn apply(&self, t: T, inputs: &[&[T]], outputs: &mut [&mut [T]]);
}

/// The differentiable-function capability consumed by integrator engines.
///
/// A forward system has input blocks `(x, z, p)` and output blocks
/// `(ode, alg, quad)`. A backward system has input blocks
/// `(rx, rz, rp, x, z, p)` and output blocks `(rode, ralg, rquad)`.
pub trait DaeFunction: Send + Sync {
    fn signature(&self) -> Signature;

    fn eval(&self, t: f64, inputs: &[&[f64]], outputs: &mut [&mut [f64]]);

    /// Whether `jvp` and `vjp` are available.
    fn is_differentiable(&self) -> bool {
        false
    }

    /// Forward directional derivative: `tangents = J · seeds`, block by block.
    fn jvp(
        &self,
        _t: f64,
        _inputs: &[&[f64]],
        _seeds: &[&[f64]],
        _tangents: &mut [&mut [f64]],
    ) -> Result<()> {
        Err(IntegratorError::unsupported(
            "function provides no directional derivatives",
        ))
    }

    /// Adjoint derivative: `sensitivities = Jᵀ · adj_seeds`, overwriting each input block.
    fn vjp(
        &self,
        _t: f64,
        _inputs: &[&[f64]],
        _adj_seeds: &[&[f64]],
        _sensitivities: &mut [&mut [f64]],
    ) -> Result<()> {
        Err(IntegratorError::unsupported(
            "function provides no adjoint derivatives",
        ))
    }

    /// Whether `second_jvp` is available.
    fn is_twice_differentiable(&self) -> bool {
        false
    }

    /// Second-order directional derivative.
    ///
    /// Writes the `ε₁ε₂` coefficient of `F(u + ε₁·first + ε₂·second + ε₁ε₂·cross)`,
    /// that is `J·cross + F''(first, second)`, into `out`.
    fn second_jvp(
        &self,
        _t: f64,
        _inputs: &[&[f64]],
        _first: &[&[f64]],
        _second: &[&[f64]],
        _cross: &[&[f64]],
        _out: &mut [&mut [f64]],
    ) -> Result<()> {
        Err(IntegratorError::unsupported(
            "function provides no second-order derivatives",
        ))
    }

    /// Number of forward sensitivity directions stacked behind the primal block.
    fn forward_directions(&self) -> usize {
        0
    }

    /// Produces an independent copy. Shared sub-functions must go through `copies`.
    fn deep_copy(&self, copies: &mut CopyMap) -> DaeRef;
}

/// Shared handle to a DAE function. Several engines may reference the same one.
pub type DaeRef = Arc<dyn DaeFunction>;

/// Identity-keyed record of functions already copied during one deep copy.
///
/// Each original handle is copied at most once; later requests for the same
/// handle return the first copy, so sharing in the original graph is
/// preserved in the copy.
#[derive(Default)]
pub struct CopyMap {
    // The original is kept alive so its address cannot be reused mid-copy.
    copied: HashMap<usize, (DaeRef, DaeRef)>,
}

impl CopyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&mut self, original: &DaeRef) -> DaeRef {
        let key = Arc::as_ptr(original) as *const () as usize;
        if let Some((_, existing)) = self.copied.get(&key) {
            return Arc::clone(existing);
        }
        let copy = original.deep_copy(self);
        self.copied
            .insert(key, (Arc::clone(original), Arc::clone(&copy)));
        copy
    }

    pub fn len(&self) -> usize {
        self.copied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copied.is_empty()
    }
}
