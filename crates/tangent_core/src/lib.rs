//! The `tangent_core` crate provides a DAE integrator engine with forward and adjoint
//! sensitivity augmentation.
//!
//! Key components:
//! - **Traits**: `DaeFunction` (the differentiable-function capability), `DaeModel` (scalar-generic models).
//! - **Autodiff**: Dual and hyper-dual numbers, and the `Differentiable` adapter deriving JVPs, VJPs and second-order JVPs from a model.
//! - **Equation Engine**: A bytecode VM for evaluating user-written right-hand sides in `f64` or `Dual`.
//! - **Integrator**: The engine state machine, evaluation, and the stepper-backed backends (RK4, Tsit5, backward Euler).
//! - **Augment / Derivative**: Augmented system pairs and the derivative functions built on them.
pub mod augment;
pub mod autodiff;
pub mod derivative;
pub mod equation_engine;
pub mod error;
pub mod integrator;
pub mod layout;
pub mod solvers;
pub mod traits;
