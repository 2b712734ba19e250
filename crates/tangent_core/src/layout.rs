//! State-count bookkeeping for forward and backward problems.

use crate::error::{IntegratorError, Result};
use crate::traits::DaeFunction;
use serde::{Deserialize, Serialize};

/// Input block indices of a forward system.
pub const DAE_X: usize = 0;
pub const DAE_Z: usize = 1;
pub const DAE_P: usize = 2;

/// Output block indices of a forward system.
pub const DAE_ODE: usize = 0;
pub const DAE_ALG: usize = 1;
pub const DAE_QUAD: usize = 2;

/// Input block indices of a backward system.
pub const RDAE_RX: usize = 0;
pub const RDAE_RZ: usize = 1;
pub const RDAE_RP: usize = 2;
pub const RDAE_X: usize = 3;
pub const RDAE_Z: usize = 4;
pub const RDAE_P: usize = 5;

/// Output block indices of a backward system.
pub const RDAE_ODE: usize = 0;
pub const RDAE_ALG: usize = 1;
pub const RDAE_QUAD: usize = 2;

/// State and parameter counts of a forward/backward problem pair.
///
/// `nrhs` is the number of right-hand sides that share one primal evaluation:
/// one for a plain system, `1 + nfwd` for a forward-augmented one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    pub nx: usize,
    pub nz: usize,
    pub nq: usize,
    pub np: usize,
    #[serde(default)]
    pub nrx: usize,
    #[serde(default)]
    pub nrz: usize,
    #[serde(default)]
    pub nrq: usize,
    #[serde(default)]
    pub nrp: usize,
    #[serde(default = "default_nrhs")]
    pub nrhs: usize,
}

fn default_nrhs() -> usize {
    1
}

impl Default for StateLayout {
    fn default() -> Self {
        Self {
            nx: 0,
            nz: 0,
            nq: 0,
            np: 0,
            nrx: 0,
            nrz: 0,
            nrq: 0,
            nrp: 0,
            nrhs: 1,
        }
    }
}

impl StateLayout {
    /// Derives the layout from a forward system and an optional backward system,
    /// checking that their block signatures agree.
    pub fn from_functions(f: &dyn DaeFunction, g: Option<&dyn DaeFunction>) -> Result<Self> {
        let fs = f.signature();
        if fs.inputs.len() != 3 || fs.outputs.len() != 3 {
            return Err(IntegratorError::configuration(format!(
                "forward system must have input blocks (x, z, p) and output blocks (ode, alg, quad), got {} inputs and {} outputs",
                fs.inputs.len(),
                fs.outputs.len()
            )));
        }

        let mut layout = StateLayout {
            nx: fs.inputs[DAE_X],
            nz: fs.inputs[DAE_Z],
            np: fs.inputs[DAE_P],
            nq: fs.outputs[DAE_QUAD],
            nrhs: 1 + f.forward_directions(),
            ..StateLayout::default()
        };

        if fs.outputs[DAE_ODE] != layout.nx {
            return Err(IntegratorError::configuration(format!(
                "forward system has {} differential states but {} ODE right-hand sides",
                layout.nx, fs.outputs[DAE_ODE]
            )));
        }
        if fs.outputs[DAE_ALG] != layout.nz {
            return Err(IntegratorError::configuration(format!(
                "forward system has {} algebraic states but {} algebraic residuals",
                layout.nz, fs.outputs[DAE_ALG]
            )));
        }
        if layout.nx + layout.nz + layout.nq == 0 {
            return Err(IntegratorError::configuration(
                "forward system carries no states",
            ));
        }

        if let Some(g) = g {
            let gs = g.signature();
            if gs.inputs.len() != 6 || gs.outputs.len() != 3 {
                return Err(IntegratorError::configuration(format!(
                    "backward system must have input blocks (rx, rz, rp, x, z, p) and output blocks (rode, ralg, rquad), got {} inputs and {} outputs",
                    gs.inputs.len(),
                    gs.outputs.len()
                )));
            }
            let coupling = [
                ("x", gs.inputs[RDAE_X], layout.nx),
                ("z", gs.inputs[RDAE_Z], layout.nz),
                ("p", gs.inputs[RDAE_P], layout.np),
            ];
            for (name, found, expected) in coupling {
                if found != expected {
                    return Err(IntegratorError::configuration(format!(
                        "backward system reads {found} entries of {name}, forward system has {expected}"
                    )));
                }
            }

            layout.nrx = gs.inputs[RDAE_RX];
            layout.nrz = gs.inputs[RDAE_RZ];
            layout.nrp = gs.inputs[RDAE_RP];
            layout.nrq = gs.outputs[RDAE_QUAD];

            if gs.outputs[RDAE_ODE] != layout.nrx {
                return Err(IntegratorError::configuration(format!(
                    "backward system has {} differential states but {} ODE right-hand sides",
                    layout.nrx, gs.outputs[RDAE_ODE]
                )));
            }
            if gs.outputs[RDAE_ALG] != layout.nrz {
                return Err(IntegratorError::configuration(format!(
                    "backward system has {} algebraic states but {} algebraic residuals",
                    layout.nrz, gs.outputs[RDAE_ALG]
                )));
            }
            if layout.nrx + layout.nrz + layout.nrq == 0 {
                return Err(IntegratorError::configuration(
                    "backward system carries no states",
                ));
            }
        }

        Ok(layout)
    }

    /// Checks a caller-declared layout against the one derived from the functions.
    pub fn check_declared(&self, declared: &StateLayout, has_backward: bool) -> Result<()> {
        let backward = [
            ("nrx", declared.nrx),
            ("nrz", declared.nrz),
            ("nrq", declared.nrq),
            ("nrp", declared.nrp),
        ];
        if !has_backward {
            if let Some((name, count)) = backward.iter().find(|(_, count)| *count > 0) {
                return Err(IntegratorError::configuration(format!(
                    "declared {name} = {count} but no backward system is attached"
                )));
            }
        }

        let pairs = [
            ("nx", declared.nx, self.nx),
            ("nz", declared.nz, self.nz),
            ("nq", declared.nq, self.nq),
            ("np", declared.np, self.np),
            ("nrx", declared.nrx, self.nrx),
            ("nrz", declared.nrz, self.nrz),
            ("nrq", declared.nrq, self.nrq),
            ("nrp", declared.nrp, self.nrp),
            ("nrhs", declared.nrhs, self.nrhs),
        ];
        for (name, declared, derived) in pairs {
            if declared != derived {
                return Err(IntegratorError::configuration(format!(
                    "declared {name} = {declared}, but the attached systems give {derived}"
                )));
            }
        }
        Ok(())
    }

    pub fn has_backward_states(&self) -> bool {
        self.nrx + self.nrz + self.nrq > 0
    }
}

/// Block `k` of a vector made of equally sized blocks.
pub fn block(values: &[f64], size: usize, k: usize) -> &[f64] {
    &values[k * size..(k + 1) * size]
}

pub fn block_mut(values: &mut [f64], size: usize, k: usize) -> &mut [f64] {
    &mut values[k * size..(k + 1) * size]
}

/// Concatenates equally sized blocks into one vector.
pub fn stack_blocks<'a>(blocks: impl IntoIterator<Item = &'a [f64]>) -> Vec<f64> {
    blocks.into_iter().flatten().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::{block, stack_blocks, StateLayout};
    use crate::autodiff::Differentiable;
    use crate::equation_engine::ExpressionModel;
    use crate::error::IntegratorError;

    fn forward() -> crate::traits::DaeRef {
        Differentiable::shared(
            ExpressionModel::forward(&["x", "y"], &["z"], &["a"], &["a*x", "y"], &["z - x"], &["x"])
                .expect("model"),
        )
    }

    fn backward(x_entries: &[&str]) -> crate::traits::DaeRef {
        let inputs: [&[&str]; 6] = [&["l"], &[], &[], x_entries, &["z"], &["a"]];
        let outputs: [&[&str]; 3] = [&["a*l"], &[], &["l"]];
        Differentiable::shared(ExpressionModel::new(&inputs, &outputs).expect("model"))
    }

    #[test]
    fn derives_counts_from_signatures() {
        let f = forward();
        let g = backward(&["x", "y"]);
        let layout = StateLayout::from_functions(f.as_ref(), Some(g.as_ref())).expect("layout");
        assert_eq!(
            layout,
            StateLayout {
                nx: 2,
                nz: 1,
                nq: 1,
                np: 1,
                nrx: 1,
                nrz: 0,
                nrq: 1,
                nrp: 0,
                nrhs: 1,
            }
        );
    }

    #[test]
    fn rejects_backward_coupling_mismatch() {
        let f = forward();
        let g = backward(&["x"]);
        let err = StateLayout::from_functions(f.as_ref(), Some(g.as_ref())).unwrap_err();
        assert!(matches!(err, IntegratorError::Configuration(_)));
        assert!(format!("{err}").contains("reads 1 entries of x"));
    }

    #[test]
    fn declared_backward_counts_need_a_backward_system() {
        let f = forward();
        let layout = StateLayout::from_functions(f.as_ref(), None).expect("layout");
        let declared = StateLayout {
            nrx: 2,
            ..layout
        };
        let err = layout.check_declared(&declared, false).unwrap_err();
        assert!(format!("{err}").contains("no backward system"));
        assert!(layout.check_declared(&layout, false).is_ok());
    }

    #[test]
    fn block_helpers_handle_empty_blocks() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(block(&values, 2, 1), &[3.0, 4.0]);
        assert!(block(&values, 0, 3).is_empty());
        assert_eq!(stack_blocks([&values[..1], &values[3..]]), vec![1.0, 4.0]);
    }
}
