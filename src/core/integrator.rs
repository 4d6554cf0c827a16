//! Classical fourth-order Runge-Kutta over whole fields.
//!
//! The integrator knows nothing about the model: it evaluates a caller-supplied
//! right-hand side at the four stage states and returns the combined increment.
//! Stage buffers are owned by [`Rk4Scratch`] and reused across steps.

use crate::error::Result;
use crate::operators::{self, ExecutionTier, ScalarField};
use crate::Real;

#[derive(Debug, Clone)]
pub struct Rk4Scratch {
    k1: ScalarField,
    k2: ScalarField,
    k3: ScalarField,
    k4: ScalarField,
    stage: ScalarField,
}

impl Rk4Scratch {
    pub fn new(len: usize) -> Self {
        Self {
            k1: vec![0.0; len],
            k2: vec![0.0; len],
            k3: vec![0.0; len],
            k4: vec![0.0; len],
            stage: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.stage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stage.is_empty()
    }
}

/// Write `dt/6 (k1 + 2 k2 + 2 k3 + k4)` for `dy/dt = rhs(y)` starting at `y0` into `out`.
///
/// `rhs(state, derivative)` must fill `derivative` completely. An error from any
/// stage aborts the step and leaves `out` untouched.
pub fn rk4_increment<F>(
    tier: ExecutionTier,
    y0: &[Real],
    dt: Real,
    scratch: &mut Rk4Scratch,
    mut rhs: F,
    out: &mut [Real],
) -> Result<()>
where
    F: FnMut(&[Real], &mut [Real]) -> Result<()>,
{
    let Rk4Scratch {
        k1,
        k2,
        k3,
        k4,
        stage,
    } = scratch;
    let half = 0.5 * dt;

    rhs(y0, k1)?;
    operators::fill(tier, stage, |h| y0[h] + half * k1[h]);
    rhs(stage, k2)?;
    operators::fill(tier, stage, |h| y0[h] + half * k2[h]);
    rhs(stage, k3)?;
    operators::fill(tier, stage, |h| y0[h] + dt * k3[h]);
    rhs(stage, k4)?;

    let sixth = dt / 6.0;
    operators::fill(tier, out, |h| {
        sixth * (k1[h] + 2.0 * k2[h] + 2.0 * k3[h] + k4[h])
    });
    Ok(())
}
