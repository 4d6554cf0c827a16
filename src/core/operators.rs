//! Finite-difference operators on the hex mesh, plus the per-cell loop helpers
//! every stage of the step is built from.
//!
//! All operators read from inputs and write into a caller-owned output buffer.
//! Each output cell depends only on inputs, so the result is the same whether the
//! loop runs on one thread or many.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mesh::{HexMesh, UNIT_VECTORS};
use crate::Real;

pub type ScalarField = Vec<Real>;

/// Execution tier for the per-cell loops of a step.
///
/// - `Scalar`: single-threaded (default, works everywhere)
/// - `Parallel`: multi-threaded via rayon (requires `parallel` feature)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given the compiled features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }

    /// Best tier available in this build.
    pub fn auto() -> ExecutionTier {
        #[cfg(feature = "parallel")]
        {
            ExecutionTier::Parallel
        }
        #[cfg(not(feature = "parallel"))]
        {
            ExecutionTier::Scalar
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VectorField {
    pub x: ScalarField,
    pub y: ScalarField,
}

impl VectorField {
    pub fn zeros(len: usize) -> Self {
        Self {
            x: vec![0.0; len],
            y: vec![0.0; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    #[inline]
    pub fn at(&self, h: usize) -> (Real, Real) {
        (self.x[h], self.y[h])
    }

    #[inline]
    pub fn dot_at(&self, other: &VectorField, h: usize) -> Real {
        self.x[h] * other.x[h] + self.y[h] * other.y[h]
    }
}

/// Stencil coefficients derived from the cell spacing `d` and diffusion constant `D`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    /// `2 D / (3 d^2)`, scales the diffusion Laplacian.
    pub diffusion: Real,
    /// `2 / (3 d^2)`, the plain Laplacian (divergence of a gradient).
    pub laplace: Real,
    /// `1 / (3 d)`, used by gradient and divergence.
    pub first_order: Real,
}

impl Coefficients {
    pub fn new(spacing: Real, diffusion: Real) -> Self {
        let dd = spacing * spacing;
        Self {
            diffusion: 2.0 * diffusion / (3.0 * dd),
            laplace: 2.0 / (3.0 * dd),
            first_order: 1.0 / (3.0 * spacing),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop helpers
// ---------------------------------------------------------------------------

/// `out[h] = f(h)` for every cell.
#[inline]
pub fn fill<F>(tier: ExecutionTier, out: &mut [Real], f: F)
where
    F: Fn(usize) -> Real + Send + Sync,
{
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => out
            .par_iter_mut()
            .enumerate()
            .for_each(|(h, o)| *o = f(h)),
        _ => out.iter_mut().enumerate().for_each(|(h, o)| *o = f(h)),
    }
}

/// `(x[h], y[h]) = f(h)` for every cell.
#[inline]
pub fn fill_vector<F>(tier: ExecutionTier, out: &mut VectorField, f: F)
where
    F: Fn(usize) -> (Real, Real) + Send + Sync,
{
    let VectorField { x, y } = out;
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => x
            .par_iter_mut()
            .zip(y.par_iter_mut())
            .enumerate()
            .for_each(|(h, (ox, oy))| (*ox, *oy) = f(h)),
        _ => x
            .iter_mut()
            .zip(y.iter_mut())
            .enumerate()
            .for_each(|(h, (ox, oy))| (*ox, *oy) = f(h)),
    }
}

/// `values[h] = f(values[h])` for every cell.
#[inline]
pub fn map_in_place<F>(tier: ExecutionTier, values: &mut [Real], f: F)
where
    F: Fn(Real) -> Real + Send + Sync,
{
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => values.par_iter_mut().for_each(|v| *v = f(*v)),
        _ => values.iter_mut().for_each(|v| *v = f(*v)),
    }
}

/// Like [`fill`], then reports the lowest cell index holding a non-finite value.
pub fn try_fill<F>(tier: ExecutionTier, out: &mut [Real], f: F) -> Result<(), usize>
where
    F: Fn(usize) -> Real + Send + Sync,
{
    fill(tier, out, f);
    match first_non_finite(out) {
        Some(h) => Err(h),
        None => Ok(()),
    }
}

pub fn first_non_finite(values: &[Real]) -> Option<usize> {
    values.iter().position(|v| !v.is_finite())
}

const SUM_CHUNK: usize = 4096;

/// Sum of all values.
///
/// The parallel path reduces fixed-size chunks and adds the partial sums in
/// order, so both tiers return bit-identical results.
pub fn sum(tier: ExecutionTier, values: &[Real]) -> Real {
    match tier.effective() {
        #[cfg(feature = "parallel")]
        ExecutionTier::Parallel => {
            let partial: Vec<Real> = values
                .par_chunks(SUM_CHUNK)
                .map(|chunk| chunk.iter().sum::<Real>())
                .collect();
            partial.iter().sum()
        }
        _ => values
            .chunks(SUM_CHUNK)
            .map(|chunk| chunk.iter().sum::<Real>())
            .sum(),
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// `out[h] = coeff * sum_k (f[nb_k] - f[h])`.
///
/// Pass [`Coefficients::diffusion`] for the diffusion term or
/// [`Coefficients::laplace`] for the divergence of a gradient. A uniform field
/// gives exactly zero everywhere, boundary cells included.
pub fn laplacian(mesh: &HexMesh, tier: ExecutionTier, f: &[Real], coeff: Real, out: &mut [Real]) {
    let stencil = mesh.stencil();
    fill(tier, out, |h| {
        let centre = f[h];
        let acc: Real = stencil[h].iter().map(|&nb| f[nb] - centre).sum();
        coeff * acc
    });
}

/// `out[h] = coeff * sum_k (f[nb_k] - f[h]) u_k`, with `coeff = 1 / 3d`
/// ([`Coefficients::first_order`]).
pub fn gradient(
    mesh: &HexMesh,
    tier: ExecutionTier,
    f: &[Real],
    coeff: Real,
    out: &mut VectorField,
) {
    let stencil = mesh.stencil();
    fill_vector(tier, out, |h| {
        let centre = f[h];
        let (mut gx, mut gy) = (0.0, 0.0);
        for (&nb, &(ux, uy)) in stencil[h].iter().zip(UNIT_VECTORS.iter()) {
            let diff = f[nb] - centre;
            gx += diff * ux;
            gy += diff * uy;
        }
        (coeff * gx, coeff * gy)
    });
}

/// `out[h] = coeff * sum_k (g[h] + g[nb_k]) . u_k`, with `coeff = 1 / 3d`.
pub fn divergence(
    mesh: &HexMesh,
    tier: ExecutionTier,
    g: &VectorField,
    coeff: Real,
    out: &mut [Real],
) {
    let stencil = mesh.stencil();
    fill(tier, out, |h| {
        let (hx, hy) = g.at(h);
        let acc: Real = stencil[h]
            .iter()
            .zip(UNIT_VECTORS.iter())
            .map(|(&nb, &(ux, uy))| (hx + g.x[nb]) * ux + (hy + g.y[nb]) * uy)
            .sum();
        coeff * acc
    });
}

/// Normalised Gaussian smoothing over cell centres, truncated at `6 sigma`.
///
/// Each output is a weighted mean, so the kernel is renormalised per cell where
/// the truncation disc leaves the mesh. Quadratic in the cell count.
pub fn gaussian_smooth(
    mesh: &HexMesh,
    tier: ExecutionTier,
    f: &[Real],
    sigma: Real,
    out: &mut [Real],
) {
    let cells = mesh.cells();
    let cutoff2 = (6.0 * sigma).powi(2);
    let inv = 1.0 / (2.0 * sigma * sigma);
    fill(tier, out, |h| {
        let (x, y) = (cells[h].x, cells[h].y);
        let (mut acc, mut norm) = (0.0, 0.0);
        for (k, c) in cells.iter().enumerate() {
            let r2 = (c.x - x).powi(2) + (c.y - y).powi(2);
            if r2 <= cutoff2 {
                let w = (-r2 * inv).exp();
                acc += w * f[k];
                norm += w;
            }
        }
        acc / norm
    });
}
