//! Closed-form guidance fields.
//!
//! Each channel is a scalar field `rho(x, y)` over the mesh with an analytic
//! gradient. Fields are evaluated once at init. Optional smoothed noise is added
//! to `rho` (its discrete gradient to `grad rho`), and an optional boundary
//! fall-off weight turns `grad rho` into the drift `v = w grad rho` that the flux
//! reads. The divergence of the drift is taken with the mesh operator so it
//! matches the discretisation of the flux.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::mesh::HexMesh;
use crate::operators::{self, Coefficients, ExecutionTier, ScalarField, VectorField};
use crate::prng::Prng;
use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FieldShape {
    #[default]
    Sigmoid1D,
    Linear1D,
    Exponential1D,
    Gauss1D,
    Gauss2D,
    CircLinear2D,
}

/// One guidance channel.
///
/// 1D shapes vary along the direction `phi` (radians from +x), measured from
/// `offset`. 2D shapes are centred at `offset * (cos phi, sin phi)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GuidanceChannel {
    pub shape: FieldShape,
    pub gain: Real,
    pub phi: Real,
    pub width: Real,
    pub offset: Real,
    /// First step at which this channel drives the flux.
    pub onset: u64,
}

impl Default for GuidanceChannel {
    fn default() -> Self {
        Self {
            shape: FieldShape::Sigmoid1D,
            gain: 1.0,
            phi: 0.0,
            width: 0.1,
            offset: 0.0,
            onset: 0,
        }
    }
}

impl GuidanceChannel {
    pub fn new(shape: FieldShape) -> Self {
        Self {
            shape,
            ..Default::default()
        }
    }

    pub fn with_gain(mut self, gain: Real) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_phi(mut self, phi: Real) -> Self {
        self.phi = phi;
        self
    }

    pub fn with_width(mut self, width: Real) -> Self {
        self.width = width;
        self
    }

    pub fn with_offset(mut self, offset: Real) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_onset(mut self, onset: u64) -> Self {
        self.onset = onset;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [self.gain, self.phi, self.width, self.offset]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(SimError::config("guidance parameters must be finite"));
        }
        if self.width <= 0.0 {
            return Err(SimError::config(format!(
                "guidance width must be positive, got {}",
                self.width
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_active(&self, step: u64) -> bool {
        step >= self.onset
    }

    /// `(rho, d rho/dx, d rho/dy)` at a point.
    pub fn evaluate(&self, x: Real, y: Real) -> (Real, Real, Real) {
        let (s, c) = self.phi.sin_cos();
        let w = self.width;
        let g = self.gain;
        match self.shape {
            FieldShape::Sigmoid1D => {
                let u = x * c + y * s - self.offset;
                let sig = 1.0 / (1.0 + (-u / w).exp());
                let d = g * sig * (1.0 - sig) / w;
                (g * sig, d * c, d * s)
            }
            FieldShape::Linear1D => {
                let u = x * c + y * s - self.offset;
                (g * u / w, g * c / w, g * s / w)
            }
            FieldShape::Exponential1D => {
                let u = x * c + y * s - self.offset;
                let rho = g * (u / w).exp();
                (rho, rho * c / w, rho * s / w)
            }
            FieldShape::Gauss1D => {
                let u = x * c + y * s - self.offset;
                let rho = g * (-u * u / (2.0 * w * w)).exp();
                let d = -rho * u / (w * w);
                (rho, d * c, d * s)
            }
            FieldShape::Gauss2D => {
                let dx = x - self.offset * c;
                let dy = y - self.offset * s;
                let rho = g * (-(dx * dx + dy * dy) / (2.0 * w * w)).exp();
                (rho, -rho * dx / (w * w), -rho * dy / (w * w))
            }
            FieldShape::CircLinear2D => {
                let dx = x - self.offset * c;
                let dy = y - self.offset * s;
                let r = (dx * dx + dy * dy).sqrt();
                let rho = g * (1.0 - r / w);
                if r > 0.0 {
                    (rho, -g * dx / (w * r), -g * dy / (w * r))
                } else {
                    (rho, 0.0, 0.0)
                }
            }
        }
    }
}

/// Smoothed white noise added to every guidance field at init.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceNoise {
    pub gain: Real,
    /// Width of the Gaussian smoothing kernel.
    pub sigma: Real,
    pub seed: u64,
}

/// Modifiers applied to every channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidanceOptions<'a> {
    /// Per-cell weight multiplying the drift, see [`boundary_falloff`].
    pub falloff: Option<&'a [Real]>,
    pub noise: Option<GuidanceNoise>,
}

/// `1 / (1 + exp(-100 (dist - falloff)))` per cell, where `dist` is the distance
/// to the mesh boundary. Rises from below one half on the edge to one inside.
pub fn boundary_falloff(mesh: &HexMesh, falloff: Real) -> ScalarField {
    mesh.boundary_distance()
        .into_iter()
        .map(|d| 1.0 / (1.0 + (-100.0 * (d - falloff)).exp()))
        .collect()
}

/// Evaluated guidance fields: one entry per channel.
#[derive(Debug, Clone, Default)]
pub struct GuidanceFields {
    pub rho: Vec<ScalarField>,
    pub grad_rho: Vec<VectorField>,
    /// `grad rho` weighted by the boundary fall-off.
    pub drift: Vec<VectorField>,
    pub div_drift: Vec<ScalarField>,
}

impl GuidanceFields {
    pub fn compute(
        mesh: &HexMesh,
        tier: ExecutionTier,
        channels: &[GuidanceChannel],
        options: &GuidanceOptions<'_>,
    ) -> Result<Self> {
        let len = mesh.len();
        let k = Coefficients::new(mesh.spacing(), 0.0).first_order;
        let mut rng = options.noise.map(|noise| Prng::new(noise.seed));
        let mut white = vec![0.0; len];
        let mut smooth = vec![0.0; len];
        let mut noise_grad = VectorField::zeros(len);

        let mut out = GuidanceFields::default();
        for (j, channel) in channels.iter().enumerate() {
            let values: Vec<(Real, Real, Real)> = mesh
                .cells()
                .iter()
                .map(|cell| channel.evaluate(cell.x, cell.y))
                .collect();

            let mut rho: ScalarField = values.iter().map(|v| v.0).collect();
            let mut grad = VectorField {
                x: values.iter().map(|v| v.1).collect(),
                y: values.iter().map(|v| v.2).collect(),
            };

            if let (Some(noise), Some(rng)) = (options.noise, rng.as_mut()) {
                for v in white.iter_mut() {
                    *v = rng.next_unit();
                }
                operators::gaussian_smooth(mesh, tier, &white, noise.sigma, &mut smooth);
                operators::gradient(mesh, tier, &smooth, k, &mut noise_grad);
                for h in 0..len {
                    rho[h] += noise.gain * smooth[h];
                    grad.x[h] += noise.gain * noise_grad.x[h];
                    grad.y[h] += noise.gain * noise_grad.y[h];
                }
            }

            let drift = match options.falloff {
                Some(w) => VectorField {
                    x: grad.x.iter().zip(w).map(|(g, w)| g * w).collect(),
                    y: grad.y.iter().zip(w).map(|(g, w)| g * w).collect(),
                },
                None => grad.clone(),
            };
            let mut div = vec![0.0; len];
            operators::divergence(mesh, tier, &drift, k, &mut div);

            for (field, values) in [("rho", &rho), ("grad_rho", &grad.x), ("grad_rho", &grad.y)] {
                if let Some(cell) = operators::first_non_finite(values) {
                    return Err(SimError::config(format!(
                        "guidance channel {j} is non-finite ({field}) at cell {cell}"
                    )));
                }
            }

            tracing::debug!(
                channel = j,
                shape = ?channel.shape,
                onset = channel.onset,
                noise = options.noise.is_some(),
                falloff = options.falloff.is_some(),
                "guidance field evaluated"
            );

            out.rho.push(rho);
            out.grad_rho.push(grad);
            out.drift.push(drift);
            out.div_drift.push(div);
        }
        Ok(out)
    }

    pub fn channel_count(&self) -> usize {
        self.rho.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn numeric_grad(ch: &GuidanceChannel, x: Real, y: Real) -> (Real, Real) {
        let e = 1e-6;
        let dx = (ch.evaluate(x + e, y).0 - ch.evaluate(x - e, y).0) / (2.0 * e);
        let dy = (ch.evaluate(x, y + e).0 - ch.evaluate(x, y - e).0) / (2.0 * e);
        (dx, dy)
    }

    #[test]
    fn linear_unit_field_is_the_rotated_coordinate() {
        let ch = GuidanceChannel::new(FieldShape::Linear1D)
            .with_gain(1.0)
            .with_offset(0.0)
            .with_width(1.0);
        assert_eq!(ch.evaluate(0.3, -0.7).0, 0.3);

        let rotated = ch.with_phi(FRAC_PI_2);
        assert!((rotated.evaluate(0.3, -0.7).0 + 0.7).abs() < 1e-12);
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let shapes = [
            FieldShape::Sigmoid1D,
            FieldShape::Linear1D,
            FieldShape::Exponential1D,
            FieldShape::Gauss1D,
            FieldShape::Gauss2D,
            FieldShape::CircLinear2D,
        ];
        for shape in shapes {
            let ch = GuidanceChannel::new(shape)
                .with_gain(1.5)
                .with_phi(0.4)
                .with_width(0.3)
                .with_offset(0.1);
            let (_, gx, gy) = ch.evaluate(0.23, -0.11);
            let (nx, ny) = numeric_grad(&ch, 0.23, -0.11);
            assert!((gx - nx).abs() < 1e-5, "{shape:?} x: {gx} vs {nx}");
            assert!((gy - ny).abs() < 1e-5, "{shape:?} y: {gy} vs {ny}");
        }
    }

    #[test]
    fn circular_gradient_is_zero_at_centre() {
        let ch = GuidanceChannel::new(FieldShape::CircLinear2D).with_offset(0.0);
        assert_eq!(ch.evaluate(0.0, 0.0), (1.0, 0.0, 0.0));
    }

    #[test]
    fn onset_gates_activity() {
        let ch = GuidanceChannel::default().with_onset(5);
        assert!(!ch.is_active(4));
        assert!(ch.is_active(5));
    }

    #[test]
    fn rejects_non_positive_width() {
        assert!(GuidanceChannel::default().with_width(0.0).validate().is_err());
        assert!(GuidanceChannel::default().validate().is_ok());
    }

    #[test]
    fn compute_fills_every_channel() {
        let mesh = HexMesh::hexagon(3, 0.1).unwrap();
        let channels = [
            GuidanceChannel::new(FieldShape::Linear1D).with_width(1.0),
            GuidanceChannel::new(FieldShape::Gauss2D).with_width(0.2),
        ];
        let fields = GuidanceFields::compute(
            &mesh,
            ExecutionTier::Scalar,
            &channels,
            &GuidanceOptions::default(),
        )
        .unwrap();
        assert_eq!(fields.channel_count(), 2);
        assert_eq!(fields.rho[1].len(), mesh.len());
        assert_eq!(fields.drift[1], fields.grad_rho[1]);
        // A linear field has constant gradient, so its divergence vanishes inside.
        for h in (0..mesh.len()).filter(|&h| !mesh.is_boundary(h)) {
            assert!(fields.div_drift[0][h].abs() < 1e-9);
        }
    }

    #[test]
    fn falloff_damps_the_drift_near_the_edge() {
        let mesh = HexMesh::hexagon(6, 0.02).unwrap();
        let weights = boundary_falloff(&mesh, 0.01);
        let channels = [GuidanceChannel::new(FieldShape::Linear1D).with_width(1.0)];
        let options = GuidanceOptions {
            falloff: Some(&weights),
            noise: None,
        };
        let fields = GuidanceFields::compute(&mesh, ExecutionTier::Scalar, &channels, &options)
            .unwrap();

        let edge = (0..mesh.len()).find(|&h| mesh.is_boundary(h)).unwrap();
        let expected_edge = 1.0 / (1.0 + 1.0f64.exp());
        assert!((weights[edge] - expected_edge).abs() < 1e-12);
        assert!((fields.drift[0].x[edge] - expected_edge).abs() < 1e-12);
        // The analytic gradient is untouched.
        assert_eq!(fields.grad_rho[0].x[edge], 1.0);

        let centre = mesh.nearest(0.0, 0.0);
        assert!((fields.drift[0].x[centre] - 1.0).abs() < 1e-3);
        // A position-dependent weight gives the drift a divergence near the edge.
        assert!(fields.div_drift[0].iter().any(|v| v.abs() > 1e-3));
    }

    #[test]
    fn noise_is_smooth_bounded_and_seeded() {
        let mesh = HexMesh::hexagon(5, 0.05).unwrap();
        let channels = [GuidanceChannel::new(FieldShape::Linear1D).with_width(1.0)];
        let build = |seed: u64| {
            let options = GuidanceOptions {
                falloff: None,
                noise: Some(GuidanceNoise {
                    gain: 0.5,
                    sigma: 0.09,
                    seed,
                }),
            };
            GuidanceFields::compute(&mesh, ExecutionTier::Scalar, &channels, &options).unwrap()
        };
        let (first, again, other) = (build(3), build(3), build(4));
        assert_eq!(first.rho, again.rho);
        assert_ne!(first.rho, other.rho);

        for (h, cell) in mesh.cells().iter().enumerate() {
            let bump = first.rho[0][h] - cell.x;
            assert!((0.0..0.5).contains(&bump), "cell {h}: {bump}");
        }
        // Noise adds a discrete gradient on top of the analytic one.
        assert!(first.grad_rho[0].x.iter().any(|&g| g != 1.0));
    }
}
