//! Branching flux and competition strategies.
//!
//! For population `i` at a trial state `fa` the flux divergence is
//!
//! ```text
//! divJ = D lap(fa)
//!      - E (fa div n + grad n . grad fa)
//!      - sum_j gamma_ij (fa div v_j + v_j . grad fa)   (active channels)
//!      - rolloff_i(fa)
//!      - fa P_i
//! ```
//!
//! `v_j` is the guidance drift: `grad rho_j`, weighted by the boundary fall-off
//! when one is configured.
//!
//! `P_i` (the pressure) and the rolloff inputs depend only on the committed
//! state of the *other* populations. They are built once per step in a [`Drive`]
//! before any population integrates, so every population sees the same snapshot.

use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::guidance::{GuidanceChannel, GuidanceFields};
use crate::mesh::HexMesh;
use crate::operators::{self, Coefficients, ExecutionTier, ScalarField, VectorField};
use crate::sim::Population;
use crate::Real;

/// How the ξ term of [`Competition::Grouped`] aggregates other populations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GroupAggregate {
    /// Other members of the population's own group, weighted `xi / (members - 1)`.
    #[default]
    WithinGroup,
    /// Populations outside the group, weighted `xi / (N - groups)`.
    OutsideGroup,
}

/// Competition formulation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Competition {
    /// No competition term. Pair with a divisive transfer for
    /// normalization-only models.
    #[default]
    None,
    /// `P_i = eps_i / (N - 1) * sum_{j != i} a_j^l`.
    PowerLaw { l: Real },
    /// `P_i = eps_i / (N - 1) * sum_{j != i} (1 / (1 + exp(-m a_j^l)) - 1/2)`.
    Logistic { l: Real, m: Real },
    /// Power law plus a ξ term aggregated per [`GroupAggregate`].
    Grouped { l: Real, aggregate: GroupAggregate },
    /// Drift away from competitors: `F / (N - 1) * div(abar grad ahat)` where
    /// `ahat = sum_{j != i} a_j` and `abar = height / (1 + exp(offset - sharpness fa))`.
    SigmoidRolloff {
        strength: Real,
        height: Real,
        offset: Real,
        sharpness: Real,
    },
}

impl Competition {
    pub fn sigmoid_rolloff(strength: Real) -> Self {
        Competition::SigmoidRolloff {
            strength,
            height: 2.0,
            offset: 5.0,
            sharpness: 0.5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let values: &[Real] = match self {
            Competition::None => &[],
            Competition::PowerLaw { l } => &[*l],
            Competition::Logistic { l, m } => &[*l, *m],
            Competition::Grouped { l, .. } => &[*l],
            Competition::SigmoidRolloff {
                strength,
                height,
                offset,
                sharpness,
            } => &[*strength, *height, *offset, *sharpness],
        };
        if values.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(SimError::config(format!(
                "competition parameters must be finite: {self:?}"
            )))
        }
    }
}

/// Per-population weights resolved from a [`Competition`] and the population table.
#[derive(Debug, Clone)]
pub struct CompetitionPlan {
    kind: Competition,
    eps: Vec<Real>,
    xi: Vec<Real>,
    group_of: Vec<usize>,
    rolloff: Real,
}

#[inline]
fn share(weight: Real, count: isize) -> Real {
    if count > 0 {
        weight / count as Real
    } else {
        0.0
    }
}

impl CompetitionPlan {
    pub fn new(kind: Competition, populations: &[Population]) -> Self {
        let n = populations.len() as isize;

        let mut group_ids: HashMap<&str, usize> = HashMap::new();
        let group_of: Vec<usize> = populations
            .iter()
            .map(|p| {
                let next = group_ids.len();
                *group_ids.entry(p.group.as_str()).or_insert(next)
            })
            .collect();
        let groups = group_ids.len() as isize;
        let mut members = vec![0isize; group_ids.len()];
        for &g in &group_of {
            members[g] += 1;
        }

        let eps = populations.iter().map(|p| share(p.epsilon, n - 1)).collect();
        let xi = populations
            .iter()
            .zip(&group_of)
            .map(|(p, &g)| match kind {
                Competition::Grouped {
                    aggregate: GroupAggregate::WithinGroup,
                    ..
                } => share(p.xi, members[g] - 1),
                Competition::Grouped {
                    aggregate: GroupAggregate::OutsideGroup,
                    ..
                } => share(p.xi, n - groups),
                _ => 0.0,
            })
            .collect();
        let rolloff = match kind {
            Competition::SigmoidRolloff { strength, .. } => share(strength, n - 1),
            _ => 0.0,
        };

        Self {
            kind,
            eps,
            xi,
            group_of,
            rolloff,
        }
    }

    pub fn kind(&self) -> Competition {
        self.kind
    }

    /// Effective `eps_i / (N - 1)`.
    pub fn epsilon_weight(&self, i: usize) -> Real {
        self.eps[i]
    }

    /// Effective ξ weight after the group aggregate has been applied.
    pub fn xi_weight(&self, i: usize) -> Real {
        self.xi[i]
    }

    pub fn group_of(&self, i: usize) -> usize {
        self.group_of[i]
    }

    fn has_pressure(&self) -> bool {
        matches!(
            self.kind,
            Competition::PowerLaw { .. } | Competition::Logistic { .. } | Competition::Grouped { .. }
        )
    }

    /// Preallocated drive buffers sized for this plan.
    pub fn allocate_drive(&self, len: usize) -> Drive {
        let n = self.eps.len();
        Drive {
            pressure: if self.has_pressure() {
                vec![vec![0.0; len]; n]
            } else {
                Vec::new()
            },
            rolloff: match self.kind {
                Competition::SigmoidRolloff { .. } => Some(RolloffDrive {
                    ahat: vec![0.0; len],
                    div_ahat: vec![vec![0.0; len]; n],
                    grad_ahat: vec![VectorField::zeros(len); n],
                }),
                _ => None,
            },
        }
    }

    /// Rebuild `drive` from the committed branching densities `a`.
    pub fn update_drive(
        &self,
        mesh: &HexMesh,
        tier: ExecutionTier,
        coeffs: &Coefficients,
        a: &[ScalarField],
        step: u64,
        drive: &mut Drive,
    ) -> Result<()> {
        let n = a.len();
        let fault = |population: usize, cell: usize| SimError::NumericFault {
            field: "competition",
            population: Some(population),
            cell,
            step,
        };

        match self.kind {
            Competition::None => {}
            Competition::PowerLaw { l } => {
                for (i, out) in drive.pressure.iter_mut().enumerate() {
                    let w = self.eps[i];
                    operators::try_fill(tier, out, |h| {
                        let acc: Real = (0..n).filter(|&j| j != i).map(|j| a[j][h].powf(l)).sum();
                        w * acc
                    })
                    .map_err(|cell| fault(i, cell))?;
                }
            }
            Competition::Logistic { l, m } => {
                for (i, out) in drive.pressure.iter_mut().enumerate() {
                    let w = self.eps[i];
                    operators::try_fill(tier, out, |h| {
                        let acc: Real = (0..n)
                            .filter(|&j| j != i)
                            .map(|j| 1.0 / (1.0 + (-m * a[j][h].powf(l)).exp()) - 0.5)
                            .sum();
                        w * acc
                    })
                    .map_err(|cell| fault(i, cell))?;
                }
            }
            Competition::Grouped { l, aggregate } => {
                let group_of = &self.group_of;
                for (i, out) in drive.pressure.iter_mut().enumerate() {
                    let (w_eps, w_xi, gi) = (self.eps[i], self.xi[i], group_of[i]);
                    operators::try_fill(tier, out, |h| {
                        let mut others = 0.0;
                        let mut grouped = 0.0;
                        for j in 0..n {
                            let p = a[j][h].powf(l);
                            if j != i {
                                others += p;
                            }
                            let counts = match aggregate {
                                GroupAggregate::WithinGroup => j != i && group_of[j] == gi,
                                GroupAggregate::OutsideGroup => group_of[j] != gi,
                            };
                            if counts {
                                grouped += p;
                            }
                        }
                        w_eps * others + w_xi * grouped
                    })
                    .map_err(|cell| fault(i, cell))?;
                }
            }
            Competition::SigmoidRolloff { .. } => {
                if let Some(roll) = drive.rolloff.as_mut() {
                    for i in 0..n {
                        operators::fill(tier, &mut roll.ahat, |h| {
                            (0..n).filter(|&j| j != i).map(|j| a[j][h]).sum()
                        });
                        operators::laplacian(
                            mesh,
                            tier,
                            &roll.ahat,
                            coeffs.laplace,
                            &mut roll.div_ahat[i],
                        );
                        operators::gradient(
                            mesh,
                            tier,
                            &roll.ahat,
                            coeffs.first_order,
                            &mut roll.grad_ahat[i],
                        );
                        if let Some(cell) = operators::first_non_finite(&roll.div_ahat[i]) {
                            return Err(fault(i, cell));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Inputs to the competition terms, built from the committed state once per step.
#[derive(Debug, Clone, Default)]
pub struct Drive {
    /// `P_i` per population; empty when the competition has no pressure term.
    pub pressure: Vec<ScalarField>,
    pub rolloff: Option<RolloffDrive>,
}

#[derive(Debug, Clone, Default)]
pub struct RolloffDrive {
    ahat: ScalarField,
    pub div_ahat: Vec<ScalarField>,
    pub grad_ahat: Vec<VectorField>,
}

/// Working buffers for one flux evaluation.
#[derive(Debug, Clone)]
pub struct FluxScratch {
    lap: ScalarField,
    grad_fa: VectorField,
    abar: ScalarField,
    grad_abar: VectorField,
    active: Vec<(usize, Real)>,
}

impl FluxScratch {
    pub fn new(len: usize) -> Self {
        Self {
            lap: vec![0.0; len],
            grad_fa: VectorField::zeros(len),
            abar: vec![0.0; len],
            grad_abar: VectorField::zeros(len),
            active: Vec::new(),
        }
    }
}

/// Coupling-field terms, present when `E != 0`.
#[derive(Debug, Clone, Copy)]
pub struct Coupling<'a> {
    pub strength: Real,
    pub div_n: &'a [Real],
    pub grad_n: &'a VectorField,
}

/// Everything a flux evaluation reads besides the trial state.
pub struct FluxContext<'a> {
    pub mesh: &'a HexMesh,
    pub tier: ExecutionTier,
    pub coeffs: Coefficients,
    pub step: u64,
    pub coupling: Option<Coupling<'a>>,
    pub guidance: &'a GuidanceFields,
    pub channels: &'a [GuidanceChannel],
    pub plan: &'a CompetitionPlan,
    pub drive: &'a Drive,
}

#[derive(Debug, Clone, Copy, Default)]
struct FluxTerms {
    diffusion: Real,
    coupling: Real,
    guidance: Real,
    rolloff: Real,
    competition: Real,
}

impl FluxTerms {
    #[inline]
    fn total(&self) -> Real {
        self.diffusion - self.coupling - self.guidance - self.rolloff - self.competition
    }

    fn first_bad(&self) -> &'static str {
        [
            ("laplacian", self.diffusion),
            ("coupling", self.coupling),
            ("guidance", self.guidance),
            ("rolloff", self.rolloff),
            ("competition", self.competition),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite())
        .map_or("flux", |(name, _)| name)
    }
}

impl FluxContext<'_> {
    /// Write the flux divergence of population `i` at trial state `fa` into `out`.
    pub fn divergence(
        &self,
        i: usize,
        gamma: &[Real],
        fa: &[Real],
        scratch: &mut FluxScratch,
        out: &mut [Real],
    ) -> Result<()> {
        let fault = |field: &'static str, cell: usize| SimError::NumericFault {
            field,
            population: Some(i),
            cell,
            step: self.step,
        };

        operators::laplacian(self.mesh, self.tier, fa, self.coeffs.diffusion, &mut scratch.lap);
        operators::gradient(
            self.mesh,
            self.tier,
            fa,
            self.coeffs.first_order,
            &mut scratch.grad_fa,
        );
        for values in [&scratch.grad_fa.x, &scratch.grad_fa.y] {
            if let Some(cell) = operators::first_non_finite(values) {
                return Err(fault("gradient", cell));
            }
        }

        scratch.active.clear();
        scratch.active.extend(
            self.channels
                .iter()
                .zip(gamma)
                .enumerate()
                .filter(|(_, (ch, g))| ch.is_active(self.step) && **g != 0.0)
                .map(|(j, (_, &g))| (j, g)),
        );

        let rolloff = match (self.plan.kind, self.drive.rolloff.as_ref()) {
            (
                Competition::SigmoidRolloff {
                    height,
                    offset,
                    sharpness,
                    ..
                },
                Some(drive),
            ) => {
                operators::fill(self.tier, &mut scratch.abar, |h| {
                    height / (1.0 + (offset - sharpness * fa[h]).exp())
                });
                operators::gradient(
                    self.mesh,
                    self.tier,
                    &scratch.abar,
                    self.coeffs.first_order,
                    &mut scratch.grad_abar,
                );
                Some((self.plan.rolloff, &drive.div_ahat[i], &drive.grad_ahat[i]))
            }
            _ => None,
        };
        let pressure = self.drive.pressure.get(i);

        let s = &*scratch;
        let terms = |h: usize| -> FluxTerms {
            let a = fa[h];
            let mut t = FluxTerms {
                diffusion: s.lap[h],
                ..Default::default()
            };
            if let Some(c) = &self.coupling {
                t.coupling = c.strength * (a * c.div_n[h] + c.grad_n.dot_at(&s.grad_fa, h));
            }
            for &(j, g) in &s.active {
                let drift = &self.guidance.drift[j];
                t.guidance += g * (a * self.guidance.div_drift[j][h] + drift.dot_at(&s.grad_fa, h));
            }
            if let Some((w, div_ahat, grad_ahat)) = rolloff {
                t.rolloff = w * (s.abar[h] * div_ahat[h] + grad_ahat.dot_at(&s.grad_abar, h));
            }
            if let Some(p) = pressure {
                t.competition = a * p[h];
            }
            t
        };

        operators::try_fill(self.tier, out, |h| terms(h).total())
            .map_err(|cell| fault(terms(cell).first_bad(), cell))
    }
}
