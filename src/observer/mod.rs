use crate::sim::{Diagnostics, Simulation};
use crate::transfer::BudgetSums;
use crate::Real;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A read-only copy of what a simulation currently holds.
///
/// Design intent:
/// - Observers cannot mutate or steer the simulation.
/// - Snapshotting is *on-demand* and allocates; the step loop stays unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldSnapshot {
    pub step: u64,
    pub positions: Vec<(Real, Real)>,
    pub populations: Vec<PopulationSnapshot>,
    pub n: Vec<Real>,
    pub rho: Vec<Vec<Real>>,
    pub budget: BudgetSums,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PopulationSnapshot {
    pub name: String,
    pub a: Vec<Real>,
    pub c: Vec<Real>,
}

pub struct SimulationAdapter<'a> {
    sim: &'a Simulation,
}

impl<'a> SimulationAdapter<'a> {
    pub fn new(sim: &'a Simulation) -> Self {
        Self { sim }
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        let sim = self.sim;
        let populations = sim
            .populations()
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                Some(PopulationSnapshot {
                    name: p.name.clone(),
                    a: sim.a(i).ok()?.to_vec(),
                    c: sim.c(i).ok()?.to_vec(),
                })
            })
            .collect();

        FieldSnapshot {
            step: sim.step_count(),
            positions: sim.mesh().cells().iter().map(|c| (c.x, c.y)).collect(),
            populations,
            n: sim.n().to_vec(),
            rho: (0..sim.channel_count())
                .filter_map(|j| sim.rho(j).ok().map(<[Real]>::to_vec))
                .collect(),
            budget: sim.budget().clone(),
            diagnostics: sim.diagnostics(),
        }
    }

    /// Per-cell index of the population with the highest connection density.
    ///
    /// This is the label field consumed by map-shape analyses. Ties resolve to
    /// the lowest index.
    pub fn labels(&self) -> Vec<usize> {
        let sim = self.sim;
        let fields: Vec<&[Real]> = (0..sim.population_count())
            .filter_map(|i| sim.c(i).ok())
            .collect();
        (0..sim.mesh().len())
            .map(|h| {
                let mut best = 0;
                for (i, f) in fields.iter().enumerate().skip(1) {
                    if f[h] > fields[best][h] {
                        best = i;
                    }
                }
                best
            })
            .collect()
    }
}
