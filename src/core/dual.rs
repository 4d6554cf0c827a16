//! Two regions sharing one divisive-normalization budget.
//!
//! Each region keeps its own mesh, fields and guidance. Only the transfer step
//! is coupled, so a population that grows in one region takes budget away from
//! the other. [`DualBudget`] selects how much of the budget is shared.
//!
//! A numeric fault in either region halts both: the pair never advances one
//! region past the other.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::sim::Simulation;
use crate::transfer::BudgetSums;

/// How the two regions' budgets are combined before the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DualBudget {
    /// Only `sum_a` is summed over both regions. Each region keeps its own
    /// `sum_a_init`, `sum_c` and cell count, so its target stays local.
    #[default]
    SharedBranching,
    /// Every sum is pooled and both regions rescale towards one joint target.
    Pooled,
}

impl DualBudget {
    /// Budgets for the left and right region.
    pub fn combine(self, left: &BudgetSums, right: &BudgetSums) -> Result<(BudgetSums, BudgetSums)> {
        match self {
            DualBudget::SharedBranching => Ok((
                left.with_shared_branching(right)?,
                right.with_shared_branching(left)?,
            )),
            DualBudget::Pooled => {
                let pooled = left.merged(right)?;
                Ok((pooled.clone(), pooled))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DualRegion {
    left: Simulation,
    right: Simulation,
    mode: DualBudget,
    budgets: (BudgetSums, BudgetSums),
    halted: bool,
}

impl DualRegion {
    /// Couple two initialised simulations with [`DualBudget::SharedBranching`].
    ///
    /// Both must have the same population count and the same transfer.
    pub fn new(left: Simulation, right: Simulation) -> Result<Self> {
        if left.population_count() != right.population_count() {
            return Err(SimError::config(format!(
                "regions disagree on population count ({} vs {})",
                left.population_count(),
                right.population_count()
            )));
        }
        if left.params().transfer != right.params().transfer {
            return Err(SimError::config(format!(
                "regions disagree on transfer ({:?} vs {:?})",
                left.params().transfer,
                right.params().transfer
            )));
        }
        if left.step_count() != right.step_count() {
            return Err(SimError::config("regions must start at the same step"));
        }
        let mode = DualBudget::default();
        let budgets = mode.combine(left.budget(), right.budget())?;
        let halted = left.is_halted() || right.is_halted();
        tracing::debug!(
            populations = left.population_count(),
            cells = left.mesh().len() + right.mesh().len(),
            ?mode,
            "dual region coupled"
        );
        Ok(Self {
            left,
            right,
            mode,
            budgets,
            halted,
        })
    }

    pub fn with_budget(mut self, mode: DualBudget) -> Result<Self> {
        self.budgets = mode.combine(self.left.budget(), self.right.budget())?;
        self.mode = mode;
        Ok(self)
    }

    /// Advance both regions by one step.
    ///
    /// After a numeric fault in either region both are halted and every later
    /// call returns [`SimError::Halted`] without touching either region.
    pub fn step(&mut self) -> Result<()> {
        if self.halted {
            return Err(SimError::Halted);
        }
        let result = self.advance();
        if let Err(err) = &result {
            if err.is_numeric_fault() || matches!(err, SimError::Halted) {
                self.halted = true;
                self.left.halt();
                self.right.halt();
                tracing::error!(
                    left_step = self.left.step_count(),
                    right_step = self.right.step_count(),
                    error = %err,
                    "dual region halted"
                );
            }
        }
        result
    }

    fn advance(&mut self) -> Result<()> {
        self.left.ensure_running()?;
        self.right.ensure_running()?;

        self.left.advance_branching()?;
        self.right.advance_branching()?;

        let left = self.left.measure_budget()?.clone();
        let right = self.right.measure_budget()?;
        self.budgets = self.mode.combine(&left, right)?;

        self.left.apply_transfer(&self.budgets.0)?;
        self.right.apply_transfer(&self.budgets.1)?;

        self.left.advance_connections()?;
        self.right.advance_connections()
    }

    pub fn run(&mut self, steps: u64) -> Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    pub fn left(&self) -> &Simulation {
        &self.left
    }

    pub fn right(&self) -> &Simulation {
        &self.right
    }

    pub fn mode(&self) -> DualBudget {
        self.mode
    }

    /// Budgets used by the last transfer for the left and right region
    /// (the initial budgets before the first step).
    pub fn budgets(&self) -> (&BudgetSums, &BudgetSums) {
        (&self.budgets.0, &self.budgets.1)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn into_parts(self) -> (Simulation, Simulation) {
        (self.left, self.right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::HexMesh;
    use crate::sim::{InitialMask, ModelParams, Population};
    use crate::transfer::Transfer;
    use crate::Real;

    fn region(rings: u32, transfer: Transfer, gain: Real) -> Simulation {
        let mesh = HexMesh::hexagon(rings, 0.1).unwrap();
        let params = ModelParams::default()
            .with_dt(1e-3)
            .with_noise(0.0, 1.0)
            .with_transfer(transfer);
        let mut setup = Simulation::allocate(mesh, 2, 0, params).unwrap();
        for i in 0..2 {
            let p = setup.population_mut(i).unwrap();
            p.alpha = 1.0;
            p.beta = 5.0;
            p.init = InitialMask::gaussian(gain, 0.2, 0.0, 0.0);
        }
        setup.init().unwrap()
    }

    fn total(sim: &Simulation, i: usize) -> Real {
        sim.a(i).unwrap().iter().sum()
    }

    #[test]
    fn rejects_mismatched_regions() {
        let a = region(2, Transfer::DivisiveInitialSum, 1.0);
        let b = region(2, Transfer::NormalizeToOne, 1.0);
        assert!(DualRegion::new(a, b).is_err());
    }

    #[test]
    fn pooled_budget_is_conserved() {
        let left = region(2, Transfer::DivisiveInitialSum, 1.0);
        let right = region(3, Transfer::DivisiveInitialSum, 2.0);
        let init = left.budget().sum_a_init[0] + right.budget().sum_a_init[0];
        let mut dual = DualRegion::new(left, right)
            .unwrap()
            .with_budget(DualBudget::Pooled)
            .unwrap();
        dual.run(5).unwrap();

        let sum = total(dual.left(), 0) + total(dual.right(), 0);
        assert!((sum - init).abs() < 1e-9 * init);
        assert_eq!(dual.left().step_count(), 5);
        assert_eq!(dual.right().step_count(), 5);
        assert_eq!(dual.budgets().0, dual.budgets().1);
    }

    #[test]
    fn shared_branching_splits_each_local_target() {
        let left = region(2, Transfer::DivisiveInitialSum, 1.0);
        let right = region(3, Transfer::DivisiveInitialSum, 2.0);
        let mut dual = DualRegion::new(left, right).unwrap();
        assert_eq!(dual.mode(), DualBudget::SharedBranching);
        dual.step().unwrap();

        let (lb, rb) = dual.budgets();
        for i in 0..2 {
            // Each region's own budget holds its local sums measured before the transfer.
            let local_l = dual.left().budget().sum_a[i];
            let local_r = dual.right().budget().sum_a[i];
            let shared = local_l + local_r;
            assert!((lb.sum_a[i] - shared).abs() < 1e-12 * shared);
            assert!((rb.sum_a[i] - shared).abs() < 1e-12 * shared);

            let expected_l = lb.sum_a_init[i] * local_l / shared;
            let expected_r = rb.sum_a_init[i] * local_r / shared;
            assert!((total(dual.left(), i) - expected_l).abs() < 1e-9 * expected_l);
            assert!((total(dual.right(), i) - expected_r).abs() < 1e-9 * expected_r);
        }
        assert_eq!(lb.cells, dual.left().mesh().len());
        assert_eq!(rb.cells, dual.right().mesh().len());
    }

    #[test]
    fn fault_in_one_region_halts_both() {
        let left = region(2, Transfer::Identity, 1.0);
        let mesh = HexMesh::hexagon(2, 0.1).unwrap();
        let params = ModelParams::default().with_dt(1e300).with_noise(0.0, 1.0);
        let mut setup = Simulation::allocate(mesh, 2, 0, params).unwrap();
        for i in 0..2 {
            setup
                .set_population(i, Population::new(format!("p{i}")).with_growth(0.0, 1e300))
                .unwrap();
        }
        let right = setup.init().unwrap();
        let mut dual = DualRegion::new(left, right).unwrap();

        let first = dual.step().unwrap_err();
        assert!(first.is_numeric_fault(), "{first}");
        assert!(dual.is_halted());
        assert!(dual.left().is_halted());
        assert!(dual.right().is_halted());

        let left_a = dual.left().a(0).unwrap().to_vec();
        for _ in 0..3 {
            assert!(matches!(dual.step(), Err(SimError::Halted)));
        }
        assert_eq!(dual.left().step_count(), 1);
        assert_eq!(dual.right().step_count(), 1);
        assert_eq!(dual.left().a(0).unwrap(), left_a.as_slice());
    }
}
