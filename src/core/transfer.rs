//! Post-integration transfer of the branching density.
//!
//! After every population has committed its RK4 update, the transfer rescales
//! each `a_i` against a global budget and clamps it to be non-negative. Budgets
//! are reductions over the whole mesh, so they are measured for all populations
//! before any cell is rewritten.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::operators::{self, ExecutionTier};
use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Transfer {
    /// Clamp only.
    #[default]
    Identity,
    /// Rescale so `sum_h a_i` equals the cell count.
    NormalizeToOne,
    /// Rescale so `sum_h a_i` equals its value at init.
    DivisiveInitialSum,
    /// Rescale so `sum_h a_i` equals its value at init minus `sum_h c_i`.
    DivisiveSubtractConnections,
}

impl Transfer {
    pub fn is_divisive(self) -> bool {
        !matches!(self, Transfer::Identity)
    }

    /// Desired `sum_h a_i`, or `None` for the identity transfer.
    pub fn target(self, i: usize, sums: &BudgetSums) -> Option<Real> {
        match self {
            Transfer::Identity => None,
            Transfer::NormalizeToOne => Some(sums.cells as Real),
            Transfer::DivisiveInitialSum => Some(sums.sum_a_init[i]),
            Transfer::DivisiveSubtractConnections => Some(sums.sum_a_init[i] - sums.sum_c[i]),
        }
    }

    /// Rescale and clamp `a` in place. Returns the number of cells clamped to zero.
    pub fn apply(
        self,
        tier: ExecutionTier,
        i: usize,
        a: &mut [Real],
        sums: &BudgetSums,
        step: u64,
    ) -> Result<usize> {
        let scale = match self.target(i, sums) {
            None => 1.0,
            Some(target) => {
                let scale = target / sums.sum_a[i];
                if !scale.is_finite() {
                    return Err(SimError::NumericFault {
                        field: "transfer",
                        population: Some(i),
                        cell: operators::first_non_finite(a).unwrap_or(0),
                        step,
                    });
                }
                scale
            }
        };

        let clamped = a.iter().filter(|&&v| scale * v < 0.0).count();
        operators::map_in_place(tier, a, |v| (scale * v).max(0.0));
        Ok(clamped)
    }
}

/// Per-population budget sums consumed by [`Transfer::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BudgetSums {
    pub sum_a: Vec<Real>,
    pub sum_c: Vec<Real>,
    pub sum_a_init: Vec<Real>,
    /// Cells the sums were taken over.
    pub cells: usize,
}

impl BudgetSums {
    pub fn new(populations: usize, cells: usize) -> Self {
        Self {
            sum_a: vec![0.0; populations],
            sum_c: vec![0.0; populations],
            sum_a_init: vec![0.0; populations],
            cells,
        }
    }

    pub fn populations(&self) -> usize {
        self.sum_a.len()
    }

    fn check_compatible(&self, other: &BudgetSums) -> Result<()> {
        if self.populations() != other.populations() {
            return Err(SimError::config(format!(
                "cannot merge budgets of {} and {} populations",
                self.populations(),
                other.populations()
            )));
        }
        Ok(())
    }

    /// This region's budget with `sum_a` replaced by the total over both regions.
    ///
    /// `sum_c`, `sum_a_init` and `cells` stay local, so each region keeps its
    /// own target and only the normalising denominator is shared.
    pub fn with_shared_branching(&self, other: &BudgetSums) -> Result<BudgetSums> {
        self.check_compatible(other)?;
        Ok(BudgetSums {
            sum_a: self.sum_a.iter().zip(&other.sum_a).map(|(p, q)| p + q).collect(),
            ..self.clone()
        })
    }

    /// Element-wise sum of two budgets, as used for two pooled regions.
    pub fn merged(&self, other: &BudgetSums) -> Result<BudgetSums> {
        self.check_compatible(other)?;
        let add = |x: &[Real], y: &[Real]| -> Vec<Real> {
            x.iter().zip(y).map(|(p, q)| p + q).collect()
        };
        Ok(BudgetSums {
            sum_a: add(&self.sum_a, &other.sum_a),
            sum_c: add(&self.sum_c, &other.sum_c),
            sum_a_init: add(&self.sum_a_init, &other.sum_a_init),
            cells: self.cells + other.cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums(a: Real, c: Real, init: Real, cells: usize) -> BudgetSums {
        BudgetSums {
            sum_a: vec![a],
            sum_c: vec![c],
            sum_a_init: vec![init],
            cells,
        }
    }

    #[test]
    fn identity_only_clamps() {
        let mut a = vec![0.5, -0.25, 2.0];
        let clamped = Transfer::Identity
            .apply(ExecutionTier::Scalar, 0, &mut a, &sums(2.25, 0.0, 1.0, 3), 1)
            .unwrap();
        assert_eq!(a, vec![0.5, 0.0, 2.0]);
        assert_eq!(clamped, 1);
    }

    #[test]
    fn normalize_to_one_targets_cell_count() {
        let mut a = vec![1.0, 3.0];
        Transfer::NormalizeToOne
            .apply(ExecutionTier::Scalar, 0, &mut a, &sums(4.0, 0.0, 0.0, 2), 1)
            .unwrap();
        assert_eq!(a, vec![0.5, 1.5]);
    }

    #[test]
    fn subtraction_removes_converted_branches() {
        let mut a = vec![2.0, 2.0, 4.0];
        Transfer::DivisiveSubtractConnections
            .apply(ExecutionTier::Scalar, 0, &mut a, &sums(8.0, 2.0, 6.0, 3), 1)
            .unwrap();
        let total: Real = a.iter().sum();
        assert!((total - 4.0).abs() < 1e-12);
    }

    #[test]
    fn zero_budget_is_a_fault() {
        let mut a = vec![0.0; 4];
        let err = Transfer::DivisiveInitialSum
            .apply(ExecutionTier::Scalar, 0, &mut a, &sums(0.0, 0.0, 1.0, 4), 12)
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::NumericFault {
                field: "transfer",
                step: 12,
                ..
            }
        ));
    }

    #[test]
    fn merged_budgets_add() {
        let left = sums(1.0, 0.5, 2.0, 10);
        let right = sums(3.0, 0.25, 4.0, 20);
        let m = left.merged(&right).unwrap();
        assert_eq!(m.sum_a, vec![4.0]);
        assert_eq!(m.sum_c, vec![0.75]);
        assert_eq!(m.sum_a_init, vec![6.0]);
        assert_eq!(m.cells, 30);
        assert!(left.merged(&BudgetSums::new(2, 1)).is_err());
    }

    #[test]
    fn shared_branching_keeps_local_targets() {
        let left = sums(1.0, 0.5, 2.0, 10);
        let right = sums(3.0, 0.25, 4.0, 20);
        let s = left.with_shared_branching(&right).unwrap();
        assert_eq!(s.sum_a, vec![4.0]);
        assert_eq!(s.sum_c, vec![0.5]);
        assert_eq!(s.sum_a_init, vec![2.0]);
        assert_eq!(s.cells, 10);

        // Local a of 1.0 against a shared 4.0 keeps a quarter of the local target.
        let mut a = vec![0.25, 0.75];
        Transfer::DivisiveInitialSum
            .apply(ExecutionTier::Scalar, 0, &mut a, &s, 1)
            .unwrap();
        assert_eq!(a, vec![0.125, 0.375]);
        assert!(left.with_shared_branching(&BudgetSums::new(2, 1)).is_err());
    }
}
