//! Error types shared by every stage of the simulation.

use thiserror::Error;

/// Problems detected while validating a mesh.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    #[error("mesh has no cells")]
    Empty,
    #[error("cell spacing must be finite and positive, got {0}")]
    BadSpacing(f64),
    #[error("cell {cell} lists neighbour {neighbour}, but the mesh only has {len} cells")]
    DanglingNeighbour {
        cell: usize,
        neighbour: usize,
        len: usize,
    },
    #[error("cell {cell} lists itself as a neighbour")]
    SelfNeighbour { cell: usize },
    #[error("cell {cell} -> {neighbour} in direction {direction} is not mirrored by the opposite link")]
    NotReciprocal {
        cell: usize,
        neighbour: usize,
        direction: usize,
    },
    #[error("cell {cell} has a non-finite position")]
    BadPosition { cell: usize },
}

#[derive(Debug, Error)]
pub enum SimError {
    /// A parameter was rejected during setup.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{what} index {index} out of range (limit {limit})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },

    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// A NaN or infinity appeared in an intermediate field. Terminal.
    #[error(
        "non-finite value in {field} at cell {cell} (population {population:?}) during step {step}"
    )]
    NumericFault {
        field: &'static str,
        population: Option<usize>,
        cell: usize,
        step: u64,
    },

    /// The simulation already hit a numeric fault and refuses to continue.
    #[error("simulation halted after an earlier numeric fault")]
    Halted,

    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }

    pub(crate) fn check_index(what: &'static str, index: usize, limit: usize) -> Result<(), Self> {
        if index < limit {
            Ok(())
        } else {
            Err(SimError::IndexOutOfRange { what, index, limit })
        }
    }

    pub fn is_numeric_fault(&self) -> bool {
        matches!(self, SimError::NumericFault { .. })
    }
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;
