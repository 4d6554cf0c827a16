//! # hexrd
//!
//! Competitive reaction-diffusion on a hexagonal mesh.
//!
//! N populations of a diffusing *branching density* `a_i` compete for space
//! while they convert into a slower *connection density* `c_i`. M closed-form
//! guidance fields steer the branching. The fields are integrated with RK4 over a
//! boundary-clipped hex lattice; competition and normalization are pluggable
//! strategies that leave the integration skeleton unchanged.
//!
//! ## Quick Start
//!
//! ```
//! use hexrd::prelude::*;
//!
//! let mesh = HexMesh::hexagon(8, 0.02).unwrap();
//! let params = ModelParams::default()
//!     .with_dt(1e-4)
//!     .with_competition(Competition::PowerLaw { l: 3.0 })
//!     .with_seed(42);
//!
//! let mut setup = Simulation::allocate(mesh, 2, 1, params).unwrap();
//! setup
//!     .set_guidance(0, GuidanceChannel::new(FieldShape::Linear1D).with_width(1.0))
//!     .unwrap();
//! setup.set_gamma(0, 0, 1.0).unwrap();
//! setup.set_gamma(1, 0, -1.0).unwrap();
//!
//! let mut sim = setup.init().unwrap();
//! sim.run(10).unwrap();
//! assert_eq!(sim.step_count(), 10);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization of parameters and snapshots, JSON configs
//! - `parallel`: multi-threaded per-cell loops via rayon
//!
//! ## Modules
//!
//! - [`mesh`]: hex mesh topology
//! - [`operators`]: Laplacian, gradient, divergence and loop helpers
//! - [`guidance`]: closed-form guidance fields
//! - [`flux`]: flux divergence and competition strategies
//! - [`integrator`]: RK4 over whole fields
//! - [`transfer`]: post-integration normalization
//! - [`sim`]: the simulation driver
//! - [`dual`]: two regions sharing one normalization budget
//! - [`observer`]: read-only snapshots

/// Floating-point type of every field.
pub type Real = f64;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/mesh.rs"]
pub mod mesh;

#[path = "core/operators.rs"]
pub mod operators;

#[path = "core/guidance.rs"]
pub mod guidance;

#[path = "core/flux.rs"]
pub mod flux;

#[path = "core/integrator.rs"]
pub mod integrator;

#[path = "core/transfer.rs"]
pub mod transfer;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/sim.rs"]
pub mod sim;

#[path = "core/dual.rs"]
pub mod dual;

#[cfg(feature = "serde")]
#[path = "core/config.rs"]
pub mod config;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use hexrd::prelude::*;
/// ```
pub mod prelude {
    pub use crate::dual::{DualBudget, DualRegion};
    pub use crate::error::{MeshError, SimError};
    pub use crate::flux::{Competition, GroupAggregate};
    pub use crate::guidance::{FieldShape, GuidanceChannel};
    pub use crate::mesh::{Cell, CellId, Direction, HexMesh};
    pub use crate::observer::{FieldSnapshot, SimulationAdapter};
    pub use crate::operators::{ExecutionTier, ScalarField, VectorField};
    pub use crate::sim::{Diagnostics, InitialMask, ModelParams, Population, Setup, Simulation};
    pub use crate::transfer::{BudgetSums, Transfer};
    pub use crate::Real;

    #[cfg(feature = "serde")]
    pub use crate::config::{RunConfig, SimConfig};
}
