//! Declarative configuration.
//!
//! A [`SimConfig`] describes one simulation in JSON and builds it through the
//! same setup API a program would use directly. A [`RunConfig`] wraps it with
//! the mesh and run length used by the `hexrd` binary.
//!
//! ```json
//! {
//!   "params": { "dt": 0.0001, "competition": { "kind": "power_law", "l": 3.0 } },
//!   "populations": [
//!     { "name": "C1", "alpha": 3.0, "beta": 20.0, "epsilon": 0.5, "gamma": [1.5] }
//!   ],
//!   "guidance": [ { "shape": "Linear1D", "width": 1.0 } ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::guidance::GuidanceChannel;
use crate::mesh::HexMesh;
use crate::sim::{ModelParams, Population, Simulation};
use crate::Real;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationConfig {
    #[serde(flatten)]
    pub population: Population,
    /// One entry per guidance channel.
    #[serde(default)]
    pub gamma: Vec<Real>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub params: ModelParams,
    pub populations: Vec<PopulationConfig>,
    pub guidance: Vec<GuidanceChannel>,
}

impl SimConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate().map_err(SimError::config)?;
        if self.populations.is_empty() {
            return Err(SimError::config("at least one population is required"));
        }
        let m = self.guidance.len();
        for (i, p) in self.populations.iter().enumerate() {
            if p.gamma.len() > m {
                return Err(SimError::IndexOutOfRange {
                    what: "guidance channel",
                    index: p.gamma.len() - 1,
                    limit: m,
                });
            }
            if p.gamma.len() < m {
                return Err(SimError::config(format!(
                    "population {i} ({}) has {} gamma values for {m} guidance channels",
                    p.population.name,
                    p.gamma.len()
                )));
            }
        }
        Ok(())
    }

    /// Allocate, configure and initialise a simulation over `mesh`.
    pub fn build(&self, mesh: HexMesh) -> Result<Simulation> {
        self.validate()?;
        let mut setup =
            Simulation::allocate(mesh, self.populations.len(), self.guidance.len(), self.params)?;
        for (j, channel) in self.guidance.iter().enumerate() {
            setup.set_guidance(j, *channel)?;
        }
        for (i, p) in self.populations.iter().enumerate() {
            setup.set_population(i, p.population.clone())?;
            for (j, &g) in p.gamma.iter().enumerate() {
                setup.set_gamma(i, j, g)?;
            }
        }
        setup.init()
    }
}

/// Regular hexagonal mesh parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub rings: u32,
    pub spacing: Real,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rings: 30,
            spacing: 0.01,
        }
    }
}

impl MeshConfig {
    pub fn build(&self) -> Result<HexMesh> {
        Ok(HexMesh::hexagon(self.rings, self.spacing)?)
    }
}

/// Everything the binary needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub steps: u64,
    pub log_every: u64,
    pub mesh: MeshConfig,
    pub model: SimConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            log_every: 100,
            mesh: MeshConfig::default(),
            model: SimConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn build(&self) -> Result<Simulation> {
        self.model.build(self.mesh.build()?)
    }
}
