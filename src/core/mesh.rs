//! Hexagonal mesh topology.
//!
//! A mesh is an immutable set of cells. Each cell knows its centre and up to six
//! neighbours, one per lattice direction. Cells on the edge of the domain have
//! some neighbours missing; the finite-difference operators treat a missing
//! neighbour as the cell itself (zero-flux boundary).
//!
//! Building meshes from an arbitrary boundary curve is left to callers. The
//! [`HexMesh::hexagon`] constructor covers the regular lattice used by tests,
//! benches and the demo binary.

use hashbrown::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::Real;

pub type CellId = usize;

/// The six lattice directions, 60 degrees apart, starting along +x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    E = 0,
    NE = 1,
    NW = 2,
    W = 3,
    SW = 4,
    SE = 5,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::E,
        Direction::NE,
        Direction::NW,
        Direction::W,
        Direction::SW,
        Direction::SE,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn opposite(self) -> Direction {
        Direction::ALL[(self.index() + 3) % 6]
    }

    /// Unit vector pointing from a cell centre to its neighbour in this direction.
    #[inline]
    pub fn unit(self) -> (Real, Real) {
        UNIT_VECTORS[self.index()]
    }
}

const HALF_SQRT3: Real = 0.866_025_403_784_438_6;

/// Unit vectors indexed by `Direction as usize`.
pub const UNIT_VECTORS: [(Real, Real); 6] = [
    (1.0, 0.0),
    (0.5, HALF_SQRT3),
    (-0.5, HALF_SQRT3),
    (-1.0, 0.0),
    (-0.5, -HALF_SQRT3),
    (0.5, -HALF_SQRT3),
];

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cell {
    pub x: Real,
    pub y: Real,
    /// Neighbour per direction, `None` where the domain ends.
    pub neighbours: [Option<CellId>; 6],
    pub boundary: bool,
}

impl Cell {
    pub fn new(x: Real, y: Real) -> Self {
        Self {
            x,
            y,
            neighbours: [None; 6],
            boundary: false,
        }
    }
}

/// Validated, immutable mesh.
///
/// Besides the cells themselves, the mesh keeps a dense neighbour table in which
/// every missing neighbour has already been replaced by the cell's own index, so
/// the stencil loops never branch on the boundary.
#[derive(Debug, Clone)]
pub struct HexMesh {
    spacing: Real,
    cells: Vec<Cell>,
    stencil: Vec<[CellId; 6]>,
}

impl HexMesh {
    /// Validate `cells` and build the mesh.
    ///
    /// Every neighbour index must be in range, no cell may be its own neighbour,
    /// and links must be reciprocal: if `b` is the E neighbour of `a` then `a` is
    /// the W neighbour of `b`.
    pub fn new(spacing: Real, cells: Vec<Cell>) -> Result<Self, MeshError> {
        if cells.is_empty() {
            return Err(MeshError::Empty);
        }
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(MeshError::BadSpacing(spacing));
        }

        let len = cells.len();
        for (h, cell) in cells.iter().enumerate() {
            if !(cell.x.is_finite() && cell.y.is_finite()) {
                return Err(MeshError::BadPosition { cell: h });
            }
            for dir in Direction::ALL {
                let Some(nb) = cell.neighbours[dir.index()] else {
                    continue;
                };
                if nb >= len {
                    return Err(MeshError::DanglingNeighbour {
                        cell: h,
                        neighbour: nb,
                        len,
                    });
                }
                if nb == h {
                    return Err(MeshError::SelfNeighbour { cell: h });
                }
                if cells[nb].neighbours[dir.opposite().index()] != Some(h) {
                    return Err(MeshError::NotReciprocal {
                        cell: h,
                        neighbour: nb,
                        direction: dir.index(),
                    });
                }
            }
        }

        let stencil = cells
            .iter()
            .enumerate()
            .map(|(h, cell)| {
                let mut row = [h; 6];
                for (slot, nb) in row.iter_mut().zip(cell.neighbours.iter()) {
                    if let Some(nb) = nb {
                        *slot = *nb;
                    }
                }
                row
            })
            .collect();

        Ok(Self {
            spacing,
            cells,
            stencil,
        })
    }

    /// Regular hexagon of `rings` rings around a central cell.
    ///
    /// Cells are laid out on an axial lattice `(q, r)` with centre
    /// `(d (q + r/2), d r sqrt(3)/2)`. A cell belongs to the mesh when
    /// `max(|q|, |r|, |q + r|) <= rings`; the outermost ring is flagged as boundary.
    /// The layout is symmetric under `x -> -x`.
    pub fn hexagon(rings: u32, spacing: Real) -> Result<Self, MeshError> {
        const OFFSETS: [(i32, i32); 6] = [(1, 0), (0, 1), (-1, 1), (-1, 0), (0, -1), (1, -1)];

        let radius = rings as i32;
        let ring_of = |q: i32, r: i32| q.abs().max(r.abs()).max((q + r).abs());

        let mut index: HashMap<(i32, i32), CellId> = HashMap::new();
        let mut axial = Vec::new();
        for r in -radius..=radius {
            for q in -radius..=radius {
                if ring_of(q, r) <= radius {
                    index.insert((q, r), axial.len());
                    axial.push((q, r));
                }
            }
        }

        let cells = axial
            .iter()
            .map(|&(q, r)| {
                let mut cell = Cell::new(
                    spacing * (q as Real + 0.5 * r as Real),
                    spacing * r as Real * HALF_SQRT3,
                );
                for (k, (dq, dr)) in OFFSETS.iter().enumerate() {
                    cell.neighbours[k] = index.get(&(q + dq, r + dr)).copied();
                }
                cell.boundary = ring_of(q, r) == radius;
                cell
            })
            .collect();

        Self::new(spacing, cells)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Centre-to-centre distance `d`.
    #[inline]
    pub fn spacing(&self) -> Real {
        self.spacing
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, h: CellId) -> Option<&Cell> {
        self.cells.get(h)
    }

    #[inline]
    pub fn position(&self, h: CellId) -> (Real, Real) {
        let c = &self.cells[h];
        (c.x, c.y)
    }

    #[inline]
    pub fn is_boundary(&self, h: CellId) -> bool {
        self.cells[h].boundary
    }

    /// Neighbour of `h` in `dir`, or `None` at the domain edge.
    #[inline]
    pub fn neighbour(&self, h: CellId, dir: Direction) -> Option<CellId> {
        self.cells[h].neighbours[dir.index()]
    }

    /// Neighbour table with boundary substitution applied.
    #[inline]
    pub fn stencil(&self) -> &[[CellId; 6]] {
        &self.stencil
    }

    /// Distance from each cell centre to the nearest boundary cell centre.
    ///
    /// Boundary cells are at distance zero. A mesh without boundary cells
    /// reports infinity everywhere.
    pub fn boundary_distance(&self) -> Vec<Real> {
        let edge: Vec<(Real, Real)> = self
            .cells
            .iter()
            .filter(|c| c.boundary)
            .map(|c| (c.x, c.y))
            .collect();
        self.cells
            .iter()
            .map(|c| {
                edge.iter()
                    .map(|&(x, y)| (c.x - x).powi(2) + (c.y - y).powi(2))
                    .fold(Real::INFINITY, Real::min)
                    .sqrt()
            })
            .collect()
    }

    /// Cell whose centre is closest to `(x, y)`.
    pub fn nearest(&self, x: Real, y: Real) -> CellId {
        let mut best = 0;
        let mut best_d2 = Real::INFINITY;
        for (h, c) in self.cells.iter().enumerate() {
            let d2 = (c.x - x).powi(2) + (c.y - y).powi(2);
            if d2 < best_d2 {
                best = h;
                best_d2 = d2;
            }
        }
        best
    }
}
