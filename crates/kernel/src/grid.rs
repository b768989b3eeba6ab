//! Uniform-grid cell addressing for the spatial-hash neighbor search.
//!
//! Particles are bucketed by flattened cell index (`x + y*gx + z*gx*gy`);
//! after sorting `(hash, index)` pairs, per-cell start/end offsets delimit each
//! bucket so that the 27 cells around a particle hold every candidate within
//! one cell width.

use crate::params::SimParams;

/// Marks a cell with no particles in the cell start/end arrays.
pub const EMPTY_CELL: u32 = u32::MAX;

/// Cell geometry taken from [`SimParams`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformGrid {
    origin: [f32; 3],
    cell_size: [f32; 3],
    dims: [u32; 3],
}

impl UniformGrid {
    /// Grid described by `params`.
    pub fn new(params: &SimParams) -> Self {
        Self {
            origin: params.grid_origin,
            cell_size: params.cell_size,
            dims: params.grid_size,
        }
    }

    /// Map a world-space position to a cell, clamped to grid bounds.
    #[inline]
    pub fn pos_to_cell(&self, p: [f32; 3]) -> [u32; 3] {
        let mut cell = [0u32; 3];
        for axis in 0..3 {
            cell[axis] = ((p[axis] - self.origin[axis]) / self.cell_size[axis])
                .floor()
                .max(0.0)
                .min((self.dims[axis] - 1) as f32) as u32;
        }
        cell
    }

    /// Flat cell index.
    #[inline]
    pub fn cell_hash(&self, cell: [u32; 3]) -> u32 {
        cell[0] + cell[1] * self.dims[0] + cell[2] * self.dims[0] * self.dims[1]
    }

    /// Flat cell index of a position.
    #[inline]
    pub fn hash_position(&self, p: [f32; 3]) -> u32 {
        self.cell_hash(self.pos_to_cell(p))
    }

    /// Call `f` with the flat index of every cell in the 3x3x3 block around
    /// `cell`, skipping cells outside the grid. Order is z, then y, then x.
    pub fn for_each_neighbor_cell<F>(&self, cell: [u32; 3], mut f: F)
    where
        F: FnMut(u32),
    {
        for dz in -1i64..=1 {
            let nz = cell[2] as i64 + dz;
            if nz < 0 || nz >= self.dims[2] as i64 {
                continue;
            }
            for dy in -1i64..=1 {
                let ny = cell[1] as i64 + dy;
                if ny < 0 || ny >= self.dims[1] as i64 {
                    continue;
                }
                for dx in -1i64..=1 {
                    let nx = cell[0] as i64 + dx;
                    if nx < 0 || nx >= self.dims[0] as i64 {
                        continue;
                    }
                    f(self.cell_hash([nx as u32, ny as u32, nz as u32]));
                }
            }
        }
    }
}
