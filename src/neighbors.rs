//! Linked cells for the real-space pair search. Cells are at least `r_cut` on a side, so
//! every partner within the cutoff is in the particle's own cell or one of its 26 neighbours.
//! Neighbour cells are derived from the cell coordinates on each query; nothing per cell is
//! stored besides the bin offsets.

use itertools::iproduct;
use lin_alg::f64::Vec3;

use crate::ambient::SimBox;

/// Particles binned into a periodic grid of cells. Indices within each cell are ascending,
/// so iteration order is fixed for a given input.
#[derive(Clone, Debug)]
pub struct CellList {
    pub n_cells: [usize; 3],
    /// `cell_start[c]..cell_start[c + 1]` indexes `sorted_indices` for cell c.
    pub cell_start: Vec<usize>,
    pub sorted_indices: Vec<usize>,
    /// The cell each particle is in.
    pub cell_of: Vec<usize>,
}

impl CellList {
    /// The grid has at most about one cell per particle; in dilute systems, cells are larger
    /// than `r_cut`.
    pub fn build(posits: &[Vec3], cell: &SimBox, r_cut: f64) -> Self {
        let l = cell.lengths();
        let max_per_axis = ((posits.len() as f64).cbrt().ceil() as usize).max(1);
        let n_cells = l.map(|len| ((len / r_cut).floor() as usize).clamp(1, max_per_axis));
        let n_cells_total = n_cells[0] * n_cells[1] * n_cells[2];

        let cell_of: Vec<usize> = posits
            .iter()
            .map(|p| {
                let f = cell.fractional(*p);
                let c = [0, 1, 2]
                    .map(|a| ((f[a] * n_cells[a] as f64) as usize).min(n_cells[a] - 1));
                cell_id(c, n_cells)
            })
            .collect();

        // Counting sort; stable, so indices within a cell stay ascending.
        let mut cell_start = vec![0; n_cells_total + 1];
        for &c in &cell_of {
            cell_start[c + 1] += 1;
        }
        for c in 0..n_cells_total {
            cell_start[c + 1] += cell_start[c];
        }

        let mut fill = cell_start.clone();
        let mut sorted_indices = vec![0; posits.len()];
        for (i, &c) in cell_of.iter().enumerate() {
            sorted_indices[fill[c]] = i;
            fill[c] += 1;
        }

        Self {
            n_cells,
            cell_start,
            sorted_indices,
            cell_of,
        }
    }

    pub fn particles_in(&self, c: usize) -> &[usize] {
        &self.sorted_indices[self.cell_start[c]..self.cell_start[c + 1]]
    }

    /// Cell `c` and its neighbours, ascending and without duplicates; the first `len` entries
    /// are valid. With fewer than three cells along an axis, the -1 and +1 neighbours are the
    /// same cell.
    pub fn neighbor_cells(&self, c: usize) -> ([usize; 27], usize) {
        let [cx, cy, cz] = cell_coords(c, self.n_cells);
        let n = self.n_cells;

        let mut cells = [0; 27];
        let offsets = iproduct!(-1_isize..=1, -1..=1, -1..=1);
        for (slot, (dx, dy, dz)) in cells.iter_mut().zip(offsets) {
            *slot = cell_id(
                [
                    wrap_cell(cx, dx, n[0]),
                    wrap_cell(cy, dy, n[1]),
                    wrap_cell(cz, dz, n[2]),
                ],
                n,
            );
        }
        cells.sort_unstable();

        let mut len = 0;
        for i in 0..cells.len() {
            if len == 0 || cells[i] != cells[len - 1] {
                cells[len] = cells[i];
                len += 1;
            }
        }

        (cells, len)
    }

    /// Candidate partners of particle `i` (including `i` itself), in a fixed order. The
    /// caller applies the distance check.
    pub fn candidates(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        let (cells, len) = self.neighbor_cells(self.cell_of[i]);

        cells
            .into_iter()
            .take(len)
            .flat_map(move |c| self.particles_in(c).iter().copied())
    }
}

#[inline]
fn cell_id(c: [usize; 3], n: [usize; 3]) -> usize {
    (c[0] * n[1] + c[1]) * n[2] + c[2]
}

#[inline]
fn cell_coords(id: usize, n: [usize; 3]) -> [usize; 3] {
    [id / (n[1] * n[2]), (id / n[2]) % n[1], id % n[2]]
}

#[inline]
fn wrap_cell(c: usize, d: isize, n: usize) -> usize {
    (c as isize + d).rem_euclid(n as isize) as usize
}
