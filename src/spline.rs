//! Charge assignment: spreading point charges onto the mesh with cardinal B-splines, and
//! the adjoint operation, interpolating a mesh field back to the particles.
//!
//! Both directions use the same precomputed stencils, so gather is exactly the transpose
//! of spread. Any mismatch there shows up as a systematic force bias, not as an error.

use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::{ambient::SimBox, params::MAX_ORDER};

/// Put one mesh‑spaced value into a flat xyz‑indexed Vec
#[inline]
pub fn idx(i: usize, j: usize, k: usize, ny: usize, nz: usize) -> usize {
    (i * ny + j) * nz + k
}

/// Cardinal B-spline values M_p(f + k), k = 0..p, for f ∈ [0, 1). Essmann et al. (1995)
/// recursion. The values sum to 1.
pub fn bspline_weights(f: f64, order: usize, w: &mut [f64; MAX_ORDER]) {
    debug_assert!((1..=MAX_ORDER).contains(&order));

    w.fill(0.);
    w[0] = 1.;

    for n in 2..=order {
        let div = 1. / (n - 1) as f64;
        // Descend so w[k - 1] still holds M_{n-1} when it's read.
        for k in (0..n).rev() {
            let prev_k = if k < n - 1 { w[k] } else { 0. };
            let prev_km1 = if k > 0 { w[k - 1] } else { 0. };
            let x = f + k as f64;
            w[k] = (x * prev_k + (n as f64 - x) * prev_km1) * div;
        }
    }
}

/// The mesh points one particle touches: a p×p×p block starting at `base`, with separable
/// per-axis weights.
#[derive(Clone, Copy, Debug)]
pub struct Stencil {
    pub base: [usize; 3],
    pub weights: [[f64; MAX_ORDER]; 3],
}

impl Stencil {
    fn new(frac: [f64; 3], mesh: [usize; 3], order: usize) -> Self {
        let mut base = [0; 3];
        let mut weights = [[0.; MAX_ORDER]; 3];
        let half = order as f64 / 2.;

        for axis in 0..3 {
            let n = mesh[axis];
            // Position in mesh units; the assignment function is centered on it.
            let u = frac[axis] * n as f64 - half;
            let u_floor = u.floor();
            let f = u - u_floor;

            base[axis] = (u_floor as isize + 1).rem_euclid(n as isize) as usize;

            let mut m = [0.; MAX_ORDER];
            bspline_weights(f, order, &mut m);
            // The first node in the block is the farthest to the left of the particle.
            for j in 0..order {
                weights[axis][j] = m[order - 1 - j];
            }
        }

        Self { base, weights }
    }
}

/// Stencils for every particle, for one mesh and order. Build once per evaluation, then
/// spread and gather with it.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub mesh: [usize; 3],
    pub order: usize,
    pub stencils: Vec<Stencil>,
}

impl Assignment {
    pub fn new(posits: &[Vec3], cell: &SimBox, mesh: [usize; 3], order: usize) -> Self {
        let stencils = posits
            .par_iter()
            .map(|p| Stencil::new(cell.fractional(*p), mesh, order))
            .collect();

        Self {
            mesh,
            order,
            stencils,
        }
    }

    /// Visit each (mesh index, weight) pair of one stencil.
    #[inline]
    fn for_each_node(&self, st: &Stencil, mut f: impl FnMut(usize, f64)) {
        let [nx, ny, nz] = self.mesh;
        let p = self.order;

        for dx in 0..p {
            let ix = (st.base[0] + dx) % nx;
            let wx = st.weights[0][dx];
            for dy in 0..p {
                let iy = (st.base[1] + dy) % ny;
                let wxy = wx * st.weights[1][dy];
                for dz in 0..p {
                    let iz = (st.base[2] + dz) % nz;
                    f(idx(ix, iy, iz, ny, nz), wxy * st.weights[2][dz]);
                }
            }
        }
    }

    /// Charge on each mesh point. Sums to the total particle charge.
    pub fn spread(&self, charges: &[f64]) -> Vec<f64> {
        let mut rho = vec![0.; self.mesh.iter().product()];

        // Sequential, so the result doesn't depend on thread scheduling.
        for (st, &q) in self.stencils.iter().zip(charges) {
            if q == 0. {
                continue;
            }
            self.for_each_node(st, |i, w| rho[i] += q * w);
        }

        rho
    }

    /// Interpolate a scalar mesh field at each particle.
    pub fn gather(&self, field: &[f64]) -> Vec<f64> {
        self.stencils
            .par_iter()
            .map(|st| {
                let mut v = 0.;
                self.for_each_node(st, |i, w| v += w * field[i]);
                v
            })
            .collect()
    }

    /// Interpolate a vector mesh field, stored one component per mesh, at each particle.
    pub fn gather_vec(&self, field: [&[f64]; 3]) -> Vec<Vec3> {
        self.stencils
            .par_iter()
            .map(|st| {
                let mut v = Vec3::new_zero();
                self.for_each_node(st, |i, w| {
                    v.x += w * field[0][i];
                    v.y += w * field[1][i];
                    v.z += w * field[2][i];
                });
                v
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn weights_partition_unity() {
        for order in 1..=MAX_ORDER {
            for f in [0., 0.1, 0.37, 0.5, 0.99] {
                let mut w = [0.; MAX_ORDER];
                bspline_weights(f, order, &mut w);
                let sum: f64 = w.iter().sum();
                assert_relative_eq!(sum, 1., epsilon = 1e-14);
                assert!(w.iter().all(|v| *v >= 0.));
            }
        }
    }

    #[test]
    fn order_4_matches_closed_form() {
        // Cubic B-spline, as in the classic SPME 4th order weights.
        let x: f64 = 0.3;
        let mut w = [0.; MAX_ORDER];
        bspline_weights(x, 4, &mut w);

        let xm1 = 1.0 - x;
        assert_relative_eq!(w[3], xm1.powi(3) / 6., epsilon = 1e-14);
        assert_relative_eq!(
            w[2],
            (3.0 * x.powi(3) - 6.0 * x.powi(2) + 4.0) / 6.,
            epsilon = 1e-14
        );
        assert_relative_eq!(
            w[1],
            (-3.0 * x.powi(3) + 3.0 * x.powi(2) + 3.0 * x + 1.0) / 6.,
            epsilon = 1e-14
        );
        assert_relative_eq!(w[0], x.powi(3) / 6., epsilon = 1e-14);
    }

    #[test]
    fn cic_stencil() {
        let cell = SimBox::cubic(8.).unwrap();
        // Mesh spacing 1; particle at 2.25 along x.
        let a = Assignment::new(&[Vec3::new(2.25, 0., 7.5)], &cell, [8, 8, 8], 2);
        let st = &a.stencils[0];
        assert_eq!(st.base[0], 2);
        assert_relative_eq!(st.weights[0][0], 0.75);
        assert_relative_eq!(st.weights[0][1], 0.25);
        // Wraps around the periodic boundary.
        assert_eq!(st.base[2], 7);
        assert_relative_eq!(st.weights[2][0], 0.5);
    }

    fn random_system(n: usize, cell: &SimBox, seed: u64) -> (Vec<Vec3>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let l = cell.lengths();
        let posits = (0..n)
            .map(|_| {
                Vec3::new(
                    rng.random::<f64>() * l[0],
                    rng.random::<f64>() * l[1],
                    rng.random::<f64>() * l[2],
                )
            })
            .collect();
        let charges = (0..n).map(|_| rng.random_range(-2.0..2.0)).collect();
        (posits, charges)
    }

    #[test]
    fn spread_conserves_charge() {
        let cell = SimBox::new([10., 7., 12.]).unwrap();
        let (posits, charges) = random_system(50, &cell, 7);
        let total: f64 = charges.iter().sum();

        for order in 1..=MAX_ORDER {
            let a = Assignment::new(&posits, &cell, [12, 9, 15], order);
            let rho = a.spread(&charges);
            assert_relative_eq!(rho.iter().sum::<f64>(), total, epsilon = 1e-11);
        }
    }

    #[test]
    fn gather_is_adjoint_of_spread() {
        let cell = SimBox::cubic(6.).unwrap();
        let (posits, charges) = random_system(20, &cell, 11);
        let mesh = [8, 10, 6];
        let mut rng = StdRng::seed_from_u64(3);
        let field: Vec<f64> = (0..480).map(|_| rng.random_range(-1.0..1.0)).collect();

        for order in [1, 3, 4, 7] {
            let a = Assignment::new(&posits, &cell, mesh, order);
            let rho = a.spread(&charges);
            let lhs: f64 = rho.iter().zip(&field).map(|(r, f)| r * f).sum();

            let at_particles = a.gather(&field);
            let rhs: f64 = at_particles.iter().zip(&charges).map(|(v, q)| v * q).sum();

            assert_relative_eq!(lhs, rhs, epsilon = 1e-11);
        }
    }

    #[test]
    fn gather_constant_field() {
        let cell = SimBox::cubic(5.).unwrap();
        let (posits, _) = random_system(10, &cell, 2);
        let a = Assignment::new(&posits, &cell, [8, 8, 8], 5);
        let ones = vec![1.; 512];
        let twos = vec![2.; 512];
        let zeros = vec![0.; 512];

        for v in a.gather(&ones) {
            assert_relative_eq!(v, 1., epsilon = 1e-13);
        }
        for v in a.gather_vec([&ones, &twos, &zeros]) {
            assert_relative_eq!(v.y, 2., epsilon = 1e-13);
            assert_relative_eq!(v.z, 0.);
        }
    }
}
