//! The optimal influence function of Hockney and Eastwood: the reciprocal-space Green's
//! function corrected for the aliasing the charge assignment introduces.
//!
//! G_opt(k) = Σ_m Û²(k_m) (D(k)·k_m) R(k_m) / (|D(k)|² (Σ_m Û²(k_m))²)
//!
//! With Û the Fourier transform of the assignment function, k_m = k + 2πm/h the aliases of k,
//! and R(q) = 4π/q² exp(-q²/4α²) the reference force kernel. The denominator sums have closed
//! forms; the numerator is truncated to the nearest aliases.

use std::f64::consts::{PI, TAU};

use itertools::iproduct;
use rayon::prelude::*;

use crate::{
    ambient::SimBox,
    diff::Differentiator,
    fft::freq,
    params::{EwaldParams, MAX_ORDER},
    spline::idx,
};

/// Aliases per axis in the numerator: m ∈ -ALIAS..=ALIAS.
const ALIAS: isize = 1;
const N_ALIAS: usize = (2 * ALIAS + 1) as usize;

/// Σ_m sinc^{2p}(π(n/N + m)) for all integers m, in closed form. `c` is cos²(π n/N).
pub fn alias_sum(order: usize, c: f64) -> f64 {
    match order {
        1 => 1.,
        2 => (1. + c * 2.) / 3.,
        3 => (2. + c * (11. + c * 2.)) / 15.,
        4 => (17. + c * (180. + c * (114. + c * 4.))) / 315.,
        5 => (62. + c * (1072. + c * (1452. + c * (247. + c * 2.)))) / 2835.,
        6 => (1382. + c * (35396. + c * (83021. + c * (34096. + c * (2026. + c * 4.))))) / 155925.,
        7 => {
            (21844.
                + c * (776661.
                    + c * (2801040. + c * (2123860. + c * (349500. + c * (8166. + c * 4.))))))
                / 6081075.
        }
        _ => unreachable!("assignment order is validated to 1..={MAX_ORDER}"),
    }
}

#[inline]
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 { 1. } else { x.sin() / x }
}

/// Per-axis factors of the alias sums for one mesh index.
#[derive(Clone, Copy, Debug, Default)]
struct AxisMode {
    /// Û² of each alias, along this axis.
    u2: [f64; N_ALIAS],
    /// Wave vector component of each alias.
    k: [f64; N_ALIAS],
    /// Σ over all aliases of Û², along this axis.
    denom: f64,
}

fn axis_modes(n: usize, l: f64, order: usize) -> Vec<AxisMode> {
    (0..n)
        .map(|i| {
            let f = freq(i, n) as f64;
            let mut mode = AxisMode::default();

            for (slot, m) in (-ALIAS..=ALIAS).enumerate() {
                let shifted = f + (m * n as isize) as f64;
                mode.u2[slot] = sinc(PI * shifted / n as f64).powi(2 * order as i32);
                mode.k[slot] = TAU * shifted / l;
            }

            let c = (PI * f / n as f64).cos().powi(2);
            mode.denom = alias_sum(order, c);
            mode
        })
        .collect()
}

#[inline]
fn reference_kernel(q2: f64, alpha: f64) -> f64 {
    4. * PI / q2 * (-q2 / (4. * alpha * alpha)).exp()
}

/// Influence functions for one parameter set and box. Immutable once built; shared across
/// force evaluations behind an `Arc`.
#[derive(Clone, Debug)]
pub struct InfluenceFunction {
    pub mesh: [usize; 3],
    /// Optimised for the energy (potential) at the particles.
    pub energy: Vec<f64>,
    /// Optimised for the forces, given the differentiation operator.
    pub force: Vec<f64>,
}

impl InfluenceFunction {
    pub fn new(params: &EwaldParams, cell: &SimBox, diff: &Differentiator) -> Self {
        let [nx, ny, nz] = params.mesh;
        let l = cell.lengths();
        let alpha = params.alpha;

        let modes = [
            axis_modes(nx, l[0], params.order),
            axis_modes(ny, l[1], params.order),
            axis_modes(nz, l[2], params.order),
        ];

        let values: Vec<(f64, f64)> = (0..nx * ny * nz)
            .into_par_iter()
            .map(|flat| {
                let i = flat / (ny * nz);
                let j = (flat / nz) % ny;
                let k = flat % nz;

                // The zero mode is the net charge; it's handled as a separate correction.
                if i == 0 && j == 0 && k == 0 {
                    return (0., 0.);
                }

                let (mx, my, mz) = (&modes[0][i], &modes[1][j], &modes[2][k]);
                let d = [
                    diff.operator[0][i],
                    diff.operator[1][j],
                    diff.operator[2][k],
                ];
                let d2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];

                let mut num_energy = 0.;
                let mut num_force = 0.;

                for (a, b, c) in iproduct!(0..N_ALIAS, 0..N_ALIAS, 0..N_ALIAS) {
                    let u2 = mx.u2[a] * my.u2[b] * mz.u2[c];
                    if u2 == 0. {
                        continue;
                    }
                    let q = [mx.k[a], my.k[b], mz.k[c]];
                    let q2 = q[0] * q[0] + q[1] * q[1] + q[2] * q[2];

                    let g = u2 * reference_kernel(q2, alpha);
                    num_energy += g;
                    num_force += g * (d[0] * q[0] + d[1] * q[1] + d[2] * q[2]);
                }

                let denom = (mx.denom * my.denom * mz.denom).powi(2);

                let energy = num_energy / denom;
                let force = if d2 == 0. { 0. } else { num_force / (d2 * denom) };
                (energy, force)
            })
            .collect();

        let (energy, force) = values.into_iter().unzip();

        Self {
            mesh: params.mesh,
            energy,
            force,
        }
    }

    pub fn at(&self, i: usize, j: usize, k: usize) -> (f64, f64) {
        let n = idx(i, j, k, self.mesh[1], self.mesh[2]);
        (self.energy[n], self.force[n])
    }
}
