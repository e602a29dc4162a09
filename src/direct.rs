//! A plain Ewald sum, with no mesh: explicit periodic images in real space, and an explicit
//! sum over wave vectors in reciprocal space. O(N²) and O(N K³), so only for small systems,
//! where it serves as the reference the mesh solver is checked against.

use std::f64::consts::{PI, TAU};

use itertools::iproduct;
use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::{
    ambient::SimBox,
    error::P3mError,
    particles::Particles,
    real_space::{energy_coulomb_ewald_real, force_coulomb_ewald_real},
    recip::{neutralization_energy, self_energy},
};

#[derive(Clone, Debug, Default)]
pub struct DirectOutput {
    pub forces: Vec<Vec3>,
    pub energy: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct DirectEwald {
    pub alpha: f64,
    /// Real-space cutoff. May exceed half the box; images are enumerated explicitly.
    pub r_max: f64,
    /// Highest wave vector index along each axis.
    pub k_max: [i32; 3],
    pub cell: SimBox,
}

impl DirectEwald {
    pub fn new(alpha: f64, r_max: f64, k_max: [i32; 3], cell: &SimBox) -> Self {
        Self {
            alpha,
            r_max,
            k_max,
            cell: *cell,
        }
    }

    /// Parameters where both truncations are below `tol`, relative to the pair terms.
    pub fn converged(cell: &SimBox, tol: f64) -> Self {
        let neg_ln = -tol.ln();
        let r_max = cell.max_cutoff();
        let alpha = neg_ln.sqrt() / r_max;

        let l = cell.lengths();
        let k_max = l.map(|len| (alpha * len * neg_ln.sqrt() / PI).ceil() as i32);

        Self::new(alpha, r_max, k_max, cell)
    }

    /// Real-space term over all images within `r_max`, including a particle's own images.
    pub fn real_space(
        &self,
        particles: &Particles,
        prefactor: f64,
    ) -> Result<DirectOutput, P3mError> {
        let posits = particles.posits;
        let charges = particles.charges;
        let l = self.cell.lengths();
        let n_img = l.map(|len| (self.r_max / len).ceil() as i32);
        let r_max_sq = self.r_max * self.r_max;

        let per_particle: Vec<Result<(Vec3, f64), P3mError>> = (0..posits.len())
            .into_par_iter()
            .map(|i| {
                let mut f = Vec3::new_zero();
                let mut e = 0.;

                for j in 0..posits.len() {
                    let diff0 = self.cell.min_image(posits[i] - posits[j]);

                    for (a, b, c) in iproduct!(
                        -n_img[0]..=n_img[0],
                        -n_img[1]..=n_img[1],
                        -n_img[2]..=n_img[2]
                    ) {
                        if i == j && a == 0 && b == 0 && c == 0 {
                            continue;
                        }
                        let shift = Vec3::new(a as f64 * l[0], b as f64 * l[1], c as f64 * l[2]);
                        let diff = diff0 + shift;
                        let r_sq = diff.magnitude_squared();
                        if r_sq >= r_max_sq {
                            continue;
                        }
                        if r_sq == 0. {
                            return Err(P3mError::InvalidInput(format!(
                                "particles {i} and {j} are at the same position"
                            )));
                        }

                        let r = r_sq.sqrt();
                        let (qi, qj) = (charges[i], charges[j]);
                        f += force_coulomb_ewald_real(diff / r, r, qi, qj, self.alpha);
                        e += 0.5 * energy_coulomb_ewald_real(r, qi, qj, self.alpha);
                    }
                }

                Ok((f * prefactor, e * prefactor))
            })
            .collect();

        let mut result = DirectOutput::default();
        for item in per_particle {
            let (f, e) = item?;
            result.forces.push(f);
            result.energy += e;
        }
        Ok(result)
    }

    /// Reciprocal-space term, summed over half of k-space; k and -k contribute equally.
    pub fn reciprocal(&self, particles: &Particles, prefactor: f64) -> DirectOutput {
        let posits = particles.posits;
        let charges = particles.charges;
        let l = self.cell.lengths();
        let vol = self.cell.volume();
        let [kx, ky, kz] = self.k_max;
        let four_a2 = 4. * self.alpha * self.alpha;

        let half_space: Vec<Vec3> = iproduct!(0..=kx, -ky..=ky, -kz..=kz)
            .filter(|&(a, b, c)| a > 0 || (a == 0 && (b > 0 || (b == 0 && c > 0))))
            .map(|(a, b, c)| {
                Vec3::new(
                    TAU * a as f64 / l[0],
                    TAU * b as f64 / l[1],
                    TAU * c as f64 / l[2],
                )
            })
            .collect();

        let mut energy = 0.;
        let mut forces = vec![Vec3::new_zero(); posits.len()];

        for k in half_space {
            let k2 = k.magnitude_squared();
            let g = 4. * PI / k2 * (-k2 / four_a2).exp();

            // Structure factor S(k) = Σ q exp(ik·r)
            let (mut s_re, mut s_im) = (0., 0.);
            for (p, q) in posits.iter().zip(charges) {
                let phase = k.dot(*p);
                s_re += q * phase.cos();
                s_im += q * phase.sin();
            }

            energy += g * (s_re * s_re + s_im * s_im);

            for (i, (p, q)) in posits.iter().zip(charges).enumerate() {
                let phase = k.dot(*p);
                // Im(exp(ik·r_i) conj(S))
                let im = phase.sin() * s_re - phase.cos() * s_im;
                forces[i] += k * (2. * g * q * im);
            }
        }

        let scale = prefactor / vol;
        DirectOutput {
            forces: forces.into_iter().map(|f| f * scale).collect(),
            energy: energy * scale,
        }
    }

    /// The full Ewald sum: both terms, the self energy, and the net-charge correction.
    pub fn compute(
        &self,
        particles: &Particles,
        prefactor: f64,
    ) -> Result<DirectOutput, P3mError> {
        let real = self.real_space(particles, prefactor)?;
        let recip = self.reciprocal(particles, prefactor);
        let summary = particles.summary();

        let energy = real.energy
            + recip.energy
            + self_energy(self.alpha, summary.sum_q2, prefactor)
            + neutralization_energy(self.alpha, summary.net_charge, self.cell.volume(), prefactor);

        let forces = real
            .forces
            .into_iter()
            .zip(recip.forces)
            .map(|(a, b)| a + b)
            .collect();

        Ok(DirectOutput { forces, energy })
    }
}
