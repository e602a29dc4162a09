//! The short-range part of the Ewald split: erfc-screened Coulomb pairs within the cutoff,
//! under the minimum image convention.

use lin_alg::f64::Vec3;
use rayon::prelude::*;
use statrs::function::erf::erfc;

use crate::{
    ambient::{SimBox, Virial, add_virial, outer},
    error::P3mError,
    neighbors::CellList,
    particles::Particles,
};

const SQRT_PI: f64 = 1.7724538509055159;

/// Force on i from j, without the prefactor. `dir` points from j to i.
pub fn force_coulomb_ewald_real(dir: Vec3, r: f64, qi: f64, qj: f64, alpha: f64) -> Vec3 {
    // F = q_i q_j [ erfc(αr)/r² + 2α/√π · e^(−α²r²)/r ] · r̂
    let qfac = qi * qj;
    let inv_r = 1.0 / r;
    let inv_r2 = inv_r * inv_r;

    let erfc_term = erfc(alpha * r);
    let exp_term = (-alpha * alpha * r * r).exp();
    let force_mag = qfac * (erfc_term * inv_r2 + 2.0 * alpha * exp_term / (SQRT_PI * r));

    dir * force_mag
}

pub fn energy_coulomb_ewald_real(r: f64, qi: f64, qj: f64, alpha: f64) -> f64 {
    qi * qj * erfc(alpha * r) / r
}

#[derive(Clone, Debug, Default)]
pub struct RealSpaceOutput {
    pub forces: Vec<Vec3>,
    pub energy: f64,
    pub virial: Virial,
}

#[derive(Clone, Copy, Debug)]
pub struct RealSpaceSolver {
    pub alpha: f64,
    pub r_cut: f64,
    pub cell: SimBox,
}

impl RealSpaceSolver {
    pub fn new(alpha: f64, r_cut: f64, cell: &SimBox) -> Result<Self, P3mError> {
        cell.validate()?;
        cell.check_cutoff(r_cut)?;

        Ok(Self {
            alpha,
            r_cut,
            cell: *cell,
        })
    }

    pub fn compute(
        &self,
        particles: &Particles,
        prefactor: f64,
    ) -> Result<RealSpaceOutput, P3mError> {
        let posits = particles.posits;
        let charges = particles.charges;
        let r_cut_sq = self.r_cut * self.r_cut;

        if charges.iter().all(|q| *q == 0.) {
            return Ok(RealSpaceOutput {
                forces: vec![Vec3::new_zero(); posits.len()],
                ..Default::default()
            });
        }

        let cells = CellList::build(posits, &self.cell, self.r_cut);

        // Each particle sums over its own partners, so every pair is visited twice: once
        // from each side. The per-particle sums are independent, and their order is fixed.
        let per_particle: Vec<Result<(Vec3, f64, Virial), P3mError>> = (0..posits.len())
            .into_par_iter()
            .map(|i| {
                let qi = charges[i];
                let mut f = Vec3::new_zero();
                let mut e = 0.;
                let mut w = [[0.; 3]; 3];

                if qi == 0. {
                    return Ok((f, e, w));
                }

                for j in cells.candidates(i) {
                    let qj = charges[j];
                    if j == i || qj == 0. {
                        continue;
                    }

                    let diff = self.cell.min_image(posits[i] - posits[j]);
                    let r_sq = diff.magnitude_squared();
                    if r_sq >= r_cut_sq {
                        continue;
                    }
                    if r_sq == 0. {
                        return Err(P3mError::InvalidInput(format!(
                            "particles {i} and {j} are at the same position"
                        )));
                    }

                    let r = r_sq.sqrt();
                    let dir = diff / r;

                    let f_ij = force_coulomb_ewald_real(dir, r, qi, qj, self.alpha);
                    f += f_ij;
                    e += 0.5 * energy_coulomb_ewald_real(r, qi, qj, self.alpha);
                    add_virial(&mut w, &outer(diff, f_ij), 0.5);
                }

                Ok((f * prefactor, e * prefactor, w))
            })
            .collect();

        let mut result = RealSpaceOutput {
            forces: Vec::with_capacity(posits.len()),
            ..Default::default()
        };

        for item in per_particle {
            let (f, e, w) = item?;
            result.forces.push(f);
            result.energy += e;
            add_virial(&mut result.virial, &w, prefactor);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    fn random_system(n: usize, l: f64, seed: u64) -> (Vec<Vec3>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let posits = (0..n)
            .map(|_| {
                Vec3::new(
                    rng.random::<f64>() * l,
                    rng.random::<f64>() * l,
                    rng.random::<f64>() * l,
                )
            })
            .collect();
        let charges = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
        (posits, charges)
    }

    #[test]
    fn rejects_cutoff_beyond_half_box() {
        let cell = SimBox::cubic(10.).unwrap();
        assert!(matches!(
            RealSpaceSolver::new(1., 5.5, &cell),
            Err(P3mError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn single_pair() {
        let cell = SimBox::cubic(10.).unwrap();
        let posits = [Vec3::new(4., 5., 5.), Vec3::new(6., 5., 5.)];
        let charges = [1., -1.];
        let alpha = 0.7;
        let solver = RealSpaceSolver::new(alpha, 4., &cell).unwrap();
        let out = solver
            .compute(&Particles::new(&posits, &charges).unwrap(), 2.)
            .unwrap();

        assert_relative_eq!(out.energy, -2. * erfc(2. * alpha) / 2., epsilon = 1e-14);
        // Attractive: the first charge is pulled toward +x.
        assert!(out.forces[0].x > 0.);
        assert_relative_eq!(out.forces[0].x, -out.forces[1].x, epsilon = 1e-14);
        assert_relative_eq!(out.virial[0][0], -2. * out.forces[0].x, epsilon = 1e-14);
        assert_relative_eq!(out.virial[1][1], 0.);
    }

    #[test]
    fn newton_third_law() {
        let cell = SimBox::new([9., 10., 11.]).unwrap();
        let (posits, charges) = random_system(200, 9., 4);
        let solver = RealSpaceSolver::new(0.9, 3.5, &cell).unwrap();
        let out = solver
            .compute(&Particles::new(&posits, &charges).unwrap(), 1.)
            .unwrap();

        let total = out.forces.iter().fold(Vec3::new_zero(), |acc, f| acc + *f);
        assert!(total.magnitude() < 1e-10);
        // The virial of a central pair force is symmetric.
        assert_relative_eq!(out.virial[0][1], out.virial[1][0], epsilon = 1e-10);
    }

    #[test]
    fn uncharged_particles() {
        let cell = SimBox::cubic(10.).unwrap();
        let posits = [Vec3::new(1., 1., 1.), Vec3::new(1., 1., 1.)];
        let charges = [0., 0.];
        let solver = RealSpaceSolver::new(1., 3., &cell).unwrap();
        let out = solver
            .compute(&Particles::new(&posits, &charges).unwrap(), 1.)
            .unwrap();

        assert_eq!(out.forces.len(), 2);
        assert_eq!(out.energy, 0.);
        assert_eq!(out.virial, [[0.; 3]; 3]);

        let empty = solver.compute(&Particles::new(&[], &[]).unwrap(), 1.).unwrap();
        assert!(empty.forces.is_empty());
    }

    #[test]
    fn coincident_particles() {
        let cell = SimBox::cubic(10.).unwrap();
        let posits = [Vec3::new(1., 1., 1.), Vec3::new(1., 1., 1.)];
        let charges = [1., 1.];
        let solver = RealSpaceSolver::new(1., 3., &cell).unwrap();
        assert!(matches!(
            solver.compute(&Particles::new(&posits, &charges).unwrap(), 1.),
            Err(P3mError::InvalidInput(_))
        ));
    }
}
