//! The reciprocal-space (mesh) part of the Ewald sum.
//!
//! Spread charges, transform, multiply by the influence function, differentiate, transform
//! back, then interpolate the field at each particle. Energy and virial are sums over the
//! transformed density alone, and need no inverse transform.

use std::{
    f64::consts::{PI, TAU},
    sync::Arc,
};

use itertools::iproduct;
use lin_alg::f64::Vec3;
use rustfft::num_complex::Complex;

use crate::{
    ambient::{SimBox, Virial},
    diff::Differentiator,
    error::P3mError,
    fft::{RustFftBackend, Transform3d, freq},
    influence::InfluenceFunction,
    params::EwaldParams,
    particles::Particles,
    spline::{Assignment, idx},
};

const SQRT_PI: f64 = 1.7724538509055159;

#[derive(Clone, Debug, Default)]
pub struct ReciprocalOutput {
    pub forces: Vec<Vec3>,
    /// Mesh energy only; the self and net-charge terms are separate.
    pub energy: f64,
    pub virial: Virial,
}

/// Mesh machinery for one parameter set and box: transform plans, differentiation
/// operator, and influence function. Build once, evaluate many times.
pub struct ReciprocalSolver {
    pub params: EwaldParams,
    pub cell: SimBox,
    diff: Differentiator,
    influence: Arc<InfluenceFunction>,
    fft: Arc<dyn Transform3d>,
}

impl ReciprocalSolver {
    pub fn new(params: &EwaldParams, cell: &SimBox) -> Result<Self, P3mError> {
        Self::with_backend(params, cell, Arc::new(RustFftBackend::new(params.mesh)))
    }

    /// Use a different transform implementation. Its resolution must match the mesh.
    pub fn with_backend(
        params: &EwaldParams,
        cell: &SimBox,
        fft: Arc<dyn Transform3d>,
    ) -> Result<Self, P3mError> {
        cell.validate()?;
        EwaldParams::validate_mesh(params.mesh, params.order)?;
        if !params.alpha.is_finite() || params.alpha <= 0. {
            return Err(P3mError::config(format!(
                "splitting parameter alpha must be > 0; got {}",
                params.alpha
            )));
        }
        if fft.mesh() != params.mesh {
            return Err(P3mError::config(format!(
                "transform resolution {:?} doesn't match the mesh {:?}",
                fft.mesh(),
                params.mesh
            )));
        }

        let diff = Differentiator::new(params.differentiation, params.mesh, cell);
        let influence = Arc::new(InfluenceFunction::new(params, cell, &diff));

        Ok(Self {
            params: *params,
            cell: *cell,
            diff,
            influence,
            fft,
        })
    }

    pub fn influence(&self) -> &Arc<InfluenceFunction> {
        &self.influence
    }

    fn transformed_density(
        &self,
        particles: &Particles,
        assignment: &Assignment,
    ) -> Vec<Complex<f64>> {
        let rho = assignment.spread(particles.charges);
        self.fft.forward_real(&rho)
    }

    /// Forces, energy, and virial of the mesh part.
    pub fn compute(&self, particles: &Particles, prefactor: f64) -> ReciprocalOutput {
        let n = particles.len();
        if particles.charges.iter().all(|q| *q == 0.) {
            return ReciprocalOutput {
                forces: vec![Vec3::new_zero(); n],
                ..Default::default()
            };
        }

        let assignment = Assignment::new(
            particles.posits,
            &self.cell,
            self.params.mesh,
            self.params.order,
        );
        let rho_hat = self.transformed_density(particles, &assignment);

        let (energy, virial) = self.energy_virial(&rho_hat, prefactor);

        // Φ̂ = (C/V) G ρ̂, so that the unnormalised inverse gives Φ on the mesh.
        let scale = prefactor / self.cell.volume();
        let phi_hat: Vec<Complex<f64>> = rho_hat
            .iter()
            .zip(&self.influence.force)
            .map(|(r, g)| *r * (g * scale))
            .collect();

        let [ex, ey, ez] = self.diff.field(phi_hat, self.fft.as_ref());
        let e_at_particles = assignment.gather_vec([&ex, &ey, &ez]);

        let forces = e_at_particles
            .into_iter()
            .zip(particles.charges)
            .map(|(e, q)| e * *q)
            .collect();

        ReciprocalOutput {
            forces,
            energy,
            virial,
        }
    }

    /// Mesh energy only: one forward transform, no field.
    pub fn energy(&self, particles: &Particles, prefactor: f64) -> f64 {
        if particles.charges.iter().all(|q| *q == 0.) {
            return 0.;
        }
        let assignment = Assignment::new(
            particles.posits,
            &self.cell,
            self.params.mesh,
            self.params.order,
        );
        let rho_hat = self.transformed_density(particles, &assignment);
        self.energy_virial(&rho_hat, prefactor).0
    }

    /// E = C/(2V) Σ_{k≠0} G(k) |ρ̂(k)|², and its strain derivative
    /// W_ab = C/(2V) Σ G |ρ̂|² (δ_ab - 2 (1/k² + 1/(4α²)) k_a k_b).
    fn energy_virial(&self, rho_hat: &[Complex<f64>], prefactor: f64) -> (f64, Virial) {
        let [nx, ny, nz] = self.params.mesh;
        let l = self.cell.lengths();
        let inv_4a2 = 1. / (4. * self.params.alpha * self.params.alpha);

        let mut energy = 0.;
        let mut virial = [[0.; 3]; 3];

        // Sequential, for a reproducible summation order.
        for (i, j, k) in iproduct!(0..nx, 0..ny, 0..nz) {
            let n = idx(i, j, k, ny, nz);
            let g = self.influence.energy[n];
            if g == 0. {
                continue;
            }

            let e = g * rho_hat[n].norm_sqr();
            energy += e;

            let kv = [
                TAU * freq(i, nx) as f64 / l[0],
                TAU * freq(j, ny) as f64 / l[1],
                TAU * freq(k, nz) as f64 / l[2],
            ];
            let k2 = kv[0] * kv[0] + kv[1] * kv[1] + kv[2] * kv[2];
            let b = 2. * (1. / k2 + inv_4a2);

            for a in 0..3 {
                for c in 0..3 {
                    let delta = if a == c { 1. } else { 0. };
                    virial[a][c] += e * (delta - b * kv[a] * kv[c]);
                }
            }
        }

        let scale = prefactor / (2. * self.cell.volume());
        for row in &mut virial {
            for v in row.iter_mut() {
                *v *= scale;
            }
        }

        (energy * scale, virial)
    }
}

/// Interaction of each Gaussian screening cloud with its own point charge:
/// -C α/√π Σq².
pub fn self_energy(alpha: f64, sum_q2: f64, prefactor: f64) -> f64 {
    -prefactor * alpha / SQRT_PI * sum_q2
}

/// Energy of a uniform neutralising background for a system with net charge Q:
/// -C π Q² / (2 V α²). Exactly zero for a neutral system.
pub fn neutralization_energy(alpha: f64, net_charge: f64, volume: f64, prefactor: f64) -> f64 {
    if net_charge == 0. {
        return 0.;
    }
    -prefactor * PI * net_charge * net_charge / (2. * volume * alpha * alpha)
}
