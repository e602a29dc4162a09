//! The solver facade: owns the configuration and the tuned state, and combines the real-space
//! and mesh parts with the constant corrections into one force evaluation.
//!
//! The tuned state is explicit. It's created by [`P3m::tune`], [`P3m::configure`], or
//! [`P3m::load_tuning`], and is tied to the box, the charges, and the accuracy it was made
//! for. Evaluating with anything else fails with [`P3mError::NotTuned`] until it's retuned.

use std::f64::consts::PI;

use lin_alg::f64::Vec3;
use log::warn;

use crate::{
    accuracy::{AccuracyModel, ErrorEstimate},
    ambient::{SimBox, Virial, add_virial, outer},
    error::P3mError,
    params::{Dielectric, EwaldParams, P3mConfig},
    particles::{ChargeSummary, Particles},
    real_space::RealSpaceSolver,
    recip::{ReciprocalSolver, neutralization_energy, self_energy},
    tuning::{Evaluator, Tuner, TunerState, TuningResult},
};

/// What a tuned state is valid for. The charge statistics are the ones the error estimates
/// depend on; positions may change freely.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemSignature {
    pub bounds_low: [f64; 3],
    pub lengths: [f64; 3],
    pub n_particles: usize,
    pub n_charged: usize,
    pub sum_q2: f64,
    pub accuracy: f64,
}

impl SystemSignature {
    pub fn new(cell: &SimBox, particles: &Particles, accuracy: f64) -> Self {
        let low = cell.bounds_low;
        let summary = particles.summary();
        Self {
            bounds_low: [low.x, low.y, low.z],
            lengths: cell.lengths(),
            n_particles: particles.len(),
            n_charged: summary.n_charged,
            sum_q2: summary.sum_q2,
            accuracy,
        }
    }
}

/// Everything needed to evaluate, for one tuned parameter set.
struct Plan {
    result: TuningResult,
    signature: SystemSignature,
    real: RealSpaceSolver,
    recip: ReciprocalSolver,
}

/// The active parameter set, and what it's predicted to achieve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveParams {
    pub alpha: f64,
    pub mesh: [usize; 3],
    pub order: usize,
    pub r_cut: f64,
    pub predicted_accuracy: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EnergyParts {
    pub real: f64,
    pub recip: f64,
    pub self_energy: f64,
    /// Uniform neutralising background. Zero for neutral systems.
    pub neutralization: f64,
    /// Surface term for a finite surrounding dielectric. Zero for metallic boundaries.
    pub dipole: f64,
}

impl EnergyParts {
    pub fn total(&self) -> f64 {
        self.real + self.recip + self.self_energy + self.neutralization + self.dipole
    }
}

#[derive(Clone, Debug, Default)]
pub struct CoulombOutput {
    pub forces: Vec<Vec3>,
    pub energy: EnergyParts,
    /// In energy units; divide by the volume for the pressure tensor.
    pub virial: Virial,
}

/// P3M electrostatics for one periodic system.
pub struct P3m {
    config: P3mConfig,
    plan: Option<Plan>,
    tuner_state: TunerState,
}

impl P3m {
    pub fn new(config: P3mConfig) -> Result<Self, P3mError> {
        config.validate()?;

        Ok(Self {
            config,
            plan: None,
            tuner_state: TunerState::Idle,
        })
    }

    pub fn config(&self) -> &P3mConfig {
        &self.config
    }

    pub fn tuner_state(&self) -> TunerState {
        self.tuner_state
    }

    /// Search for parameters meeting the configured accuracy, and make them active. On
    /// failure, the solver is left untuned.
    pub fn tune(&mut self, cell: &SimBox, particles: &Particles) -> Result<&TuningResult, P3mError> {
        self.plan = None;
        check_neutrality(&particles.summary());

        let mut tuner = Tuner::new(&self.config);
        let outcome = tuner.tune(cell, particles);
        self.tuner_state = tuner.state();

        let result = outcome?;
        self.install(result, cell, particles)
    }

    /// Drop the current parameters and search again; e.g. after the box changed.
    pub fn retune(&mut self, cell: &SimBox, particles: &Particles) -> Result<&TuningResult, P3mError> {
        self.invalidate();
        self.tune(cell, particles)
    }

    /// Use these parameters as they are, without searching. The predicted errors are still
    /// computed, and a warning is logged if they miss the accuracy target.
    pub fn configure(
        &mut self,
        params: EwaldParams,
        cell: &SimBox,
        particles: &Particles,
    ) -> Result<&TuningResult, P3mError> {
        self.plan = None;
        params.validate(cell)?;
        check_neutrality(&particles.summary());

        let evaluator = Evaluator {
            model: AccuracyModel::new(cell, particles.summary(), self.config.prefactor),
            target: self.config.accuracy,
            overrides: self.config.overrides,
            differentiation: params.differentiation,
        };
        let estimate = evaluator.model.estimate(&params);

        if estimate.total > self.config.accuracy {
            warn!(
                "P3M parameters predict an RMS force error of {:.3e}, above the target of {:.3e}",
                estimate.total, self.config.accuracy
            );
        }

        let result = TuningResult {
            params,
            real_error: estimate.real,
            recip_error: estimate.recip,
            total_error: estimate.total,
            cost: evaluator.cost(&params),
            measured_secs: None,
        };
        self.install(result, cell, particles)
    }

    /// Restore a result persisted from an earlier run, for this system.
    pub fn load_tuning(
        &mut self,
        result: TuningResult,
        cell: &SimBox,
        particles: &Particles,
    ) -> Result<&TuningResult, P3mError> {
        self.plan = None;
        result.params.validate(cell)?;
        self.install(result, cell, particles)
    }

    fn install(
        &mut self,
        result: TuningResult,
        cell: &SimBox,
        particles: &Particles,
    ) -> Result<&TuningResult, P3mError> {
        let params = result.params;
        let plan = Plan {
            result,
            signature: SystemSignature::new(cell, particles, self.config.accuracy),
            real: RealSpaceSolver::new(params.alpha, params.r_cut, cell)?,
            recip: ReciprocalSolver::new(&params, cell)?,
        };

        Ok(&self.plan.insert(plan).result)
    }

    pub fn invalidate(&mut self) {
        self.plan = None;
        self.tuner_state = TunerState::Idle;
    }

    /// Changing the target invalidates the tuned state.
    pub fn set_accuracy(&mut self, accuracy: f64) -> Result<(), P3mError> {
        let config = P3mConfig {
            accuracy,
            ..self.config
        };
        config.validate()?;
        self.config = config;
        self.invalidate();
        Ok(())
    }

    /// The boundary term doesn't enter the tuning, so this keeps the tuned state.
    pub fn set_boundary(&mut self, boundary: Dielectric) -> Result<(), P3mError> {
        let config = P3mConfig {
            boundary,
            ..self.config
        };
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn tuning(&self) -> Option<&TuningResult> {
        self.plan.as_ref().map(|p| &p.result)
    }

    pub fn params(&self) -> Option<ActiveParams> {
        self.plan.as_ref().map(|p| {
            let r = &p.result;
            ActiveParams {
                alpha: r.params.alpha,
                mesh: r.params.mesh,
                order: r.params.order,
                r_cut: r.params.r_cut,
                predicted_accuracy: r.total_error,
            }
        })
    }

    pub fn predicted_error(&self) -> Option<ErrorEstimate> {
        self.tuning().map(|r| r.estimate())
    }

    /// Whether the tuned state is valid for this box and these charges.
    pub fn is_tuned_for(&self, cell: &SimBox, particles: &Particles) -> bool {
        self.plan.as_ref().is_some_and(|p| {
            p.signature == SystemSignature::new(cell, particles, self.config.accuracy)
        })
    }

    fn plan_for(&self, cell: &SimBox, particles: &Particles) -> Result<&Plan, P3mError> {
        let Some(plan) = &self.plan else {
            return Err(P3mError::NotTuned(
                "no parameters; call tune or configure first".to_owned(),
            ));
        };

        let current = SystemSignature::new(cell, particles, self.config.accuracy);
        if plan.signature != current {
            let (was, now) = (&plan.signature, &current);
            return Err(P3mError::NotTuned(format!(
                "parameters were tuned for box {:?} with {} particles ({} charged, Σq² {}) at \
                 accuracy {:.3e}; now box {:?} with {} particles ({} charged, Σq² {}) at \
                 accuracy {:.3e}. Retune",
                was.lengths,
                was.n_particles,
                was.n_charged,
                was.sum_q2,
                was.accuracy,
                now.lengths,
                now.n_particles,
                now.n_charged,
                now.sum_q2,
                now.accuracy,
            )));
        }

        Ok(plan)
    }

    /// Forces, energy, and virial of the full periodic Coulomb interaction.
    pub fn compute(&self, cell: &SimBox, particles: &Particles) -> Result<CoulombOutput, P3mError> {
        let plan = self.plan_for(cell, particles)?;
        let c = self.config.prefactor;
        let alpha = plan.result.params.alpha;
        let summary = particles.summary();

        let real = plan.real.compute(particles, c)?;
        let recip = plan.recip.compute(particles, c);

        let mut energy = EnergyParts {
            real: real.energy,
            recip: recip.energy,
            self_energy: self_energy(alpha, summary.sum_q2, c),
            neutralization: neutralization_energy(alpha, summary.net_charge, cell.volume(), c),
            dipole: 0.,
        };

        let mut forces: Vec<Vec3> = real
            .forces
            .into_iter()
            .zip(recip.forces)
            .map(|(a, b)| a + b)
            .collect();

        let mut virial = real.virial;
        add_virial(&mut virial, &recip.virial, 1.);

        // The background energy scales as 1/V.
        for a in 0..3 {
            virial[a][a] += energy.neutralization;
        }

        if let Dielectric::Dielectric(eps) = self.config.boundary {
            let dipole = dipole_correction(particles, cell, eps, c);
            energy.dipole = dipole.energy;
            for (f, df) in forces.iter_mut().zip(dipole.forces) {
                *f += df;
            }
            add_virial(&mut virial, &dipole.virial, 1.);
        }

        Ok(CoulombOutput {
            forces,
            energy,
            virial,
        })
    }

    /// Add the forces into a caller-owned accumulator. Returns the energy parts and virial.
    pub fn apply_forces(
        &self,
        cell: &SimBox,
        particles: &Particles,
        forces: &mut [Vec3],
    ) -> Result<(EnergyParts, Virial), P3mError> {
        if forces.len() != particles.len() {
            return Err(P3mError::InvalidInput(format!(
                "force accumulator has {} entries for {} particles",
                forces.len(),
                particles.len()
            )));
        }

        let out = self.compute(cell, particles)?;
        for (acc, f) in forces.iter_mut().zip(out.forces) {
            *acc += f;
        }

        Ok((out.energy, out.virial))
    }
}

struct DipoleTerm {
    energy: f64,
    forces: Vec<Vec3>,
    virial: Virial,
}

/// Surface term for a lattice embedded in a medium of dielectric constant ε':
/// E = 2πC |M|² / ((2ε' + 1) V), with M the total dipole moment.
fn dipole_correction(particles: &Particles, cell: &SimBox, eps: f64, prefactor: f64) -> DipoleTerm {
    let m = particles
        .posits
        .iter()
        .zip(particles.charges)
        .fold(Vec3::new_zero(), |acc, (p, q)| acc + *p * *q);

    let k = 2. * PI * prefactor / ((2. * eps + 1.) * cell.volume());
    let energy = k * m.magnitude_squared();

    let forces = particles
        .charges
        .iter()
        .map(|q| m * (-2. * k * q))
        .collect();

    // W_ab = E δ_ab - 2k M_a M_b
    let mut virial = outer(m, m);
    for (a, row) in virial.iter_mut().enumerate() {
        for (b, v) in row.iter_mut().enumerate() {
            *v *= -2. * k;
            if a == b {
                *v += energy;
            }
        }
    }

    DipoleTerm {
        energy,
        forces,
        virial,
    }
}

fn check_neutrality(summary: &ChargeSummary) {
    if !summary.is_neutral() {
        warn!(
            "System has a net charge of {:.3e}; a uniform neutralizing background is applied",
            summary.net_charge
        );
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::params::Differentiation;

    fn pair() -> (Vec<Vec3>, Vec<f64>) {
        (
            vec![Vec3::new(4., 5., 5.), Vec3::new(6., 5., 5.)],
            vec![1., -1.],
        )
    }

    fn params() -> EwaldParams {
        EwaldParams {
            alpha: 1.,
            mesh: [16, 16, 16],
            order: 5,
            r_cut: 3.5,
            differentiation: Differentiation::Spectral,
        }
    }

    #[test]
    fn compute_before_tuning_fails() {
        let cell = SimBox::cubic(10.).unwrap();
        let (posits, charges) = pair();
        let particles = Particles::new(&posits, &charges).unwrap();

        let p3m = P3m::new(P3mConfig::default()).unwrap();
        assert!(matches!(
            p3m.compute(&cell, &particles),
            Err(P3mError::NotTuned(_))
        ));
        assert!(p3m.params().is_none());
    }

    #[test]
    fn stale_state_is_rejected() {
        let cell = SimBox::cubic(10.).unwrap();
        let (posits, charges) = pair();
        let particles = Particles::new(&posits, &charges).unwrap();

        let mut p3m = P3m::new(P3mConfig::default()).unwrap();
        p3m.configure(params(), &cell, &particles).unwrap();
        assert!(p3m.compute(&cell, &particles).is_ok());
        assert!(p3m.is_tuned_for(&cell, &particles));

        // Different box.
        let bigger = SimBox::cubic(11.).unwrap();
        assert!(matches!(
            p3m.compute(&bigger, &particles),
            Err(P3mError::NotTuned(_))
        ));

        // Different particle count.
        let posits3 = [posits[0], posits[1], Vec3::new(1., 1., 1.)];
        let charges3 = [1., -1., 0.];
        let three = Particles::new(&posits3, &charges3).unwrap();
        assert!(matches!(
            p3m.compute(&cell, &three),
            Err(P3mError::NotTuned(_))
        ));

        // Same positions, charges scaled: the error estimates no longer hold.
        let tripled = [3., -3.];
        let scaled = Particles::new(&posits, &tripled).unwrap();
        assert!(!p3m.is_tuned_for(&cell, &scaled));
        assert!(matches!(
            p3m.compute(&cell, &scaled),
            Err(P3mError::NotTuned(_))
        ));

        // A charge switched off.
        let one_off = [1., 0.];
        let neutralized = Particles::new(&posits, &one_off).unwrap();
        assert!(matches!(
            p3m.compute(&cell, &neutralized),
            Err(P3mError::NotTuned(_))
        ));

        // Moved particles are fine.
        let moved = [Vec3::new(3., 5., 5.), Vec3::new(6., 6., 5.)];
        let moved = Particles::new(&moved, &charges).unwrap();
        assert!(p3m.compute(&cell, &moved).is_ok());

        // New accuracy target.
        p3m.set_accuracy(1e-4).unwrap();
        assert!(p3m.tuning().is_none());
        assert!(matches!(
            p3m.compute(&cell, &particles),
            Err(P3mError::NotTuned(_))
        ));
    }

    #[test]
    fn introspection() {
        let cell = SimBox::cubic(10.).unwrap();
        let (posits, charges) = pair();
        let particles = Particles::new(&posits, &charges).unwrap();

        let mut p3m = P3m::new(P3mConfig::default()).unwrap();
        let result = *p3m.configure(params(), &cell, &particles).unwrap();

        let active = p3m.params().unwrap();
        assert_eq!(active.mesh, [16, 16, 16]);
        assert_eq!(active.order, 5);
        assert_eq!(active.alpha, 1.);
        assert_eq!(active.r_cut, 3.5);
        assert_eq!(active.predicted_accuracy, result.total_error);
    }

    #[test]
    fn apply_forces_accumulates() {
        let cell = SimBox::cubic(10.).unwrap();
        let (posits, charges) = pair();
        let particles = Particles::new(&posits, &charges).unwrap();

        let mut p3m = P3m::new(P3mConfig::default()).unwrap();
        p3m.configure(params(), &cell, &particles).unwrap();
        let out = p3m.compute(&cell, &particles).unwrap();

        let mut acc = vec![Vec3::new(1., 0., 0.); 2];
        let (energy, _) = p3m.apply_forces(&cell, &particles, &mut acc).unwrap();
        assert_eq!(energy, out.energy);
        assert_relative_eq!(acc[0].x, 1. + out.forces[0].x);
        assert_relative_eq!(acc[1].y, out.forces[1].y);

        let mut wrong = vec![Vec3::new_zero(); 3];
        assert!(matches!(
            p3m.apply_forces(&cell, &particles, &mut wrong),
            Err(P3mError::InvalidInput(_))
        ));
    }

    #[test]
    fn dipole_term() {
        let cell = SimBox::cubic(10.).unwrap();
        let (posits, charges) = pair();
        let particles = Particles::new(&posits, &charges).unwrap();

        let mut p3m = P3m::new(P3mConfig::default()).unwrap();
        p3m.configure(params(), &cell, &particles).unwrap();
        let metallic = p3m.compute(&cell, &particles).unwrap();
        assert_eq!(metallic.energy.dipole, 0.);

        // Vacuum. M = (-2, 0, 0).
        p3m.set_boundary(Dielectric::Dielectric(0.)).unwrap();
        let vacuum = p3m.compute(&cell, &particles).unwrap();
        assert_relative_eq!(vacuum.energy.dipole, 2. * PI * 4. / 1000., max_relative = 1e-12);

        // The surface term pulls the charges together along the dipole.
        let df = vacuum.forces[0].x - metallic.forces[0].x;
        assert_relative_eq!(df, 4. * PI * 2. / 1000., max_relative = 1e-9);
        assert_relative_eq!(
            vacuum.forces[1].x - metallic.forces[1].x,
            -df,
            max_relative = 1e-9
        );
    }

    #[test]
    fn persisted_result_restores_state() {
        let cell = SimBox::cubic(10.).unwrap();
        let (posits, charges) = pair();
        let particles = Particles::new(&posits, &charges).unwrap();

        let mut a = P3m::new(P3mConfig::default()).unwrap();
        let bytes = a
            .configure(params(), &cell, &particles)
            .unwrap()
            .to_bytes()
            .unwrap();

        let mut b = P3m::new(P3mConfig::default()).unwrap();
        b.load_tuning(TuningResult::from_bytes(&bytes).unwrap(), &cell, &particles)
            .unwrap();

        let ea = a.compute(&cell, &particles).unwrap().energy.total();
        let eb = b.compute(&cell, &particles).unwrap().energy.total();
        assert_eq!(ea, eb);
    }
}
