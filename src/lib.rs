//! P3M (particle-particle particle-mesh) Ewald electrostatics for periodic systems.
//!
//! The Coulomb interaction is split into a short-range part, summed directly over pairs within
//! a cutoff, and a smooth long-range part, solved on a mesh with FFTs. [`P3m`] tunes the split
//! parameter, the mesh, the interpolation order and the cutoff so that the predicted RMS force
//! error meets a target at the lowest estimated cost.
//!
//! ```ignore
//! let cell = SimBox::cubic(10.)?;
//! let particles = Particles::new(&posits, &charges)?;
//!
//! let mut p3m = P3m::new(P3mConfig { accuracy: 1e-4, ..Default::default() })?;
//! p3m.tune(&cell, &particles)?;
//! let out = p3m.compute(&cell, &particles)?;
//! ```

pub mod accuracy;
pub mod ambient;
pub mod diff;
pub mod direct;
pub mod error;
pub mod fft;
pub mod influence;
pub mod neighbors;
pub mod params;
pub mod particles;
pub mod real_space;
pub mod recip;
pub mod solver;
pub mod spline;
pub mod tuning;

pub use accuracy::{AccuracyModel, ErrorEstimate};
pub use ambient::{SimBox, Virial};
pub use direct::DirectEwald;
pub use error::P3mError;
pub use params::{Dielectric, Differentiation, EwaldParams, P3mConfig, ParamOverrides, TuningBudget};
pub use particles::{ChargeSummary, Particles};
pub use solver::{ActiveParams, CoulombOutput, EnergyParts, P3m};
pub use tuning::{Tuner, TunerState, TuningResult};
