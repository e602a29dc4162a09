//! Ewald splitting parameters, user overrides, and solver configuration.

use std::time::Duration;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{ambient::SimBox, error::P3mError};

/// Highest supported charge assignment order. (B-spline of degree 6.)
pub const MAX_ORDER: usize = 7;
/// Per-axis mesh limit.
pub const MAX_MESH_DIM: usize = 1024;
/// Total mesh points; keeps the complex mesh and three field meshes within a few GB.
pub const MAX_MESH_POINTS: usize = 1 << 27;

/// How forces are recovered from the reciprocal-space solution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Differentiation {
    /// Multiply by ik before three inverse transforms.
    #[default]
    Spectral,
    /// One inverse transform of the potential, then a central-difference stencil on the mesh.
    FiniteDifference,
}

impl Differentiation {
    /// Number of inverse transforms per force evaluation.
    pub fn inverse_transforms(self) -> usize {
        match self {
            Self::Spectral => 3,
            Self::FiniteDifference => 1,
        }
    }
}

/// Dielectric constant of the medium surrounding the infinite periodic lattice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Dielectric {
    /// Tin-foil boundary conditions: no dipole term.
    #[default]
    Metallic,
    /// Finite ε'; adds the surface dipole correction.
    Dielectric(f64),
}

/// A complete parameter set for one P3M configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct EwaldParams {
    /// Ewald splitting parameter. 1/length.
    pub alpha: f64,
    pub mesh: [usize; 3],
    /// Charge assignment order: the number of mesh points per axis a charge is spread over.
    pub order: usize,
    pub r_cut: f64,
    pub differentiation: Differentiation,
}

impl EwaldParams {
    pub fn mesh_points(&self) -> usize {
        self.mesh.iter().product()
    }

    /// Mesh spacing along each axis.
    pub fn spacing(&self, cell: &SimBox) -> [f64; 3] {
        let l = cell.lengths();
        [
            l[0] / self.mesh[0] as f64,
            l[1] / self.mesh[1] as f64,
            l[2] / self.mesh[2] as f64,
        ]
    }

    /// Mesh and order limits only; no geometry.
    pub fn validate_mesh(mesh: [usize; 3], order: usize) -> Result<(), P3mError> {
        if order == 0 || order > MAX_ORDER {
            return Err(P3mError::config(format!(
                "charge assignment order must be in 1..={MAX_ORDER}; got {order}"
            )));
        }

        for (axis, &n) in ["x", "y", "z"].iter().zip(&mesh) {
            if n < order {
                return Err(P3mError::config(format!(
                    "mesh {axis} ({n}) is smaller than the assignment order ({order})"
                )));
            }
            if n > MAX_MESH_DIM {
                return Err(P3mError::config(format!(
                    "mesh {axis} ({n}) exceeds the per-axis limit of {MAX_MESH_DIM}"
                )));
            }
        }

        let total = mesh.iter().product::<usize>();
        if total > MAX_MESH_POINTS {
            return Err(P3mError::config(format!(
                "mesh {mesh:?} has {total} points; the limit is {MAX_MESH_POINTS}"
            )));
        }

        Ok(())
    }

    pub fn validate(&self, cell: &SimBox) -> Result<(), P3mError> {
        if !self.alpha.is_finite() || self.alpha <= 0. {
            return Err(P3mError::config(format!(
                "splitting parameter alpha must be > 0; got {}",
                self.alpha
            )));
        }
        Self::validate_mesh(self.mesh, self.order)?;
        cell.check_cutoff(self.r_cut)
    }
}

/// Parameters the caller fixes; the tuner searches over the rest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamOverrides {
    pub alpha: Option<f64>,
    pub mesh: Option<[usize; 3]>,
    pub order: Option<usize>,
    pub r_cut: Option<f64>,
}

impl ParamOverrides {
    /// If every parameter is fixed, no search is needed.
    pub fn complete(&self, differentiation: Differentiation) -> Option<EwaldParams> {
        Some(EwaldParams {
            alpha: self.alpha?,
            mesh: self.mesh?,
            order: self.order?,
            r_cut: self.r_cut?,
            differentiation,
        })
    }
}

/// Limits on a single tuning call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningBudget {
    /// Candidate (mesh, order) evaluations plus timed trial runs.
    pub max_trials: usize,
    pub time_limit_secs: Option<f64>,
}

impl Default for TuningBudget {
    fn default() -> Self {
        Self {
            max_trials: 5_000,
            time_limit_secs: None,
        }
    }
}

impl TuningBudget {
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs_f64)
    }
}

/// Everything the caller configures. Serializable, so it can live in an application's
/// settings file.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P3mConfig {
    /// Coulomb prefactor, e.g. the Bjerrum length, or 1/(4π ε0 εr) in the caller's units.
    pub prefactor: f64,
    /// Target RMS force error, in the same units as the forces.
    pub accuracy: f64,
    pub differentiation: Differentiation,
    pub boundary: Dielectric,
    pub overrides: ParamOverrides,
    pub budget: TuningBudget,
    /// If > 0, the best analytic candidates are timed over this many real evaluations each.
    pub timing_trials: usize,
}

impl Default for P3mConfig {
    fn default() -> Self {
        Self {
            prefactor: 1.,
            accuracy: 1e-3,
            differentiation: Differentiation::default(),
            boundary: Dielectric::default(),
            overrides: ParamOverrides::default(),
            budget: TuningBudget::default(),
            timing_trials: 0,
        }
    }
}

impl P3mConfig {
    pub fn validate(&self) -> Result<(), P3mError> {
        if !self.prefactor.is_finite() || self.prefactor <= 0. {
            return Err(P3mError::config(format!(
                "prefactor must be > 0; got {}",
                self.prefactor
            )));
        }
        if !self.accuracy.is_finite() || self.accuracy <= 0. {
            return Err(P3mError::config(format!(
                "accuracy must be > 0; got {}",
                self.accuracy
            )));
        }
        if let Dielectric::Dielectric(eps) = self.boundary {
            if !eps.is_finite() || eps < 0. {
                return Err(P3mError::config(format!(
                    "surrounding dielectric constant must be >= 0; got {eps}"
                )));
            }
        }
        if let Some(alpha) = self.overrides.alpha {
            if !alpha.is_finite() || alpha <= 0. {
                return Err(P3mError::config(format!("alpha override must be > 0; got {alpha}")));
            }
        }
        if let Some(order) = self.overrides.order {
            if order == 0 || order > MAX_ORDER {
                return Err(P3mError::config(format!(
                    "order override must be in 1..={MAX_ORDER}; got {order}"
                )));
            }
        }
        if let Some(r_cut) = self.overrides.r_cut {
            if !r_cut.is_finite() || r_cut <= 0. {
                return Err(P3mError::config(format!("r_cut override must be > 0; got {r_cut}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EwaldParams {
        EwaldParams {
            alpha: 0.8,
            mesh: [16, 16, 16],
            order: 5,
            r_cut: 3.,
            differentiation: Differentiation::Spectral,
        }
    }

    #[test]
    fn validate_params() {
        let cell = SimBox::cubic(10.).unwrap();
        assert!(params().validate(&cell).is_ok());

        let mut p = params();
        p.order = 8;
        assert!(matches!(p.validate(&cell), Err(P3mError::Configuration(_))));

        let mut p = params();
        p.mesh = [4, 16, 16];
        assert!(matches!(p.validate(&cell), Err(P3mError::Configuration(_))));

        let mut p = params();
        p.mesh = [2048, 16, 16];
        assert!(p.validate(&cell).is_err());

        let mut p = params();
        p.r_cut = 6.;
        assert!(matches!(p.validate(&cell), Err(P3mError::InvalidGeometry(_))));

        let mut p = params();
        p.alpha = 0.;
        assert!(p.validate(&cell).is_err());
    }

    #[test]
    fn overrides_complete() {
        let mut o = ParamOverrides {
            alpha: Some(1.),
            mesh: Some([8, 8, 8]),
            order: Some(3),
            r_cut: None,
        };
        assert!(o.complete(Differentiation::Spectral).is_none());

        o.r_cut = Some(2.);
        let p = o.complete(Differentiation::FiniteDifference).unwrap();
        assert_eq!(p.mesh, [8, 8, 8]);
        assert_eq!(p.differentiation, Differentiation::FiniteDifference);
    }

    #[test]
    fn config_from_json_uses_defaults() {
        let cfg: P3mConfig = serde_json::from_str(r#"{ "accuracy": 0.01 }"#).unwrap();
        assert_eq!(cfg.accuracy, 0.01);
        assert_eq!(cfg.prefactor, 1.);
        assert_eq!(cfg.differentiation, Differentiation::Spectral);
        assert!(cfg.validate().is_ok());

        let bad = P3mConfig {
            accuracy: -1.,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
