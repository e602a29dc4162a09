//! Read-only view of the charged particles handed to the solver.

use lin_alg::f64::Vec3;

use crate::error::P3mError;

/// Positions and charges, owned by the caller. The solver never mutates these; it only
/// writes force contributions into caller-provided buffers.
#[derive(Clone, Copy, Debug)]
pub struct Particles<'a> {
    pub posits: &'a [Vec3],
    pub charges: &'a [f64],
}

impl<'a> Particles<'a> {
    pub fn new(posits: &'a [Vec3], charges: &'a [f64]) -> Result<Self, P3mError> {
        if posits.len() != charges.len() {
            return Err(P3mError::InvalidInput(format!(
                "{} positions but {} charges",
                posits.len(),
                charges.len()
            )));
        }

        if let Some(i) = charges.iter().position(|q| !q.is_finite()) {
            return Err(P3mError::InvalidInput(format!(
                "charge {i} is not finite"
            )));
        }

        if let Some(i) = posits
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
        {
            return Err(P3mError::InvalidInput(format!(
                "position {i} is not finite"
            )));
        }

        Ok(Self { posits, charges })
    }

    pub fn len(&self) -> usize {
        self.charges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charges.is_empty()
    }

    pub fn summary(&self) -> ChargeSummary {
        ChargeSummary::from_charges(self.charges)
    }
}

/// The charge statistics the accuracy model and the reciprocal corrections depend on.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChargeSummary {
    pub n_charged: usize,
    pub net_charge: f64,
    pub sum_q2: f64,
}

impl ChargeSummary {
    pub fn from_charges(charges: &[f64]) -> Self {
        let mut result = Self::default();

        for &q in charges {
            // Uncharged particles don't enter the error estimates.
            if q != 0. {
                result.n_charged += 1;
                result.net_charge += q;
                result.sum_q2 += q * q;
            }
        }

        result
    }

    pub fn is_neutral(&self) -> bool {
        self.net_charge == 0.
    }
}
