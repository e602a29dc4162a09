//! Closed-form RMS force error estimates. Pure functions of the parameters, the box and
//! the charge statistics; nothing is evaluated.
//!
//! Real space: Kolafa and Perram (1992). Reciprocal space: the Deserno and Holm (1998)
//! estimate for the optimal influence function, in the per-axis form of Hockney and
//! Eastwood, with a central-difference truncation term added for finite differences.

use std::f64::consts::{PI, TAU};

use crate::{
    ambient::SimBox,
    params::{Differentiation, EwaldParams},
    particles::ChargeSummary,
};

/// Expansion coefficients of the ik reciprocal error in powers of (hα)², by order.
const ACONS: [&[f64]; 8] = [
    &[],
    &[2. / 3.],
    &[1. / 50., 5. / 294.],
    &[1. / 588., 7. / 1440., 21. / 3872.],
    &[1. / 4320., 3. / 1936., 7601. / 2271360., 143. / 28800.],
    &[
        1. / 23232.,
        7601. / 13628160.,
        143. / 69120.,
        517231. / 106536960.,
        106640677. / 11737571328.,
    ],
    &[
        691. / 68140800.,
        13. / 57600.,
        47021. / 35512320.,
        9694607. / 2095994880.,
        733191589. / 59609088000.,
        326190917. / 11700633600.,
    ],
    &[
        1. / 345600.,
        3617. / 35512320.,
        745739. / 838397952.,
        56399353. / 12773376000.,
        25091609. / 1560084480.,
        1755948832039. / 36229939200000.,
        4887769399. / 37838389248.,
    ],
];

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ErrorEstimate {
    pub real: f64,
    pub recip: f64,
    /// Quadrature sum; the two are treated as independent.
    pub total: f64,
}

impl ErrorEstimate {
    pub fn new(real: f64, recip: f64) -> Self {
        Self {
            real,
            recip,
            total: (real * real + recip * recip).sqrt(),
        }
    }
}

/// Everything the estimates depend on besides the Ewald parameters.
#[derive(Clone, Copy, Debug)]
pub struct AccuracyModel {
    pub cell: SimBox,
    pub summary: ChargeSummary,
    pub prefactor: f64,
}

impl AccuracyModel {
    pub fn new(cell: &SimBox, summary: ChargeSummary, prefactor: f64) -> Self {
        Self {
            cell: *cell,
            summary,
            prefactor,
        }
    }

    /// No charges: every error is zero, whatever the parameters.
    pub fn is_trivial(&self) -> bool {
        self.summary.n_charged == 0 || self.summary.sum_q2 == 0.
    }

    pub fn real_error(&self, alpha: f64, r_cut: f64) -> f64 {
        if self.is_trivial() {
            return 0.;
        }
        let n = self.summary.n_charged as f64;

        2. * self.prefactor * self.summary.sum_q2 * (-alpha * alpha * r_cut * r_cut).exp()
            / (n * r_cut * self.cell.volume()).sqrt()
    }

    pub fn recip_error(
        &self,
        alpha: f64,
        mesh: [usize; 3],
        order: usize,
        differentiation: Differentiation,
    ) -> f64 {
        if self.is_trivial() {
            return 0.;
        }
        let n = self.summary.n_charged as f64;
        let l = self.cell.lengths();
        let coeffs = ACONS[order];

        let mut ik_sq = 0.;
        let mut fd_sq = 0.;

        for axis in 0..3 {
            let h = l[axis] / mesh[axis] as f64;
            let ha = h * alpha;

            let sum: f64 = coeffs
                .iter()
                .enumerate()
                .map(|(m, c)| c * ha.powi(2 * m as i32))
                .sum();

            let e = self.summary.sum_q2
                * ha.powi(order as i32)
                * (alpha * l[axis] * TAU.sqrt() * sum / n).sqrt()
                / (l[axis] * l[axis]);
            ik_sq += e * e;

            fd_sq += 2. / 21. * (PI / 2.).sqrt() * h.powi(4) * alpha.powi(5);
        }

        let ik = ik_sq.sqrt() / 3_f64.sqrt();

        let err = match differentiation {
            Differentiation::Spectral => ik,
            Differentiation::FiniteDifference => {
                let fd = self.summary.sum_q2 * (fd_sq / (n * self.cell.volume())).sqrt();
                (ik * ik + fd * fd).sqrt()
            }
        };

        self.prefactor * err
    }

    pub fn estimate(&self, params: &EwaldParams) -> ErrorEstimate {
        ErrorEstimate::new(
            self.real_error(params.alpha, params.r_cut),
            self.recip_error(
                params.alpha,
                params.mesh,
                params.order,
                params.differentiation,
            ),
        )
    }

    /// The α that puts half the error budget (in quadrature) in real space for this cutoff.
    /// When even α → 0 leaves the real error under that, the real part is negligible and a
    /// small α is returned.
    pub fn alpha_for_cutoff(&self, r_cut: f64, target: f64) -> f64 {
        let rs0 = self.real_error(0., r_cut);
        let rs_target = target / 2_f64.sqrt();

        if rs0 > rs_target {
            (rs0 / rs_target).ln().sqrt() / r_cut
        } else {
            0.1 / self.cell.max_edge()
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn model() -> AccuracyModel {
        let cell = SimBox::cubic(10.).unwrap();
        let charges: Vec<f64> = (0..300).map(|i| if i % 2 == 0 { 1. } else { -1. }).collect();
        AccuracyModel::new(&cell, ChargeSummary::from_charges(&charges), 1.)
    }

    #[test]
    fn no_charges_no_error() {
        let cell = SimBox::cubic(10.).unwrap();
        let m = AccuracyModel::new(&cell, ChargeSummary::from_charges(&[0., 0.]), 1.);
        assert_eq!(m.real_error(1., 2.), 0.);
        assert_eq!(
            m.recip_error(1., [8, 8, 8], 3, Differentiation::Spectral),
            0.
        );

        let empty = AccuracyModel::new(&cell, ChargeSummary::default(), 1.);
        assert_eq!(empty.real_error(1., 2.), 0.);
    }

    #[test]
    fn real_error_decreases_with_cutoff() {
        let m = model();
        let errs: Vec<f64> = [1., 2., 3., 4.].iter().map(|rc| m.real_error(1., *rc)).collect();
        assert!(errs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn recip_error_trends() {
        let m = model();
        let d = Differentiation::Spectral;

        // Finer mesh, or higher order, or smaller α: smaller error.
        assert!(m.recip_error(1., [32; 3], 5, d) < m.recip_error(1., [16; 3], 5, d));
        assert!(m.recip_error(1., [16; 3], 6, d) < m.recip_error(1., [16; 3], 3, d));
        assert!(m.recip_error(0.8, [16; 3], 5, d) < m.recip_error(1.2, [16; 3], 5, d));

        // Finite differences add error on top of the ik estimate.
        assert!(
            m.recip_error(1., [16; 3], 5, Differentiation::FiniteDifference)
                > m.recip_error(1., [16; 3], 5, d)
        );
    }

    #[test]
    fn alpha_balances_real_error() {
        let m = model();
        let target = 1e-3;
        let alpha = m.alpha_for_cutoff(3., target);
        assert_relative_eq!(
            m.real_error(alpha, 3.),
            target / 2_f64.sqrt(),
            max_relative = 1e-10
        );

        let estimate = ErrorEstimate::new(3., 4.);
        assert_relative_eq!(estimate.total, 5.);
    }

    #[test]
    fn prefactor_scales_errors() {
        let m = model();
        let scaled = AccuracyModel { prefactor: 2.5, ..m };
        assert_relative_eq!(scaled.real_error(1., 2.), 2.5 * m.real_error(1., 2.));
        assert_relative_eq!(
            scaled.recip_error(1., [12, 16, 20], 4, Differentiation::FiniteDifference),
            2.5 * m.recip_error(1., [12, 16, 20], 4, Differentiation::FiniteDifference),
            max_relative = 1e-12
        );
    }
}
