//! Recovering the electric field on the mesh from the reciprocal-space potential.
//!
//! Spectral differentiation multiplies by -iD(k) before three inverse transforms.
//! Finite differences do one inverse transform of the potential, then take central
//! differences between neighbouring mesh points. Both are expressed as an odd operator
//! D(k), which the influence function is optimised against.

use std::f64::consts::TAU;

use itertools::iproduct;
use rustfft::num_complex::Complex;

use crate::{
    ambient::SimBox,
    fft::{Transform3d, freq, is_nyquist},
    params::Differentiation,
    spline::idx,
};

/// D(k) along each axis, indexed by mesh index.
#[derive(Clone, Debug)]
pub struct Differentiator {
    pub kind: Differentiation,
    pub mesh: [usize; 3],
    /// Mesh spacing.
    pub h: [f64; 3],
    pub operator: [Vec<f64>; 3],
}

impl Differentiator {
    pub fn new(kind: Differentiation, mesh: [usize; 3], cell: &SimBox) -> Self {
        let l = cell.lengths();
        let h = [
            l[0] / mesh[0] as f64,
            l[1] / mesh[1] as f64,
            l[2] / mesh[2] as f64,
        ];

        let operator = [0, 1, 2].map(|axis| {
            let n = mesh[axis];
            (0..n)
                .map(|i| {
                    // The Nyquist mode has no partner of opposite sign: a real field can't
                    // carry an odd component there.
                    if is_nyquist(i, n) {
                        return 0.;
                    }
                    let k = TAU * freq(i, n) as f64 / l[axis];
                    match kind {
                        Differentiation::Spectral => k,
                        Differentiation::FiniteDifference => (k * h[axis]).sin() / h[axis],
                    }
                })
                .collect()
        });

        Self {
            kind,
            mesh,
            h,
            operator,
        }
    }

    /// |D(k)|² at one mesh index.
    #[inline]
    pub fn norm_sq(&self, i: usize, j: usize, k: usize) -> f64 {
        let d = [self.operator[0][i], self.operator[1][j], self.operator[2][k]];
        d[0] * d[0] + d[1] * d[1] + d[2] * d[2]
    }

    /// E = -∇Φ on the mesh, one component per mesh. `phi_hat` is the transformed potential,
    /// already scaled so an unnormalised inverse transform yields Φ on the mesh.
    pub fn field(&self, phi_hat: Vec<Complex<f64>>, fft: &dyn Transform3d) -> [Vec<f64>; 3] {
        match self.kind {
            Differentiation::Spectral => self.field_spectral(&phi_hat, fft),
            Differentiation::FiniteDifference => {
                let phi = fft.inverse_real(phi_hat);
                self.field_finite_difference(&phi)
            }
        }
    }

    fn field_spectral(&self, phi_hat: &[Complex<f64>], fft: &dyn Transform3d) -> [Vec<f64>; 3] {
        let [nx, ny, nz] = self.mesh;

        [0, 1, 2].map(|axis| {
            let mut e_hat = phi_hat.to_vec();
            for (i, j, k) in iproduct!(0..nx, 0..ny, 0..nz) {
                let d = match axis {
                    0 => self.operator[0][i],
                    1 => self.operator[1][j],
                    _ => self.operator[2][k],
                };
                let v = &mut e_hat[idx(i, j, k, ny, nz)];
                // -i·D·(a + ib) = D·b - i·D·a
                *v = Complex::new(d * v.im, -d * v.re);
            }
            fft.inverse_real(e_hat)
        })
    }

    fn field_finite_difference(&self, phi: &[f64]) -> [Vec<f64>; 3] {
        let [nx, ny, nz] = self.mesh;
        let n = phi.len();
        let scale = self.h.map(|h| 0.5 / h);

        let mut ex = vec![0.; n];
        let mut ey = vec![0.; n];
        let mut ez = vec![0.; n];

        for (i, j, k) in iproduct!(0..nx, 0..ny, 0..nz) {
            let ip1 = (i + 1) % nx;
            let im1 = (i + nx - 1) % nx;
            let jp1 = (j + 1) % ny;
            let jm1 = (j + ny - 1) % ny;
            let kp1 = (k + 1) % nz;
            let km1 = (k + nz - 1) % nz;

            let c = idx(i, j, k, ny, nz);
            ex[c] = -(phi[idx(ip1, j, k, ny, nz)] - phi[idx(im1, j, k, ny, nz)]) * scale[0];
            ey[c] = -(phi[idx(i, jp1, k, ny, nz)] - phi[idx(i, jm1, k, ny, nz)]) * scale[1];
            ez[c] = -(phi[idx(i, j, kp1, ny, nz)] - phi[idx(i, j, km1, ny, nz)]) * scale[2];
        }

        [ex, ey, ez]
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::fft::RustFftBackend;

    /// Φ = cos(2π x / L): E_x = (2π/L) sin(2π x / L).
    fn plane_wave(mesh: [usize; 3]) -> Vec<f64> {
        let [nx, ny, nz] = mesh;
        let mut phi = vec![0.; nx * ny * nz];
        for (i, j, k) in iproduct!(0..nx, 0..ny, 0..nz) {
            phi[idx(i, j, k, ny, nz)] = (TAU * i as f64 / nx as f64).cos();
        }
        phi
    }

    #[test]
    fn operators_are_odd() {
        let cell = SimBox::new([10., 8., 9.]).unwrap();
        for kind in [Differentiation::Spectral, Differentiation::FiniteDifference] {
            let d = Differentiator::new(kind, [8, 6, 9], &cell);
            for axis in 0..3 {
                let n = d.mesh[axis];
                assert_eq!(d.operator[axis][0], 0.);
                for i in 1..n {
                    assert_relative_eq!(
                        d.operator[axis][i],
                        -d.operator[axis][n - i],
                        epsilon = 1e-12
                    );
                }
            }
            assert_eq!(d.operator[0][4], 0.);
        }
    }

    #[test]
    fn plane_wave_field() {
        let l = 10.;
        let cell = SimBox::cubic(l).unwrap();
        let mesh = [16, 4, 4];
        let fft = RustFftBackend::new(mesh);
        let phi = plane_wave(mesh);
        let k = TAU / l;
        let h = l / 16.;

        for kind in [Differentiation::Spectral, Differentiation::FiniteDifference] {
            let d = Differentiator::new(kind, mesh, &cell);
            // `field` expects the transformed potential scaled for an unnormalised inverse.
            let mut phi_hat = fft.forward_real(&phi);
            let norm = 1. / phi.len() as f64;
            phi_hat.iter_mut().for_each(|v| *v *= norm);

            let [ex, ey, ez] = d.field(phi_hat, &fft);

            let amplitude = match kind {
                Differentiation::Spectral => k,
                Differentiation::FiniteDifference => (k * h).sin() / h,
            };
            for i in 0..16 {
                let expected = amplitude * (TAU * i as f64 / 16.).sin();
                assert_relative_eq!(ex[idx(i, 1, 2, 4, 4)], expected, epsilon = 1e-10);
                assert_relative_eq!(ey[idx(i, 1, 2, 4, 4)], 0., epsilon = 1e-10);
                assert_relative_eq!(ez[idx(i, 1, 2, 4, 4)], 0., epsilon = 1e-10);
            }
        }
    }
}
