//! 3D discrete Fourier transforms over the charge mesh.
//!
//! The transform is done as 1D transforms along z, then y, then x lines. Lines along one
//! axis are independent, so each pass runs them in parallel: a pencil decomposition over
//! the rayon pool.

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::{Fft, FftPlanner, num_complex::Complex};

/// A forward and inverse 3D DFT with a fixed resolution. Data is laid out as in
/// [`crate::spline::idx`]: x outermost, z contiguous.
pub trait Transform3d: Send + Sync {
    fn mesh(&self) -> [usize; 3];

    /// In place: X(k) = Σ_m x(m) exp(-2πi k·m / N)
    fn forward(&self, data: &mut [Complex<f64>]);

    /// In place, unnormalised: x(m) = Σ_k X(k) exp(+2πi k·m / N)
    fn inverse(&self, data: &mut [Complex<f64>]);

    fn forward_real(&self, data: &[f64]) -> Vec<Complex<f64>> {
        let mut result: Vec<Complex<f64>> = data.iter().map(|&r| Complex::new(r, 0.)).collect();
        self.forward(&mut result);
        result
    }

    /// Inverse transform of a spectrum known to be Hermitian; keeps the real part.
    fn inverse_real(&self, mut data: Vec<Complex<f64>>) -> Vec<f64> {
        self.inverse(&mut data);
        data.into_iter().map(|c| c.re).collect()
    }
}

/// The default backend, over `rustfft`. Supports any size; sizes with only small prime
/// factors are the fast ones.
pub struct RustFftBackend {
    mesh: [usize; 3],
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
}

impl RustFftBackend {
    pub fn new(mesh: [usize; 3]) -> Self {
        let mut planner = FftPlanner::new();

        let forward = mesh.map(|n| planner.plan_fft_forward(n));
        let inverse = mesh.map(|n| planner.plan_fft_inverse(n));

        Self {
            mesh,
            forward,
            inverse,
        }
    }

    fn transform(&self, data: &mut [Complex<f64>], plans: &[Arc<dyn Fft<f64>>; 3]) {
        let [nx, ny, nz] = self.mesh;
        assert_eq!(data.len(), nx * ny * nz, "mesh data has the wrong length");

        let zero = Complex::new(0., 0.);

        // z lines are contiguous.
        let fft_z = &plans[2];
        data.par_chunks_mut(nz).for_each_init(
            || vec![zero; fft_z.get_inplace_scratch_len()],
            |scratch, line| fft_z.process_with_scratch(line, scratch),
        );

        // y lines live inside one contiguous x-plane each.
        let fft_y = &plans[1];
        data.par_chunks_mut(ny * nz).for_each_init(
            || (vec![zero; ny], vec![zero; fft_y.get_inplace_scratch_len()]),
            |(line, scratch), plane| {
                for k in 0..nz {
                    for j in 0..ny {
                        line[j] = plane[j * nz + k];
                    }
                    fft_y.process_with_scratch(line, scratch);
                    for j in 0..ny {
                        plane[j * nz + k] = line[j];
                    }
                }
            },
        );

        // x lines are strided across the whole mesh: transform copies, then write back.
        let fft_x = &plans[0];
        let stride = ny * nz;
        let lines: Vec<Vec<Complex<f64>>> = {
            let data: &[Complex<f64>] = data;
            (0..stride)
                .into_par_iter()
                .map_init(
                    || vec![zero; fft_x.get_inplace_scratch_len()],
                    |scratch, jk| {
                        let mut line: Vec<_> = (0..nx).map(|i| data[i * stride + jk]).collect();
                        fft_x.process_with_scratch(&mut line, scratch);
                        line
                    },
                )
                .collect()
        };

        for (jk, line) in lines.into_iter().enumerate() {
            for (i, v) in line.into_iter().enumerate() {
                data[i * stride + jk] = v;
            }
        }
    }
}

impl Transform3d for RustFftBackend {
    fn mesh(&self) -> [usize; 3] {
        self.mesh
    }

    fn forward(&self, data: &mut [Complex<f64>]) {
        self.transform(data, &self.forward);
    }

    fn inverse(&self, data: &mut [Complex<f64>]) {
        self.transform(data, &self.inverse);
    }
}

/// Signed frequency of mesh index `i` along an axis of `n` points: 0, 1, .. then negative.
#[inline]
pub fn freq(i: usize, n: usize) -> isize {
    if 2 * i < n {
        i as isize
    } else {
        i as isize - n as isize
    }
}

/// True for the unpaired -N/2 mode of an even axis.
#[inline]
pub fn is_nyquist(i: usize, n: usize) -> bool {
    n % 2 == 0 && 2 * i == n
}

pub fn largest_prime_factor(mut n: usize) -> usize {
    let mut result = 1;
    let mut p = 2;

    while p * p <= n {
        while n % p == 0 {
            result = p;
            n /= p;
        }
        p += 1;
    }

    result.max(n)
}

/// Relative cost per point of a transform of length `n`, against a power of two. Sizes
/// with large prime factors fall back to Rader's or Bluestein's algorithm, which is several
/// times slower; treat them as more expensive rather than unsupported.
pub fn transform_cost_factor(n: usize) -> f64 {
    match largest_prime_factor(n) {
        0..=2 => 1.,
        3 => 1.1,
        5 => 1.25,
        7 => 1.4,
        11 | 13 => 2.,
        _ => 4.,
    }
}
