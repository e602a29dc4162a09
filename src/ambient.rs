//! The periodic simulation cell.

use lin_alg::f64::Vec3;

use crate::error::P3mError;

/// A 3×3 virial (or stress) tensor, W_ab = Σ r_a F_b. In energy units; divide by the box
/// volume for a pressure tensor.
pub type Virial = [[f64; 3]; 3];

/// r ⊗ f, as a virial contribution.
#[inline]
pub fn outer(r: Vec3, f: Vec3) -> Virial {
    let r = [r.x, r.y, r.z];
    let f = [f.x, f.y, f.z];
    let mut result = [[0.; 3]; 3];
    for a in 0..3 {
        for b in 0..3 {
            result[a][b] = r[a] * f[b];
        }
    }
    result
}

#[inline]
pub fn add_virial(acc: &mut Virial, v: &Virial, scale: f64) {
    for a in 0..3 {
        for b in 0..3 {
            acc[a][b] += v[a][b] * scale;
        }
    }
}

pub fn virial_trace(v: &Virial) -> f64 {
    v[0][0] + v[1][1] + v[2][2]
}

/// Simulation cell (orthorhombic). Periodic along all three axes.
#[derive(Clone, Copy, Debug)]
pub struct SimBox {
    pub bounds_low: Vec3,
    pub bounds_high: Vec3,
}

impl SimBox {
    /// A box with its lower corner at the origin.
    pub fn new(lengths: [f64; 3]) -> Result<Self, P3mError> {
        Self::from_bounds(
            Vec3::new_zero(),
            Vec3::new(lengths[0], lengths[1], lengths[2]),
        )
    }

    pub fn cubic(edge: f64) -> Result<Self, P3mError> {
        Self::new([edge; 3])
    }

    pub fn from_bounds(bounds_low: Vec3, bounds_high: Vec3) -> Result<Self, P3mError> {
        let result = Self {
            bounds_low,
            bounds_high,
        };
        result.validate()?;
        Ok(result)
    }

    /// All edges must be finite and > 0.
    pub fn validate(&self) -> Result<(), P3mError> {
        for (axis, len) in ["x", "y", "z"].iter().zip(self.lengths()) {
            if !len.is_finite() || len <= 0. {
                return Err(P3mError::geometry(format!(
                    "box edge {axis} must be finite and > 0; got {len}"
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.bounds_high - self.bounds_low
    }

    #[inline]
    pub fn lengths(&self) -> [f64; 3] {
        let ext = self.extent();
        [ext.x, ext.y, ext.z]
    }

    pub fn volume(&self) -> f64 {
        let ext = self.extent();
        ext.x * ext.y * ext.z
    }

    pub fn min_edge(&self) -> f64 {
        self.lengths().into_iter().fold(f64::INFINITY, f64::min)
    }

    pub fn max_edge(&self) -> f64 {
        self.lengths().into_iter().fold(0., f64::max)
    }

    /// Largest real-space cutoff compatible with the minimum-image convention.
    pub fn max_cutoff(&self) -> f64 {
        0.5 * self.min_edge()
    }

    pub fn check_cutoff(&self, r_cut: f64) -> Result<(), P3mError> {
        if !r_cut.is_finite() || r_cut <= 0. {
            return Err(P3mError::geometry(format!(
                "real-space cutoff must be > 0; got {r_cut}"
            )));
        }
        if r_cut > self.max_cutoff() {
            return Err(P3mError::geometry(format!(
                "real-space cutoff {r_cut} exceeds half the shortest box edge ({})",
                self.max_cutoff()
            )));
        }
        Ok(())
    }

    /// wrap an absolute coordinate back into the box (orthorhombic)
    #[inline]
    pub fn wrap(&self, p: Vec3) -> Vec3 {
        let ext = self.extent();

        // rem_euclid keeps the value in [0, ext)
        Vec3::new(
            (p.x - self.bounds_low.x).rem_euclid(ext.x) + self.bounds_low.x,
            (p.y - self.bounds_low.y).rem_euclid(ext.y) + self.bounds_low.y,
            (p.z - self.bounds_low.z).rem_euclid(ext.z) + self.bounds_low.z,
        )
    }

    /// Position relative to the lower corner, as a fraction of each edge, in [0, 1).
    #[inline]
    pub fn fractional(&self, p: Vec3) -> [f64; 3] {
        let ext = self.extent();
        let diff = p - self.bounds_low;

        // `rem_euclid` can round up to exactly 1.0 for tiny negative inputs.
        let wrap01 = |v: f64| {
            let r = v.rem_euclid(1.);
            if r >= 1. { 0. } else { r }
        };

        [
            wrap01(diff.x / ext.x),
            wrap01(diff.y / ext.y),
            wrap01(diff.z / ext.z),
        ]
    }

    /// minimum-image displacement vector (no √)
    #[inline]
    pub fn min_image(&self, dv: Vec3) -> Vec3 {
        let ext = self.extent();
        debug_assert!(ext.x > 0.0 && ext.y > 0.0 && ext.z > 0.0);

        Vec3::new(
            dv.x - (dv.x / ext.x).round() * ext.x,
            dv.y - (dv.y / ext.y).round() * ext.y,
            dv.z - (dv.z / ext.z).round() * ext.z,
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn rejects_bad_edges() {
        assert!(matches!(
            SimBox::new([10., 0., 10.]),
            Err(P3mError::InvalidGeometry(_))
        ));
        assert!(SimBox::new([10., -2., 10.]).is_err());
        assert!(SimBox::new([10., f64::NAN, 10.]).is_err());
        assert!(SimBox::new([10., 8., 6.]).is_ok());
    }

    #[test]
    fn cutoff_limits() {
        let cell = SimBox::new([10., 8., 12.]).unwrap();
        assert_relative_eq!(cell.max_cutoff(), 4.0);
        assert!(cell.check_cutoff(4.0).is_ok());
        assert!(cell.check_cutoff(4.01).is_err());
        assert!(cell.check_cutoff(0.).is_err());
    }

    #[test]
    fn min_image_is_antisymmetric() {
        let cell = SimBox::cubic(10.).unwrap();
        let d = Vec3::new(7.5, -6.2, 0.3);
        let a = cell.min_image(d);
        let b = cell.min_image(Vec3::new_zero() - d);

        assert_relative_eq!(a.x, -2.5);
        assert_relative_eq!(a.y, 3.8, epsilon = 1e-12);
        assert_eq!(a.x, -b.x);
        assert_eq!(a.y, -b.y);
        assert_eq!(a.z, -b.z);
    }

    #[test]
    fn wrap_and_fractional() {
        let cell = SimBox::cubic(4.).unwrap();
        let p = cell.wrap(Vec3::new(-1., 5., 2.));
        assert_relative_eq!(p.x, 3.);
        assert_relative_eq!(p.y, 1.);
        assert_relative_eq!(p.z, 2.);

        let f = cell.fractional(Vec3::new(-1e-18, 4., 1.));
        assert!(f.iter().all(|v| (0.0..1.0).contains(v)));
        assert_relative_eq!(f[2], 0.25);
    }
}
