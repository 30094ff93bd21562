//! SE3 rigid transform.
//!
//! Poses throughout the crate are world-to-camera transforms Tcw unless a
//! name says otherwise; Twc = Tcw⁻¹. Composition is written left to
//! right of the point being transformed: `(a * b).transform(p) ==
//! a.transform(b.transform(p))`.

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};

/// A rigid transform: rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix that is assumed orthonormal.
    pub fn from_parts(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::from_matrix_unchecked(rotation),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        *self.rotation.matrix()
    }

    /// Camera center in the source frame: for a Tcw this is the camera
    /// position in world coordinates, -Rᵀt.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn sample() -> SE3 {
        SE3::new(
            Rotation3::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn inverse_round_trip() {
        let t = sample();
        let p = Vector3::new(0.3, 4.0, -1.2);
        let back = t.inverse().transform(&t.transform(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn composition_matches_sequential_transform() {
        let a = sample();
        let b = SE3::new(
            Rotation3::from_euler_angles(-0.4, 0.0, 0.2),
            Vector3::new(0.0, 1.0, 3.0),
        );
        let p = Vector3::new(1.0, 1.0, 1.0);
        assert_relative_eq!(
            (a * b).transform(&p),
            a.transform(&b.transform(&p)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn center_is_inverse_translation() {
        let rot = Rotation3::from_euler_angles(0.0, FRAC_PI_2, 0.0);
        let tcw = SE3::new(rot, Vector3::new(0.0, 0.0, 2.0));
        // Camera center transformed back into the camera frame is the origin.
        assert_relative_eq!(
            tcw.transform(&tcw.center()),
            Vector3::zeros(),
            epsilon = 1e-12
        );
        assert_relative_eq!(tcw.center(), tcw.inverse().translation, epsilon = 1e-12);
    }

    #[test]
    fn matrix_form_agrees() {
        let t = sample();
        let p = Vector3::new(-0.7, 0.2, 5.0);
        let hp = t.to_matrix4() * p.push(1.0);
        assert_relative_eq!(hp.xyz(), t.transform(&p), epsilon = 1e-12);
    }
}
